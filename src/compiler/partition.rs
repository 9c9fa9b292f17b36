//! Partition & lower stage
//!
//! Operator placement rule: the first backend (in preference order) that
//! supports an operator gets it; operators no backend supports fall back to
//! the portable executor. A fallback never fails the stage.
//!
//! Nodes that do not contribute to any graph output are dropped.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashSet;

use super::graph::{ModelGraph, Op, ValueId};
use super::program::{ConstantData, Executor, Instruction, LoweredProgram, ProgramMethod, Segment};
use super::quantize::QuantizationScheme;
use crate::{Error, Result};

/// A kernel library that can take over graph operators.
pub trait Backend: Send + Sync {
    /// Backend name recorded in the program.
    fn name(&self) -> &str;

    /// Whether this backend has a kernel for `op`.
    fn supports(&self, op: &Op) -> bool;
}

/// Accelerated CPU kernel library (XNNPACK-style).
///
/// Covers the convolution / dense / activation set typical for mobile
/// vision models. Shape-only ops and softmax stay on the portable executor.
#[derive(Debug, Clone)]
pub struct CpuAcceleratedBackend {
    supported: FxHashSet<&'static str>,
}

impl CpuAcceleratedBackend {
    /// Backend name
    pub const NAME: &'static str = "cpu-accelerated";

    /// Create the backend with its default operator set.
    #[must_use]
    pub fn new() -> Self {
        let supported = ["conv2d", "linear", "relu", "relu6", "add", "global_avg_pool"]
            .into_iter()
            .collect();
        Self { supported }
    }

    /// Restrict the operator set, e.g. to mirror an older kernel release.
    #[must_use]
    pub fn with_ops(ops: &[&'static str]) -> Self {
        Self {
            supported: ops.iter().copied().collect(),
        }
    }
}

impl Default for CpuAcceleratedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuAcceleratedBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports(&self, op: &Op) -> bool {
        // Strided convolutions beyond 2 are not in the fast path.
        if let Op::Conv2d { stride, .. } = op {
            if *stride > 2 {
                return false;
            }
        }
        self.supported.contains(op.name())
    }
}

/// Placement summary produced alongside the program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionReport {
    /// Delegated instruction count per backend
    pub delegated: BTreeMap<String, usize>,
    /// Instructions left on the portable executor
    pub portable: usize,
    /// Operator names that fell back
    pub fallback_ops: BTreeSet<&'static str>,
    /// Nodes removed because no output depends on them
    pub pruned: usize,
}

impl PartitionReport {
    /// Total delegated instructions across backends.
    #[must_use]
    pub fn delegated_total(&self) -> usize {
        self.delegated.values().sum()
    }
}

/// Partition `graph` across `backends` and lower it into a single-method
/// program named `method_name`.
///
/// # Errors
///
/// Returns [`Error::Lowering`] if the resulting program has no executable
/// method (a graph without outputs lowers to nothing).
#[tracing::instrument(skip_all, fields(model = graph.name(), backends = backends.len()))]
pub fn lower(
    graph: ModelGraph,
    backends: &[Box<dyn Backend>],
    method_name: &str,
) -> Result<(LoweredProgram, PartitionReport)> {
    let mut report = PartitionReport::default();
    let mut methods = Vec::new();

    if graph.outputs().is_empty() {
        tracing::warn!("graph has no outputs; no method can be lowered");
    } else {
        let live = live_nodes(&graph);
        report.pruned = graph.nodes().len() - live.len();

        let mut segments: Vec<Segment> = Vec::new();
        for (idx, node) in graph.nodes().iter().enumerate() {
            if !live.contains(&idx) {
                continue;
            }
            let executor = backends
                .iter()
                .find(|b| b.supports(&node.op))
                .map_or(Executor::Portable, |b| Executor::Delegate {
                    backend: b.name().to_string(),
                });
            match &executor {
                Executor::Delegate { backend } => {
                    *report.delegated.entry(backend.clone()).or_insert(0) += 1;
                }
                Executor::Portable => {
                    report.portable += 1;
                    report.fallback_ops.insert(node.op.name());
                }
            }
            let instruction = Instruction {
                op: node.op.clone(),
                inputs: node.inputs.clone(),
                output: node.output,
            };
            match segments.last_mut() {
                Some(seg) if seg.executor == executor => seg.instructions.push(instruction),
                _ => segments.push(Segment {
                    executor,
                    instructions: vec![instruction],
                }),
            }
        }

        let used: BTreeSet<ValueId> = segments
            .iter()
            .flat_map(|s| s.instructions.iter())
            .flat_map(|i| i.inputs.iter().copied())
            .collect();
        let constants = graph
            .constants()
            .iter()
            .filter(|(id, _)| used.contains(*id) || graph.outputs().contains(*id))
            .map(|(id, t)| (*id, ConstantData::F32(t.data().to_vec())))
            .collect();

        methods.push(ProgramMethod {
            name: method_name.to_string(),
            values: graph.values().to_vec(),
            inputs: graph.inputs().to_vec(),
            outputs: graph.outputs().to_vec(),
            constants,
            segments,
        });
    }

    if methods.is_empty() {
        return Err(Error::Lowering(format!(
            "model '{}' lowered to a program with zero executable methods",
            graph.name()
        )));
    }

    if !report.fallback_ops.is_empty() {
        tracing::warn!(
            ops = ?report.fallback_ops,
            count = report.portable,
            "operators fell back to the portable executor"
        );
    }
    tracing::info!(
        delegated = report.delegated_total(),
        portable = report.portable,
        pruned = report.pruned,
        "lowered program"
    );

    let program = LoweredProgram {
        model_name: graph.name().to_string(),
        quantization: QuantizationScheme::None,
        methods,
    };
    Ok((program, report))
}

/// Indices of nodes reachable backwards from the graph outputs.
fn live_nodes(graph: &ModelGraph) -> BTreeSet<usize> {
    let producer: BTreeMap<ValueId, usize> = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(i, n)| (n.output, i))
        .collect();
    let mut live = BTreeSet::new();
    let mut stack: Vec<ValueId> = graph.outputs().to_vec();
    while let Some(value) = stack.pop() {
        if let Some(&idx) = producer.get(&value) {
            if live.insert(idx) {
                stack.extend(graph.nodes()[idx].inputs.iter().copied());
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::export::{export, Mode, Model, Tracer};
    use crate::tensor::Tensor;

    struct Classifier {
        with_dead_branch: bool,
        no_outputs: bool,
    }

    impl Model for Classifier {
        fn name(&self) -> &str {
            "classifier"
        }

        fn mode(&self) -> Mode {
            Mode::Eval
        }

        fn forward(&self, t: &mut Tracer, inputs: &[ValueId]) -> crate::Result<Vec<ValueId>> {
            let w = Tensor::ramp([4, 3, 3, 3], 0.01);
            let h = t.conv2d(inputs[0], w, Tensor::zeros([4]), 1, 1)?;
            let h = t.relu(h)?;
            if self.with_dead_branch {
                t.relu6(h)?;
            }
            let h = t.flatten(h)?;
            let y = t.linear(h, Tensor::ramp([5, 4 * 8 * 8], 0.01), Tensor::zeros([5]))?;
            let y = t.softmax(y)?;
            if self.no_outputs {
                Ok(vec![])
            } else {
                Ok(vec![y])
            }
        }
    }

    fn graph(with_dead_branch: bool, no_outputs: bool) -> ModelGraph {
        let model = Classifier {
            with_dead_branch,
            no_outputs,
        };
        export(&model, &[Tensor::zeros([1, 3, 8, 8])]).unwrap()
    }

    fn cpu() -> Vec<Box<dyn Backend>> {
        vec![Box::new(CpuAcceleratedBackend::new())]
    }

    #[test]
    fn test_prefers_backend_and_falls_back() {
        let (program, report) = lower(graph(false, false), &cpu(), "forward").unwrap();
        assert_eq!(report.delegated_total(), 3);
        assert_eq!(report.portable, 2);
        assert!(report.fallback_ops.contains("flatten"));
        assert!(report.fallback_ops.contains("softmax"));

        let method = program.method("forward").unwrap();
        let labels: Vec<&str> = method.segments.iter().map(|s| s.executor.label()).collect();
        assert_eq!(labels, ["cpu-accelerated", "portable", "cpu-accelerated", "portable"]);
    }

    #[test]
    fn test_no_backends_is_all_portable() {
        let (program, report) = lower(graph(false, false), &[], "forward").unwrap();
        assert_eq!(report.delegated_total(), 0);
        assert_eq!(program.methods[0].segments.len(), 1);
    }

    #[test]
    fn test_dead_nodes_pruned() {
        let (program, report) = lower(graph(true, false), &cpu(), "forward").unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(program.methods[0].instruction_count(), 5);
    }

    #[test]
    fn test_zero_methods_is_lowering_error() {
        let err = lower(graph(false, true), &cpu(), "forward").unwrap_err();
        assert!(matches!(err, Error::Lowering(_)));
    }

    #[test]
    fn test_restricted_backend() {
        let backends: Vec<Box<dyn Backend>> =
            vec![Box::new(CpuAcceleratedBackend::with_ops(&["relu"]))];
        let (_, report) = lower(graph(false, false), &backends, "forward").unwrap();
        assert_eq!(report.delegated["cpu-accelerated"], 1);
        assert!(report.fallback_ops.contains("conv2d"));
    }
}
