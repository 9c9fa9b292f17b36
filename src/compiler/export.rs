//! Export stage: trace a model into a frozen [`ModelGraph`]
//!
//! Models describe their forward pass against a [`Tracer`]. The tracer fixes
//! every value's shape at trace time, so anything that would need concrete
//! tensor values to decide what runs next cannot be captured and is rejected
//! with [`Error::Export`].

use std::collections::BTreeMap;

use super::graph::{ModelGraph, Node, Op, ValueId};
use crate::tensor::{Tensor, TensorSpec};
use crate::{Error, Result};

/// Execution mode of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Training mode (dropout, batch statistics). Not exportable.
    Train,
    /// Evaluation mode.
    Eval,
}

/// A trained model that can describe its forward pass symbolically.
pub trait Model: Send + Sync {
    /// Model name recorded in the exported graph.
    fn name(&self) -> &str;

    /// Current execution mode.
    fn mode(&self) -> Mode;

    /// Record the forward computation on `tracer` and return the outputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for constructs the tracer cannot capture.
    fn forward(&self, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>>;
}

/// Symbolic recorder handed to [`Model::forward`].
#[derive(Debug, Default)]
pub struct Tracer {
    values: Vec<TensorSpec>,
    inputs: Vec<ValueId>,
    constants: BTreeMap<ValueId, Tensor>,
    nodes: Vec<Node>,
}

impl Tracer {
    fn new(input_specs: &[TensorSpec]) -> Self {
        let mut tracer = Self::default();
        for spec in input_specs {
            let id = tracer.push_value(spec.clone());
            tracer.inputs.push(id);
        }
        tracer
    }

    fn push_value(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(spec);
        id
    }

    /// Spec of a traced value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] if `id` was not produced by this tracer.
    pub fn spec(&self, id: ValueId) -> Result<&TensorSpec> {
        self.values
            .get(id.0)
            .ok_or_else(|| Error::Export(format!("unknown value {id}")))
    }

    /// Register a constant (weight or bias).
    pub fn constant(&mut self, tensor: Tensor) -> ValueId {
        let id = self.push_value(tensor.spec());
        self.constants.insert(id, tensor);
        id
    }

    /// Record an operator application.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] if operand shapes do not fit the operator.
    pub fn apply(&mut self, op: Op, inputs: &[ValueId]) -> Result<ValueId> {
        let specs = inputs
            .iter()
            .map(|id| self.spec(*id))
            .collect::<Result<Vec<_>>>()?;
        let out = op
            .infer(&specs)
            .map_err(|msg| Error::Export(format!("{op}: {msg}")))?;
        let output = self.push_value(out);
        self.nodes.push(Node {
            op,
            inputs: inputs.to_vec(),
            output,
        });
        Ok(output)
    }

    /// `conv2d(x, weight, bias)` with constant weights.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] on shape mismatch.
    pub fn conv2d(
        &mut self,
        x: ValueId,
        weight: Tensor,
        bias: Tensor,
        stride: usize,
        padding: usize,
    ) -> Result<ValueId> {
        let w = self.constant(weight);
        let b = self.constant(bias);
        self.apply(Op::Conv2d { stride, padding }, &[x, w, b])
    }

    /// `linear(x, weight, bias)` with constant weights.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] on shape mismatch.
    pub fn linear(&mut self, x: ValueId, weight: Tensor, bias: Tensor) -> Result<ValueId> {
        let w = self.constant(weight);
        let b = self.constant(bias);
        self.apply(Op::Linear, &[x, w, b])
    }

    /// Elementwise ReLU.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for an unknown operand.
    pub fn relu(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Op::Relu, &[x])
    }

    /// Elementwise ReLU6.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for an unknown operand.
    pub fn relu6(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Op::Relu6, &[x])
    }

    /// Elementwise sum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] on shape mismatch.
    pub fn add(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.apply(Op::Add, &[a, b])
    }

    /// Spatial mean.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for non-4-D operands.
    pub fn global_avg_pool(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Op::GlobalAvgPool, &[x])
    }

    /// Collapse non-batch dims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for scalar operands.
    pub fn flatten(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Op::Flatten, &[x])
    }

    /// Softmax over the last axis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] for scalar operands.
    pub fn softmax(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Op::Softmax, &[x])
    }

    /// Branch on the runtime value of `cond`.
    ///
    /// Always fails: tensor values do not exist at trace time.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Export`].
    pub fn branch_on(&mut self, cond: ValueId) -> Result<bool> {
        Err(Error::Export(format!(
            "control flow depends on the value of {cond}, which is unknown while tracing"
        )))
    }

    /// Call an operator the exporter has no definition for.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Export`].
    pub fn opaque(&mut self, name: &str, _inputs: &[ValueId]) -> Result<ValueId> {
        Err(Error::Export(format!("unsupported operator '{name}'")))
    }

    fn finish(self, name: &str, outputs: Vec<ValueId>) -> Result<ModelGraph> {
        for id in &outputs {
            if id.0 >= self.values.len() {
                return Err(Error::Export(format!("model returned unknown value {id}")));
            }
        }
        Ok(ModelGraph::from_parts(
            name.to_string(),
            self.values,
            self.inputs,
            outputs,
            self.constants,
            self.nodes,
        ))
    }
}

/// Export `model` using `example_inputs` to fix input shapes and dtypes.
///
/// # Errors
///
/// Returns [`Error::Export`] if the model is in training mode, no example
/// inputs are given, or the forward pass contains untraceable constructs.
#[tracing::instrument(skip_all, fields(model = model.name()))]
pub fn export(model: &dyn Model, example_inputs: &[Tensor]) -> Result<ModelGraph> {
    if model.mode() != Mode::Eval {
        return Err(Error::Export(format!(
            "model '{}' is in training mode; switch it to evaluation mode before export",
            model.name()
        )));
    }
    if example_inputs.is_empty() {
        return Err(Error::Export("at least one example input is required".to_string()));
    }

    let specs: Vec<TensorSpec> = example_inputs.iter().map(Tensor::spec).collect();
    let mut tracer = Tracer::new(&specs);
    let inputs = tracer.inputs.clone();
    let outputs = model.forward(&mut tracer, &inputs).map_err(|e| match e {
        Error::Export(_) => e,
        other => Error::Export(other.to_string()),
    })?;
    let graph = tracer.finish(model.name(), outputs)?;

    tracing::info!(
        nodes = graph.nodes().len(),
        constants = graph.constants().len(),
        outputs = graph.outputs().len(),
        "exported graph"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TinyMlp {
        mode: Mode,
    }

    impl Model for TinyMlp {
        fn name(&self) -> &str {
            "tiny-mlp"
        }

        fn mode(&self) -> Mode {
            self.mode
        }

        fn forward(&self, t: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
            let h = t.linear(inputs[0], Tensor::ramp([8, 4], 0.1), Tensor::zeros([8]))?;
            let h = t.relu(h)?;
            let y = t.linear(h, Tensor::ramp([2, 8], 0.1), Tensor::zeros([2]))?;
            Ok(vec![y])
        }
    }

    struct Branchy;

    impl Model for Branchy {
        fn name(&self) -> &str {
            "branchy"
        }

        fn mode(&self) -> Mode {
            Mode::Eval
        }

        fn forward(&self, t: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
            let x = t.relu(inputs[0])?;
            if t.branch_on(x)? {
                Ok(vec![x])
            } else {
                Ok(vec![t.softmax(x)?])
            }
        }
    }

    #[test]
    fn test_export_records_nodes_and_shapes() {
        let graph = export(&TinyMlp { mode: Mode::Eval }, &[Tensor::zeros([1, 4])]).unwrap();
        assert_eq!(graph.nodes().len(), 3);
        assert_eq!(graph.constants().len(), 4);
        assert_eq!(graph.output_specs()[0].shape(), &[1, 2]);
    }

    #[test]
    fn test_export_rejects_training_mode() {
        let err = export(&TinyMlp { mode: Mode::Train }, &[Tensor::zeros([1, 4])]).unwrap_err();
        assert!(matches!(err, Error::Export(_)));
    }

    #[test]
    fn test_export_rejects_value_dependent_branch() {
        let err = export(&Branchy, &[Tensor::zeros([1, 4])]).unwrap_err();
        assert!(err.to_string().contains("control flow"));
    }

    #[test]
    fn test_export_shape_error_is_export_error() {
        let err = export(&TinyMlp { mode: Mode::Eval }, &[Tensor::zeros([1, 5])]).unwrap_err();
        assert!(matches!(err, Error::Export(_)));
    }
}
