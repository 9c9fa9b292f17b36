//! Model graph IR
//!
//! A [`ModelGraph`] is the frozen output of the export stage: every value has
//! a fixed [`TensorSpec`], constants carry their weights, and nodes are kept
//! in trace order (which is a valid topological order).
//!
//! Graphs are immutable once built. Later stages produce new values instead
//! of editing a graph in place.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::{Tensor, TensorSpec};

/// Handle to a value (graph input, constant or node output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Graph operators.
///
/// Operand order is fixed per operator:
/// - `Conv2d`: input `[N,C,H,W]`, weight `[O,C,KH,KW]`, bias `[O]`
/// - `Linear`: input `[N,K]`, weight `[M,K]`, bias `[M]`
/// - `Add`: two operands of identical shape
/// - everything else: one operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// 2-D convolution with square stride and zero padding.
    Conv2d {
        /// Stride in both spatial dims
        stride: usize,
        /// Zero padding on every spatial edge
        padding: usize,
    },
    /// Fully connected layer `y = x W^T + b`.
    Linear,
    /// Elementwise `max(x, 0)`.
    Relu,
    /// Elementwise `min(max(x, 0), 6)`.
    Relu6,
    /// Elementwise sum.
    Add,
    /// Mean over spatial dims: `[N,C,H,W] -> [N,C]`.
    GlobalAvgPool,
    /// Collapse all non-batch dims: `[N, ...] -> [N, prod(...)]`.
    Flatten,
    /// Softmax over the last axis.
    Softmax,
}

impl Op {
    /// Stable operator name, used for kernel lookup and backend support tables.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::Linear => "linear",
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::Add => "add",
            Self::GlobalAvgPool => "global_avg_pool",
            Self::Flatten => "flatten",
            Self::Softmax => "softmax",
        }
    }

    /// Operand count.
    #[must_use]
    pub const fn arity(&self) -> usize {
        match self {
            Self::Conv2d { .. } | Self::Linear => 3,
            Self::Add => 2,
            _ => 1,
        }
    }

    /// Index of the weight operand, for operators that have one.
    #[must_use]
    pub const fn weight_operand(&self) -> Option<usize> {
        match self {
            Self::Conv2d { .. } | Self::Linear => Some(1),
            _ => None,
        }
    }

    /// Infer the output spec from operand specs.
    ///
    /// # Errors
    ///
    /// Returns a description of the shape mismatch.
    pub fn infer(&self, inputs: &[&TensorSpec]) -> Result<TensorSpec, String> {
        if inputs.len() != self.arity() {
            return Err(format!(
                "{} expects {} operands, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            ));
        }
        let x = inputs[0].shape();
        match self {
            Self::Conv2d { stride, padding } => {
                let w = inputs[1].shape();
                let b = inputs[2].shape();
                if x.len() != 4 || w.len() != 4 {
                    return Err(format!("conv2d expects 4-D input and weight, got {x:?} and {w:?}"));
                }
                if *stride == 0 {
                    return Err("conv2d stride must be positive".to_string());
                }
                if x[1] != w[1] {
                    return Err(format!(
                        "conv2d channel mismatch: input {} vs weight {}",
                        x[1], w[1]
                    ));
                }
                if b != [w[0]] {
                    return Err(format!("conv2d bias must be [{}], got {b:?}", w[0]));
                }
                let (h, wd) = (x[2] + 2 * padding, x[3] + 2 * padding);
                if h < w[2] || wd < w[3] {
                    return Err(format!("conv2d kernel {:?} larger than padded input", &w[2..]));
                }
                let oh = (h - w[2]) / stride + 1;
                let ow = (wd - w[3]) / stride + 1;
                Ok(TensorSpec::f32([x[0], w[0], oh, ow]))
            }
            Self::Linear => {
                let w = inputs[1].shape();
                let b = inputs[2].shape();
                if x.len() != 2 || w.len() != 2 {
                    return Err(format!("linear expects 2-D input and weight, got {x:?} and {w:?}"));
                }
                if x[1] != w[1] {
                    return Err(format!(
                        "linear feature mismatch: input {} vs weight {}",
                        x[1], w[1]
                    ));
                }
                if b != [w[0]] {
                    return Err(format!("linear bias must be [{}], got {b:?}", w[0]));
                }
                Ok(TensorSpec::f32([x[0], w[0]]))
            }
            Self::Add => {
                if inputs[0].shape() != inputs[1].shape() {
                    return Err(format!(
                        "add shape mismatch: {:?} vs {:?}",
                        inputs[0].shape(),
                        inputs[1].shape()
                    ));
                }
                Ok(TensorSpec::f32(x.to_vec()))
            }
            Self::Relu | Self::Relu6 => Ok(TensorSpec::f32(x.to_vec())),
            Self::Softmax => {
                if x.is_empty() {
                    return Err("softmax needs at least one axis".to_string());
                }
                Ok(TensorSpec::f32(x.to_vec()))
            }
            Self::GlobalAvgPool => {
                if x.len() != 4 {
                    return Err(format!("global_avg_pool expects [N,C,H,W], got {x:?}"));
                }
                Ok(TensorSpec::f32([x[0], x[1]]))
            }
            Self::Flatten => {
                if x.is_empty() {
                    return Err("flatten needs a batch axis".to_string());
                }
                Ok(TensorSpec::f32([x[0], x[1..].iter().product()]))
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv2d { stride, padding } => {
                write!(f, "conv2d(stride={stride}, padding={padding})")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// One operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operator
    pub op: Op,
    /// Operand values, in operator order
    pub inputs: Vec<ValueId>,
    /// Produced value
    pub output: ValueId,
}

/// Frozen, shape-annotated graph of a model's forward computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGraph {
    name: String,
    values: Vec<TensorSpec>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    constants: BTreeMap<ValueId, Tensor>,
    nodes: Vec<Node>,
}

impl ModelGraph {
    pub(crate) fn from_parts(
        name: String,
        values: Vec<TensorSpec>,
        inputs: Vec<ValueId>,
        outputs: Vec<ValueId>,
        constants: BTreeMap<ValueId, Tensor>,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            name,
            values,
            inputs,
            outputs,
            constants,
            nodes,
        }
    }

    /// Model name the graph was exported from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spec of a value.
    #[must_use]
    pub fn spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.values.get(id.0)
    }

    /// All value specs, indexed by [`ValueId`].
    #[must_use]
    pub fn values(&self) -> &[TensorSpec] {
        &self.values
    }

    /// Graph inputs.
    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Input specs in declaration order.
    #[must_use]
    pub fn input_specs(&self) -> Vec<TensorSpec> {
        self.inputs.iter().map(|id| self.values[id.0].clone()).collect()
    }

    /// Graph outputs.
    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Output specs in declaration order.
    #[must_use]
    pub fn output_specs(&self) -> Vec<TensorSpec> {
        self.outputs.iter().map(|id| self.values[id.0].clone()).collect()
    }

    /// Constant tensors (weights, biases).
    #[must_use]
    pub const fn constants(&self) -> &BTreeMap<ValueId, Tensor> {
        &self.constants
    }

    /// Nodes in topological order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Operator histogram, keyed by operator name.
    #[must_use]
    pub fn op_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.op.name()).or_insert(0) += 1;
        }
        counts
    }
}
