//! Lowered, backend-targeted program
//!
//! A [`LoweredProgram`] is what the serialize stage writes: a set of named
//! methods, each a sequence of [`Segment`]s. A segment is either delegated to
//! a named backend or runs on the portable executor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::graph::{Op, ValueId};
use super::quantize::QuantizationScheme;
use crate::tensor::TensorSpec;

/// Who executes a segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Executor {
    /// Backend-specific kernel library.
    Delegate {
        /// Backend name, e.g. `cpu-accelerated`
        backend: String,
    },
    /// Generic fallback executor.
    Portable,
}

impl Executor {
    /// Short label for logs and params.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Delegate { backend } => backend,
            Self::Portable => "portable",
        }
    }
}

/// A single operator invocation inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Operator
    pub op: Op,
    /// Operand slots
    pub inputs: Vec<ValueId>,
    /// Result slot
    pub output: ValueId,
}

/// Contiguous run of instructions handled by one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Executor for every instruction in the segment
    pub executor: Executor,
    /// Instructions in execution order
    pub instructions: Vec<Instruction>,
}

/// Weight storage inside a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantData {
    /// Full-precision values.
    F32(Vec<f32>),
    /// Symmetric int8 values; real value is `q * scale`.
    I8 {
        /// Quantized values
        values: Vec<i8>,
        /// Per-tensor scale
        scale: f32,
    },
}

impl ConstantData {
    /// Dequantized view.
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::I8 { values, scale } => values.iter().map(|q| f32::from(*q) * scale).collect(),
        }
    }

    /// Stored payload size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::F32(v) => v.len() * 4,
            Self::I8 { values, .. } => values.len() + 4,
        }
    }
}

/// An executable entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMethod {
    /// Method name (`forward` by default)
    pub name: String,
    /// Spec of every value slot, indexed by [`ValueId`]
    pub values: Vec<TensorSpec>,
    /// Input slots
    pub inputs: Vec<ValueId>,
    /// Output slots
    pub outputs: Vec<ValueId>,
    /// Constant slots and their data
    pub constants: BTreeMap<ValueId, ConstantData>,
    /// Segments in execution order
    pub segments: Vec<Segment>,
}

impl ProgramMethod {
    /// Total instruction count across segments.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.segments.iter().map(|s| s.instructions.len()).sum()
    }

    /// Input specs in declaration order, or `None` if an input has no
    /// value slot.
    #[must_use]
    pub fn input_specs(&self) -> Option<Vec<TensorSpec>> {
        self.specs_of(&self.inputs)
    }

    /// Output specs in declaration order, or `None` if an output has no
    /// value slot.
    #[must_use]
    pub fn output_specs(&self) -> Option<Vec<TensorSpec>> {
        self.specs_of(&self.outputs)
    }

    fn specs_of(&self, ids: &[ValueId]) -> Option<Vec<TensorSpec>> {
        ids.iter().map(|id| self.values.get(id.0).cloned()).collect()
    }

    /// Check that every slot reference is in range and every instruction
    /// carries as many operands as its operator takes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed reference.
    pub fn check_structure(&self) -> std::result::Result<(), String> {
        let slots = self.values.len();
        let in_range = |what: &str, id: ValueId| {
            if id.0 < slots {
                Ok(())
            } else {
                Err(format!("{what} {id} is outside the {slots} value slots"))
            }
        };
        for id in &self.inputs {
            in_range("input", *id)?;
        }
        for id in &self.outputs {
            in_range("output", *id)?;
        }
        for id in self.constants.keys() {
            in_range("constant", *id)?;
        }
        for ins in self.segments.iter().flat_map(|s| s.instructions.iter()) {
            let arity = ins.op.arity();
            if ins.inputs.len() != arity {
                return Err(format!(
                    "{} takes {arity} operands, instruction has {}",
                    ins.op.name(),
                    ins.inputs.len()
                ));
            }
            for id in &ins.inputs {
                in_range("operand", *id)?;
            }
            in_range("result", ins.output)?;
        }
        Ok(())
    }
}

/// Hardware-targeted program produced by the lower stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoweredProgram {
    /// Source model name
    pub model_name: String,
    /// Weight quantization applied during lowering
    pub quantization: QuantizationScheme,
    /// Executable methods
    pub methods: Vec<ProgramMethod>,
}

impl LoweredProgram {
    /// Look up a method by name.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&ProgramMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Method names.
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.name.as_str()).collect()
    }

    /// Bytes of constant storage across methods.
    #[must_use]
    pub fn constant_bytes(&self) -> usize {
        self.methods
            .iter()
            .flat_map(|m| m.constants.values())
            .map(ConstantData::byte_len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(values: usize, instructions: Vec<Instruction>) -> ProgramMethod {
        ProgramMethod {
            name: "forward".to_string(),
            values: vec![TensorSpec::f32(vec![1, 2]); values],
            inputs: vec![ValueId(0)],
            outputs: vec![ValueId(values.saturating_sub(1))],
            constants: BTreeMap::new(),
            segments: vec![Segment {
                executor: Executor::Portable,
                instructions,
            }],
        }
    }

    #[test]
    fn test_well_formed_method_passes() {
        let m = method(
            2,
            vec![Instruction {
                op: Op::Relu,
                inputs: vec![ValueId(0)],
                output: ValueId(1),
            }],
        );
        assert_eq!(m.check_structure(), Ok(()));
        assert_eq!(m.input_specs(), Some(vec![TensorSpec::f32(vec![1, 2])]));
    }

    #[test]
    fn test_missing_operand_is_reported() {
        let m = method(
            2,
            vec![Instruction {
                op: Op::Add,
                inputs: vec![ValueId(0)],
                output: ValueId(1),
            }],
        );
        let err = m.check_structure().unwrap_err();
        assert!(err.contains("takes 2 operands"), "{err}");
    }

    #[test]
    fn test_result_slot_out_of_range_is_reported() {
        let m = method(
            1,
            vec![Instruction {
                op: Op::Relu,
                inputs: vec![ValueId(0)],
                output: ValueId(5),
            }],
        );
        assert!(m.check_structure().is_err());
    }

    #[test]
    fn test_specs_of_dangling_input_is_none() {
        let mut m = method(1, vec![]);
        m.inputs = vec![ValueId(3)];
        assert_eq!(m.input_specs(), None);
        assert!(m.check_structure().is_err());
    }
}
