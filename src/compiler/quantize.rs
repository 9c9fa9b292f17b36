//! Post-training weight quantization
//!
//! Symmetric per-tensor int8: `scale = max|w| / 127`, `q = round(w / scale)`.
//! Only weight operands of conv2d / linear are quantized; biases and
//! activations stay in f32. Kernels see dequantized weights.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::graph::ValueId;
use super::program::{ConstantData, LoweredProgram};

/// Weight quantization applied while lowering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantizationScheme {
    /// Full-precision weights.
    #[default]
    None,
    /// Post-training symmetric int8, one scale per weight tensor.
    Int8PerTensor,
}

impl fmt::Display for QuantizationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Int8PerTensor => "PTQ_Int8",
        })
    }
}

/// Quantize one weight tensor.
#[must_use]
pub fn quantize_tensor(values: &[f32]) -> ConstantData {
    let max_abs = values.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
    let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
    #[allow(clippy::cast_possible_truncation)]
    let values = values
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    ConstantData::I8 { values, scale }
}

/// Apply `scheme` to every weight operand in `program`.
///
/// Returns the number of tensors quantized.
#[tracing::instrument(skip(program))]
pub fn apply(program: &mut LoweredProgram, scheme: QuantizationScheme) -> usize {
    if scheme == QuantizationScheme::None {
        return 0;
    }
    let mut quantized = 0;
    for method in &mut program.methods {
        let weights: BTreeSet<ValueId> = method
            .segments
            .iter()
            .flat_map(|s| s.instructions.iter())
            .filter_map(|i| i.op.weight_operand().and_then(|idx| i.inputs.get(idx).copied()))
            .collect();
        for id in weights {
            if let Some(ConstantData::F32(values)) = method.constants.get(&id) {
                let q = quantize_tensor(values);
                method.constants.insert(id, q);
                quantized += 1;
            }
        }
    }
    program.quantization = scheme;
    tracing::info!(tensors = quantized, bytes = program.constant_bytes(), "quantized weights");
    quantized
}
