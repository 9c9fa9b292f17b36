//! Validate stage: reload the artifact and check its output contract
//!
//! The artifact is reloaded in a fresh [`Runtime`], its entry method is run
//! on a freshly sampled input matching the export-time specs, and the
//! outputs are checked for arity and shape.

use std::path::Path;
use std::time::{Duration, Instant};

use rand::Rng;

use super::runtime::Runtime;
use crate::tensor::TensorSpec;
use crate::{Error, Result};

/// Expected outputs of the entry method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputContract {
    outputs: Vec<Vec<usize>>,
}

impl OutputContract {
    /// Exactly one output tensor of `shape`.
    #[must_use]
    pub fn single(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            outputs: vec![shape.into()],
        }
    }

    /// One output per shape, in order.
    #[must_use]
    pub fn new(outputs: Vec<Vec<usize>>) -> Self {
        Self { outputs }
    }

    /// Expected output shapes.
    #[must_use]
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.outputs
    }

    /// Check actual output shapes against the contract.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on an arity or shape mismatch.
    pub fn check(&self, actual: &[&[usize]]) -> Result<()> {
        if actual.len() != self.outputs.len() {
            return Err(Error::Validation(format!(
                "unexpected output count {} (expected {})",
                actual.len(),
                self.outputs.len()
            )));
        }
        for (i, (got, want)) in actual.iter().zip(&self.outputs).enumerate() {
            if *got != want.as_slice() {
                return Err(Error::Validation(format!(
                    "unexpected shape {got:?} for output {i} (expected {want:?})"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a successful validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Method that was executed
    pub method: String,
    /// Input specs the sample was drawn from
    pub input_specs: Vec<TensorSpec>,
    /// Output shapes produced
    pub output_shapes: Vec<Vec<usize>>,
    /// Wall time of the execution
    pub elapsed: Duration,
}

/// Reload `artifact` and execute `method` once against `contract`.
///
/// # Errors
///
/// Returns [`Error::Validation`] on a contract mismatch, and propagates
/// load and execution failures ([`Error::NotFound`], [`Error::Runtime`]).
#[tracing::instrument(skip_all, fields(path = %artifact.display(), method = %method))]
pub fn validate<R: Rng>(
    artifact: &Path,
    method: &str,
    input_specs: &[TensorSpec],
    contract: &OutputContract,
    rng: &mut R,
) -> Result<ValidationReport> {
    let runtime = Runtime::new();
    let program = runtime.load_program(artifact)?;
    let loaded = program.load_method(method)?;

    let inputs: Vec<_> = input_specs.iter().map(|spec| spec.sample(rng)).collect();
    let started = Instant::now();
    let outputs = loaded.execute(&inputs)?;
    let elapsed = started.elapsed();

    let shapes: Vec<&[usize]> = outputs.iter().map(crate::tensor::Tensor::shape).collect();
    contract.check(&shapes)?;

    if outputs.iter().any(|t| t.data().iter().any(|v| !v.is_finite())) {
        tracing::warn!("validation output contains non-finite values");
    }
    tracing::info!(
        outputs = outputs.len(),
        elapsed_us = elapsed.as_micros() as u64,
        "validated artifact"
    );

    Ok(ValidationReport {
        method: method.to_string(),
        input_specs: input_specs.to_vec(),
        output_shapes: shapes.iter().map(|s| s.to_vec()).collect(),
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_accepts_match() {
        let contract = OutputContract::single([1, 1000]);
        let got: [&[usize]; 1] = [&[1, 1000]];
        contract.check(&got).unwrap();
    }

    #[test]
    fn test_contract_rejects_shape() {
        let contract = OutputContract::single([1, 1000]);
        let got: [&[usize]; 1] = [&[1, 10]];
        let err = contract.check(&got).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("[1, 10]"));
    }

    #[test]
    fn test_contract_rejects_arity() {
        let contract = OutputContract::single([1, 1000]);
        let got: [&[usize]; 2] = [&[1, 1000], &[1, 1000]];
        let err = contract.check(&got).unwrap_err();
        assert!(err.to_string().contains("output count"));
    }
}
