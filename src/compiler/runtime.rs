//! Program runtime
//!
//! Loads a serialized container into a fresh instance and executes its
//! methods. Every [`Runtime`] owns its own operator registry; nothing is
//! shared between instances.

use std::collections::BTreeMap;
use std::path::Path;

use rustc_hash::FxHashMap;

use super::container;
use super::graph::ValueId;
use super::kernels::{KernelFn, KERNELS};
use super::program::{Executor, LoweredProgram, ProgramMethod};
use crate::tensor::{Tensor, TensorSpec};
use crate::{Error, Result};

/// Operator registry plus program loader.
pub struct Runtime {
    kernels: FxHashMap<&'static str, KernelFn>,
}

impl Runtime {
    /// Create a runtime with every built-in kernel registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kernels: KERNELS.iter().copied().collect(),
        }
    }

    /// Names of registered operators, sorted.
    #[must_use]
    pub fn operator_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.kernels.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Load a program container from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for a missing file and [`Error::Runtime`]
    /// for an invalid container or an operator without a registered kernel.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_program(&self, path: impl AsRef<Path>) -> Result<LoadedProgram<'_>> {
        let program = container::read(path.as_ref())?;
        self.load(program)
    }

    /// Wrap an in-memory program.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if the program uses an unregistered operator
    /// or references a value slot that does not exist.
    pub fn load(&self, program: LoweredProgram) -> Result<LoadedProgram<'_>> {
        for method in &program.methods {
            method.check_structure().map_err(|e| {
                Error::Runtime(format!("method '{}' is malformed: {e}", method.name))
            })?;
            for ins in method.segments.iter().flat_map(|s| s.instructions.iter()) {
                if !self.kernels.contains_key(ins.op.name()) {
                    return Err(Error::Runtime(format!(
                        "method '{}' uses operator '{}' with no registered kernel",
                        method.name,
                        ins.op.name()
                    )));
                }
            }
        }
        tracing::debug!(methods = ?program.method_names(), "loaded program");
        Ok(LoadedProgram {
            runtime: self,
            program,
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// A program bound to a runtime.
pub struct LoadedProgram<'rt> {
    runtime: &'rt Runtime,
    program: LoweredProgram,
}

impl<'rt> LoadedProgram<'rt> {
    /// Method names available for loading.
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        self.program.method_names()
    }

    /// The decoded program.
    #[must_use]
    pub const fn program(&self) -> &LoweredProgram {
        &self.program
    }

    /// Prepare a method for execution, materializing its constants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if no method has that name or its slots
    /// do not line up with its constants and inputs.
    pub fn load_method(&self, name: &str) -> Result<LoadedMethod<'_, 'rt>> {
        let method = self.program.method(name).ok_or_else(|| {
            Error::Runtime(format!(
                "no method '{name}' in program (available: {:?})",
                self.program.method_names()
            ))
        })?;
        let mut constants = BTreeMap::new();
        for (id, data) in &method.constants {
            let spec = method
                .values
                .get(id.0)
                .ok_or_else(|| Error::Runtime(format!("constant {id} has no value slot")))?;
            constants.insert(*id, Tensor::new(spec.shape(), data.to_f32())?);
        }
        let input_specs = method.input_specs().ok_or_else(|| {
            Error::Runtime(format!("method '{name}' declares an input with no value slot"))
        })?;
        Ok(LoadedMethod {
            runtime: self.runtime,
            method,
            input_specs,
            constants,
        })
    }
}

/// A method ready to execute.
pub struct LoadedMethod<'p, 'rt> {
    runtime: &'rt Runtime,
    method: &'p ProgramMethod,
    input_specs: Vec<TensorSpec>,
    constants: BTreeMap<ValueId, Tensor>,
}

impl LoadedMethod<'_, '_> {
    /// Declared input specs.
    #[must_use]
    pub fn input_specs(&self) -> &[TensorSpec] {
        &self.input_specs
    }

    /// Execute with the given inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if inputs do not match the declared specs
    /// or a kernel fails.
    pub fn execute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let specs = &self.input_specs;
        if inputs.len() != specs.len() {
            return Err(Error::Runtime(format!(
                "method '{}' expects {} inputs, got {}",
                self.method.name,
                specs.len(),
                inputs.len()
            )));
        }
        let mut slots: Vec<Option<Tensor>> = vec![None; self.method.values.len()];
        for ((id, spec), tensor) in self.method.inputs.iter().zip(specs).zip(inputs) {
            if tensor.shape() != spec.shape() {
                return Err(Error::Runtime(format!(
                    "input {id} expects shape {:?}, got {:?}",
                    spec.shape(),
                    tensor.shape()
                )));
            }
            store(&mut slots, *id, tensor.clone())?;
        }
        for (id, tensor) in &self.constants {
            store(&mut slots, *id, tensor.clone())?;
        }

        for segment in &self.method.segments {
            if let Executor::Delegate { backend } = &segment.executor {
                let ops = segment.instructions.len();
                tracing::trace!(backend = %backend, ops, "delegate segment");
            }
            for ins in &segment.instructions {
                let kernel = self.runtime.kernels.get(ins.op.name()).ok_or_else(|| {
                    Error::Runtime(format!("no kernel for '{}'", ins.op.name()))
                })?;
                let out = {
                    let args = ins
                        .inputs
                        .iter()
                        .map(|id| {
                            slots.get(id.0).and_then(Option::as_ref).ok_or_else(|| {
                                Error::Runtime(format!("value {id} read before it was produced"))
                            })
                        })
                        .collect::<Result<Vec<&Tensor>>>()?;
                    kernel(&ins.op, &args)?
                };
                store(&mut slots, ins.output, out)?;
            }
        }

        self.method
            .outputs
            .iter()
            .map(|id| {
                slots
                    .get(id.0)
                    .and_then(Option::as_ref)
                    .cloned()
                    .ok_or_else(|| Error::Runtime(format!("output {id} was never produced")))
            })
            .collect()
    }
}

fn store(slots: &mut [Option<Tensor>], id: ValueId, tensor: Tensor) -> Result<()> {
    let slot = slots
        .get_mut(id.0)
        .ok_or_else(|| Error::Runtime(format!("value {id} has no slot")))?;
    *slot = Some(tensor);
    Ok(())
}
