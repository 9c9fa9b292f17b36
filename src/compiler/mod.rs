//! Model Compilation Pipeline
//!
//! Drives one model through four stages as an explicit state machine:
//!
//! ```text
//! Export ──> Lower ──> Serialize ──> Validate ──> Done
//!    │         │           │            │
//!    └─────────┴───────────┴────────────┴──────> Failed
//! ```
//!
//! Each stage consumes the previous stage's output. A failing stage moves
//! the pipeline to [`Stage::Failed`] and no later stage runs. Validation is
//! part of the chain, so a [`CompiledArtifact`] only exists for artifacts
//! that were reloaded and executed successfully.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modelpack::compiler::{CompileOptions, OutputContract, Pipeline, QuantizationScheme};
//! use modelpack::models::ReferenceClassifier;
//! use modelpack::tensor::Tensor;
//!
//! # fn main() -> modelpack::Result<()> {
//! let model = ReferenceClassifier::new(1000);
//! let options = CompileOptions::new()
//!     .with_quantization(QuantizationScheme::Int8PerTensor)
//!     .with_contract(OutputContract::single([1, 1000]));
//! let artifact = Pipeline::new(&model, vec![Tensor::zeros([1, 3, 224, 224])], "mv2.pte", options)
//!     .run()?;
//! println!("{} bytes", artifact.size_bytes());
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod export;
pub mod graph;
pub mod kernels;
pub mod partition;
pub mod program;
pub mod quantize;
pub mod runtime;
pub mod validate;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use container::{ArtifactFile, StagedArtifact};
pub use export::{export, Mode, Model, Tracer};
pub use graph::{ModelGraph, Op, ValueId};
pub use partition::{lower, Backend, CpuAcceleratedBackend, PartitionReport};
pub use program::{Executor, LoweredProgram};
pub use quantize::QuantizationScheme;
pub use runtime::Runtime;
pub use validate::{validate, OutputContract, ValidationReport};

use crate::tensor::{Tensor, TensorSpec};
use crate::{Error, Result, Stage};

/// Default entry method name.
pub const DEFAULT_METHOD: &str = "forward";

/// Options controlling a pipeline run.
pub struct CompileOptions {
    backends: Vec<Box<dyn Backend>>,
    quantization: QuantizationScheme,
    contract: Option<OutputContract>,
    method_name: String,
    validation_seed: Option<u64>,
}

impl CompileOptions {
    /// Accelerated CPU backend, no quantization, `forward` entry method.
    ///
    /// Without an explicit contract the output shapes recorded at export
    /// time are enforced.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: vec![Box::new(CpuAcceleratedBackend::new())],
            quantization: QuantizationScheme::None,
            contract: None,
            method_name: DEFAULT_METHOD.to_string(),
            validation_seed: None,
        }
    }

    /// Replace the backend preference list (first match wins).
    #[must_use]
    pub fn with_backends(mut self, backends: Vec<Box<dyn Backend>>) -> Self {
        self.backends = backends;
        self
    }

    /// Set weight quantization.
    #[must_use]
    pub const fn with_quantization(mut self, scheme: QuantizationScheme) -> Self {
        self.quantization = scheme;
        self
    }

    /// Set the output contract checked by the validate stage.
    #[must_use]
    pub fn with_contract(mut self, contract: OutputContract) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Set the entry method name.
    #[must_use]
    pub fn with_method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = name.into();
        self
    }

    /// Seed the validation input sampler (reproducible validation).
    #[must_use]
    pub const fn with_validation_seed(mut self, seed: u64) -> Self {
        self.validation_seed = Some(seed);
        self
    }

    /// Configured quantization.
    #[must_use]
    pub const fn quantization(&self) -> QuantizationScheme {
        self.quantization
    }

    /// Configured entry method name.
    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Backend names in preference order.
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    artifact: ArtifactFile,
    model_name: String,
    quantization: QuantizationScheme,
    backends: Vec<String>,
    partition: PartitionReport,
    validation: ValidationReport,
}

impl CompiledArtifact {
    /// Artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    /// Artifact size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.artifact.size_bytes()
    }

    /// Exported model name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Quantization that was applied.
    #[must_use]
    pub const fn quantization(&self) -> QuantizationScheme {
        self.quantization
    }

    /// Operator placement summary.
    #[must_use]
    pub const fn partition(&self) -> &PartitionReport {
        &self.partition
    }

    /// Validation outcome.
    #[must_use]
    pub const fn validation(&self) -> &ValidationReport {
        &self.validation
    }

    /// Run parameters describing how the artifact was built.
    #[must_use]
    pub fn params(&self) -> BTreeMap<String, String> {
        let backend = if self.partition.delegated_total() == 0 {
            "portable".to_string()
        } else {
            self.partition
                .delegated
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        };
        BTreeMap::from([
            ("base_model".to_string(), self.model_name.clone()),
            ("quantization_type".to_string(), self.quantization.to_string()),
            ("delegate_backend".to_string(), backend),
            ("backend_preference".to_string(), self.backends.join(",")),
            ("delegated_ops".to_string(), self.partition.delegated_total().to_string()),
            ("portable_ops".to_string(), self.partition.portable.to_string()),
            ("entry_method".to_string(), self.validation.method.clone()),
            ("container_version".to_string(), container::FORMAT_VERSION.to_string()),
        ])
    }
}

/// Four-stage compilation state machine for one model.
///
/// Call [`Pipeline::step`] to advance one stage at a time (for inspection),
/// or [`Pipeline::run`] to drive it to completion.
pub struct Pipeline<'m> {
    model: &'m dyn Model,
    example_inputs: Vec<Tensor>,
    output_path: PathBuf,
    options: CompileOptions,
    stage: Stage,
    failed_at: Option<Stage>,
    input_specs: Vec<TensorSpec>,
    output_specs: Vec<TensorSpec>,
    graph: Option<ModelGraph>,
    program: Option<LoweredProgram>,
    partition: Option<PartitionReport>,
    staged: Option<StagedArtifact>,
    artifact: Option<ArtifactFile>,
    validation: Option<ValidationReport>,
}

impl<'m> Pipeline<'m> {
    /// Prepare a pipeline; nothing runs until [`step`](Self::step) or
    /// [`run`](Self::run).
    pub fn new(
        model: &'m dyn Model,
        example_inputs: Vec<Tensor>,
        output_path: impl Into<PathBuf>,
        options: CompileOptions,
    ) -> Self {
        Self {
            model,
            example_inputs,
            output_path: output_path.into(),
            options,
            stage: Stage::Export,
            failed_at: None,
            input_specs: Vec::new(),
            output_specs: Vec::new(),
            graph: None,
            program: None,
            partition: None,
            staged: None,
            artifact: None,
            validation: None,
        }
    }

    /// Stage that runs on the next [`step`](Self::step).
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage that failed, once the pipeline is in [`Stage::Failed`].
    #[must_use]
    pub const fn failed_stage(&self) -> Option<Stage> {
        self.failed_at
    }

    /// Exported graph, available between Export and Lower.
    #[must_use]
    pub const fn graph(&self) -> Option<&ModelGraph> {
        self.graph.as_ref()
    }

    /// Lowered program, available between Lower and Serialize.
    #[must_use]
    pub const fn program(&self) -> Option<&LoweredProgram> {
        self.program.as_ref()
    }

    /// Serialized artifact awaiting validation, available between
    /// Serialize and Validate.
    #[must_use]
    pub const fn staged(&self) -> Option<&StagedArtifact> {
        self.staged.as_ref()
    }

    /// Artifact at the output path, available once Validate passed.
    #[must_use]
    pub const fn artifact(&self) -> Option<&ArtifactFile> {
        self.artifact.as_ref()
    }

    /// Run the current stage and advance.
    ///
    /// Returns the new current stage.
    ///
    /// # Errors
    ///
    /// Returns the stage's error (after moving to [`Stage::Failed`]), or
    /// [`Error::InvalidInput`] if the pipeline already finished.
    pub fn step(&mut self) -> Result<Stage> {
        let stage = self.stage;
        let outcome = match stage {
            Stage::Export => self.run_export(),
            Stage::Lower => self.run_lower(),
            Stage::Serialize => self.run_serialize(),
            Stage::Validate => self.run_validate(),
            Stage::Done | Stage::Failed => {
                return Err(Error::InvalidInput(format!(
                    "pipeline for '{}' already finished ({stage})",
                    self.model.name()
                )));
            }
        };
        match outcome {
            Ok(next) => {
                tracing::debug!(
                    model = self.model.name(),
                    from = %stage,
                    to = %next,
                    "pipeline advanced"
                );
                self.stage = next;
                Ok(next)
            }
            Err(e) => {
                tracing::error!(
                    model = self.model.name(),
                    stage = %stage,
                    error = %e,
                    "pipeline stage failed"
                );
                self.stage = Stage::Failed;
                self.failed_at = Some(stage);
                Err(e)
            }
        }
    }

    /// Drive every remaining stage and return the validated artifact.
    ///
    /// # Errors
    ///
    /// Returns the first stage error, unmodified.
    #[tracing::instrument(
        skip_all,
        fields(model = self.model.name(), path = %self.output_path.display())
    )]
    pub fn run(mut self) -> Result<CompiledArtifact> {
        while self.stage != Stage::Done {
            self.step()?;
        }
        self.finish()
    }

    /// Consume a finished pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] unless the pipeline reached
    /// [`Stage::Done`].
    pub fn finish(self) -> Result<CompiledArtifact> {
        match (self.stage, self.artifact, self.partition, self.validation) {
            (Stage::Done, Some(artifact), Some(partition), Some(validation)) => {
                Ok(CompiledArtifact {
                    artifact,
                    model_name: self.model.name().to_string(),
                    quantization: self.options.quantization,
                    backends: self.options.backend_names(),
                    partition,
                    validation,
                })
            }
            (stage, ..) => Err(Error::InvalidInput(format!(
                "pipeline is at stage {stage}; only a validated pipeline yields an artifact"
            ))),
        }
    }

    fn run_export(&mut self) -> Result<Stage> {
        let graph = export(self.model, &self.example_inputs)?;
        self.input_specs = graph.input_specs();
        self.output_specs = graph.output_specs();
        self.graph = Some(graph);
        Ok(Stage::Lower)
    }

    fn run_lower(&mut self) -> Result<Stage> {
        let graph = self
            .graph
            .take()
            .ok_or_else(|| Error::Lowering("no exported graph to lower".to_string()))?;
        let (mut program, report) =
            lower(graph, &self.options.backends, &self.options.method_name)?;
        let quantized = quantize::apply(&mut program, self.options.quantization);
        if quantized > 0 {
            let scheme = self.options.quantization;
            tracing::info!(tensors = quantized, scheme = %scheme, "quantized weights");
        }
        self.program = Some(program);
        self.partition = Some(report);
        Ok(Stage::Serialize)
    }

    fn run_serialize(&mut self) -> Result<Stage> {
        let program = self
            .program
            .take()
            .ok_or_else(|| Error::Serialization("no lowered program to serialize".to_string()))?;
        self.staged = Some(container::stage(&program, &self.output_path)?);
        Ok(Stage::Validate)
    }

    fn run_validate(&mut self) -> Result<Stage> {
        // Dropping the staged file on any error below leaves the output path
        // exactly as it was before this run.
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::Validation("no artifact to validate".to_string()))?;
        let contract = self.options.contract.clone().unwrap_or_else(|| {
            OutputContract::new(self.output_specs.iter().map(|s| s.shape().to_vec()).collect())
        });
        let mut rng = self
            .options
            .validation_seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        let report = validate(
            staged.path(),
            &self.options.method_name,
            &self.input_specs,
            &contract,
            &mut rng,
        )?;
        self.artifact = Some(staged.commit()?);
        self.validation = Some(report);
        Ok(Stage::Done)
    }
}

/// Compile `model` end to end.
///
/// # Errors
///
/// Returns the first stage error; see [`Pipeline::run`].
pub fn compile(
    model: &dyn Model,
    example_inputs: Vec<Tensor>,
    output_path: impl Into<PathBuf>,
    options: CompileOptions,
) -> Result<CompiledArtifact> {
    Pipeline::new(model, example_inputs, output_path, options).run()
}

/// One independent compilation in a batch.
pub struct CompileJob {
    /// Model to compile
    pub model: Box<dyn Model>,
    /// Example inputs fixing shapes
    pub example_inputs: Vec<Tensor>,
    /// Destination artifact path
    pub output_path: PathBuf,
    /// Pipeline options
    pub options: CompileOptions,
}

/// Compile independent models in parallel.
///
/// Stages of one model still run strictly in order; parallelism is only
/// across jobs. Results are returned in job order.
#[cfg(feature = "rayon")]
#[must_use]
pub fn compile_batch(jobs: Vec<CompileJob>) -> Vec<Result<CompiledArtifact>> {
    use rayon::prelude::*;

    jobs.into_par_iter()
        .map(|job| compile(job.model.as_ref(), job.example_inputs, job.output_path, job.options))
        .collect()
}

/// Run the pipeline on tokio's blocking pool.
///
/// # Errors
///
/// Returns the pipeline's error, or [`Error::Worker`] if the worker task
/// panicked or was cancelled.
pub async fn compile_on_worker(
    model: Arc<dyn Model>,
    example_inputs: Vec<Tensor>,
    output_path: PathBuf,
    options: CompileOptions,
) -> Result<CompiledArtifact> {
    tokio::task::spawn_blocking(move || {
        compile(model.as_ref(), example_inputs, output_path, options)
    })
    .await
        .map_err(|e| Error::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dense {
        classes: usize,
    }

    impl Model for Dense {
        fn name(&self) -> &str {
            "dense"
        }

        fn mode(&self) -> Mode {
            Mode::Eval
        }

        fn forward(&self, t: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
            let w = Tensor::ramp([self.classes, 4], 0.1);
            let b = Tensor::zeros([self.classes]);
            let h = t.linear(inputs[0], w, b)?;
            Ok(vec![t.softmax(h)?])
        }
    }

    fn pipeline<'m>(model: &'m Dense, path: &Path) -> Pipeline<'m> {
        Pipeline::new(
            model,
            vec![Tensor::zeros([1, 4])],
            path,
            CompileOptions::new().with_validation_seed(7),
        )
    }

    #[test]
    fn test_step_walks_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dense.pte");
        let model = Dense { classes: 3 };
        let mut p = pipeline(&model, &path);

        assert_eq!(p.stage(), Stage::Export);
        assert_eq!(p.step().unwrap(), Stage::Lower);
        assert!(p.graph().is_some());
        assert_eq!(p.step().unwrap(), Stage::Serialize);
        assert!(p.program().is_some());
        assert!(!path.exists());
        assert_eq!(p.step().unwrap(), Stage::Validate);
        assert!(p.staged().unwrap().path().exists());
        assert!(!path.exists());
        assert_eq!(p.step().unwrap(), Stage::Done);
        assert!(path.exists());
        assert!(p.staged().is_none());

        let artifact = p.finish().unwrap();
        assert_eq!(artifact.validation().output_shapes, vec![vec![1, 3]]);
    }

    #[test]
    fn test_step_after_done_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = Dense { classes: 2 };
        let mut p = pipeline(&model, &dir.path().join("m.pte"));
        while p.stage() != Stage::Done {
            p.step().unwrap();
        }
        assert!(matches!(p.step(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_finish_before_done_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = Dense { classes: 2 };
        let mut p = pipeline(&model, &dir.path().join("m.pte"));
        p.step().unwrap();
        assert!(p.finish().is_err());
    }

    #[test]
    fn test_contract_mismatch_fails_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.pte");
        let model = Dense { classes: 10 };
        let options = CompileOptions::new().with_contract(OutputContract::single([1, 1000]));
        let mut p = Pipeline::new(&model, vec![Tensor::zeros([1, 4])], &path, options);

        let err = loop {
            if let Err(e) = p.step() {
                break e;
            }
        };
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(p.stage(), Stage::Failed);
        assert_eq!(p.failed_stage(), Some(Stage::Validate));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejected_rebuild_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.pte");
        let model = Dense { classes: 10 };
        pipeline(&model, &path).run().unwrap();
        let good = std::fs::read(&path).unwrap();

        let options = CompileOptions::new().with_contract(OutputContract::single([1, 1000]));
        let err = compile(&model, vec![Tensor::zeros([1, 4])], &path, options).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(std::fs::read(&path).unwrap(), good);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_params_describe_build() {
        let dir = tempfile::tempdir().unwrap();
        let model = Dense { classes: 2 };
        let options = CompileOptions::new().with_quantization(QuantizationScheme::Int8PerTensor);
        let path = dir.path().join("q.pte");
        let artifact = compile(&model, vec![Tensor::zeros([1, 4])], path, options).unwrap();
        let params = artifact.params();
        assert_eq!(params["base_model"], "dense");
        assert_eq!(params["quantization_type"], "PTQ_Int8");
        assert_eq!(params["delegate_backend"], CpuAcceleratedBackend::NAME);
        assert_eq!(params["portable_ops"], "1");
    }
}
