//! Reference image classifier
//!
//! A small MobileNet-shaped network (strided 3x3 convolutions, one
//! inverted-residual style skip connection, global pooling, dense head) with
//! deterministic weights. It stands in for a trained model so the pipeline
//! can be exercised end to end without a training framework.

use crate::compiler::{Mode, Model, Tracer, ValueId};
use crate::tensor::Tensor;
use crate::Result;

/// Default square input resolution.
pub const DEFAULT_RESOLUTION: usize = 224;

/// ImageNet class count.
pub const IMAGENET_CLASSES: usize = 1000;

/// Reference classifier: `[1, 3, R, R] -> [1, classes]` probabilities.
#[derive(Debug, Clone)]
pub struct ReferenceClassifier {
    classes: usize,
    resolution: usize,
    mode: Mode,
}

impl ReferenceClassifier {
    /// Evaluation-mode classifier with `classes` outputs at 224x224.
    #[must_use]
    pub const fn new(classes: usize) -> Self {
        Self {
            classes,
            resolution: DEFAULT_RESOLUTION,
            mode: Mode::Eval,
        }
    }

    /// Change the input resolution.
    #[must_use]
    pub const fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    /// Switch to training mode.
    #[must_use]
    pub const fn train(mut self) -> Self {
        self.mode = Mode::Train;
        self
    }

    /// Switch to evaluation mode.
    #[must_use]
    pub const fn eval(mut self) -> Self {
        self.mode = Mode::Eval;
        self
    }

    /// Output class count.
    #[must_use]
    pub const fn classes(&self) -> usize {
        self.classes
    }

    /// A representative input batch of one image.
    #[must_use]
    pub fn example_input(&self) -> Tensor {
        Tensor::zeros([1, 3, self.resolution, self.resolution])
    }

    /// Expected output shape.
    #[must_use]
    pub fn output_shape(&self) -> Vec<usize> {
        vec![1, self.classes]
    }
}

impl Default for ReferenceClassifier {
    fn default() -> Self {
        Self::new(IMAGENET_CLASSES)
    }
}

impl Model for ReferenceClassifier {
    fn name(&self) -> &str {
        "MobileNetV2"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn forward(&self, t: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
        let x = inputs[0];

        // stem
        let h = t.conv2d(x, Tensor::ramp([8, 3, 3, 3], 0.01), Tensor::zeros([8]), 2, 1)?;
        let h = t.relu6(h)?;
        let h = t.conv2d(h, Tensor::ramp([16, 8, 3, 3], 0.005), Tensor::zeros([16]), 2, 1)?;
        let h = t.relu6(h)?;

        // pointwise block with skip
        let r = t.conv2d(h, Tensor::ramp([16, 16, 1, 1], 0.02), Tensor::zeros([16]), 1, 0)?;
        let r = t.relu6(r)?;
        let h = t.add(h, r)?;

        let h = t.global_avg_pool(h)?;
        let h = t.flatten(h)?;
        let logits = t.linear(
            h,
            Tensor::ramp([self.classes, 16], 0.01),
            Tensor::zeros([self.classes]),
        )?;
        Ok(vec![t.softmax(logits)?])
    }
}
