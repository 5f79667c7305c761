//! ONNX Runtime implementation of [`PatchInference`].
//!
//! The model takes one `[1, 1, px, py, pz]` patch and returns class scores as
//! its first output, `[1, C, px, py, pz]`. Models trained with an auxiliary
//! head (e.g. a signed-distance regression) expose it as extra outputs, which
//! are passed along untouched in [`PatchResponse::WithAuxiliary`].

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{ArrayD, ArrayView5, Axis};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::backend::build_session;
use crate::config::{ModelConfig, OutputActivation};
use crate::inference::{HeadLayout, PatchInference, PatchResponse};

pub struct OnnxPatchModel {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    is_fp16: bool,
    head: HeadLayout,
    activation: OutputActivation,
}

impl OnnxPatchModel {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        if !config.path.is_file() {
            bail!("ONNX model not found: {}", config.path.display());
        }

        let session = build_session(&config.path, config.backend, &config.trt_cache_dir)?;

        let input_name = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?
            .name()
            .to_string();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        let head = HeadLayout::from_auxiliary_flag(config.auxiliary_head_present);
        match (head, output_names.len()) {
            (_, 0) => bail!("ONNX model declares no outputs"),
            (HeadLayout::WithAuxiliary, 1) => bail!(
                "auxiliary head configured but the model has a single output ({})",
                output_names[0]
            ),
            _ => {}
        }

        info!(
            %input_name,
            outputs = ?output_names,
            is_fp16,
            %head,
            "Loaded segmentation model"
        );

        Ok(Self {
            session,
            input_name,
            output_names,
            is_fp16,
            head,
            activation: config.activation,
        })
    }

    fn run(&mut self, patch: ArrayView5<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
        let input = patch.as_standard_layout().into_owned().into_dyn();

        let outputs = if self.is_fp16 {
            let f32_slice = input
                .as_slice()
                .context("patch must be contiguous for f16 conversion")?;
            let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
            fp16_data.convert_from_f32_slice(f32_slice);
            let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
            let input_tensor = Tensor::from_array(fp16_array)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let mut widened = Vec::with_capacity(self.output_names.len());
            for name in &self.output_names {
                let view = outputs[name.as_str()].try_extract_array::<f16>()?;
                widened.push(view.mapv(f16::to_f32));
            }
            widened
        } else {
            let input_tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let mut extracted = Vec::with_capacity(self.output_names.len());
            for name in &self.output_names {
                extracted.push(outputs[name.as_str()].try_extract_array::<f32>()?.to_owned());
            }
            extracted
        };

        Ok(outputs)
    }
}

impl PatchInference for OnnxPatchModel {
    fn infer(&mut self, patch: ArrayView5<'_, f32>) -> Result<PatchResponse> {
        let mut outputs = self.run(patch)?.into_iter();
        let mut scores = outputs.next().context("model produced no outputs")?;
        if self.activation == OutputActivation::Softmax {
            softmax_classes(&mut scores)?;
        }

        match self.head {
            HeadLayout::Single => Ok(PatchResponse::Scores(scores)),
            HeadLayout::WithAuxiliary => {
                let auxiliary: Vec<ArrayD<f32>> = outputs.collect();
                debug!(auxiliary = auxiliary.len(), "Discarding auxiliary outputs");
                Ok(PatchResponse::WithAuxiliary { scores, auxiliary })
            }
        }
    }
}

/// In-place softmax over the class axis of `[C, ...]` or `[1, C, ...]` scores.
pub fn softmax_classes(scores: &mut ArrayD<f32>) -> Result<()> {
    let class_axis = match scores.ndim() {
        4 => Axis(0),
        5 if scores.shape()[0] == 1 => Axis(1),
        _ => bail!("unexpected class-score shape {:?}", scores.shape()),
    };

    for mut lane in scores.lanes_mut(class_axis) {
        let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane /= sum;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;

    use super::*;

    #[test]
    fn softmax_normalizes_each_voxel() {
        let mut scores = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2, 2, 2]), |index| {
            (index[1] as f32) * 2.0 - (index[2] as f32)
        });
        softmax_classes(&mut scores).expect("softmax");
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    let total: f32 = (0..3).map(|c| scores[[0, c, x, y, z]]).sum();
                    assert!((total - 1.0).abs() < 1e-5);
                    assert!(scores[[0, 2, x, y, z]] > scores[[0, 0, x, y, z]]);
                }
            }
        }
    }

    #[test]
    fn softmax_accepts_unbatched_scores_and_large_logits() {
        let mut scores = ArrayD::from_elem(IxDyn(&[2, 1, 1, 1]), 1000.0f32);
        softmax_classes(&mut scores).expect("softmax");
        assert!((scores[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
        assert!((scores[[1, 0, 0, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn softmax_rejects_unexpected_rank() {
        let mut scores = ArrayD::<f32>::zeros(IxDyn(&[2, 2]));
        assert!(softmax_classes(&mut scores).is_err());
    }

    #[test]
    fn load_rejects_missing_model() {
        let config = ModelConfig {
            path: std::env::temp_dir().join("voxeval-missing-model.onnx"),
            ..ModelConfig::default()
        };
        let error = OnnxPatchModel::load(&config).err().expect("missing model");
        assert!(error.to_string().contains("not found"));
    }
}
