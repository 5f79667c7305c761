//! Execution-provider selection for ONNX Runtime sessions.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::execution_providers::{
    CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Where patch inference runs.
///
/// TensorRT falls back to CUDA when its libraries are missing; ORT falls back
/// to CPU when CUDA is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Whether CUDA/cuDNN/TensorRT libraries should be preloaded.
    pub fn uses_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Provider chain in registration order, most preferred first.
    fn providers(self, trt_cache_dir: &Path) -> Vec<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => Vec::new(),
            Self::Cuda => vec![CUDAExecutionProvider::default().build()],
            Self::Tensorrt => vec![
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(trt_cache_dir.to_string_lossy().to_string())
                    .with_device_id(0)
                    .build(),
                CUDAExecutionProvider::default().build(),
            ],
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Tensorrt => "tensorrt",
        })
    }
}

/// Loads a segmentation model with the providers `backend` asks for.
///
/// TensorRT engines are cached under `trt_cache_dir` so only the first run
/// pays for engine building.
pub fn build_session(
    model_path: &Path,
    backend: InferenceBackend,
    trt_cache_dir: &Path,
) -> Result<Session> {
    let started = Instant::now();
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match backend {
        InferenceBackend::Cpu => {}
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA execution provider unavailable; patches will run on CPU");
            }
        }
        InferenceBackend::Tensorrt => {
            if let Err(error) = std::fs::create_dir_all(trt_cache_dir) {
                warn!(
                    dir = %trt_cache_dir.display(),
                    %error,
                    "Cannot create TensorRT engine cache; engines will be rebuilt every run"
                );
            }
            info!(
                cache_dir = %trt_cache_dir.display(),
                "Building TensorRT engines (first run may take several minutes)"
            );
        }
    }

    let providers = backend.providers(trt_cache_dir);
    debug!(%backend, providers = providers.len(), "Registering execution providers");
    if !providers.is_empty() {
        builder = builder.with_execution_providers(providers)?;
    }

    let session = builder
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    info!(
        %backend,
        model = %model_path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );
    Ok(session)
}
