//! Sliding-window inference and evaluation for volumetric segmentation models.

pub mod backend;
pub mod case_io;
pub mod components;
pub mod config;
pub mod crash;
pub mod driver;
pub mod engine;
pub mod error;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod onnx;
pub mod padding;
pub mod planner;
pub mod resolve;
pub mod runtime;
pub mod volume;

pub use engine::{Segmentation, SlidingWindowEngine};
pub use error::SegmentationError;
pub use inference::{HeadLayout, PatchInference, PatchResponse};
