//! Ports: trait seams to collaborators outside the substrate.

pub mod inference;
pub mod null_inference;

pub use inference::InferenceClient;
pub use null_inference::NullInferenceClient;
