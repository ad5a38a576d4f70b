//! Serve a pretrained object-detection model over HTTP: upload a still image
//! and receive an annotated result, or watch a live annotated stream from a
//! webcam in the browser.

pub mod endpoints;
pub mod nn;
pub mod pipeline;
pub mod render;
pub mod sensors;
pub mod utils;

pub type Error = Box<dyn std::error::Error>;
