//! Model description, loading and the NVM image
//!
//! ```text
//! model.json ──► ModelSpec ──► ModelGraph::load ──► image::install ──► NVM
//!                               (validate, quantize,     (erase, write blobs,
//!                                allocate, plan slots)     tables, header)
//! ```
//!
//! At boot the controller reloads the same graph and calls [`image::verify`]
//! before trusting anything in the control region.

pub mod graph;
pub mod image;
pub mod spec;

pub use graph::{GraphNode, GraphOptions, ModelGraph, NO_LABEL};
pub use spec::{ModelBuilder, ModelSpec, NodeSpec, ParameterSpec, INPUT_NAME};
