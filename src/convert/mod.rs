//! Payload formats and the conversion registry.
//!
//! Payloads cached by the core are opaque: bytes plus a [`DataFormat`] tag.
//! The [`ConversionRegistry`] contract describes how representations relate
//! (a directed graph of [`ConversionEdge`]s) and [`ConversionGraph`] is the
//! default table-backed implementation.

mod format;
mod graph;
mod registry;

pub use format::{DataFormat, Payload};
pub use graph::ConversionGraph;
pub use registry::{ConversionEdge, ConversionPath, ConversionRegistry, TransformFn};
