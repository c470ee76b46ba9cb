//! The conversion registry contract.
//!
//! The registry owns the directed graph of payload representations. The cache
//! core consumes this trait only: it asks for a [`ConversionPath`] between two
//! tags, applies the edges one at a time, and hands payloads back through
//! [`ConversionRegistry::destroy`] when it is done with them.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;

use crate::convert::format::{DataFormat, Payload};

/// Boxed async transform applied along one conversion edge.
///
/// Resolving to `None` means the transform failed; the caller rolls back.
pub type TransformFn =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Option<Payload>> + Send + Sync>;

/// One edge of the conversion graph: `origin` → `target` plus the transform
/// that performs the step.
#[derive(Clone)]
pub struct ConversionEdge {
    /// Representation consumed by the transform.
    pub origin: DataFormat,
    /// Representation produced by the transform.
    pub target: DataFormat,
    transform: TransformFn,
}

impl ConversionEdge {
    /// Create an edge from an async closure.
    pub fn new<F, Fut>(
        origin: impl Into<DataFormat>,
        target: impl Into<DataFormat>,
        transform: F,
    ) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Payload>> + Send + 'static,
    {
        Self {
            origin: origin.into(),
            target: target.into(),
            transform: Arc::new(move |payload| transform(payload).boxed()),
        }
    }

    /// Apply the transform to `input`.
    pub fn transform(&self, input: Payload) -> BoxFuture<'static, Option<Payload>> {
        (self.transform)(input)
    }
}

impl fmt::Debug for ConversionEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionEdge")
            .field("origin", &self.origin)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A finite sequence of composable edges. Empty means no route exists.
pub type ConversionPath = Vec<ConversionEdge>;

/// Process-wide collaborator exposing the format graph.
///
/// Implementations must be thread-safe (`Send + Sync`); the cache shares one
/// registry across every record and every conversion task.
///
/// # Implementors
///
/// - [`ConversionGraph`](crate::convert::ConversionGraph): edge table with
///   BFS shortest-path lookup
/// - Test doubles wrapping a graph to record calls
pub trait ConversionRegistry: Send + Sync {
    /// Shortest sequence of edges from `from` to `to`, or empty when
    /// unreachable. Adjacent edges compose: each edge's `target` is the next
    /// edge's `origin`.
    fn conversion_path(&self, from: &DataFormat, to: &DataFormat) -> ConversionPath;

    /// One-shot convenience: convert `data` from `from` to `to`, releasing
    /// every intermediate (and the input) along the way.
    ///
    /// Returns `None` when no route exists or a transform fails. `from == to`
    /// resolves with the input untouched.
    fn convert(
        &self,
        data: Payload,
        from: &DataFormat,
        to: &DataFormat,
    ) -> BoxFuture<'static, Option<Payload>>;

    /// Deep copy `data` within its format.
    fn copy(&self, data: &Payload, format: &DataFormat) -> BoxFuture<'static, Payload>;

    /// Release a payload the caller no longer needs.
    ///
    /// Type-specific; for plain byte buffers this is a no-op beyond dropping
    /// the handle.
    fn destroy(&self, data: Payload, format: &DataFormat);

    /// Best-effort format inference for untagged data.
    fn guess_type(&self, data: &Payload) -> Option<DataFormat>;
}

/// Arc-wrapped registries implement the trait by delegation, so callers can
/// hold `Arc<ConversionGraph>` where `impl ConversionRegistry` is expected.
impl<T: ConversionRegistry + ?Sized> ConversionRegistry for Arc<T> {
    fn conversion_path(&self, from: &DataFormat, to: &DataFormat) -> ConversionPath {
        (**self).conversion_path(from, to)
    }

    fn convert(
        &self,
        data: Payload,
        from: &DataFormat,
        to: &DataFormat,
    ) -> BoxFuture<'static, Option<Payload>> {
        (**self).convert(data, from, to)
    }

    fn copy(&self, data: &Payload, format: &DataFormat) -> BoxFuture<'static, Payload> {
        (**self).copy(data, format)
    }

    fn destroy(&self, data: Payload, format: &DataFormat) {
        (**self).destroy(data, format)
    }

    fn guess_type(&self, data: &Payload) -> Option<DataFormat> {
        (**self).guess_type(data)
    }
}
