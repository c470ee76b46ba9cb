//! Default conversion registry backed by an edge table.
//!
//! [`ConversionGraph`] keeps registered edges in concurrent maps and answers
//! path queries with a breadth-first search, so the returned route is always
//! a shortest one. Computed paths are cached until the edge table changes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error};

use crate::convert::format::{DataFormat, Payload};
use crate::convert::registry::{ConversionEdge, ConversionPath, ConversionRegistry};

type Destructor = Arc<dyn Fn(Payload) + Send + Sync>;
type Copier = Arc<dyn Fn(&Payload) -> BoxFuture<'static, Payload> + Send + Sync>;
type Sniffer = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// Shared-state conversion registry.
///
/// Cloning is cheap and yields a handle to the same graph, so one graph can
/// serve the cache, conversion tasks, and registration sites concurrently.
#[derive(Clone, Default)]
pub struct ConversionGraph {
    inner: Arc<GraphInner>,
}

#[derive(Default)]
struct GraphInner {
    /// Adjacency: edges grouped by origin format.
    edges: DashMap<DataFormat, Vec<ConversionEdge>>,
    /// Per-format release hooks. Formats without one are plain buffers.
    destructors: DashMap<DataFormat, Destructor>,
    /// Per-format deep-copy overrides.
    copiers: DashMap<DataFormat, Copier>,
    /// Ordered sniffers for `guess_type`; first match wins.
    sniffers: Mutex<Vec<(Sniffer, DataFormat)>>,
    /// Memoized shortest paths, cleared whenever an edge is registered.
    path_cache: DashMap<(DataFormat, DataFormat), ConversionPath>,
}

impl ConversionGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversion edge.
    pub fn register_edge(&self, edge: ConversionEdge) {
        debug!(origin = %edge.origin, target = %edge.target, "registering conversion edge");
        self.inner
            .edges
            .entry(edge.origin.clone())
            .or_default()
            .push(edge);
        self.inner.path_cache.clear();
    }

    /// Register a release hook for `format`.
    pub fn register_destructor(
        &self,
        format: impl Into<DataFormat>,
        destructor: impl Fn(Payload) + Send + Sync + 'static,
    ) {
        self.inner
            .destructors
            .insert(format.into(), Arc::new(destructor));
    }

    /// Override the deep-copy strategy for `format`.
    pub fn register_copier<F, Fut>(&self, format: impl Into<DataFormat>, copier: F)
    where
        F: Fn(&Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Payload> + Send + 'static,
    {
        self.inner.copiers.insert(
            format.into(),
            Arc::new(move |payload| copier(payload).boxed()),
        );
    }

    /// Register a format sniffer for [`ConversionRegistry::guess_type`].
    ///
    /// Sniffers run in registration order; the first match wins.
    pub fn register_sniffer(
        &self,
        format: impl Into<DataFormat>,
        sniffer: impl Fn(&Payload) -> bool + Send + Sync + 'static,
    ) {
        let mut sniffers = self.inner.sniffers.lock().unwrap();
        sniffers.push((Arc::new(sniffer), format.into()));
    }

    /// Breadth-first shortest path between two formats.
    fn shortest_path(&self, from: &DataFormat, to: &DataFormat) -> ConversionPath {
        if from == to {
            return Vec::new();
        }

        let mut visited: HashSet<DataFormat> = HashSet::new();
        visited.insert(from.clone());
        let mut queue: VecDeque<DataFormat> = VecDeque::new();
        queue.push_back(from.clone());
        // Edge used to first reach each format, for path reconstruction.
        let mut reached_via: HashMap<DataFormat, ConversionEdge> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            let Some(neighbors) = self.inner.edges.get(&node) else {
                continue;
            };
            for edge in neighbors.iter() {
                if !visited.insert(edge.target.clone()) {
                    continue;
                }
                reached_via.insert(edge.target.clone(), edge.clone());
                if edge.target == *to {
                    let mut path = Vec::new();
                    let mut cursor = to.clone();
                    while cursor != *from {
                        let edge = reached_via[&cursor].clone();
                        cursor = edge.origin.clone();
                        path.push(edge);
                    }
                    path.reverse();
                    return path;
                }
                queue.push_back(edge.target.clone());
            }
        }

        Vec::new()
    }
}

impl ConversionRegistry for ConversionGraph {
    fn conversion_path(&self, from: &DataFormat, to: &DataFormat) -> ConversionPath {
        let cache_key = (from.clone(), to.clone());
        if let Some(path) = self.inner.path_cache.get(&cache_key) {
            return path.clone();
        }
        let path = self.shortest_path(from, to);
        self.inner.path_cache.insert(cache_key, path.clone());
        path
    }

    fn convert(
        &self,
        data: Payload,
        from: &DataFormat,
        to: &DataFormat,
    ) -> BoxFuture<'static, Option<Payload>> {
        if from == to {
            return async move { Some(data) }.boxed();
        }
        let path = self.conversion_path(from, to);
        if path.is_empty() {
            error!(from = %from, to = %to, "no conversion path between formats");
            return async move { None }.boxed();
        }
        let graph = self.clone();
        let (from, to) = (from.clone(), to.clone());
        async move {
            let mut current = data;
            for edge in path {
                match edge.transform(current.clone()).await {
                    Some(next) => {
                        graph.destroy(current, &edge.origin);
                        current = next;
                    }
                    None => {
                        error!(
                            from = %from,
                            to = %to,
                            step = %edge.origin,
                            "conversion step failed"
                        );
                        graph.destroy(current, &edge.origin);
                        return None;
                    }
                }
            }
            Some(current)
        }
        .boxed()
    }

    fn copy(&self, data: &Payload, format: &DataFormat) -> BoxFuture<'static, Payload> {
        let copier = self.inner.copiers.get(format).map(|c| Arc::clone(c.value()));
        if let Some(copier) = copier {
            return copier(data);
        }
        let copy = data.deep_copy();
        async move { copy }.boxed()
    }

    fn destroy(&self, data: Payload, format: &DataFormat) {
        // Clone the hook out of the map so user code never runs under a
        // shard guard.
        let destructor = self
            .inner
            .destructors
            .get(format)
            .map(|d| Arc::clone(d.value()));
        match destructor {
            Some(destructor) => destructor(data),
            None => drop(data),
        }
    }

    fn guess_type(&self, data: &Payload) -> Option<DataFormat> {
        let sniffers = self.inner.sniffers.lock().unwrap();
        sniffers
            .iter()
            .find(|(sniffer, _)| sniffer(data))
            .map(|(_, format)| format.clone())
    }
}
