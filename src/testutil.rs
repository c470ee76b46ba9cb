//! Shared test doubles for the cache test modules.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;

use crate::cache::CacheKey;
use crate::convert::{
    ConversionEdge, ConversionGraph, ConversionPath, ConversionRegistry, DataFormat, Payload,
};
use crate::events::{Viewer, ViewerEvent};
use crate::tile::{Tile, TiledImage};

/// Install a test subscriber once so `RUST_LOG` surfaces cache logs during
/// test runs. Safe to call from every test; only the first call wins.
pub(crate) fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Viewer that records every raised event.
#[derive(Default)]
pub(crate) struct RecordingViewer {
    events: Mutex<Vec<ViewerEvent>>,
}

impl RecordingViewer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ViewerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Viewer for RecordingViewer {
    fn raise_event(&self, event: ViewerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Tiled image with observable flags.
pub(crate) struct MockTiledImage {
    needs_draw: AtomicBool,
    zombie_cache: AtomicBool,
    viewer: Arc<RecordingViewer>,
}

impl MockTiledImage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            needs_draw: AtomicBool::new(false),
            zombie_cache: AtomicBool::new(true),
            viewer: RecordingViewer::new(),
        })
    }

    pub fn needs_draw(&self) -> bool {
        self.needs_draw.load(Ordering::SeqCst)
    }

    pub fn clear_needs_draw(&self) {
        self.needs_draw.store(false, Ordering::SeqCst);
    }

    pub fn set_zombie_cache(&self, enabled: bool) {
        self.zombie_cache.store(enabled, Ordering::SeqCst);
    }

    pub fn viewer_handle(&self) -> Arc<RecordingViewer> {
        Arc::clone(&self.viewer)
    }
}

impl TiledImage for MockTiledImage {
    fn mark_needs_draw(&self) {
        self.needs_draw.store(true, Ordering::SeqCst);
    }

    fn zombie_cache_enabled(&self) -> bool {
        self.zombie_cache.load(Ordering::SeqCst)
    }

    fn viewer(&self) -> Arc<dyn Viewer> {
        Arc::clone(&self.viewer) as Arc<dyn Viewer>
    }
}

/// Tile with settable attributes.
///
/// The `caches` list mirrors what the tile pipeline maintains outside the
/// cache: tests push a key after each `cache_tile` call, so a first-time
/// tile reads zero prior cache rows during insertion bookkeeping.
pub(crate) struct MockTile {
    key: CacheKey,
    level: AtomicU32,
    being_drawn: AtomicBool,
    last_touch: AtomicU64,
    image: Arc<MockTiledImage>,
    caches: Mutex<Vec<CacheKey>>,
    loaded: AtomicBool,
    unload_calls: AtomicUsize,
}

impl MockTile {
    pub fn new(key: &str, image: &Arc<MockTiledImage>) -> Arc<Self> {
        Arc::new(Self {
            key: CacheKey::new(key),
            level: AtomicU32::new(1),
            being_drawn: AtomicBool::new(false),
            last_touch: AtomicU64::new(0),
            image: Arc::clone(image),
            caches: Mutex::new(Vec::new()),
            loaded: AtomicBool::new(true),
            unload_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub fn set_being_drawn(&self, drawn: bool) {
        self.being_drawn.store(drawn, Ordering::SeqCst);
    }

    pub fn set_last_touch(&self, touch: u64) {
        self.last_touch.store(touch, Ordering::SeqCst);
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    /// Record that this tile now references `key`, the way the tile
    /// pipeline does after a successful `cache_tile`.
    pub fn track_key(&self, key: impl Into<CacheKey>) {
        self.caches.lock().unwrap().push(key.into());
    }

    pub fn unload_count(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }
}

impl Tile for MockTile {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    fn being_drawn(&self) -> bool {
        self.being_drawn.load(Ordering::SeqCst)
    }

    fn last_touch_time(&self) -> u64 {
        self.last_touch.load(Ordering::SeqCst)
    }

    fn tiled_image(&self) -> Arc<dyn TiledImage> {
        Arc::clone(&self.image) as Arc<dyn TiledImage>
    }

    fn cache_keys(&self) -> Vec<CacheKey> {
        self.caches.lock().unwrap().clone()
    }

    fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn cache_size(&self) -> usize {
        self.caches.lock().unwrap().len()
    }

    fn unload(&self) {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn as_tile(tile: &Arc<MockTile>) -> Arc<dyn Tile> {
    Arc::clone(tile) as Arc<dyn Tile>
}

pub(crate) fn as_image(image: &Arc<MockTiledImage>) -> Arc<dyn TiledImage> {
    Arc::clone(image) as Arc<dyn TiledImage>
}

/// Registry wrapper that counts calls and logs released payload formats.
///
/// Cloning shares the counters, so tests keep one handle and hand a clone to
/// the cache.
#[derive(Clone, Default)]
pub(crate) struct RecordingRegistry {
    graph: ConversionGraph,
    transforms: Arc<AtomicUsize>,
    copies: Arc<AtomicUsize>,
    destroys: Arc<Mutex<Vec<DataFormat>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an edge whose output is the input with `:<target>` appended,
    /// so chained conversions stay distinguishable.
    pub fn add_edge(&self, from: &str, to: &str) {
        let transforms = Arc::clone(&self.transforms);
        let target = to.to_string();
        self.graph
            .register_edge(ConversionEdge::new(from, to, move |payload: Payload| {
                let transforms = Arc::clone(&transforms);
                let target = target.clone();
                async move {
                    transforms.fetch_add(1, Ordering::SeqCst);
                    Some(stamp(payload, &target))
                }
            }));
    }

    /// Register an edge that always fails.
    pub fn add_failing_edge(&self, from: &str, to: &str) {
        let transforms = Arc::clone(&self.transforms);
        self.graph
            .register_edge(ConversionEdge::new(from, to, move |_| {
                let transforms = Arc::clone(&transforms);
                async move {
                    transforms.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }));
    }

    /// Register an edge that waits for the returned gate before resolving.
    pub fn add_gated_edge(&self, from: &str, to: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let transforms = Arc::clone(&self.transforms);
        let target = to.to_string();
        let edge_gate = Arc::clone(&gate);
        self.graph
            .register_edge(ConversionEdge::new(from, to, move |payload: Payload| {
                let transforms = Arc::clone(&transforms);
                let target = target.clone();
                let gate = Arc::clone(&edge_gate);
                async move {
                    gate.notified().await;
                    transforms.fetch_add(1, Ordering::SeqCst);
                    Some(stamp(payload, &target))
                }
            }));
        gate
    }

    /// Register a format sniffer for `guess_type`.
    pub fn add_sniffer(
        &self,
        format: &str,
        sniffer: impl Fn(&Payload) -> bool + Send + Sync + 'static,
    ) {
        self.graph.register_sniffer(format, sniffer);
    }

    pub fn transform_count(&self) -> usize {
        self.transforms.load(Ordering::SeqCst)
    }

    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Formats of every payload released through the registry, in order.
    pub fn destroyed(&self) -> Vec<DataFormat> {
        self.destroys.lock().unwrap().clone()
    }

    pub fn destroy_count_of(&self, format: &str) -> usize {
        let want = DataFormat::new(format);
        self.destroys
            .lock()
            .unwrap()
            .iter()
            .filter(|f| **f == want)
            .count()
    }
}

/// Append `:<target>` to the payload bytes.
fn stamp(payload: Payload, target: &str) -> Payload {
    let mut bytes = payload.as_bytes().to_vec();
    bytes.push(b':');
    bytes.extend_from_slice(target.as_bytes());
    Payload::from(bytes)
}

impl ConversionRegistry for RecordingRegistry {
    fn conversion_path(&self, from: &DataFormat, to: &DataFormat) -> ConversionPath {
        self.graph.conversion_path(from, to)
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
            return async move { None }.boxed();
        }
        let registry = self.clone();
        async move {
            let mut current = data;
            for edge in path {
                match edge.transform(current.clone()).await {
                    Some(next) => {
                        registry.destroy(current, &edge.origin);
                        current = next;
                    }
                    None => {
                        registry.destroy(current, &edge.origin);
                        return None;
                    }
                }
            }
            Some(current)
        }
        .boxed()
    }

    fn copy(&self, data: &Payload, format: &DataFormat) -> BoxFuture<'static, Payload> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.graph.copy(data, format)
    }

    fn destroy(&self, data: Payload, format: &DataFormat) {
        self.destroys.lock().unwrap().push(format.clone());
        self.graph.destroy(data, format);
    }

    fn guess_type(&self, data: &Payload) -> Option<DataFormat> {
        self.graph.guess_type(data)
    }
}
