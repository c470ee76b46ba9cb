//! Cache record: one payload, one format, many referring tiles.
//!
//! A [`CacheRecord`] owns a single payload in a single current format and
//! coordinates asynchronous conversion between formats. Requests that arrive
//! while a conversion is in flight queue up and run in arrival order once the
//! conversion settles, so per-record mutation is serialized without a lock
//! held across suspension points.
//!
//! The record's `ready` handle is a watch channel: `Pending` while a
//! conversion or initial load is in flight, `Ready` with the current payload
//! otherwise. Any number of waiters can subscribe and all of them observe
//! the same resolution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use crate::convert::{ConversionEdge, ConversionRegistry, DataFormat, Payload};
use crate::tile::{Tile, TiledImage};

/// State of the record's `ready` eventual.
#[derive(Clone, Debug)]
enum ReadyState {
    /// Never populated (fresh or revived).
    Empty,
    /// A conversion or initial load is in flight.
    Pending,
    /// Payload present and consistent with the current format.
    Ready(Payload),
    /// The record was destroyed; waiters resolve empty.
    Destroyed,
}

impl ReadyState {
    fn is_pending(&self) -> bool {
        matches!(self, ReadyState::Pending)
    }
}

/// A deferred operation that arrived while a conversion was in flight.
enum PendingOp {
    Transform {
        to: DataFormat,
        result: oneshot::Sender<Option<Payload>>,
    },
    Overwrite {
        data: Payload,
        format: DataFormat,
        result: oneshot::Sender<Option<Payload>>,
    },
}

struct RecordState {
    payload: Option<Payload>,
    format: Option<DataFormat>,
    loaded: bool,
    /// True while a conversion task owns the record's payload.
    converting: bool,
    tiles: Vec<Arc<dyn Tile>>,
    pending: VecDeque<PendingOp>,
    destroyed: bool,
    /// Bumped on destroy and revive; a conversion task that observes a
    /// different generation than it started with drops its result.
    generation: u64,
}

impl RecordState {
    fn empty(generation: u64) -> Self {
        Self {
            payload: None,
            format: None,
            loaded: false,
            converting: false,
            tiles: Vec::new(),
            pending: VecDeque::new(),
            destroyed: false,
            generation,
        }
    }
}

/// One cached payload shared by every tile that references its cache key.
pub struct CacheRecord {
    state: Mutex<RecordState>,
    ready: watch::Sender<ReadyState>,
    registry: Arc<dyn ConversionRegistry>,
    me: Weak<CacheRecord>,
}

impl CacheRecord {
    pub(crate) fn new(registry: Arc<dyn ConversionRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(RecordState::empty(0)),
            ready: watch::channel(ReadyState::Empty).0,
            registry,
            me: me.clone(),
        })
    }

    // ─── Synchronous accessors ───────────────────────────────────────────

    /// Current payload, if loaded. Never suspends.
    pub fn data(&self) -> Option<Payload> {
        self.state.lock().unwrap().payload.clone()
    }

    /// Current (or, mid-conversion, target) format tag.
    pub fn current_format(&self) -> Option<DataFormat> {
        self.state.lock().unwrap().format.clone()
    }

    /// Whether the payload is present and consistent with the format.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    /// Whether the record reached its terminal state.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    /// Number of referring tiles, or 0 once destroyed.
    pub fn tile_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        if state.destroyed {
            0
        } else {
            state.tiles.len()
        }
    }

    // ─── Tile membership ─────────────────────────────────────────────────

    /// Attach `tile` to this record.
    ///
    /// A tile that is already attached is detached and re-attached, leaving
    /// the count unchanged. When the record holds no payload yet, the
    /// supplied `(data, format)` pair becomes the initial payload; otherwise
    /// the arguments are ignored and the tile inherits the existing payload,
    /// since equal cache keys are content-equivalent by contract.
    pub(crate) fn add_tile(
        &self,
        tile: Arc<dyn Tile>,
        data: Option<Payload>,
        format: Option<DataFormat>,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            error!("attempt to attach a tile to a destroyed cache record");
            return;
        }

        if let Some(pos) = state.tiles.iter().position(|t| Arc::ptr_eq(t, &tile)) {
            state.tiles.remove(pos);
        } else if !state.loaded {
            match (data, format) {
                (Some(data), Some(format)) => {
                    state.payload = Some(data.clone());
                    state.format = Some(format);
                    state.loaded = true;
                    state.tiles.push(tile);
                    drop(state);
                    self.ready.send_replace(ReadyState::Ready(data));
                    return;
                }
                _ => {
                    warn!("tile attached to an unloaded record without initial data");
                }
            }
        }
        state.tiles.push(tile);
    }

    /// Detach `tile`; true iff it was attached. No-op once destroyed.
    pub(crate) fn remove_tile(&self, tile: &Arc<dyn Tile>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return false;
        }
        match state.tiles.iter().position(|t| Arc::ptr_eq(t, tile)) {
            Some(pos) => {
                state.tiles.remove(pos);
                true
            }
            None => false,
        }
    }

    // ─── Payload access ──────────────────────────────────────────────────

    /// Resolve once the current conversion or load settles.
    ///
    /// Yields the then-current payload, or `None` for an empty or destroyed
    /// record. Resolves immediately when nothing is in flight.
    pub async fn wait_ready(&self) -> Option<Payload> {
        let mut rx = self.ready.subscribe();
        let result = match rx.wait_for(|s| !s.is_pending()).await {
            Ok(state) => match &*state {
                ReadyState::Ready(payload) => Some(payload.clone()),
                _ => None,
            },
            Err(_) => None,
        };
        result
    }

    /// Read the payload as `format` (current format when `None`).
    ///
    /// With `copy` the result is a registry deep copy; without it the
    /// current payload handle is shared. A request for a different format
    /// converts a copy through the registry and leaves the record unchanged.
    pub async fn data_as(&self, format: Option<DataFormat>, copy: bool) -> Option<Payload> {
        enum Access {
            Hit { payload: Payload, format: DataFormat },
            Wait,
        }

        let access = {
            let state = self.state.lock().unwrap();
            if state.destroyed {
                return None;
            }
            match (&state.payload, &state.format) {
                (Some(payload), Some(current)) if state.loaded => {
                    let want = format.clone().unwrap_or_else(|| current.clone());
                    if want == *current {
                        Access::Hit {
                            payload: payload.clone(),
                            format: want,
                        }
                    } else {
                        Access::Wait
                    }
                }
                _ => Access::Wait,
            }
        };

        match access {
            Access::Hit { payload, format } => {
                if copy {
                    Some(self.registry.copy(&payload, &format).await)
                } else {
                    Some(payload)
                }
            }
            Access::Wait => {
                let payload = self.wait_ready().await?;
                let current = {
                    let state = self.state.lock().unwrap();
                    if state.destroyed {
                        return None;
                    }
                    state.format.clone()?
                };
                let want = format.unwrap_or_else(|| current.clone());
                if want != current {
                    self.registry.convert(payload, &current, &want).await
                } else if copy {
                    Some(self.registry.copy(&payload, &want).await)
                } else {
                    Some(payload)
                }
            }
        }
    }

    /// Overwrite the record's payload.
    ///
    /// Resolves with the previous payload once the overwrite lands. Issued
    /// behind queued work, it keeps its place in line; issued against a
    /// destroyed record, the argument is released rather than stored.
    pub fn set_data_as(
        &self,
        data: Payload,
        format: DataFormat,
    ) -> impl std::future::Future<Output = Option<Payload>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut immediate = Some((data, format, tx));
        {
            let mut state = self.state.lock().unwrap();
            if !state.pending.is_empty() {
                let (data, format, result) = immediate.take().expect("unconsumed overwrite");
                state.pending.push_back(PendingOp::Overwrite { data, format, result });
            }
        }
        if let Some((data, format, result)) = immediate {
            self.execute_overwrite(data, format, result);
        }
        async move { rx.await.unwrap_or(None) }
    }

    // ─── Transformation ──────────────────────────────────────────────────

    /// Convert the record's payload to `format` in place.
    ///
    /// Resolves with the payload in the target format. While a conversion is
    /// already in flight the request queues and runs after it, in arrival
    /// order. An unreachable target leaves the record unchanged.
    pub fn transform_to(
        &self,
        format: DataFormat,
    ) -> impl std::future::Future<Output = Option<Payload>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                warn!("transform requested on a destroyed cache record");
                let _ = tx.send(None);
            } else if state.loaded && state.format.as_ref() == Some(&format) {
                let payload = state.payload.clone();
                let _ = tx.send(payload);
            } else if !state.loaded {
                if state.converting || !state.pending.is_empty() {
                    // Queued even when the in-flight target already matches:
                    // completion order must follow arrival order.
                    state.pending.push_back(PendingOp::Transform { to: format, result: tx });
                } else {
                    warn!("transform requested on an empty cache record");
                    let _ = tx.send(None);
                }
            } else {
                self.begin_conversion(&mut state, format, tx);
            }
        }
        async move { rx.await.unwrap_or(None) }
    }

    /// Start a conversion while holding the state lock.
    ///
    /// The record must be loaded and the target must differ from the current
    /// format.
    fn begin_conversion(
        &self,
        state: &mut RecordState,
        to: DataFormat,
        result: oneshot::Sender<Option<Payload>>,
    ) {
        let from = state
            .format
            .clone()
            .expect("conversion begins on a loaded record");
        let original = state
            .payload
            .clone()
            .expect("conversion begins on a loaded record");

        let path = self.registry.conversion_path(&from, &to);
        if path.is_empty() {
            error!(from = %from, to = %to, "no conversion path; record left unchanged");
            let _ = result.send(Some(original));
            return;
        }

        state.loaded = false;
        state.payload = None;
        state.format = Some(to.clone());
        state.converting = true;
        let generation = state.generation;
        self.ready.send_replace(ReadyState::Pending);

        let Some(record) = self.me.upgrade() else {
            return;
        };
        debug!(from = %from, to = %to, steps = path.len(), "starting payload conversion");
        tokio::spawn(async move {
            record
                .run_conversion(generation, from, to, original, path, result)
                .await;
        });
    }

    /// The conversion engine: walk the path edge by edge, releasing each
    /// edge's input as soon as the edge resolves. The original input stays
    /// alive for rollback until the final edge succeeds.
    async fn run_conversion(
        self: Arc<Self>,
        generation: u64,
        from: DataFormat,
        to: DataFormat,
        original: Payload,
        path: Vec<ConversionEdge>,
        result: oneshot::Sender<Option<Payload>>,
    ) {
        let mut current = original.clone();
        let mut current_is_original = true;

        for edge in path {
            let next = edge.transform(current.clone()).await;
            match next {
                Some(next) => {
                    if !current_is_original {
                        self.registry.destroy(current, &edge.origin);
                    }
                    current = next;
                    current_is_original = false;
                    if self.is_stale(generation) {
                        self.registry.destroy(current, &edge.target);
                        self.registry.destroy(original, &from);
                        let _ = result.send(None);
                        return;
                    }
                }
                None => {
                    error!(
                        from = %from,
                        to = %to,
                        step = %edge.origin,
                        "conversion step failed; restoring original payload"
                    );
                    if !current_is_original {
                        self.registry.destroy(current, &edge.origin);
                    }
                    if self.try_install(generation, original.clone(), from.clone()) {
                        let _ = result.send(Some(original));
                        self.drain_pending();
                    } else {
                        self.registry.destroy(original, &from);
                        let _ = result.send(None);
                    }
                    return;
                }
            }
        }

        if self.try_install(generation, current.clone(), to.clone()) {
            self.registry.destroy(original, &from);
            let _ = result.send(Some(current));
            self.drain_pending();
        } else {
            self.registry.destroy(current, &to);
            self.registry.destroy(original, &from);
            let _ = result.send(None);
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.destroyed || state.generation != generation
    }

    /// Install a payload produced by a conversion, unless the record was
    /// destroyed or revived underneath the task.
    fn try_install(&self, generation: u64, payload: Payload, format: DataFormat) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed || state.generation != generation {
                return false;
            }
            state.payload = Some(payload.clone());
            state.format = Some(format);
            state.loaded = true;
            state.converting = false;
        }
        self.ready.send_replace(ReadyState::Ready(payload));
        true
    }

    // ─── Pending-op queue ────────────────────────────────────────────────

    /// Drain queued operations after a conversion settles.
    fn drain_pending(&self) {
        if let Some(record) = self.me.upgrade() {
            tokio::spawn(async move { record.run_drain().await });
        }
    }

    async fn run_drain(self: Arc<Self>) {
        loop {
            // Yield one step so continuations chained on the just-completed
            // conversion run before the next queued job starts.
            tokio::task::yield_now().await;

            let op = {
                let mut state = self.state.lock().unwrap();
                if state.destroyed || state.converting {
                    return;
                }
                match state.pending.pop_front() {
                    Some(op) => op,
                    None => return,
                }
            };

            match op {
                PendingOp::Transform { to, result } => {
                    let mut state = self.state.lock().unwrap();
                    if state.loaded && state.format.as_ref() == Some(&to) {
                        let payload = state.payload.clone();
                        let _ = result.send(payload);
                    } else if state.loaded {
                        self.begin_conversion(&mut state, to, result);
                        // Completion drains the rest of the queue.
                        return;
                    } else {
                        let _ = result.send(None);
                    }
                }
                PendingOp::Overwrite { data, format, result } => {
                    self.execute_overwrite(data, format, result);
                }
            }
        }
    }

    /// Replace the payload, releasing the previous one through the registry
    /// and flagging every referring tiled image for redraw.
    fn execute_overwrite(
        &self,
        data: Payload,
        format: DataFormat,
        result: oneshot::Sender<Option<Payload>>,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            drop(state);
            // The record took ownership of the argument; release it.
            self.registry.destroy(data, &format);
            let _ = result.send(None);
            return;
        }

        if state.loaded {
            let old = state.payload.take().expect("loaded record has a payload");
            let old_format = state.format.take().expect("loaded record has a format");
            state.payload = Some(data.clone());
            state.format = Some(format);
            let images: Vec<Arc<dyn TiledImage>> =
                state.tiles.iter().map(|t| t.tiled_image()).collect();
            drop(state);

            self.registry.destroy(old.clone(), &old_format);
            self.ready.send_replace(ReadyState::Ready(data));
            for image in images {
                image.mark_needs_draw();
            }
            let _ = result.send(Some(old));
        } else if state.converting {
            drop(state);
            let Some(record) = self.me.upgrade() else {
                self.registry.destroy(data, &format);
                let _ = result.send(None);
                return;
            };
            tokio::spawn(async move {
                let _ = record.wait_ready().await;
                record.execute_overwrite(data, format, result);
            });
        } else {
            // Never populated: the overwrite is the initial load.
            state.payload = Some(data.clone());
            state.format = Some(format);
            state.loaded = true;
            let images: Vec<Arc<dyn TiledImage>> =
                state.tiles.iter().map(|t| t.tiled_image()).collect();
            drop(state);

            self.ready.send_replace(ReadyState::Ready(data));
            for image in images {
                image.mark_needs_draw();
            }
            let _ = result.send(None);
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Reset a fresh or destroyed record to empty. Loaded records must be
    /// destroyed first.
    pub(crate) fn revive(&self) {
        let mut state = self.state.lock().unwrap();
        if state.loaded {
            warn!("revive() called on a loaded cache record; ignoring");
            return;
        }
        let generation = state.generation + 1;
        *state = RecordState::empty(generation);
        drop(state);
        self.ready.send_replace(ReadyState::Empty);
    }

    /// Release the record.
    ///
    /// Queued operations resolve empty and their payload arguments are
    /// released. A conversion in flight releases its intermediates when it
    /// settles and does not re-populate the record.
    pub(crate) fn destroy(&self) {
        let (released, pending) = {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            let pending: Vec<PendingOp> = state.pending.drain(..).collect();
            state.destroyed = true;
            state.loaded = false;
            state.converting = false;
            state.generation += 1;
            state.tiles.clear();
            let released = match (state.payload.take(), state.format.take()) {
                (Some(payload), Some(format)) => Some((payload, format)),
                _ => None,
            };
            (released, pending)
        };

        for op in pending {
            match op {
                PendingOp::Transform { result, .. } => {
                    let _ = result.send(None);
                }
                PendingOp::Overwrite { data, format, result } => {
                    self.registry.destroy(data, &format);
                    let _ = result.send(None);
                }
            }
        }
        if let Some((payload, format)) = released {
            self.registry.destroy(payload, &format);
        }
        self.ready.send_replace(ReadyState::Destroyed);
    }
}
