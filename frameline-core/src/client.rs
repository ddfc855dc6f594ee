//! Streaming client
//!
//! Async-facing side of the decode boundary. Resolves frame requests from a
//! bounded LRU cache, coalesces concurrent requests for the same index, and
//! keeps a read-ahead window decoded through cancellable batches.
//!
//! Resolution order for `get_frame`: cache hit, then attach to an in-flight
//! request, then issue a new single-frame request. Only calls with
//! `prefetch` enabled participate in position tracking and batch
//! scheduling; diagnostics and one-off probes pass `false`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::frame::FrameHandle;
use crate::protocol::{StreamError, StreamEvent, StreamRequest};
use crate::session::StreamConfig;

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct StreamStats {
    pub cached: usize,
    pub pending: usize,
    pub active_batch: Option<u64>,
}

struct PendingFrame {
    waiters: Vec<oneshot::Sender<Option<FrameHandle>>>,
    /// Batch expected to deliver this index, if any
    batch: Option<u64>,
}

struct BatchWindow {
    id: u64,
    /// Prefetch window as computed when the batch was issued
    start: usize,
    end: usize,
}

struct ClientState {
    cache: LruCache<usize, FrameHandle>,
    pending: HashMap<usize, PendingFrame>,
    batch: Option<BatchWindow>,
    last_requested: Option<usize>,
    failed: Option<StreamError>,
}

struct StreamInner {
    config: StreamConfig,
    frame_count: usize,
    session: u64,
    requests: mpsc::Sender<StreamRequest>,
    /// Shared with the decode server; id of the batch allowed to proceed,
    /// 0 when none. Written only from the client side.
    active_batch: Arc<AtomicU64>,
    next_batch_id: AtomicU64,
    state: Mutex<ClientState>,
}

/// Client handle over one open stream. Clones share state.
#[derive(Clone)]
pub struct FrameStream {
    inner: Arc<StreamInner>,
}

impl FrameStream {
    pub(crate) fn new(
        config: StreamConfig,
        frame_count: usize,
        session: u64,
        requests: mpsc::Sender<StreamRequest>,
        active_batch: Arc<AtomicU64>,
        events: UnboundedReceiver<StreamEvent>,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(StreamInner {
            config,
            frame_count,
            session,
            requests,
            active_batch,
            next_batch_id: AtomicU64::new(1),
            state: Mutex::new(ClientState {
                cache: LruCache::new(capacity),
                pending: HashMap::new(),
                batch: None,
                last_requested: None,
                failed: None,
            }),
        });

        let pump = inner.clone();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                pump.handle_event(event);
            }
            pump.channel_closed();
        });

        Self { inner }
    }

    /// Resolve the frame at `index`. `Ok(None)` is a decode miss or an
    /// out-of-range index. Waits as long as it takes; there are no
    /// timeouts.
    pub async fn get_frame(
        &self,
        index: usize,
        prefetch: bool,
    ) -> Result<Option<FrameHandle>, StreamError> {
        if index >= self.inner.frame_count {
            return Ok(None);
        }

        let receiver = {
            let mut state = self.inner.state.lock();
            if let Some(error) = &state.failed {
                return Err(error.clone());
            }

            if let Some(handle) = state.cache.get(&index) {
                let handle = handle.clone();
                if prefetch {
                    self.inner.note_position(&mut state, index);
                }
                return Ok(Some(handle));
            }

            let (tx, rx) = oneshot::channel();
            if let Some(pending) = state.pending.get_mut(&index) {
                pending.waiters.push(tx);
            } else {
                state.pending.insert(
                    index,
                    PendingFrame {
                        waiters: vec![tx],
                        batch: None,
                    },
                );
                self.inner.send(StreamRequest::GetFrame { index });
            }
            if prefetch {
                self.inner.note_position(&mut state, index);
            }
            rx
        };

        match receiver.await {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let state = self.inner.state.lock();
                Err(state
                    .failed
                    .clone()
                    .unwrap_or(StreamError::SessionClosed))
            }
        }
    }

    pub fn frame_count(&self) -> usize {
        self.inner.frame_count
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.inner.state.lock();
        StreamStats {
            cached: state.cache.len(),
            pending: state.pending.len(),
            active_batch: state.batch.as_ref().map(|b| b.id),
        }
    }

    /// Tear the client down: release every cached frame, wake waiters with
    /// a closed-session error, and refuse further requests.
    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.failed = Some(StreamError::SessionClosed);
        state.batch = None;
        self.inner.active_batch.store(0, Ordering::SeqCst);
        state.pending.clear();
        while let Some((_, mut handle)) = state.cache.pop_lru() {
            handle.close();
        }
    }
}

impl StreamInner {
    fn send(&self, request: StreamRequest) {
        if self.requests.send(request).is_err() {
            tracing::warn!(session = self.session, "decode server is gone");
        }
    }

    /// Track the playhead: detect seeks (a jump of more than one index),
    /// cancel a batch the playhead left behind, and keep the read-ahead
    /// window scheduled.
    fn note_position(&self, state: &mut ClientState, index: usize) {
        let last = state.last_requested.replace(index);
        if let Some(last) = last {
            let jumped = (index as i64 - last as i64).abs() > 1;
            if jumped {
                if let Some(batch) = &state.batch {
                    // Compared against the window captured when the batch
                    // was issued, not the current playhead. An overlapping
                    // batch keeps running even when most of it is behind
                    // the new position.
                    if index < batch.start || index >= batch.end {
                        let id = batch.id;
                        self.cancel_batch(state, id);
                    }
                }
            }
        }
        self.schedule_prefetch(state, index);
    }

    fn cancel_batch(&self, state: &mut ClientState, id: u64) {
        tracing::debug!(request_id = id, "cancelling batch");
        self.active_batch.store(0, Ordering::SeqCst);
        state.batch = None;
        self.send(StreamRequest::CancelBatch { request_id: id });

        // Indices owed to the dead batch: reissue the ones someone is
        // actually waiting on, forget the rest.
        let mut reissue = Vec::new();
        state.pending.retain(|&index, entry| {
            if entry.batch != Some(id) {
                return true;
            }
            if entry.waiters.is_empty() {
                return false;
            }
            entry.batch = None;
            reissue.push(index);
            true
        });
        for index in reissue {
            self.send(StreamRequest::GetFrame { index });
        }
    }

    fn schedule_prefetch(&self, state: &mut ClientState, current: usize) {
        if state.batch.is_some() {
            return;
        }
        let span =
            (self.config.target_fps * self.config.buffer_duration_secs).ceil() as usize;
        let start = (current + 1).min(self.frame_count);
        let end = (current + 1 + span).min(self.frame_count);

        let missing: Vec<usize> = (start..end)
            .filter(|i| !state.cache.contains(i) && !state.pending.contains_key(i))
            .collect();
        let Some(&first) = missing.first() else {
            return;
        };
        let batch_end = missing[missing.len() - 1] + 1;

        let id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        self.active_batch.store(id, Ordering::SeqCst);
        for index in first..batch_end {
            state.pending.entry(index).or_insert_with(|| PendingFrame {
                waiters: Vec::new(),
                batch: Some(id),
            });
        }
        state.batch = Some(BatchWindow { id, start, end });
        tracing::debug!(request_id = id, start = first, end = batch_end, "prefetch batch");
        self.send(StreamRequest::GetBatch {
            start: first,
            end: batch_end,
            request_id: id,
        });
    }

    fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Frame {
                session,
                index,
                handle,
            } => {
                if session != self.session {
                    discard(handle);
                    return;
                }
                let mut state = self.state.lock();
                if state.failed.is_some() {
                    discard(handle);
                    return;
                }
                self.settle(&mut state, index, handle);
            }
            StreamEvent::BatchFrame {
                session,
                request_id,
                index,
                handle,
                is_complete,
                ..
            } => {
                if session != self.session {
                    discard(handle);
                    return;
                }
                let mut state = self.state.lock();
                if state.failed.is_some()
                    || self.active_batch.load(Ordering::SeqCst) != request_id
                {
                    // Left over from a superseded batch.
                    tracing::trace!(request_id, index, "dropping stale batch frame");
                    discard(handle);
                    return;
                }
                self.settle(&mut state, index, handle);
                if is_complete {
                    state.batch = None;
                    let _ = self.active_batch.compare_exchange(
                        request_id,
                        0,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
            StreamEvent::Fatal { error, .. } => {
                tracing::error!(session = self.session, %error, "decode context failed");
                let mut state = self.state.lock();
                self.fail(&mut state, error);
            }
            // Consumed by the session layer during open; late duplicates
            // carry nothing actionable.
            StreamEvent::Metadata { .. } | StreamEvent::IndexProgress { .. } => {}
        }
    }

    /// The event channel closed. After a clean shutdown or a fatal event
    /// the state already carries an error; otherwise the decode thread died
    /// without reporting, and whatever is in flight must not wait forever.
    fn channel_closed(&self) {
        let mut state = self.state.lock();
        if state.failed.is_some() {
            return;
        }
        tracing::error!(
            session = self.session,
            "decode context exited without a fatal event"
        );
        self.fail(&mut state, StreamError::SessionClosed);
    }

    /// Terminal teardown: record the error, stop batching, wake every
    /// waiter, and release the cache.
    fn fail(&self, state: &mut ClientState, error: StreamError) {
        state.failed = Some(error);
        state.batch = None;
        self.active_batch.store(0, Ordering::SeqCst);
        // Dropping the waiters wakes every in-flight get_frame with the
        // stored error.
        state.pending.clear();
        while let Some((_, mut handle)) = state.cache.pop_lru() {
            handle.close();
        }
    }

    /// Deliver one server answer: wake waiters, then store the handle,
    /// releasing whatever it displaces.
    fn settle(&self, state: &mut ClientState, index: usize, handle: Option<FrameHandle>) {
        if let Some(entry) = state.pending.remove(&index) {
            for waiter in entry.waiters {
                let _ = waiter.send(handle.clone());
            }
        }
        if let Some(handle) = handle {
            if let Some(mut old) = state.cache.pop(&index) {
                old.close();
            }
            if let Some((_, mut evicted)) = state.cache.push(index, handle) {
                evicted.close();
            }
        }
    }
}

fn discard(handle: Option<FrameHandle>) {
    if let Some(mut handle) = handle {
        handle.close();
    }
}
