//! One cancellable streaming model call per request.
//!
//! A stream moves from absent to streaming to one of completed, errored or
//! cancelled. Every exit path removes the handle and the text buffer of the
//! request, so a reused `RequestId` always starts clean.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_abstraction::{ChatChunk, ChatRequest, Model, ModelError, ModelToolCall};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::event::{ComponentTag, Event, StreamChunk, StreamComplete, StreamError};
use crate::id::RequestId;

/// Callbacks invoked while a response is streamed.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// The backend requested tool calls.
    async fn on_tool_calls(&self, request_id: RequestId, calls: Vec<ModelToolCall>);

    /// Whether `request_id` still waits on tool results.
    async fn has_pending_calls(&self, request_id: RequestId) -> bool;

    /// The final chunk arrived; `text` is everything streamed for the turn.
    async fn on_done(&self, request_id: RequestId, text: String);
}

struct StreamHandle {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct StreamTable {
    handles: HashMap<RequestId, StreamHandle>,
    buffers: HashMap<RequestId, String>,
}

struct StreamInner {
    bus: EventBus,
    model: Arc<dyn Model>,
    table: Mutex<StreamTable>,
    next_generation: AtomicU64,
}

/// Runs streaming calls against a model and republishes them on the bus.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager")
            .field("model", &self.inner.model.model_id())
            .field("active_streams", &self.active_streams())
            .finish_non_exhaustive()
    }
}

/// Removes the handle of one stream generation when its task ends.
struct HandleGuard {
    inner: Arc<StreamInner>,
    request_id: RequestId,
    generation: u64,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let mut table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer stream for the same request owns the slot now.
        if table.handles.get(&self.request_id).is_some_and(|h| h.generation == self.generation) {
            table.handles.remove(&self.request_id);
            table.buffers.remove(&self.request_id);
        }
    }
}

impl StreamManager {
    /// Creates a manager publishing on `bus` and calling `model`.
    pub fn new(bus: EventBus, model: Arc<dyn Model>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                bus,
                model,
                table: Mutex::new(StreamTable::default()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts streaming `request` in the background.
    ///
    /// A live stream for the same request is cancelled first.
    pub fn start_stream(&self, request_id: RequestId, request: ChatRequest, sink: Arc<dyn StreamSink>) {
        let token = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = self.table();
            let stale = table
                .handles
                .insert(request_id, StreamHandle { token: token.clone(), generation });
            if let Some(stale) = stale {
                warn!(request_id = %request_id, "Replacing live stream for request");
                stale.token.cancel();
            }
            table.buffers.insert(request_id, String::new());
        }

        debug!(
            request_id = %request_id,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting stream"
        );

        let manager = self.clone();
        tokio::spawn(async move {
            let _guard = HandleGuard { inner: Arc::clone(&manager.inner), request_id, generation };
            manager.run(request_id, request, token, sink).await;
        });
    }

    async fn run(
        &self,
        request_id: RequestId,
        request: ChatRequest,
        token: CancellationToken,
        sink: Arc<dyn StreamSink>,
    ) {
        let connected = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(request_id = %request_id, "Stream cancelled before connecting");
                return;
            }
            result = self.inner.model.stream_chat(request) => result,
        };

        let mut stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(request_id, &err);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(request_id = %request_id, "Stream cancelled");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let done = chunk.done;
                    self.response(request_id, chunk, sink.as_ref()).await;
                    if done {
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.fail(request_id, &err);
                    return;
                }
                None => {
                    debug!(request_id = %request_id, "Backend closed stream without a final chunk");
                    self.response(request_id, ChatChunk::default().finished(), sink.as_ref()).await;
                    return;
                }
            }
        }
    }

    fn fail(&self, request_id: RequestId, err: &ModelError) {
        if err.is_cancelled() {
            debug!(request_id = %request_id, "Backend reported cancellation");
            return;
        }
        warn!(request_id = %request_id, error = %err, "Stream failed");
        self.inner.bus.stream_error.publish(Event::new(
            ComponentTag::Llm,
            StreamError { request_id, error: err.to_string() },
        ));
    }

    /// Handles one chunk delivered by the backend.
    ///
    /// Text is buffered only while the request has a live stream. A final
    /// chunk carrying tool calls always completes as pending, however fast
    /// their results come back.
    pub async fn response(&self, request_id: RequestId, chunk: ChatChunk, sink: &dyn StreamSink) {
        let ChatChunk { content, done, tool_calls } = chunk;

        if !content.is_empty() {
            if let Some(buffer) = self.table().buffers.get_mut(&request_id) {
                buffer.push_str(&content);
            }
            self.inner
                .bus
                .stream_chunk
                .publish(Event::new(ComponentTag::Llm, StreamChunk { request_id, content }));
        }

        // The final text lands before any tool call goes out, so tool
        // results always follow the assistant turn that asked for them.
        if done {
            let text = self.table().buffers.get_mut(&request_id).map(std::mem::take).unwrap_or_default();
            sink.on_done(request_id, text).await;
        }

        // Read before the calls go out: a fast round trip could otherwise
        // drain the request and report this turn as complete.
        let pending = done && (!tool_calls.is_empty() || sink.has_pending_calls(request_id).await);

        if !tool_calls.is_empty() {
            sink.on_tool_calls(request_id, tool_calls).await;
        }

        if done {
            self.inner.bus.stream_complete.publish(Event::new(
                ComponentTag::Llm,
                StreamComplete { request_id, is_complete: !pending },
            ));
        }
    }

    /// Cancels the stream of `request_id`. Returns whether one was live.
    pub fn cancel_stream(&self, request_id: RequestId) -> bool {
        let handle = {
            let mut table = self.table();
            table.buffers.remove(&request_id);
            table.handles.remove(&request_id)
        };

        match handle {
            Some(handle) => {
                handle.token.cancel();
                debug!(request_id = %request_id, "Cancelled stream");
                true
            }
            None => false,
        }
    }

    /// Whether `request_id` has a live stream.
    pub fn is_streaming(&self, request_id: RequestId) -> bool {
        self.table().handles.contains_key(&request_id)
    }

    /// Number of live streams.
    pub fn active_streams(&self) -> usize {
        self.table().handles.len()
    }

    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
