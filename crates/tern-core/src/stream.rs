use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::Stream;

use crate::types::{AssistantEvent, LlmContext, Message, Model, StreamOptions};

struct Shared<T, R> {
    queue: VecDeque<T>,
    finished: bool,
    result: Option<R>,
    stream_wakers: Vec<Waker>,
    result_wakers: Vec<Waker>,
}

/// An in-memory event channel: producers `emit` events and eventually
/// `finish` with a result; consumers poll it as a `Stream` and may await
/// the result once. Cloning shares the underlying channel.
pub struct EventStream<T, R> {
    shared: Arc<Mutex<Shared<T, R>>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> EventStream<T, R> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                finished: false,
                result: None,
                stream_wakers: Vec::new(),
                result_wakers: Vec::new(),
            })),
        }
    }

    /// Queue an event. Events emitted after `finish` are dropped.
    pub fn emit(&self, event: T) {
        let mut shared = self.shared.lock().unwrap();
        if shared.finished {
            return;
        }
        shared.queue.push_back(event);
        for waker in shared.stream_wakers.drain(..) {
            waker.wake();
        }
    }

    /// Mark the stream complete. Queued events remain consumable; the
    /// result becomes available to `result()`.
    pub fn finish(&self, result: Option<R>) {
        let mut shared = self.shared.lock().unwrap();
        if shared.finished {
            return;
        }
        shared.finished = true;
        shared.result = result;
        for waker in shared.stream_wakers.drain(..) {
            waker.wake();
        }
        for waker in shared.result_wakers.drain(..) {
            waker.wake();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().unwrap().finished
    }

    /// Wait for the stream to finish and take the result. Returns `None`
    /// if the stream finished without one or the result was already taken.
    pub fn result(&self) -> ResultFuture<T, R> {
        ResultFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Default for EventStream<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, R: Send + 'static> Stream for EventStream<T, R> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(event) = shared.queue.pop_front() {
            Poll::Ready(Some(event))
        } else if shared.finished {
            Poll::Ready(None)
        } else {
            shared.stream_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

pub struct ResultFuture<T, R> {
    shared: Arc<Mutex<Shared<T, R>>>,
}

impl<T, R> std::future::Future for ResultFuture<T, R> {
    type Output = Option<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock().unwrap();
        if shared.finished {
            Poll::Ready(shared.result.take())
        } else {
            shared.result_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

// ---------- LLM adapter interface ----------

/// Stream of one assistant message; finishes with the final message.
pub type AssistantStream = EventStream<AssistantEvent, Message>;

pub fn assistant_stream() -> AssistantStream {
    EventStream::new()
}

/// The narrow interface the kernel consumes in place of an LLM wire
/// client: given a model, a request context, and options, produce a
/// stream of assistant events terminated by `Done` or `Error`.
pub type StreamFn =
    Arc<dyn Fn(&Model, &LlmContext, &StreamOptions) -> AssistantStream + Send + Sync>;
