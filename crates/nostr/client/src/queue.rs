//! Strictly ordered, single-consumer message drain.
//!
//! Each relay connection owns one queue. Frames are handled one at a time in
//! arrival order; the drain task yields to the scheduler between frames and
//! exits when the queue is empty, so an idle connection holds no task.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

pub type MessageHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct QueueState<T> {
    pending: VecDeque<T>,
    draining: bool,
}

pub struct SequentialMessageQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
    handler: MessageHandler<T>,
    label: String,
}

impl<T: Send + 'static> SequentialMessageQueue<T> {
    /// `label` identifies the owner in logs (usually the relay url).
    pub fn new(label: impl Into<String>, handler: MessageHandler<T>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                draining: false,
            })),
            handler,
            label: label.into(),
        }
    }

    /// Enqueue a message, starting a drain task if none is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, message: T) {
        {
            let mut state = self.state.lock();
            state.pending.push_back(message);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let state = self.state.clone();
        let handler = self.handler.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut state = state.lock();
                    match state.pending.pop_front() {
                        Some(message) => message,
                        None => {
                            state.draining = false;
                            return;
                        }
                    }
                };

                if let Err(e) = handler(next).await {
                    warn!("Message handler failed for {}: {}", label, e);
                }
                tokio::task::yield_now().await;
            }
        });
    }

    /// Messages waiting to be handled, not counting one in progress.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }
}
