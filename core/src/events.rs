//! Event surface exposed to collaborators (renderers, buffers, UI panels).
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. A slow
//! subscriber lags and loses the oldest events instead of stalling the pipeline.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::pipeline::PipelineMetrics;
use crate::prelude::Payload;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Fired after every stage that ran for a call.
    DataProcessed {
        stream_id: String,
        stage: String,
        output: Payload,
    },
    DataError {
        stream_id: String,
        stage: Option<String>,
        error: String,
    },
    PipelineStarted {
        stream_id: String,
    },
    PipelineStopped {
        stream_id: String,
    },
    StageAdded {
        name: String,
    },
    StageRemoved {
        name: String,
    },
    PerformanceUpdate(PipelineMetrics),
    MemoryWarning {
        usage_mb: f64,
        limit_mb: f64,
    },
}

pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns a receiver; after [`EventBus::close`] the receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        match self.sender.lock().ok().and_then(|guard| guard.as_ref().map(|s| s.subscribe())) {
            Some(receiver) => receiver,
            None => broadcast::channel(1).1,
        }
    }

    pub fn has_listeners(&self) -> bool {
        self.sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.receiver_count() > 0))
            .unwrap_or(false)
    }

    /// Sends an event; having no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                let _ = sender.send(event);
            }
        }
    }

    /// Builds and sends an event only when someone is listening.
    pub fn emit_with<F>(&self, build: F)
    where
        F: FnOnce() -> PipelineEvent,
    {
        if self.has_listeners() {
            self.emit(build());
        }
    }

    /// Detaches every listener. Idempotent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::StageAdded { name: "window".into() });
        match rx.recv().await.unwrap() {
            PipelineEvent::StageAdded { name } => assert_eq!(name, "window"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emit_without_listeners_is_silent() {
        let bus = EventBus::default();
        assert!(!bus.has_listeners());
        bus.emit(PipelineEvent::PipelineStarted { stream_id: "a".into() });
        bus.emit_with(|| panic!("builder must not run without listeners"));
    }

    #[tokio::test]
    async fn close_detaches_listeners() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.close();
        bus.close();
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        let mut late = bus.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Closed)));
    }
}
