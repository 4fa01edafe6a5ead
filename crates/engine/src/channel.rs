//! Duplex event channel to the engine.
//!
//! An [`EventChannel`] owns one connected [`Transport`], decodes inbound
//! frames into [`EngineEvent`]s and fans them out to the registered
//! [`Listeners`] in the order they arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::event::{EngineEvent, EventKind};

/// A raw inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The peer closed the connection.
    Closed,
}

/// A connected socket.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next inbound frame.
    async fn recv(&mut self) -> Result<Frame, TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports; one connection per job.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Handle returned by [`Listeners::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Shared registry of event listeners keyed by event kind.
#[derive(Clone, Default)]
pub struct Listeners {
    entries: Arc<Mutex<Vec<(ListenerId, EventKind, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, kind, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry, _, _)| *entry != id);
        entries.len() != before
    }

    /// Deliver `event` to every listener of its kind.
    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        // Snapshot first so handlers may (un)register without deadlocking.
        let handlers: Vec<Listener> = self
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, EventKind, Listener)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.lock().len())
            .finish()
    }
}

/// What the channel produced next.
#[derive(Debug)]
pub enum ChannelEvent {
    Event(EngineEvent),
    /// The peer closed the connection.
    Closed,
    Failed(TransportError),
}

/// A typed event stream over one transport.
pub struct EventChannel {
    transport: Option<Box<dyn Transport>>,
    listeners: Listeners,
}

impl EventChannel {
    /// Connect to `url` and start delivering events to `listeners`.
    pub async fn open(
        connector: &dyn Connector,
        url: &str,
        listeners: Listeners,
    ) -> Result<Self, TransportError> {
        let transport = connector.connect(url).await?;
        debug!(url, "event channel open");
        Ok(Self {
            transport: Some(transport),
            listeners,
        })
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Wait for the next decodable event.
    ///
    /// Undecodable frames and unknown tags are skipped. Every decoded event
    /// is emitted to listeners before it is returned.
    pub async fn next_event(&mut self) -> ChannelEvent {
        let Some(transport) = self.transport.as_mut() else {
            return ChannelEvent::Closed;
        };
        loop {
            match transport.recv().await {
                Ok(Frame::Text(text)) => match EngineEvent::decode(&text) {
                    Some(event) => {
                        self.listeners.emit(&event);
                        return ChannelEvent::Event(event);
                    }
                    None => trace!(frame = %text, "ignoring engine frame"),
                },
                Ok(Frame::Closed) => return ChannelEvent::Closed,
                Err(e) => return ChannelEvent::Failed(e),
            }
        }
    }

    /// Close the transport. Safe to call repeatedly; close errors are dropped.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "ignoring event channel close error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_filter_by_kind() {
        let listeners = Listeners::new();
        let progress = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&progress);
        listeners.on(EventKind::Progress, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&EngineEvent::Status(serde_json::Value::Null));
        listeners.emit(&EngineEvent::Progress(crate::ProgressData {
            value: 1,
            max: 2,
            node: None,
            prompt_id: None,
        }));
        assert_eq!(progress.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = listeners.on(EventKind::Status, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(listeners.off(id));
        assert!(!listeners.off(id));
        listeners.emit(&EngineEvent::Status(serde_json::Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
