//! Live connections, keyed by session id.
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::view::ViewEvent;
use crate::metrics;

pub type EventSink = UnboundedSender<ViewEvent>;

/// Which page a connection serves; decides what it renders on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    #[default]
    Projects,
    Chat,
}

pub struct Connection {
    pub id: u64,
    pub session_id: String,
    pub view: ViewKind,
    sink: EventSink,
}

impl Connection {
    /// Queues an event for the client. A closed client drops it.
    pub fn emit(&self, event: ViewEvent) {
        if self.sink.send(event).is_err() {
            debug!("Connection {} closed, dropping event", self.id);
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<String, Vec<(u64, EventSink)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, view: ViewKind, sink: EventSink) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .push((id, sink.clone()));
        metrics::inc_connections();
        debug!("Registered connection {} for session {}", id, session_id);
        Connection { id, session_id: session_id.to_string(), view, sink }
    }

    pub fn remove(&self, connection: &Connection) {
        let mut emptied = false;
        if let Some(mut entries) = self.sessions.get_mut(&connection.session_id) {
            let before = entries.len();
            entries.retain(|(id, _)| *id != connection.id);
            if entries.len() < before {
                metrics::dec_connections();
            }
            emptied = entries.is_empty();
        }
        if emptied {
            self.sessions.remove_if(&connection.session_id, |_, entries| entries.is_empty());
        }
        debug!("Removed connection {}", connection.id);
    }

    /// Sends to every connection of the session except `except`; returns how many accepted it.
    pub fn send_to(&self, session_id: &str, event: &ViewEvent, except: Option<u64>) -> usize {
        match self.sessions.get(session_id) {
            Some(entries) => entries
                .iter()
                .filter(|(id, _)| Some(*id) != except)
                .filter(|(_, sink)| sink.send(event.clone()).is_ok())
                .count(),
            None => 0,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_register_send_remove() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let (tx3, mut rx3) = unbounded_channel();
        let first = registry.register("s1", ViewKind::Projects, tx1);
        let second = registry.register("s1", ViewKind::Chat, tx2);
        let other = registry.register("s2", ViewKind::Chat, tx3);
        assert_ne!(first.id, second.id);

        assert_eq!(registry.send_to("s1", &ViewEvent::SessionReset, Some(first.id)), 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), ViewEvent::SessionReset);
        assert!(rx3.try_recv().is_err());

        registry.remove(&second);
        registry.remove(&first);
        assert_eq!(registry.send_to("s1", &ViewEvent::SessionReset, None), 0);

        other.emit(ViewEvent::ClearMessages);
        assert_eq!(rx3.try_recv().unwrap(), ViewEvent::ClearMessages);
        assert_eq!(registry.send_to("s2", &ViewEvent::SessionReset, None), 1);
    }

    #[test]
    fn test_emit_to_closed_client_is_silent() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = unbounded_channel();
        let connection = registry.register("s1", ViewKind::Chat, tx);
        drop(rx);
        connection.emit(ViewEvent::ClearMessages);
        assert_eq!(registry.send_to("s1", &ViewEvent::SessionReset, None), 0);
    }
}
