//! Event stream for lifecycle, permission and audit notifications
//!
//! The MessageBus is the append-only event stream hosts subscribe to. It
//! uses bounded channels to prevent unbounded memory growth and supports
//! both specific event subscriptions and global "All" subscriptions.

use chrono::{DateTime, Utc};
use sdk::types::{LifecycleState, Permission, RuntimeState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::trust::AuditEntry;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// A plugin moved between lifecycle states
    StateChanged,
    /// A module runtime moved between runtime states
    RuntimeChanged,
    /// A permission request was granted
    PermissionGranted,
    /// A permission request was denied
    PermissionDenied,
    /// A grant was removed
    PermissionRevoked,
    /// Security audit entry
    Audit,
    /// Subscribe to all event types
    All,
}

/// Lifecycle state change notification
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub plugin_id: String,
    pub old_state: LifecycleState,
    pub new_state: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    StateChanged(LifecycleEvent),
    RuntimeChanged {
        plugin_id: String,
        old_state: RuntimeState,
        new_state: RuntimeState,
        timestamp: DateTime<Utc>,
        error: Option<String>,
    },
    PermissionGranted {
        plugin_id: String,
        permission: Permission,
        reason: String,
    },
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
        reason: String,
    },
    PermissionRevoked {
        plugin_id: String,
        permission: Permission,
    },
    Audit(AuditEntry),
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::StateChanged(_) => EventType::StateChanged,
            Event::RuntimeChanged { .. } => EventType::RuntimeChanged,
            Event::PermissionGranted { .. } => EventType::PermissionGranted,
            Event::PermissionDenied { .. } => EventType::PermissionDenied,
            Event::PermissionRevoked { .. } => EventType::PermissionRevoked,
            Event::Audit(_) => EventType::Audit,
        }
    }
}

/// Message bus for pub/sub delivery of core events
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or EventType::All for all events
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers
    ///
    /// The event is sent to all subscribers of the specific event type,
    /// as well as all subscribers of EventType::All. Delivery never waits:
    /// a subscriber whose buffer is full misses the event, and subscribers
    /// whose receiver was dropped are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Subscriber to {:?} is full, dropping {:?} event",
                            key, event_type
                        );
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
