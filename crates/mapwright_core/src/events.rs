//! Session events and the callback registry that delivers them.
//!
//! The session emits [`SessionEvent`] values whenever its observable state
//! changes. Shells subscribe with a callback and translate events into UI
//! updates; events are serializable so IPC-based shells can forward them
//! as-is.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::session::MapId;

/// Events emitted by a map session.
///
/// Events describe completed state changes, never requests: by the time a
/// subscriber sees `DocumentClosed`, the document is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A map file was opened and registered
    DocumentOpened {
        /// Identity of the new document
        id: MapId,
        /// Canonical path it was opened from
        path: PathBuf,
    },

    /// A different open document became selected
    SelectionChanged {
        /// Identity of the now-selected document
        id: MapId,
    },

    /// The last open document went away; nothing is selected
    SelectionCleared,

    /// An open document was closed and deregistered
    DocumentClosed {
        /// Identity of the closed document
        id: MapId,
    },

    /// The selected document's active z-level changed
    LayerChanged {
        /// The new active z-level
        z: u32,
    },

    /// A document was written to disk
    SaveCompleted {
        /// Identity of the saved document
        id: MapId,
    },

    /// A freshly created map wants its dimensions configured
    SizeConfigurationRequested {
        /// Identity of the new document
        id: MapId,
    },

    /// An opened map uses type paths the environment does not declare
    UnknownTypesFound {
        /// Identity of the opened document
        id: MapId,
        /// Unknown type paths, sorted and deduplicated
        types: Vec<String>,
    },
}

impl SessionEvent {
    /// Create a DocumentOpened event.
    pub fn document_opened(id: MapId, path: PathBuf) -> Self {
        Self::DocumentOpened { id, path }
    }

    /// Create a SelectionChanged event.
    pub fn selection_changed(id: MapId) -> Self {
        Self::SelectionChanged { id }
    }

    /// Create a DocumentClosed event.
    pub fn document_closed(id: MapId) -> Self {
        Self::DocumentClosed { id }
    }

    /// Create a LayerChanged event.
    pub fn layer_changed(z: u32) -> Self {
        Self::LayerChanged { z }
    }

    /// Create a SaveCompleted event.
    pub fn save_completed(id: MapId) -> Self {
        Self::SaveCompleted { id }
    }

    /// Create a SizeConfigurationRequested event.
    pub fn size_configuration_requested(id: MapId) -> Self {
        Self::SizeConfigurationRequested { id }
    }

    /// Create an UnknownTypesFound event.
    pub fn unknown_types_found(id: MapId, types: Vec<String>) -> Self {
        Self::UnknownTypesFound { id, types }
    }

    /// The document this event concerns, if it concerns one.
    pub fn map_id(&self) -> Option<MapId> {
        match self {
            Self::DocumentOpened { id, .. } => Some(*id),
            Self::SelectionChanged { id } => Some(*id),
            Self::SelectionCleared => None,
            Self::DocumentClosed { id } => Some(*id),
            Self::LayerChanged { .. } => None,
            Self::SaveCompleted { id } => Some(*id),
            Self::SizeConfigurationRequested { id } => Some(*id),
            Self::UnknownTypesFound { id, .. } => Some(*id),
        }
    }

    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DocumentOpened { .. } => "DocumentOpened",
            Self::SelectionChanged { .. } => "SelectionChanged",
            Self::SelectionCleared => "SelectionCleared",
            Self::DocumentClosed { .. } => "DocumentClosed",
            Self::LayerChanged { .. } => "LayerChanged",
            Self::SaveCompleted { .. } => "SaveCompleted",
            Self::SizeConfigurationRequested { .. } => "SizeConfigurationRequested",
            Self::UnknownTypesFound { .. } => "UnknownTypesFound",
        }
    }
}

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for session events.
///
/// Callbacks receive a reference to the event and should not block for
/// extended periods.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Thread-safe registry for managing event subscriptions.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use mapwright_core::events::EventBus;
///
/// let bus = EventBus::new();
/// let id = bus.subscribe(Arc::new(|event| {
///     println!("Event: {:?}", event);
/// }));
/// bus.unsubscribe(id);
/// ```
pub struct EventBus {
    /// Map of subscription IDs to callbacks.
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback>>,
    /// Counter for generating unique subscription IDs.
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to session events.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.insert(id, callback);
        id
    }

    /// Unsubscribe from session events.
    ///
    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.remove(&id).is_some()
    }

    /// Emit an event to all registered callbacks.
    ///
    /// Callbacks are invoked synchronously in an undefined order.
    /// If a callback panics, it does not affect other callbacks.
    pub fn emit(&self, event: &SessionEvent) {
        let callbacks = self.callbacks.read().unwrap();
        for callback in callbacks.values() {
            // Use catch_unwind to prevent one callback from breaking others
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.read().unwrap();
        callbacks.len()
    }

    /// Check if there are any active subscriptions.
    pub fn has_subscribers(&self) -> bool {
        let callbacks = self.callbacks.read().unwrap();
        !callbacks.is_empty()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = self.callbacks.read().unwrap();
        f.debug_struct("EventBus")
            .field("subscriber_count", &callbacks.len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}
