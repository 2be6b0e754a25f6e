//! Close negotiation types and bookkeeping.
//!
//! Closing a map with unsaved changes is a conversation: the session asks
//! the shell's dialog layer, the user answers some time later, and only
//! then does the document actually go away. The types here make that
//! conversation explicit. [`PendingCloses`] is the ledger of negotiations
//! in flight, so a duplicate close request for a map already being asked
//! about stays a no-op, and only one close-everything sweep runs at a
//! time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::MapId;

/// The user's answer to an unsaved-changes prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseDecision {
    /// Write the map to disk, then close it
    Save,
    /// Close the map, dropping unsaved changes
    Discard,
    /// Keep the map open; aborts a surrounding close-everything sweep
    Cancel,
}

/// Continuation handed to the shell with a confirmation request.
///
/// The shell invokes it exactly once, from whatever thread its dialog
/// layer runs on, once the user has decided.
pub type DecisionCallback = Box<dyn FnOnce(CloseDecision) + Send>;

/// Port to the shell's dialog layer.
///
/// The session calls this for every close of a modified document; clean
/// documents close without any prompt. Not answering parks that one
/// negotiation indefinitely without blocking anything else.
pub trait CloseConfirmer: Send + Sync {
    /// Ask the user what to do about unsaved changes in `id`
    fn request_close_confirmation(&self, id: MapId, on_decision: DecisionCallback);
}

/// Ledger of close negotiations currently awaiting a decision.
///
/// Lives inside the session's state lock; the session records a
/// negotiation here before prompting and resolves it when the decision
/// arrives, whichever way it went.
#[derive(Debug, Default)]
pub(crate) struct PendingCloses {
    awaiting: HashSet<MapId>,
    sweep_active: bool,
}

impl PendingCloses {
    /// Record a new negotiation. `false` when one is already running for
    /// this id, in which case the new request must be dropped.
    pub(crate) fn begin(&mut self, id: MapId) -> bool {
        self.awaiting.insert(id)
    }

    /// A decision arrived (any outcome); the negotiation is over.
    pub(crate) fn resolve(&mut self, id: MapId) {
        self.awaiting.remove(&id);
    }

    /// Claim the close-everything sweep. `false` when one is already
    /// running.
    pub(crate) fn begin_sweep(&mut self) -> bool {
        if self.sweep_active {
            return false;
        }
        self.sweep_active = true;
        true
    }

    /// The sweep finished, completed or aborted.
    pub(crate) fn end_sweep(&mut self) {
        self.sweep_active = false;
    }

    /// Drop every in-flight negotiation. Used when the environment resets
    /// and the documents being negotiated no longer exist.
    pub(crate) fn clear(&mut self) {
        self.awaiting.clear();
        self.sweep_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_negotiation_is_rejected() {
        let mut pending = PendingCloses::default();
        assert!(pending.begin(MapId::new(1)));
        assert!(!pending.begin(MapId::new(1)));
        assert!(pending.begin(MapId::new(2)));

        pending.resolve(MapId::new(1));
        assert!(pending.begin(MapId::new(1)));
    }

    #[test]
    fn only_one_sweep_at_a_time() {
        let mut pending = PendingCloses::default();
        assert!(pending.begin_sweep());
        assert!(!pending.begin_sweep());
        pending.end_sweep();
        assert!(pending.begin_sweep());
    }

    #[test]
    fn clear_resets_everything() {
        let mut pending = PendingCloses::default();
        pending.begin(MapId::new(1));
        pending.begin_sweep();
        pending.clear();
        assert!(pending.begin(MapId::new(1)));
        assert!(pending.begin_sweep());
    }

    #[test]
    fn decisions_round_trip_through_json() {
        let json = serde_json::to_string(&CloseDecision::Save).unwrap();
        assert_eq!(json, "\"save\"");
        let back: CloseDecision = serde_json::from_str("\"cancel\"").unwrap();
        assert_eq!(back, CloseDecision::Cancel);
    }
}
