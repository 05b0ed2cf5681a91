//! Local undo/redo history over the shared text.
//!
//! Only transactions tagged with the local origin are captured, so undo
//! never reverts a remote peer's edit. Consecutive local edits made within
//! the capture window are grouped into one undo unit.

use std::time::Duration;

use yrs::undo::Options as UndoOptions;
use yrs::UndoManager;

use crate::replica::{MutationOrigin, ReplicaManager, UpdateFragment};

pub struct UndoCoordinator {
    manager: UndoManager,
}

impl UndoCoordinator {
    pub fn new(replica: &ReplicaManager, capture_window: Duration) -> Self {
        let options = UndoOptions {
            capture_timeout_millis: capture_window.as_millis() as u64,
            ..UndoOptions::default()
        };
        let mut manager =
            UndoManager::with_scope_and_options(replica.doc(), replica.text_ref(), options);
        manager.include_origin(MutationOrigin::Local.tag());
        Self { manager }
    }

    /// Revert the most recent local undo unit. Returns the fragment that
    /// must be propagated to peers, or `None` when the stack is empty.
    pub fn undo(&mut self, replica: &mut ReplicaManager) -> Option<UpdateFragment> {
        let before = replica.state_vector();
        if !self.manager.undo_blocking() {
            return None;
        }
        Some(Self::publish(replica, &before))
    }

    /// Re-apply the most recently undone unit.
    pub fn redo(&mut self, replica: &mut ReplicaManager) -> Option<UpdateFragment> {
        let before = replica.state_vector();
        if !self.manager.redo_blocking() {
            return None;
        }
        Some(Self::publish(replica, &before))
    }

    fn publish(replica: &mut ReplicaManager, before: &yrs::StateVector) -> UpdateFragment {
        let fragment = replica.diff_since(before);
        replica.record_change(MutationOrigin::History, fragment.clone());
        fragment
    }

    /// Forget all history, e.g. after the content was replaced wholesale.
    pub fn clear(&mut self) {
        self.manager.clear();
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }
}
