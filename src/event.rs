//! Event records and per-event lock bookkeeping.
//!
//! An [`Event`] is one unit of work targeting a context. Its identity is an
//! [`OrderId`], assigned once from the creating context's ticket counter and
//! immutable afterwards. During execution the event accumulates an
//! [`EventOperationInfo`] per pending cross-context operation (which
//! contexts it has touched, which permits it already holds, which structure
//! version each permit was computed against) and an [`EventExecutionInfo`]
//! (sub-events spawned, messages deferred until commit, ownership edits
//! requested).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{ContextName, EventKind, EventState, LockKind, NodeAddr, OrderId};

/// An ownership-structure edit requested by an event.
///
/// Edits are collected during execution and applied at commit so that the
/// structure never changes under an event that has already been granted
/// permits against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipOp {
    /// Add a parent→child edge.
    Add {
        /// The parent context.
        parent: ContextName,
        /// The child context.
        child: ContextName,
    },
    /// Delete a parent→child edge.
    Delete {
        /// The parent context.
        parent: ContextName,
        /// The child context.
        child: ContextName,
    },
}

/// The operation an [`EventOperationInfo`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Acquire a context lock.
    Lock,
    /// Release a context lock.
    Unlock,
    /// Add an ownership edge (structure write).
    AddOwnership,
    /// Delete an ownership edge (structure write).
    DeleteOwnership,
}

/// A message the event produced but which must not leave the node until
/// the event commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMessage {
    /// Destination node.
    pub dest: NodeAddr,
    /// Serialized payload, opaque to the engine.
    pub payload: Vec<u8>,
}

/// Describes one pending cross-context operation attached to an event.
///
/// `accessed_contexts` is ordered by first access and grows monotonically
/// for the life of the event's execution; the entry before a context is the
/// "previous" context used to direct unlock cascades. `version_stamps`
/// records the ownership-structure version each permit was computed
/// against, so a structural edit in between is detected as staleness
/// instead of being silently honored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOperationInfo {
    /// The event this operation belongs to.
    pub event: OrderId,
    /// What the operation does.
    pub kind: OpKind,
    /// Access mode for lock operations ([`LockKind::Write`] or
    /// [`LockKind::Read`]); ignored for ownership edits.
    pub mode: LockKind,
    /// Context the operation originates from.
    pub from: ContextName,
    /// Context the operation targets.
    pub to: ContextName,
    /// Execute ticket within the target context, 0 until assigned.
    pub ticket: u64,
    /// Contexts this event has accessed, in first-access order.
    pub accessed_contexts: Vec<ContextName>,
    /// Structure version each granted context was computed against.
    pub version_stamps: BTreeMap<ContextName, u64>,
    /// Contexts for which permission is already granted.
    pub permit_contexts: BTreeSet<ContextName>,
}

impl EventOperationInfo {
    /// Creates an operation record for `event` going from `from` to `to`.
    #[must_use]
    pub fn new(
        event: OrderId,
        kind: OpKind,
        mode: LockKind,
        from: ContextName,
        to: ContextName,
    ) -> Self {
        Self {
            event,
            kind,
            mode,
            from,
            to,
            ticket: 0,
            accessed_contexts: Vec::new(),
            version_stamps: BTreeMap::new(),
            permit_contexts: BTreeSet::new(),
        }
    }

    /// Records that `name` has been accessed. Append-only; re-access of a
    /// known context is a no-op so the first-access order is preserved.
    pub fn record_access(&mut self, name: ContextName) {
        if !self.accessed_contexts.contains(&name) {
            self.accessed_contexts.push(name);
        }
    }

    /// The context accessed immediately before `name`, used to direct
    /// unlock cascades back along the access path.
    #[must_use]
    pub fn previous_context(&self, name: &ContextName) -> Option<&ContextName> {
        let pos = self.accessed_contexts.iter().position(|c| c == name)?;
        if pos == 0 {
            None
        } else {
            Some(&self.accessed_contexts[pos - 1])
        }
    }

    /// Records a granted permit for `name`, stamped with the structure
    /// version it was computed against.
    pub fn grant_permit(&mut self, name: ContextName, structure_version: u64) {
        self.version_stamps.insert(name.clone(), structure_version);
        self.permit_contexts.insert(name);
    }

    /// Returns true if a permit for `name` is already held.
    #[must_use]
    pub fn has_permit(&self, name: &ContextName) -> bool {
        self.permit_contexts.contains(name)
    }

    /// Drops the permit for `name` (on unlock). The access record stays;
    /// accessed contexts are never removed mid-flight.
    pub fn revoke_permit(&mut self, name: &ContextName) {
        self.permit_contexts.remove(name);
        self.version_stamps.remove(name);
    }
}

/// Side effects accumulated while an event executes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventExecutionInfo {
    /// Sub-events spawned into other contexts, in spawn order.
    pub sub_events: Vec<OrderId>,
    /// Messages deferred until commit.
    pub deferred_messages: Vec<DeferredMessage>,
    /// Ownership edits to apply at commit.
    pub ownership_ops: Vec<OwnershipOp>,
    /// Highest cross-context operation ticket issued so far; the
    /// per-event sequence that orders its [`EventOperationInfo`]s.
    pub next_operation_ticket: u64,
}

impl EventExecutionInfo {
    /// Returns true if the event produced no side effects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sub_events.is_empty()
            && self.deferred_messages.is_empty()
            && self.ownership_ops.is_empty()
    }

    /// Issues the next operation ticket, counting up from 1.
    pub fn issue_operation_ticket(&mut self) -> u64 {
        self.next_operation_ticket += 1;
        self.next_operation_ticket
    }
}

/// One unit of work targeting a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Global order identifier; immutable once assigned.
    pub id: OrderId,
    /// The context that created the event.
    pub created_by: ContextName,
    /// The context the event executes against.
    pub target: ContextName,
    /// Application method tag; opaque to the engine.
    pub method: u32,
    /// Event classification.
    pub kind: EventKind,
    /// Lifecycle state.
    pub state: EventState,
    /// Serialized application payload.
    pub payload: Vec<u8>,
    /// Side effects accumulated during execution.
    pub execution: EventExecutionInfo,
}

impl Event {
    /// Creates a freshly admitted event.
    #[must_use]
    pub fn new(
        id: OrderId,
        created_by: ContextName,
        target: ContextName,
        method: u32,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            created_by,
            target,
            method,
            kind,
            state: EventState::Created,
            payload,
            execution: EventExecutionInfo::default(),
        }
    }

    /// Advances the lifecycle state, returning false if the transition is
    /// not legal (the caller logs and drops the event).
    pub fn transition(&mut self, next: EventState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
