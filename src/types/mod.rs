//! Core identifier and classification types for the runtime.
//!
//! Everything that crosses a component boundary (context names, event
//! order identifiers, node addresses, lock kinds) lives here so that the
//! ordering, ownership and elasticity modules agree on one vocabulary.

use core::fmt;
use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// The canonical name of the global root context.
///
/// The ownership structure is a forest rooted at this context; contexts
/// created without an explicit owner become its children.
pub const GLOBAL_CONTEXT: &str = "global";

/// Canonical, hierarchical name of a context.
///
/// Names are parameterized by numeric IDs in the application layer
/// (`"App.Room[3]"`); the runtime treats them as opaque ordered strings.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextName(String);

impl ContextName {
    /// Creates a context name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the global root context.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_CONTEXT
    }

    /// Extracts the type name embedded in a canonical context name:
    /// the last dot-separated component with any `[id]` suffix removed.
    ///
    /// `"App.Room[3]"` → `"Room"`, `"global"` → `"global"`.
    #[must_use]
    pub fn type_name(&self) -> &str {
        let tail = match self.0.rfind('.') {
            Some(pos) => &self.0[pos + 1..],
            None => &self.0[..],
        };
        match tail.find('[') {
            Some(pos) => &tail[..pos],
            None => tail,
        }
    }
}

impl Borrow<str> for ContextName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ContextName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextName({})", self.0)
    }
}

/// Numeric identifier of a context, unique per node.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// Globally unique, totally ordered identifier of an event.
///
/// Composed of the creating context's ID and that context's creation
/// sequence number. Ordering is lexicographic `(context, sequence)`:
/// total within a context by generation order, and globally unique.
/// Immutable once assigned.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OrderId {
    /// The context that created the event.
    pub context: ContextId,
    /// The creation ticket within that context (starts at 1; 0 is unset).
    pub sequence: u64,
}

impl OrderId {
    /// Creates an order identifier.
    #[must_use]
    pub const fn new(context: ContextId, sequence: u64) -> Self {
        Self { context, sequence }
    }

    /// Returns true if this identifier has not been assigned yet.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.sequence == 0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}.{}", self.context.0, self.sequence)
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({}:{})", self.context.0, self.sequence)
    }
}

/// Address of a node hosting contexts. Opaque to the runtime core; the
/// transport layer owns its interpretation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    /// Creates a node address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeAddr {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({})", self.0)
    }
}

/// Classification of an event entering a context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum EventKind {
    /// Asynchronous event delivered to the context's create queue.
    Async,
    /// Synchronous cross-context call (caller blocks on the callee).
    Routine,
    /// Broadcast fan-out to a context sub-tree.
    Broadcast,
    /// Service start event.
    Start,
    /// Context migration marker; uses the skip-ticket mechanism.
    Migration,
    /// Commit barrier marker.
    Commit,
}

/// Lock kinds a request may carry against a dominated region.
///
/// `VWrite`/`VRead` are shadow entries placed in the queues of a target's
/// descendants so that a grant on the target implicitly orders the whole
/// subtree; `Dom` is the exclusive whole-region lock taken by ownership
/// edits; `Unlock` is the release marker carried by unlock cascades.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum LockKind {
    /// Exclusive write lock.
    Write,
    /// Shared read lock.
    Read,
    /// Shadow write entry in a descendant's queue.
    VWrite,
    /// Shadow read entry in a descendant's queue.
    VRead,
    /// Exclusive lock over a dominator's entire region.
    Dom,
    /// Release marker.
    Unlock,
}

impl LockKind {
    /// Returns true if two holders of these kinds may share a region.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::VRead)
    }

    /// Returns true if this kind demands exclusive access.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::VWrite)
    }
}

/// Lifecycle state of an event within a context engine.
///
/// Transitions: `Created → QueuedForExecute → Executing → AwaitingLocks
/// (cross-context only) → Committing → Committed`, or `Deleted` when a
/// migration supersedes the event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum EventState {
    /// Admitted to the create queue, creation ticket assigned.
    Created,
    /// Creation ticket served; waiting for an execute ticket turn.
    QueuedForExecute,
    /// Body running on a worker thread.
    Executing,
    /// Blocked on dominator lock grants for other contexts.
    AwaitingLocks,
    /// Execution finished; waiting on the commit barrier.
    Committing,
    /// Committed in ticket order.
    Committed,
    /// Superseded (e.g. by migration); its ticket is skipped.
    Deleted,
}

impl EventState {
    /// Returns true if `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use EventState::{
            AwaitingLocks, Committed, Committing, Created, Deleted, Executing, QueuedForExecute,
        };
        matches!(
            (self, next),
            (Created, QueuedForExecute)
                | (QueuedForExecute, Executing)
                | (Executing, AwaitingLocks)
                | (AwaitingLocks, Executing)
                | (Executing, Committing)
                | (Committing, Committed)
                | (Created | QueuedForExecute, Deleted)
        )
    }
}
