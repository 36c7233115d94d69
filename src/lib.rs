//! Contexture: the runtime core of a distributed actor/context framework.
//!
//! # Overview
//!
//! A node hosts many independently lockable **contexts** (actor-like
//! units of state). Events that target a context are sequenced by
//! strictly increasing tickets, execute under a single-writer discipline,
//! and commit through a per-context barrier so the committed order is
//! deterministic and replayable. Cross-context work is admitted by a
//! hierarchical locking protocol over a dynamic ownership DAG: all
//! contention for a closed region resolves at that region's dominator,
//! which serializes conflicting requests FIFO and makes the protocol
//! deadlock-free without a global lock order. Telemetry recorded during
//! execution feeds a rule-based elasticity engine that proposes context
//! migrations between nodes.
//!
//! # Core Guarantees
//!
//! - **Ticket monotonicity**: create, execute, and commit tickets are
//!   strictly increasing per context and never reused
//! - **Single-writer**: at most one event executes against a context at
//!   a time; readers batch, writers are exclusive
//! - **Commit barrier**: no event commits before every lower-ticket
//!   event of its context has committed
//! - **Dominator closure**: after any sequence of ownership edits, every
//!   context's memoized dominator is recomputed, never stale
//! - **FIFO grants**: lock requests at one dominator are granted in
//!   submission order; reader runs batch, writers are never bypassed
//! - **Release on all paths**: tickets, access permits, and lock guards
//!   advance on drop, so a panic cannot wedge a gate
//!
//! # Module Structure
//!
//! - [`types`]: Core identifiers (context names, order IDs, lock kinds)
//! - [`error`]: Error type with kind, category, and recoverability
//! - [`config`]: Runtime configuration and environment overrides
//! - [`codec`]: Wire serialization for protocol objects
//! - [`event`]: Event records and per-event lock bookkeeping
//! - [`ticket`]: Ticketed ordering gates with skip sets
//! - [`ownership`]: The ownership DAG and its FIFO-fair lock
//! - [`dominator`]: Lock admission at dominator contexts
//! - [`context`]: The per-context execution engine
//! - [`mapping`]: Versioned context → node placement directory
//! - [`elasticity`]: Telemetry and rule-driven migration proposals
//! - [`runtime`]: The explicitly-owned per-node runtime and worker pool
//! - [`transport`]: Seams to the dispatch and network layers
//! - [`util`]: Internal utilities (generational arena)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod context;
pub mod dominator;
pub mod elasticity;
pub mod error;
pub mod event;
pub mod mapping;
pub mod ownership;
pub mod runtime;
pub mod ticket;
pub mod transport;
pub mod types;
pub mod util;

pub use codec::Wire;
pub use config::RuntimeConfig;
pub use context::{AccessGate, AccessPermit, ContextEngine};
pub use dominator::{Dominator, DominatorTable, GrantSet};
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, EventExecutionInfo, EventOperationInfo};
pub use mapping::ContextMapping;
pub use ownership::{FairRwLock, OwnershipStructure};
pub use runtime::NodeRuntime;
pub use ticket::{ServingGuard, TicketBooth, TicketGate};
pub use transport::{EventHandler, Transport};
pub use types::{ContextId, ContextName, EventKind, EventState, LockKind, NodeAddr, OrderId};
