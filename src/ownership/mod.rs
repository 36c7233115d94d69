//! Ownership of contexts: the structure DAG and its fair lock.
//!
//! [`OwnershipStructure`] answers "who dominates whom" for the lock
//! admission protocol; [`FairRwLock`] is the FIFO reader/writer lock it
//! sits behind, exposed separately because the context engine reuses it
//! for its own shared state.

pub mod fair_lock;
pub mod structure;

pub use fair_lock::{FairReadGuard, FairRwLock, FairWriteGuard};
pub use structure::OwnershipStructure;
