//! Context placement directory.
//!
//! Maps every context name to the node currently hosting it. The table
//! is versioned: each mutation bumps a monotonic counter, and readers
//! that captured an older version can detect staleness instead of acting
//! on a placement that has since changed. [`MappingSnapshot`] captures
//! the whole table at one version for wire transfer between nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::ownership::FairRwLock;
use crate::types::{ContextName, NodeAddr};

#[derive(Debug, Default)]
struct MappingState {
    entries: BTreeMap<ContextName, NodeAddr>,
    head: NodeAddr,
    version: u64,
}

/// A consistent copy of the directory at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    /// All placements at capture time.
    pub entries: BTreeMap<ContextName, NodeAddr>,
    /// The head node at capture time.
    pub head: NodeAddr,
    /// The directory version the snapshot was taken at.
    pub version: u64,
}

/// Versioned context → node directory.
#[derive(Debug)]
pub struct ContextMapping {
    state: FairRwLock<MappingState>,
}

impl ContextMapping {
    /// Creates an empty directory with the given head node.
    #[must_use]
    pub fn new(head: NodeAddr) -> Self {
        Self {
            state: FairRwLock::new(MappingState {
                entries: BTreeMap::new(),
                head,
                version: 0,
            }),
        }
    }

    /// The node hosting `context`, or [`ErrorKind::Unmapped`].
    pub fn node_of(&self, context: &ContextName) -> Result<NodeAddr> {
        let state = self.state.read();
        state
            .entries
            .get(context)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::Unmapped).in_context(context.clone())
            })
    }

    /// Places (or re-places) `context` on `node`. Returns the new
    /// directory version.
    pub fn update(&self, context: ContextName, node: NodeAddr) -> u64 {
        let mut state = self.state.write();
        state.version += 1;
        debug!(context = %context, node = %node, version = state.version, "mapping updated");
        state.entries.insert(context, node);
        state.version
    }

    /// Removes `context` from the directory. Returns the new version, or
    /// [`ErrorKind::Unmapped`] if it was not present.
    pub fn remove(&self, context: &ContextName) -> Result<u64> {
        let mut state = self.state.write();
        if state.entries.remove(context).is_none() {
            return Err(Error::new(ErrorKind::Unmapped).in_context(context.clone()));
        }
        state.version += 1;
        Ok(state.version)
    }

    /// The head node coordinating mapping changes.
    #[must_use]
    pub fn head(&self) -> NodeAddr {
        self.state.read().head.clone()
    }

    /// Installs a new head node. Bumps the version.
    pub fn set_head(&self, head: NodeAddr) -> u64 {
        let mut state = self.state.write();
        state.head = head;
        state.version += 1;
        state.version
    }

    /// Current directory version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Captures the whole table at its current version.
    #[must_use]
    pub fn snapshot(&self) -> MappingSnapshot {
        let state = self.state.read();
        MappingSnapshot {
            entries: state.entries.clone(),
            head: state.head.clone(),
            version: state.version,
        }
    }

    /// Replaces the table with `snapshot` if it is newer; an older or
    /// equal version is rejected as stale.
    pub fn install(&self, snapshot: MappingSnapshot) -> Result<()> {
        let mut state = self.state.write();
        if snapshot.version <= state.version {
            return Err(Error::stale_version(snapshot.version, state.version));
        }
        state.entries = snapshot.entries;
        state.head = snapshot.head;
        state.version = snapshot.version;
        Ok(())
    }
}
