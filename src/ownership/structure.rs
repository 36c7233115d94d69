//! The ownership structure: a dynamic DAG of contexts.
//!
//! Contexts form a forest rooted at the global context. Each node memoizes
//! its *upper bound*: the nearest ancestor (or itself) whose descendant
//! region is closed, meaning every parent of every node in the region is
//! itself inside the region. Lock admission resolves all contention for a
//! region at its upper bound, so the memo must never go stale: every
//! structural edit clears the flags over the affected region and re-runs
//! the traversal before the edit becomes visible.
//!
//! The traversal ([`DagState::traverse_and_update`]) is a DFS from a root.
//! A node is its own upper bound iff all parents reachable through its
//! subtree are within the subtree; a leaf is trivially its own upper
//! bound. A closed node broadcasts its name down to descendants until the
//! broadcast reaches a node that is itself closed.
//!
//! Nodes live in a generational [`Arena`] and refer to each other by
//! index; per-node version counters rise on every edge edit touching the
//! node, and a structure-wide version rises once per edit batch. Both feed
//! the staleness checks in lock admission.

use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::event::OwnershipOp;
use crate::ownership::fair_lock::FairRwLock;
use crate::types::{ContextName, GLOBAL_CONTEXT};
use crate::util::{Arena, ArenaIndex};

#[derive(Debug)]
struct Node {
    name: ContextName,
    parents: SmallVec<[ArenaIndex; 2]>,
    children: SmallVec<[ArenaIndex; 4]>,
    upper_bound: ContextName,
    is_upper_bound: bool,
    version: u64,
}

impl Node {
    fn new(name: ContextName) -> Self {
        let upper_bound = name.clone();
        Self {
            name,
            parents: SmallVec::new(),
            children: SmallVec::new(),
            upper_bound,
            is_upper_bound: false,
            version: 0,
        }
    }
}

/// The mutable DAG state held under the structure's fair lock.
#[derive(Debug)]
pub struct DagState {
    nodes: Arena<Node>,
    by_name: BTreeMap<ContextName, ArenaIndex>,
    /// Edge set mirroring the node links, for O(log n) membership checks.
    edges: BTreeSet<(ContextName, ContextName)>,
    version: u64,
}

impl DagState {
    fn new() -> Self {
        let mut state = Self {
            nodes: Arena::new(),
            by_name: BTreeMap::new(),
            edges: BTreeSet::new(),
            version: 1,
        };
        let root = ContextName::new(GLOBAL_CONTEXT);
        let idx = state.nodes.insert(Node::new(root.clone()));
        state.by_name.insert(root, idx);
        state
    }

    fn find(&self, name: &ContextName) -> Option<ArenaIndex> {
        self.by_name.get(name).copied()
    }

    fn node(&self, idx: ArenaIndex) -> Option<&Node> {
        self.nodes.get(idx)
    }

    fn ensure_node(&mut self, name: &ContextName) -> ArenaIndex {
        if let Some(idx) = self.find(name) {
            return idx;
        }
        let idx = self.nodes.insert(Node::new(name.clone()));
        self.by_name.insert(name.clone(), idx);
        idx
    }

    fn has_edge(&self, parent: &ContextName, child: &ContextName) -> bool {
        self.edges.contains(&(parent.clone(), child.clone()))
    }

    fn link(&mut self, parent: ArenaIndex, child: ArenaIndex) {
        if let Some(p) = self.nodes.get_mut(parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
            p.version += 1;
        }
        if let Some(c) = self.nodes.get_mut(child) {
            if !c.parents.contains(&parent) {
                c.parents.push(parent);
            }
            c.version += 1;
        }
    }

    fn unlink(&mut self, parent: ArenaIndex, child: ArenaIndex) {
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.retain(|i| *i != child);
            p.version += 1;
        }
        if let Some(c) = self.nodes.get_mut(child) {
            c.parents.retain(|i| *i != parent);
            c.version += 1;
        }
    }

    /// True if `elder` is an ancestor of (or equal to) `descendant`.
    fn is_elder(&self, descendant: &ContextName, elder: &ContextName) -> bool {
        let Some(idx) = self.find(elder) else {
            return false;
        };
        self.reaches_down(idx, descendant)
    }

    fn reaches_down(&self, idx: ArenaIndex, target: &ContextName) -> bool {
        let Some(node) = self.node(idx) else {
            return false;
        };
        if node.name == *target {
            return true;
        }
        node.children
            .iter()
            .any(|&child| self.reaches_down(child, target))
    }

    /// Names in the closed region below `idx`: the node itself plus
    /// descendants, cutting off below any child that is an upper bound
    /// (the boundary node is included, its subtree is not).
    fn region_descendants(&self, idx: ArenaIndex) -> BTreeSet<ContextName> {
        let mut names = BTreeSet::new();
        if let Some(node) = self.node(idx) {
            names.insert(node.name.clone());
            for &child in &node.children {
                self.collect_region(child, &mut names);
            }
        }
        names
    }

    fn collect_region(&self, idx: ArenaIndex, names: &mut BTreeSet<ContextName>) {
        let Some(node) = self.node(idx) else {
            return;
        };
        names.insert(node.name.clone());
        if node.is_upper_bound {
            return;
        }
        for &child in &node.children {
            self.collect_region(child, names);
        }
    }

    /// Maps every context under `idx` to its governing dominator.
    fn dominate_region_map(
        &self,
        idx: ArenaIndex,
        dominator: &ContextName,
        map: &mut BTreeMap<ContextName, BTreeSet<ContextName>>,
    ) {
        let Some(node) = self.node(idx) else {
            return;
        };
        map.entry(dominator.clone())
            .or_default()
            .insert(node.name.clone());
        let next = if node.is_upper_bound {
            map.entry(node.name.clone())
                .or_default()
                .insert(node.name.clone());
            node.name.clone()
        } else {
            dominator.clone()
        };
        for &child in &node.children {
            self.dominate_region_map(child, &next, map);
        }
    }

    /// Shortest distance from `idx` to a root, in edges.
    fn depth_of(&self, idx: ArenaIndex) -> Option<usize> {
        let node = self.node(idx)?;
        let mut best: Option<usize> = None;
        for &parent in &node.parents {
            if let Some(d) = self.depth_of(parent) {
                best = Some(best.map_or(d + 1, |b| b.min(d + 1)));
            }
        }
        Some(best.unwrap_or(0))
    }

    /// Walks first-parent links up to a root context.
    fn root_of(&self, idx: ArenaIndex) -> Option<ContextName> {
        let node = self.node(idx)?;
        match node.parents.first() {
            Some(&parent) => self.root_of(parent),
            None => Some(node.name.clone()),
        }
    }

    fn clear_upper_bound_flags(&mut self, idx: ArenaIndex) {
        let children = match self.node(idx) {
            Some(node) => node.children.clone(),
            None => return,
        };
        for child in children {
            self.clear_upper_bound_flags(child);
        }
        if let Some(node) = self.nodes.get_mut(idx) {
            node.is_upper_bound = false;
        }
    }

    /// The DFS that recomputes upper bounds from `idx` down.
    ///
    /// `caller_children`/`caller_parents` accumulate, for the caller's
    /// subtree, the set of names inside it and the set of parent names
    /// referenced from inside it. A node whose referenced-parent set is
    /// contained in its own subtree is closed: it becomes its own upper
    /// bound and broadcasts its name down to the region it closes.
    fn traverse_and_update(
        &mut self,
        idx: ArenaIndex,
        caller_children: &mut BTreeSet<ContextName>,
        caller_parents: &mut BTreeSet<ContextName>,
    ) {
        let (name, parent_names, children) = match self.node(idx) {
            Some(node) => (
                node.name.clone(),
                node.parents
                    .iter()
                    .filter_map(|&p| self.node(p).map(|n| n.name.clone()))
                    .collect::<Vec<_>>(),
                node.children.clone(),
            ),
            None => return,
        };

        let mut my_children = BTreeSet::new();
        let mut my_parents = BTreeSet::new();
        my_children.insert(name.clone());
        my_parents.insert(name.clone());
        caller_children.insert(name.clone());
        caller_parents.insert(name.clone());
        // A node's own parents count against the caller's region, not its
        // own; closure of this node depends only on its descendants.
        for parent in parent_names {
            caller_parents.insert(parent);
        }

        if children.is_empty() {
            if let Some(node) = self.nodes.get_mut(idx) {
                node.is_upper_bound = true;
                node.upper_bound = name;
            }
            return;
        }

        for &child in &children {
            self.traverse_and_update(child, &mut my_children, &mut my_parents);
        }

        let closed = my_parents.iter().all(|p| my_children.contains(p));
        if closed {
            for &child in &children {
                self.broadcast_upper_bound(child, &name);
            }
            if let Some(node) = self.nodes.get_mut(idx) {
                node.upper_bound = name.clone();
            }
        } else {
            caller_parents.append(&mut my_parents);
            caller_children.append(&mut my_children);
        }
        if let Some(node) = self.nodes.get_mut(idx) {
            node.is_upper_bound = closed;
        }
    }

    fn broadcast_upper_bound(&mut self, idx: ArenaIndex, upper_bound: &ContextName) {
        let children = match self.node(idx) {
            Some(node) if !node.is_upper_bound => node.children.clone(),
            _ => return,
        };
        if let Some(node) = self.nodes.get_mut(idx) {
            node.upper_bound = upper_bound.clone();
        }
        for child in children {
            self.broadcast_upper_bound(child, upper_bound);
        }
    }

    fn recompute_from(&mut self, name: &ContextName) {
        let Some(idx) = self.find(name) else {
            return;
        };
        let mut children = BTreeSet::new();
        let mut parents = BTreeSet::new();
        self.traverse_and_update(idx, &mut children, &mut parents);
    }

    /// Recomputes every tree in the forest.
    fn recompute_forest(&mut self) {
        let mut roots = BTreeSet::new();
        let indices: Vec<ArenaIndex> = self.by_name.values().copied().collect();
        for idx in indices {
            if let Some(root) = self.root_of(idx) {
                roots.insert(root);
            }
        }
        for root in roots {
            self.recompute_from(&root);
        }
    }
}

/// Shared, fair-locked ownership structure for one node.
#[derive(Debug)]
pub struct OwnershipStructure {
    state: FairRwLock<DagState>,
}

impl Default for OwnershipStructure {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipStructure {
    /// Creates a structure holding only the global root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FairRwLock::new(DagState::new()),
        }
    }

    /// Creates a structure from initial parent→child edges. Missing nodes
    /// are created; the forest's upper bounds are computed once at the
    /// end.
    #[must_use]
    pub fn with_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (ContextName, ContextName)>,
    {
        let structure = Self::new();
        {
            let mut state = structure.state.write();
            for (parent, child) in edges {
                if state.has_edge(&parent, &child) {
                    continue;
                }
                let p = state.ensure_node(&parent);
                let c = state.ensure_node(&child);
                state.link(p, c);
                state.edges.insert((parent, child));
            }
            state.recompute_forest();
        }
        structure
    }

    /// Adds a parent→child edge and recomputes the affected tree.
    pub fn add_parent_child(&self, parent: &ContextName, child: &ContextName) -> Result<()> {
        let mut state = self.state.write();
        if state.has_edge(parent, child) {
            return Err(Error::new(ErrorKind::DuplicateRequest)
                .with_message(format!("edge {parent}->{child} already exists")));
        }
        if state.is_elder(parent, child) {
            return Err(Error::new(ErrorKind::WouldCycle)
                .with_message(format!("{parent} is already a descendant of {child}")));
        }
        let p = state.ensure_node(parent);
        let c = state.ensure_node(child);
        state.link(p, c);
        state.edges.insert((parent.clone(), child.clone()));
        state.version += 1;
        let root = state.root_of(p).unwrap_or_else(|| parent.clone());
        let root_idx = state.find(&root).unwrap_or(p);
        state.clear_upper_bound_flags(root_idx);
        state.recompute_from(&root);
        debug!(parent = %parent, child = %child, version = state.version, "ownership edge added");
        Ok(())
    }

    /// Deletes a parent→child edge and recomputes the affected trees.
    ///
    /// Removing an edge may split a previously closed region, so the
    /// upper-bound flags for the whole forest under both endpoints' roots
    /// are cleared before recomputation.
    pub fn delete_parent_child(&self, parent: &ContextName, child: &ContextName) -> Result<()> {
        let mut state = self.state.write();
        if !state.has_edge(parent, child) {
            return Err(Error::new(ErrorKind::NoSuchEdge)
                .with_message(format!("no edge {parent}->{child}")));
        }
        let (Some(p), Some(c)) = (state.find(parent), state.find(child)) else {
            return Err(Error::internal("edge set and node map out of sync"));
        };
        state.unlink(p, c);
        state.edges.remove(&(parent.clone(), child.clone()));
        state.version += 1;
        let indices: Vec<ArenaIndex> = state.by_name.values().copied().collect();
        for idx in indices {
            if let Some(node) = state.nodes.get_mut(idx) {
                node.is_upper_bound = false;
            }
        }
        state.recompute_forest();
        debug!(parent = %parent, child = %child, version = state.version, "ownership edge deleted");
        Ok(())
    }

    /// Applies a batch of ownership edits under a dominator and returns
    /// the set of contexts whose governing region changed.
    ///
    /// Invalid entries (cycle-forming adds, deletes of absent edges) are
    /// skipped with a warning rather than failing the batch.
    pub fn modify_ownerships(
        &self,
        dominator: &ContextName,
        ops: &[OwnershipOp],
    ) -> Result<BTreeSet<ContextName>> {
        let mut state = self.state.write();
        let dom_idx = state
            .find(dominator)
            .ok_or_else(|| Error::unknown_context(dominator))?;

        let mut old_regions = BTreeMap::new();
        state.dominate_region_map(dom_idx, dominator, &mut old_regions);

        let mut affected = BTreeSet::new();
        let mut modified = false;
        for op in ops {
            match op {
                OwnershipOp::Add { parent, child } => {
                    if state.has_edge(parent, child) {
                        continue;
                    }
                    if state.find(child).is_some() && state.is_elder(parent, child) {
                        warn!(parent = %parent, child = %child, "skipping cycle-forming ownership add");
                        continue;
                    }
                    let p = state.ensure_node(parent);
                    let c = state.ensure_node(child);
                    state.link(p, c);
                    state.edges.insert((parent.clone(), child.clone()));
                    affected.insert(parent.clone());
                    affected.insert(child.clone());
                    modified = true;
                }
                OwnershipOp::Delete { parent, child } => {
                    if !state.has_edge(parent, child) {
                        warn!(parent = %parent, child = %child, "skipping delete of absent ownership edge");
                        continue;
                    }
                    let (Some(p), Some(c)) = (state.find(parent), state.find(child)) else {
                        continue;
                    };
                    state.unlink(p, c);
                    state.edges.remove(&(parent.clone(), child.clone()));
                    affected.insert(parent.clone());
                    affected.insert(child.clone());
                    modified = true;
                }
            }
        }

        if !modified {
            return Ok(affected);
        }

        state.version += 1;
        state.clear_upper_bound_flags(dom_idx);
        let dom_name = dominator.clone();
        state.recompute_from(&dom_name);

        let mut new_regions = BTreeMap::new();
        state.dominate_region_map(dom_idx, dominator, &mut new_regions);

        for (dom, members) in &new_regions {
            match old_regions.get(dom) {
                None => {
                    affected.insert(dom.clone());
                }
                Some(old_members) if old_members != members => {
                    affected.insert(dom.clone());
                }
                Some(_) => {}
            }
        }
        for dom in old_regions.keys() {
            if !new_regions.contains_key(dom) {
                affected.insert(dom.clone());
            }
        }
        Ok(affected)
    }

    /// Replaces the edge set below the listed parents with `edges`, for
    /// parents whose received version is newer than the local one. Used
    /// when a peer node pushes its view of the structure.
    pub fn update_ownerships(
        &self,
        edges: &[(ContextName, ContextName)],
        versions: &BTreeMap<ContextName, u64>,
    ) {
        let mut state = self.state.write();

        let mut stale_parents = BTreeSet::new();
        let mut incoming = BTreeSet::new();
        for (parent, child) in edges {
            let local = state
                .find(parent)
                .and_then(|idx| state.node(idx))
                .map(|n| n.version);
            let remote = versions.get(parent).copied().unwrap_or(0);
            if local.is_none() || remote > local.unwrap_or(0) {
                stale_parents.insert(parent.clone());
                incoming.insert((parent.clone(), child.clone()));
            }
        }
        if stale_parents.is_empty() {
            return;
        }

        for (parent, child) in edges {
            if !stale_parents.contains(parent) || state.has_edge(parent, child) {
                continue;
            }
            if state.find(child).is_some() && state.is_elder(parent, child) {
                warn!(parent = %parent, child = %child, "skipping cycle-forming ownership update");
                continue;
            }
            let p = state.ensure_node(parent);
            let c = state.ensure_node(child);
            state.link(p, c);
            for idx in [p, c] {
                if let Some(node) = state.nodes.get_mut(idx) {
                    let remote = versions.get(&node.name).copied().unwrap_or(0);
                    if node.version < remote {
                        node.version = remote;
                    }
                }
            }
            state.edges.insert((parent.clone(), child.clone()));
        }

        // Any recorded edge under an updated parent that the peer no
        // longer lists has been deleted remotely.
        let to_remove: Vec<(ContextName, ContextName)> = state
            .edges
            .iter()
            .filter(|(parent, child)| {
                stale_parents.contains(parent)
                    && !incoming.contains(&(parent.clone(), child.clone()))
            })
            .cloned()
            .collect();
        for (parent, child) in to_remove {
            if let (Some(p), Some(c)) = (state.find(&parent), state.find(&child)) {
                state.unlink(p, c);
            }
            state.edges.remove(&(parent, child));
        }

        state.version += 1;
        state.recompute_forest();
    }

    /// The memoized upper bound of `name`. Unknown contexts echo their
    /// own name back: a context outside the structure is degenerately its
    /// own dominator.
    #[must_use]
    pub fn upper_bound_of(&self, name: &ContextName) -> ContextName {
        let state = self.state.read();
        match state.find(name).and_then(|idx| state.node(idx)) {
            Some(node) => node.upper_bound.clone(),
            None => {
                debug!(context = %name, "context not in ownership structure, self-dominating");
                name.clone()
            }
        }
    }

    /// The dominator of `name`, failing on unknown contexts.
    pub fn dominator_of(&self, name: &ContextName) -> Result<ContextName> {
        let state = self.state.read();
        state
            .find(name)
            .and_then(|idx| state.node(idx))
            .map(|node| node.upper_bound.clone())
            .ok_or_else(|| Error::unknown_context(name))
    }

    /// True if `name` is a computed upper bound.
    #[must_use]
    pub fn is_upper_bound(&self, name: &ContextName) -> bool {
        let state = self.state.read();
        state
            .find(name)
            .and_then(|idx| state.node(idx))
            .is_some_and(|node| node.is_upper_bound)
    }

    /// The contexts in the closed region below `name` (see
    /// [`DagState::region_descendants`]). Empty for unknown contexts.
    #[must_use]
    pub fn region_descendants(&self, name: &ContextName) -> BTreeSet<ContextName> {
        let state = self.state.read();
        match state.find(name) {
            Some(idx) => state.region_descendants(idx),
            None => BTreeSet::new(),
        }
    }

    /// True if `elder` is an ancestor of (or equal to) `descendant`.
    #[must_use]
    pub fn is_elder(&self, descendant: &ContextName, elder: &ContextName) -> bool {
        self.state.read().is_elder(descendant, elder)
    }

    /// Direct children of `name`.
    #[must_use]
    pub fn children_of(&self, name: &ContextName) -> Vec<ContextName> {
        let state = self.state.read();
        state
            .find(name)
            .and_then(|idx| state.node(idx))
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|&c| state.node(c).map(|n| n.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct parents of `name`.
    #[must_use]
    pub fn parents_of(&self, name: &ContextName) -> Vec<ContextName> {
        let state = self.state.read();
        state
            .find(name)
            .and_then(|idx| state.node(idx))
            .map(|node| {
                node.parents
                    .iter()
                    .filter_map(|&p| state.node(p).map(|n| n.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Orders `contexts` senior-first: contexts nearer a root come
    /// before deeper ones, so ancestors always precede their
    /// descendants. Ties and unrelated contexts at equal depth fall
    /// back to name order; unknown contexts sort last.
    pub fn sort_by_seniority(&self, contexts: &mut [ContextName]) {
        let state = self.state.read();
        contexts.sort_by(|a, b| {
            let da = state.find(a).and_then(|i| state.depth_of(i)).unwrap_or(usize::MAX);
            let db = state.find(b).and_then(|i| state.depth_of(i)).unwrap_or(usize::MAX);
            da.cmp(&db).then_with(|| a.cmp(b))
        });
    }

    /// The subset of `contexts` at minimal depth, preserving input
    /// order. Contexts outside the structure are ignored.
    #[must_use]
    pub fn contexts_closest_to_root(&self, contexts: &[ContextName]) -> Vec<ContextName> {
        let state = self.state.read();
        let depths: Vec<(usize, &ContextName)> = contexts
            .iter()
            .filter_map(|ctx| {
                state
                    .find(ctx)
                    .and_then(|idx| state.depth_of(idx))
                    .map(|d| (d, ctx))
            })
            .collect();
        let Some(min) = depths.iter().map(|(d, _)| *d).min() else {
            return Vec::new();
        };
        depths
            .into_iter()
            .filter(|(d, _)| *d == min)
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }

    /// Per-node version, 0 for unknown contexts.
    #[must_use]
    pub fn node_version(&self, name: &ContextName) -> u64 {
        let state = self.state.read();
        state
            .find(name)
            .and_then(|idx| state.node(idx))
            .map_or(0, |node| node.version)
    }

    /// Structure-wide version, incremented once per edit batch.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// True if `name` has a node in the structure.
    #[must_use]
    pub fn contains(&self, name: &ContextName) -> bool {
        self.state.read().find(name).is_some()
    }

    /// All edges, for mapping exchange with peers.
    #[must_use]
    pub fn all_edges(&self) -> Vec<(ContextName, ContextName)> {
        self.state.read().edges.iter().cloned().collect()
    }
}
