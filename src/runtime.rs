//! The per-node runtime object.
//!
//! Everything node-scoped lives here, explicitly constructed and passed
//! by reference, never in process statics: the ownership structure, the
//! dominator table, the placement directory, the context engines, the
//! telemetry recorders, and the worker pool that drains the event queue.
//! Dropping the runtime shuts the pool down.
//!
//! The worker pipeline for one event: pop a context off the injector
//! queue, take its next runnable event, acquire the context's access
//! permit, wait for the governing dominator to admit the event's region
//! claim (parking it in `AwaitingLocks` if the claim queues), run the
//! application [`EventHandler`], release the permit, pass the commit
//! barrier, give the region claim back, then apply the committed side
//! effects (deferred messages and the commit acknowledgement through
//! the [`Transport`], ownership edits through the structure).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::codec::Wire;
use crate::config::RuntimeConfig;
use crate::context::ContextEngine;
use crate::dominator::{DominatorTable, GrantSet};
use crate::elasticity::{propose_actions, Action, ContextRuntimeInfo, ElasticityConfig, ServerTelemetry};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventOperationInfo, OpKind, OwnershipOp};
use crate::mapping::ContextMapping;
use crate::ownership::OwnershipStructure;
use crate::transport::{CommitNotice, EventHandler, Transport};
use crate::types::{ContextName, LockKind, NodeAddr, OrderId, GLOBAL_CONTEXT};

/// Parking spot for events whose region claims queued at a dominator.
///
/// Grants computed by a dominator sweep are posted here per event and
/// persist until consumed, so a grant that lands between a failed
/// submit and the waiter's arrival is not lost. One mutex-and-condvar
/// pair covers all waiters; each wakeup rechecks its own entry.
#[derive(Debug, Default)]
struct GrantBoard {
    granted: Mutex<BTreeMap<OrderId, BTreeSet<ContextName>>>,
    cond: Condvar,
}

impl GrantBoard {
    /// Posts every per-event grant in `grants` and wakes the waiters.
    fn post(&self, grants: &GrantSet) {
        if grants.permitted_contexts.is_empty() {
            return;
        }
        let mut granted = self.granted.lock();
        for (event, contexts) in &grants.permitted_contexts {
            granted
                .entry(*event)
                .or_default()
                .extend(contexts.iter().cloned());
        }
        self.cond.notify_all();
    }

    /// Blocks until `context` has been granted to `event`, consuming
    /// the grant.
    fn wait_for(
        &self,
        event: OrderId,
        context: &ContextName,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut granted = self.granted.lock();
        loop {
            if let Some(contexts) = granted.get_mut(&event) {
                if contexts.remove(context) {
                    if contexts.is_empty() {
                        granted.remove(&event);
                    }
                    return Ok(());
                }
            }
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut granted, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut granted);
                    false
                }
            };
            if timed_out {
                return Err(Error::new(ErrorKind::GateTimeout)
                    .for_event(event)
                    .in_context(context.clone())
                    .with_message("region grant did not arrive in time"));
            }
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    structure: OwnershipStructure,
    dominators: DominatorTable,
    mapping: ContextMapping,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn EventHandler>,
    contexts: Mutex<BTreeMap<ContextName, Arc<ContextEngine>>>,
    telemetry: Mutex<BTreeMap<ContextName, Arc<ContextRuntimeInfo>>>,
    next_context_id: AtomicU32,
    grants: GrantBoard,
    queue: SegQueue<ContextName>,
    pending: AtomicUsize,
    shutdown: AtomicBool,
    park_mutex: Mutex<()>,
    park_cond: Condvar,
}

impl RuntimeInner {
    /// Gets or lazily creates the engine for `name`, wiring it into the
    /// ownership structure under the global root and into the directory.
    fn context(&self, name: &ContextName) -> Arc<ContextEngine> {
        let mut contexts = self.contexts.lock();
        if let Some(engine) = contexts.get(name) {
            return Arc::clone(engine);
        }
        let id = crate::types::ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed));
        let engine = Arc::new(ContextEngine::new(name.clone(), id, &self.config));
        contexts.insert(name.clone(), Arc::clone(&engine));
        drop(contexts);

        if !name.is_global() && !self.structure.contains(name) {
            if let Err(err) = self
                .structure
                .add_parent_child(&ContextName::new(GLOBAL_CONTEXT), name)
            {
                warn!(context = %name, error = %err, "could not attach context to root");
            }
        }
        self.mapping
            .update(name.clone(), self.config.local_addr.clone());
        self.telemetry
            .lock()
            .insert(name.clone(), Arc::new(ContextRuntimeInfo::new(name.clone())));
        debug!(context = %name, id = %id, "context created");
        engine
    }

    fn recorder(&self, name: &ContextName) -> Option<Arc<ContextRuntimeInfo>> {
        self.telemetry.lock().get(name).map(Arc::clone)
    }

    /// Runs the next runnable event of `name` through the full pipeline.
    fn process_context(&self, name: &ContextName) -> Result<()> {
        let engine = {
            let contexts = self.contexts.lock();
            match contexts.get(name) {
                Some(engine) => Arc::clone(engine),
                None => return Ok(()),
            }
        };
        let Some((id, _ticket)) = engine.next_runnable() else {
            return Ok(());
        };
        self.run_event(&engine, id)
    }

    fn run_event(&self, engine: &ContextEngine, id: OrderId) -> Result<()> {
        let started = Instant::now();
        let permit = engine.begin_execute(id, LockKind::Write)?;
        let event = engine
            .event(id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        self.wait_for_execute_permission(engine, &event)?;
        debug!(context = %engine.name(), event = %id, "executing");
        match self.handler.handle(&event) {
            Ok(info) => engine.record_execution(id, info)?,
            Err(err) => {
                warn!(context = %engine.name(), event = %id, error = %err, "event body failed");
            }
        }
        drop(permit);
        engine.finish_execute(id)?;
        let committed = engine.commit(id)?;
        self.release_context(id, engine.name())?;
        if let Some(recorder) = self.recorder(engine.name()) {
            recorder.add_exec_time(started.elapsed());
            recorder.record_from_access(committed.created_by.clone());
        }
        self.acknowledge_commit(&committed);
        self.apply_side_effects(&committed);
        self.pending.fetch_sub(1, Ordering::Release);
        Ok(())
    }

    /// Submits the event's write claim on its target region to the
    /// governing dominator and blocks until the claim is admitted. A
    /// claim that queues behind a conflicting holder parks the event in
    /// `AwaitingLocks` until a release elsewhere posts the grant.
    fn wait_for_execute_permission(&self, engine: &ContextEngine, event: &Event) -> Result<()> {
        let mut op = EventOperationInfo::new(
            event.id,
            OpKind::Lock,
            LockKind::Write,
            event.created_by.clone(),
            event.target.clone(),
        );
        op.ticket = engine.next_operation_ticket(event.id)?;
        let granted = self.dominators.submit(&self.structure, &op)?;
        if !granted.contains(&event.target) {
            engine.park_for_locks(event.id)?;
            debug!(context = %event.target, event = %event.id, "awaiting region grant");
            self.grants
                .wait_for(event.id, &event.target, self.config.gate_timeout)?;
            engine.resume(event.id)?;
        }
        self.dominators
            .note_locked(&self.structure, event.id, std::slice::from_ref(&event.target))
    }

    /// Gives the event's region claim back after commit and routes the
    /// resulting grants to whoever is parked on them.
    fn release_context(&self, event: OrderId, context: &ContextName) -> Result<()> {
        let grants = self.dominators.release(&self.structure, event, context)?;
        self.grants.post(&grants);
        Ok(())
    }

    /// Acknowledges the commit back to the creating context's node when
    /// the event originated elsewhere.
    fn acknowledge_commit(&self, event: &Event) {
        let Ok(origin) = self.mapping.node_of(&event.created_by) else {
            return;
        };
        if origin == self.config.local_addr {
            return;
        }
        let notice = CommitNotice {
            event: event.id,
            committed_on: self.config.local_addr.clone(),
        };
        match notice.to_wire() {
            Ok(bytes) => {
                if let Err(err) = self.transport.send(&origin, &bytes) {
                    warn!(event = %event.id, origin = %origin, error = %err, "commit notice failed");
                }
            }
            Err(err) => {
                warn!(event = %event.id, error = %err, "commit notice did not encode");
            }
        }
    }

    /// Sends deferred messages and applies ownership edits after commit.
    fn apply_side_effects(&self, event: &Event) {
        for message in &event.execution.deferred_messages {
            if let Err(err) = self.transport.send(&message.dest, &message.payload) {
                warn!(event = %event.id, dest = %message.dest, error = %err, "deferred send failed");
            }
        }
        for op in &event.execution.ownership_ops {
            let applied = match op {
                OwnershipOp::Add { parent, child } => self.structure.add_parent_child(parent, child),
                OwnershipOp::Delete { parent, child } => {
                    self.structure.delete_parent_child(parent, child)
                }
            };
            if let Err(err) = applied {
                warn!(event = %event.id, error = %err, "ownership edit rejected");
            }
        }
    }

    fn wake_one(&self) {
        let _guard = self.park_mutex.lock();
        self.park_cond.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.park_mutex.lock();
        self.park_cond.notify_all();
    }

    fn worker_loop(&self) {
        loop {
            if let Some(name) = self.queue.pop() {
                if let Err(err) = self.process_context(&name) {
                    warn!(context = %name, error = %err, "event pipeline failed");
                    self.pending.fetch_sub(1, Ordering::Release);
                }
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let mut guard = self.park_mutex.lock();
            if self.queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                self.park_cond
                    .wait_for(&mut guard, Duration::from_millis(50));
            }
        }
    }
}

/// One node's explicitly-owned runtime state and worker pool.
pub struct NodeRuntime {
    inner: Arc<RuntimeInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Builds a runtime. Workers are not started until [`Self::start`].
    #[must_use]
    pub fn new(
        mut config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        config.normalize();
        let mapping = ContextMapping::new(config.local_addr.clone());
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                structure: OwnershipStructure::new(),
                dominators: DominatorTable::new(),
                mapping,
                transport,
                handler,
                contexts: Mutex::new(BTreeMap::new()),
                telemetry: Mutex::new(BTreeMap::new()),
                next_context_id: AtomicU32::new(1),
                grants: GrantBoard::default(),
                queue: SegQueue::new(),
                pending: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                park_mutex: Mutex::new(()),
                park_cond: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The shared ownership structure.
    #[must_use]
    pub fn structure(&self) -> &OwnershipStructure {
        &self.inner.structure
    }

    /// The placement directory.
    #[must_use]
    pub fn mapping(&self) -> &ContextMapping {
        &self.inner.mapping
    }

    /// The engine for `name`, created on first reference.
    pub fn context(&self, name: &ContextName) -> Arc<ContextEngine> {
        self.inner.context(name)
    }

    /// Admits `event` at its target context and queues it for a worker.
    pub fn submit(&self, event: Event) -> Result<()> {
        let target = event.target.clone();
        let engine = self.inner.context(&target);
        engine.admit(event)?;
        self.inner.pending.fetch_add(1, Ordering::Release);
        self.inner.queue.push(target);
        self.inner.wake_one();
        Ok(())
    }

    /// Requests cross-context lock grants for `op` at its governing
    /// dominator, recording whatever was granted immediately. A claim
    /// that queues is granted later; [`Self::wait_for_grant`] blocks on
    /// its arrival.
    pub fn request_locks(&self, op: &EventOperationInfo) -> Result<BTreeSet<ContextName>> {
        let granted = self.inner.dominators.submit(&self.inner.structure, op)?;
        if !granted.is_empty() {
            let contexts: Vec<ContextName> = granted.iter().cloned().collect();
            self.inner
                .dominators
                .note_locked(&self.inner.structure, op.event, &contexts)?;
        }
        Ok(granted)
    }

    /// Blocks until a queued claim from [`Self::request_locks`] is
    /// granted, consuming the grant.
    pub fn wait_for_grant(
        &self,
        event: OrderId,
        context: &ContextName,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.inner.grants.wait_for(event, context, timeout)
    }

    /// Processes a mid-execution unlock operation, waking whatever the
    /// dominator's queues now allow.
    pub fn unlock_context(&self, op: &EventOperationInfo) -> Result<()> {
        if let Some(grants) = self.inner.dominators.unlock(&self.inner.structure, op)? {
            self.inner.grants.post(&grants);
        }
        Ok(())
    }

    /// Gives one locked context back at commit, waking whatever the
    /// dominator's queues now allow.
    pub fn release_context(&self, event: OrderId, context: &ContextName) -> Result<GrantSet> {
        let grants = self
            .inner
            .dominators
            .release(&self.inner.structure, event, context)?;
        self.inner.grants.post(&grants);
        Ok(grants)
    }

    /// Spawns the worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.inner.config.worker_threads {
            let inner = Arc::clone(&self.inner);
            let name = format!("{}-{index}", self.inner.config.thread_name_prefix);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || inner.worker_loop());
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(error = %err, "worker thread failed to start"),
            }
        }
        info!(workers = workers.len(), addr = %self.inner.config.local_addr, "node runtime started");
    }

    /// Processes queued events on the calling thread until the queue is
    /// empty. Deterministic alternative to [`Self::start`] for tests and
    /// single-threaded embedding.
    pub fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(name) = self.inner.queue.pop() {
            match self.inner.process_context(&name) {
                Ok(()) => processed += 1,
                Err(err) => {
                    self.inner.pending.fetch_sub(1, Ordering::Release);
                    return Err(err);
                }
            }
        }
        Ok(processed)
    }

    /// Number of submitted events not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Blocks until all submitted events have committed or `timeout`
    /// passes. Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stops the worker pool and joins every worker.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        info!(addr = %self.inner.config.local_addr, "node runtime stopped");
    }

    /// Captures one telemetry epoch and evaluates the placement rules.
    #[must_use]
    pub fn evaluate_elasticity(
        &self,
        policy: &ElasticityConfig,
        servers: &BTreeMap<NodeAddr, ServerTelemetry>,
    ) -> Vec<Action> {
        let local = self.inner.config.local_addr.clone();
        let telemetry: BTreeMap<_, _> = {
            let recorders = self.inner.telemetry.lock();
            recorders
                .iter()
                .map(|(name, rec)| (name.clone(), rec.capture(local.clone())))
                .collect()
        };
        propose_actions(
            policy,
            &telemetry,
            servers,
            &self.inner.mapping.snapshot(),
            &self.inner.structure,
            &local,
        )
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("addr", &self.inner.config.local_addr)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeferredMessage, EventExecutionInfo};
    use crate::transport::{LoopbackTransport, NoopHandler};
    use crate::types::{ContextId, EventKind, EventState};

    struct DeferringHandler;

    impl EventHandler for DeferringHandler {
        fn handle(&self, _event: &Event) -> Result<EventExecutionInfo> {
            Ok(EventExecutionInfo {
                deferred_messages: vec![DeferredMessage {
                    dest: NodeAddr::new("n2"),
                    payload: b"done".to_vec(),
                }],
                ..EventExecutionInfo::default()
            })
        }
    }

    fn runtime_with(handler: Arc<dyn EventHandler>) -> (NodeRuntime, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let mut config = RuntimeConfig::default();
        config.worker_threads = 2;
        let runtime = NodeRuntime::new(config, Arc::clone(&transport) as Arc<dyn Transport>, handler);
        (runtime, transport)
    }

    #[test]
    fn drain_commits_submitted_events() {
        let (runtime, _transport) = runtime_with(Arc::new(NoopHandler));
        let room = ContextName::new("App.Room[1]");
        let engine = runtime.context(&room);
        for i in 0..3 {
            let event = engine.create_event(room.clone(), i, EventKind::Async, Vec::new());
            runtime.submit(event).expect("submit");
        }
        assert_eq!(runtime.pending(), 3);
        let processed = runtime.drain().expect("drain");
        assert_eq!(processed, 3);
        assert_eq!(runtime.pending(), 0);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn deferred_messages_leave_only_after_commit() {
        let (runtime, transport) = runtime_with(Arc::new(DeferringHandler));
        let room = ContextName::new("App.Room[1]");
        let engine = runtime.context(&room);
        let event = engine.create_event(room.clone(), 1, EventKind::Async, Vec::new());
        runtime.submit(event).expect("submit");
        assert_eq!(transport.sent_count(), 0);
        runtime.drain().expect("drain");
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NodeAddr::new("n2"));
        assert_eq!(sent[0].1, b"done");
    }

    #[test]
    fn workers_drain_the_queue() {
        let (runtime, _transport) = runtime_with(Arc::new(NoopHandler));
        runtime.start();
        let room = ContextName::new("App.Room[1]");
        let engine = runtime.context(&room);
        for i in 0..16 {
            let event = engine.create_event(room.clone(), i, EventKind::Async, Vec::new());
            runtime.submit(event).expect("submit");
        }
        assert!(runtime.wait_idle(Duration::from_secs(5)));
        runtime.shutdown();
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn held_region_claim_parks_execution_until_released() {
        let (runtime, _transport) = runtime_with(Arc::new(NoopHandler));
        runtime.start();
        let room = ContextName::new("App.Room[1]");
        let engine = runtime.context(&room);

        // Another node's event takes the region's write claim first.
        let holder = OrderId::new(ContextId(9), 1);
        let claim = EventOperationInfo::new(
            holder,
            OpKind::Lock,
            LockKind::Write,
            ContextName::new("App.User[9]"),
            room.clone(),
        );
        let granted = runtime.request_locks(&claim).expect("claim");
        assert!(granted.contains(&room));

        let event = engine.create_event(room.clone(), 1, EventKind::Async, Vec::new());
        let id = event.id;
        runtime.submit(event).expect("submit");

        // The event must park behind the holder, not run through.
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.event_state(id) != Some(EventState::AwaitingLocks) {
            assert!(Instant::now() < deadline, "event never parked on the claim");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runtime.pending(), 1);

        runtime.release_context(holder, &room).expect("give back");
        assert!(runtime.wait_idle(Duration::from_secs(5)));
        runtime.shutdown();
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn remote_origin_receives_commit_notice() {
        let (runtime, transport) = runtime_with(Arc::new(NoopHandler));
        let room = ContextName::new("App.Room[1]");
        runtime.context(&room);
        let creator = ContextName::new("App.User[7]");
        runtime.mapping().update(creator.clone(), NodeAddr::new("n2"));

        let id = OrderId::new(ContextId(9), 1);
        let event = Event::new(id, creator, room, 1, EventKind::Async, Vec::new());
        runtime.submit(event).expect("submit");
        runtime.drain().expect("drain");

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NodeAddr::new("n2"));
        let notice = CommitNotice::from_wire(&sent[0].1).expect("decode");
        assert_eq!(notice.event, id);
        assert_eq!(notice.committed_on, runtime.config().local_addr);
    }

    #[test]
    fn contexts_register_in_structure_and_mapping() {
        let (runtime, _transport) = runtime_with(Arc::new(NoopHandler));
        let room = ContextName::new("App.Room[1]");
        runtime.context(&room);
        assert!(runtime.structure().contains(&room));
        assert_eq!(
            runtime.mapping().node_of(&room).expect("mapped"),
            runtime.config().local_addr
        );
    }
}
