//! Per-context event execution engine.
//!
//! One [`ContextEngine`] owns one context's state and pushes events
//! through three ordered phases:
//!
//! 1. **create**: the event is admitted and receives a creation ticket;
//!    admission order is FIFO by that ticket.
//! 2. **execute**: the event receives an execute ticket and runs under
//!    the [`AccessGate`]: one writer at a time, or a batch of readers,
//!    strictly in ticket order.
//! 3. **commit**: finished events pass a commit barrier in execute-ticket
//!    order, so no event commits before every lower-ticket event in the
//!    same context has committed.
//!
//! Lifecycle per event: `Created → QueuedForExecute → Executing →
//! AwaitingLocks (cross-context only) ⇄ Executing → Committing →
//! Committed`, or `Deleted` when a migration supersedes it (its tickets
//! are skipped so the serving pointers jump the gap).
//!
//! Internal locks are always taken in the order create → execute →
//! commit → snapshot, and never held across a blocking gate wait.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use crate::ticket::TicketGate;
use crate::types::{ContextId, ContextName, EventState, LockKind, OrderId};

/// Access admission for one context: ticket order plus single-writer /
/// multi-reader discipline, in one gate.
///
/// A writer is admitted when its ticket is being served and no one else
/// is inside; the serving pointer advances when its [`AccessPermit`]
/// drops. A reader is admitted under the same ticket condition but
/// advances the pointer immediately on entry, so a contiguous run of
/// readers overlaps while a later writer still waits for all of them to
/// leave.
#[derive(Debug)]
pub struct AccessGate {
    state: Mutex<AccessState>,
    cond: Condvar,
    stall_warn: Duration,
}

#[derive(Debug)]
struct AccessState {
    next: u64,
    now_serving: u64,
    readers: usize,
    writers: usize,
    skips: BTreeSet<u64>,
    waiters: usize,
    last_advance: Instant,
}

impl AccessState {
    fn drain_skips(&mut self) {
        while self.skips.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }

    fn advance(&mut self, past: u64) {
        if self.now_serving == past {
            self.now_serving = past + 1;
            self.drain_skips();
            self.last_advance = Instant::now();
        }
    }
}

impl AccessGate {
    /// Creates a gate with the given stall-warning window.
    #[must_use]
    pub fn new(stall_warn: Duration) -> Self {
        Self {
            state: Mutex::new(AccessState {
                next: 1,
                now_serving: 1,
                readers: 0,
                writers: 0,
                skips: BTreeSet::new(),
                waiters: 0,
                last_advance: Instant::now(),
            }),
            cond: Condvar::new(),
            stall_warn,
        }
    }

    /// Issues the next execute ticket. Strictly increasing, never reused.
    pub fn issue(&self) -> u64 {
        let mut state = self.state.lock();
        let ticket = state.next;
        state.next += 1;
        ticket
    }

    /// The ticket currently allowed through.
    #[must_use]
    pub fn now_serving(&self) -> u64 {
        self.state.lock().now_serving
    }

    /// Blocks until `ticket` is being served and the requested access
    /// mode is compatible with the holders inside, then admits.
    ///
    /// Shared modes ([`LockKind::is_read`]) wait only for writers to
    /// leave; exclusive modes wait for everyone.
    pub fn acquire(
        &self,
        ticket: u64,
        mode: LockKind,
        timeout: Option<Duration>,
    ) -> Result<AccessPermit<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let shared = mode.is_read();
        let mut state = self.state.lock();
        state.waiters += 1;
        loop {
            if state.now_serving > ticket {
                state.waiters -= 1;
                return Err(Error::new(ErrorKind::TicketOutOfOrder).with_message(format!(
                    "execute ticket {ticket} already served (now at {})",
                    state.now_serving
                )));
            }
            let blocked = state.now_serving != ticket
                || state.writers != 0
                || (!shared && state.readers != 0);
            if !blocked {
                break;
            }
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    let lapsed = self.cond.wait_for(&mut state, self.stall_warn).timed_out();
                    if lapsed && state.last_advance.elapsed() >= self.stall_warn {
                        warn!(
                            ticket,
                            now_serving = state.now_serving,
                            readers = state.readers,
                            writers = state.writers,
                            waiters = state.waiters,
                            "access gate stalled"
                        );
                    }
                    false
                }
            };
            if timed_out {
                state.waiters -= 1;
                return Err(Error::new(ErrorKind::GateTimeout).with_message(format!(
                    "execute ticket {ticket} timed out at now_serving {}",
                    state.now_serving
                )));
            }
        }
        state.waiters -= 1;
        if shared {
            state.readers += 1;
            // Readers hand the turn to the next ticket on entry so a
            // following reader can join the batch.
            state.advance(ticket);
            self.cond.notify_all();
        } else {
            state.writers += 1;
        }
        drop(state);
        Ok(AccessPermit {
            gate: self,
            ticket,
            shared,
        })
    }

    /// Marks `ticket` as abandoned; the serving pointer jumps over it.
    /// A ticket the pointer has already passed is ignored.
    pub fn skip(&self, ticket: u64) {
        let mut state = self.state.lock();
        if ticket < state.now_serving {
            return;
        }
        state.skips.insert(ticket);
        if state.skips.contains(&state.now_serving) {
            state.drain_skips();
            state.last_advance = Instant::now();
            self.cond.notify_all();
        }
    }

    /// Stall check mirroring [`TicketGate::is_stalled`].
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        let state = self.state.lock();
        state.waiters > 0 && state.last_advance.elapsed() >= self.stall_warn
    }

    #[cfg(test)]
    fn occupancy(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.readers, state.writers)
    }
}

/// Permission to access the context for one execute ticket. Dropping it
/// releases the access; writers also advance the serving pointer here.
#[derive(Debug)]
#[must_use = "the context stays locked until the permit is dropped"]
pub struct AccessPermit<'a> {
    gate: &'a AccessGate,
    ticket: u64,
    shared: bool,
}

impl AccessPermit<'_> {
    /// The execute ticket this permit serves.
    #[must_use]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for AccessPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        if self.shared {
            state.readers -= 1;
        } else {
            state.writers -= 1;
            state.advance(self.ticket);
        }
        self.gate.cond.notify_all();
    }
}

#[derive(Debug, Default)]
struct EngineState {
    events: BTreeMap<OrderId, Event>,
    create_queue: VecDeque<OrderId>,
    execute_tickets: BTreeMap<OrderId, u64>,
    ticket_events: BTreeMap<u64, OrderId>,
}

#[derive(Debug, Default)]
struct SnapshotStore {
    versions: BTreeMap<u64, Arc<Vec<u8>>>,
    latest: u64,
}

/// The execution engine for a single context.
#[derive(Debug)]
pub struct ContextEngine {
    name: ContextName,
    id: ContextId,
    sequence: AtomicU64,
    create: TicketGate,
    access: AccessGate,
    commit: TicketGate,
    state: Mutex<EngineState>,
    snapshots: Mutex<SnapshotStore>,
    snapshot_cond: Condvar,
    snapshot_history: usize,
    gate_timeout: Option<Duration>,
}

impl ContextEngine {
    /// Creates an engine for the named context.
    #[must_use]
    pub fn new(name: ContextName, id: ContextId, config: &RuntimeConfig) -> Self {
        Self {
            name,
            id,
            sequence: AtomicU64::new(1),
            create: TicketGate::new("create", config.gate_stall_warn),
            access: AccessGate::new(config.gate_stall_warn),
            commit: TicketGate::new("commit", config.gate_stall_warn),
            state: Mutex::new(EngineState::default()),
            snapshots: Mutex::new(SnapshotStore::default()),
            snapshot_cond: Condvar::new(),
            snapshot_history: config.snapshot_history,
            gate_timeout: config.gate_timeout,
        }
    }

    /// The context's canonical name.
    #[must_use]
    pub fn name(&self) -> &ContextName {
        &self.name
    }

    /// The context's numeric ID.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Builds a new event originating here. The order identifier is this
    /// context's ID plus a fresh origin sequence number, and never changes.
    /// The sequence counter is separate from the admission gate: events
    /// created here may be admitted elsewhere.
    pub fn create_event(
        &self,
        target: ContextName,
        method: u32,
        kind: crate::types::EventKind,
        payload: Vec<u8>,
    ) -> Event {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Event::new(
            OrderId::new(self.id, sequence),
            self.name.clone(),
            target,
            method,
            kind,
            payload,
        )
    }

    /// Admits an event to this context. Blocks until every event admitted
    /// before it has been admitted (FIFO by creation ticket), then queues
    /// it for execution. Returns the local creation ticket.
    pub fn admit(&self, event: Event) -> Result<u64> {
        if event.state != EventState::Created {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .for_event(event.id)
                .with_message(format!("cannot admit event in state {:?}", event.state)));
        }
        let ticket = self.create.issue();
        let guard = self.create.wait_turn(ticket, self.gate_timeout)?;
        let id = event.id;
        {
            let mut state = self.state.lock();
            if state.events.contains_key(&id) {
                return Err(Error::new(ErrorKind::DuplicateRequest)
                    .for_event(id)
                    .in_context(self.name.clone()));
            }
            state.events.insert(id, event);
            state.create_queue.push_back(id);
        }
        drop(guard);
        debug!(context = %self.name, event = %id, ticket, "event admitted");
        Ok(ticket)
    }

    /// Takes the next admitted event off the create queue, assigns its
    /// execute ticket, and moves it to `QueuedForExecute`. Returns `None`
    /// when the queue is empty.
    pub fn next_runnable(&self) -> Option<(OrderId, u64)> {
        let mut state = self.state.lock();
        let id = state.create_queue.pop_front()?;
        let ticket = self.access.issue();
        state.execute_tickets.insert(id, ticket);
        state.ticket_events.insert(ticket, id);
        if let Some(event) = state.events.get_mut(&id) {
            event.transition(EventState::QueuedForExecute);
        }
        Some((id, ticket))
    }

    /// Waits for the event's execute turn and enters `Executing`. The
    /// permit must stay alive for the duration of the body; dropping it
    /// releases the context even if the body panics.
    pub fn begin_execute(&self, id: OrderId, mode: LockKind) -> Result<AccessPermit<'_>> {
        let ticket = {
            let state = self.state.lock();
            *state
                .execute_tickets
                .get(&id)
                .ok_or_else(|| Error::new(ErrorKind::UnknownContext).for_event(id).with_message(
                    "event has no execute ticket; call next_runnable first",
                ))?
        };
        let permit = self.access.acquire(ticket, mode, self.gate_timeout)?;
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        if !event.transition(EventState::Executing) {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .for_event(id)
                .with_message(format!("{:?} -> Executing", event.state)));
        }
        Ok(permit)
    }

    /// Merges side effects produced by the event body into the stored
    /// event, so commit hands them back to the caller.
    pub fn record_execution(&self, id: OrderId, info: crate::event::EventExecutionInfo) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        event.execution.sub_events.extend(info.sub_events);
        event.execution.deferred_messages.extend(info.deferred_messages);
        event.execution.ownership_ops.extend(info.ownership_ops);
        event.execution.next_operation_ticket = event
            .execution
            .next_operation_ticket
            .max(info.next_operation_ticket);
        Ok(())
    }

    /// Issues the event's next cross-context operation ticket. Tickets
    /// count up from 1 per event and stamp the order of its operations.
    pub fn next_operation_ticket(&self, id: OrderId) -> Result<u64> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        Ok(event.execution.issue_operation_ticket())
    }

    /// Marks an executing event as blocked on cross-context lock grants.
    pub fn park_for_locks(&self, id: OrderId) -> Result<()> {
        self.step(id, EventState::AwaitingLocks)
    }

    /// Returns a parked event to `Executing` after its grants arrive.
    pub fn resume(&self, id: OrderId) -> Result<()> {
        self.step(id, EventState::Executing)
    }

    /// Moves a finished event to `Committing`. The caller must have
    /// dropped the event's [`AccessPermit`] already.
    pub fn finish_execute(&self, id: OrderId) -> Result<()> {
        self.step(id, EventState::Committing)
    }

    fn step(&self, id: OrderId, next: EventState) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        if !event.transition(next) {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .for_event(id)
                .with_message(format!("{:?} -> {next:?}", event.state)));
        }
        Ok(())
    }

    /// Passes the commit barrier for `id` and removes the event.
    ///
    /// Blocks until every lower-ticket event of this context has
    /// committed (or was deleted), then commits and returns the event so
    /// the caller can apply its deferred side effects.
    pub fn commit(&self, id: OrderId) -> Result<Event> {
        let ticket = {
            let state = self.state.lock();
            *state
                .execute_tickets
                .get(&id)
                .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?
        };
        let guard = self.commit.wait_turn(ticket, self.gate_timeout)?;
        let mut state = self.state.lock();
        let mut event = state
            .events
            .remove(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        if !event.transition(EventState::Committed) {
            state.events.insert(id, event);
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .for_event(id)
                .with_message("commit of an event that is not committing"));
        }
        state.execute_tickets.remove(&id);
        state.ticket_events.remove(&ticket);
        drop(state);
        drop(guard);
        debug!(context = %self.name, event = %id, ticket, "event committed");
        Ok(event)
    }

    /// Deletes a superseded event (migration). Its tickets are skipped so
    /// the execute and commit pointers jump the gap instead of stalling.
    pub fn delete(&self, id: OrderId) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::ContextGone).for_event(id))?;
        if !event.transition(EventState::Deleted) {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .for_event(id)
                .with_message(format!("{:?} -> Deleted", event.state)));
        }
        state.events.remove(&id);
        state.create_queue.retain(|queued| *queued != id);
        if let Some(ticket) = state.execute_tickets.remove(&id) {
            state.ticket_events.remove(&ticket);
            drop(state);
            self.access.skip(ticket);
            self.commit.skip(ticket);
        }
        debug!(context = %self.name, event = %id, "event deleted");
        Ok(())
    }

    /// The event holding `ticket`, if any.
    #[must_use]
    pub fn event_for_ticket(&self, ticket: u64) -> Option<OrderId> {
        self.state.lock().ticket_events.get(&ticket).copied()
    }

    /// A copy of the stored event, if still held here.
    #[must_use]
    pub fn event(&self, id: OrderId) -> Option<Event> {
        self.state.lock().events.get(&id).cloned()
    }

    /// Current lifecycle state of `id`, if the event is still held here.
    #[must_use]
    pub fn event_state(&self, id: OrderId) -> Option<EventState> {
        self.state.lock().events.get(&id).map(|e| e.state)
    }

    /// Number of events currently held by the engine.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Installs a read-only snapshot under `version`. Versions must be
    /// strictly increasing; older installs are rejected. The history is
    /// pruned to the configured depth.
    pub fn install_snapshot(&self, version: u64, bytes: Vec<u8>) -> Result<()> {
        let mut store = self.snapshots.lock();
        if version <= store.latest {
            return Err(Error::stale_version(version, store.latest)
                .in_context(self.name.clone())
                .with_message("snapshot versions must be strictly increasing"));
        }
        store.versions.insert(version, Arc::new(bytes));
        store.latest = version;
        while store.versions.len() > self.snapshot_history {
            let oldest = match store.versions.keys().next() {
                Some(v) => *v,
                None => break,
            };
            store.versions.remove(&oldest);
        }
        drop(store);
        self.snapshot_cond.notify_all();
        Ok(())
    }

    /// Fetches the snapshot for `version`, blocking until it is produced.
    ///
    /// A version older than the retained history fails immediately with
    /// [`ErrorKind::SnapshotMissing`]; a version not yet produced waits,
    /// bounded by `timeout` when given.
    pub fn snapshot(&self, version: u64, timeout: Option<Duration>) -> Result<Arc<Vec<u8>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut store = self.snapshots.lock();
        loop {
            if let Some(bytes) = store.versions.get(&version) {
                return Ok(Arc::clone(bytes));
            }
            if store.latest >= version {
                return Err(Error::new(ErrorKind::SnapshotMissing)
                    .in_context(self.name.clone())
                    .with_message(format!(
                        "snapshot {version} pruned (history floor {:?})",
                        store.versions.keys().next()
                    )));
            }
            let timed_out = match deadline {
                Some(deadline) => self
                    .snapshot_cond
                    .wait_until(&mut store, deadline)
                    .timed_out(),
                None => {
                    self.snapshot_cond.wait(&mut store);
                    false
                }
            };
            if timed_out {
                return Err(Error::new(ErrorKind::SnapshotMissing)
                    .in_context(self.name.clone())
                    .with_message(format!(
                        "snapshot {version} not produced in time (latest {})",
                        store.latest
                    )));
            }
        }
    }

    /// Latest installed snapshot version, 0 when none exists.
    #[must_use]
    pub fn snapshot_version(&self) -> u64 {
        self.snapshots.lock().latest
    }
}
