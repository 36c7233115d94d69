//! Ticketed ordering primitives.
//!
//! Every context orders its events with tickets: strictly increasing 64-bit
//! numbers handed out at admission (create), at execution, and at commit.
//! A "now serving" pointer names the next ticket allowed through; a thread
//! holding a later ticket blocks on the gate's condition variable until the
//! preceding ticket finishes.
//!
//! Two properties the rest of the engine depends on:
//!
//! - **Release on all paths.** Passing a gate yields a [`ServingGuard`];
//!   the pointer advances when the guard drops, so a panic or early return
//!   in the serving thread cannot wedge the gate.
//! - **Skips.** A ticket abandoned by migration is recorded in a skip set
//!   and consumed when the serving pointer reaches it, so the pointer jumps
//!   over the gap instead of waiting for a ticket no one holds.
//!
//! Skips are consumed only at the serving boundary. A gate that holds
//! waiters without advancing past the configured stall window logs a
//! warning ([`TicketGate::is_stalled`] exposes the same check to callers);
//! an optional wait timeout converts the hang into a recoverable
//! [`ErrorKind::GateTimeout`](crate::error::ErrorKind).

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
struct GateState {
    /// Next ticket to hand out.
    next: u64,
    /// Ticket currently allowed through.
    now_serving: u64,
    /// Tickets to bypass when the serving pointer reaches them.
    skips: BTreeSet<u64>,
    /// Threads blocked in `wait_turn`.
    waiters: usize,
    /// Last time the serving pointer moved.
    last_advance: Instant,
}

impl GateState {
    /// Consumes skips contiguous with the serving pointer.
    fn drain_skips(&mut self) {
        while self.skips.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }
}

/// A single now-serving gate over one ticket sequence.
#[derive(Debug)]
pub struct TicketGate {
    label: &'static str,
    state: Mutex<GateState>,
    cond: Condvar,
    stall_warn: Duration,
}

impl TicketGate {
    /// Creates a gate. `label` names the concern in stall diagnostics.
    #[must_use]
    pub fn new(label: &'static str, stall_warn: Duration) -> Self {
        Self {
            label,
            state: Mutex::new(GateState {
                next: 1,
                now_serving: 1,
                skips: BTreeSet::new(),
                waiters: 0,
                last_advance: Instant::now(),
            }),
            cond: Condvar::new(),
            stall_warn,
        }
    }

    /// Issues the next ticket. Strictly increasing, never reused.
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

    /// Blocks until `ticket` is being served, then returns a guard whose
    /// drop advances the pointer. `timeout` of `None` waits forever.
    pub fn wait_turn(&self, ticket: u64, timeout: Option<Duration>) -> Result<ServingGuard<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        state.waiters += 1;
        while state.now_serving != ticket {
            if state.now_serving > ticket {
                state.waiters -= 1;
                return Err(Error::new(ErrorKind::TicketOutOfOrder).with_message(format!(
                    "{} ticket {ticket} already served (now at {})",
                    self.label, state.now_serving
                )));
            }
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    let lapsed = self
                        .cond
                        .wait_for(&mut state, self.stall_warn)
                        .timed_out();
                    if lapsed && state.last_advance.elapsed() >= self.stall_warn {
                        warn!(
                            gate = self.label,
                            ticket,
                            now_serving = state.now_serving,
                            waiters = state.waiters,
                            "ticket gate stalled"
                        );
                    }
                    false
                }
            };
            if timed_out && state.now_serving != ticket {
                state.waiters -= 1;
                return Err(Error::new(ErrorKind::GateTimeout).with_message(format!(
                    "{} ticket {ticket} timed out at now_serving {}",
                    self.label, state.now_serving
                )));
            }
        }
        state.waiters -= 1;
        drop(state);
        Ok(ServingGuard { gate: self, ticket })
    }

    /// Marks `ticket` as abandoned. If it is the one being served the
    /// pointer advances immediately; otherwise it is consumed when the
    /// pointer reaches it. Skipping a ticket the pointer has already
    /// passed is a no-op: the entry could never be drained.
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

    /// Advances past `ticket` without a guard. Used by acquisition modes
    /// that hand the turn to the next ticket on acquire rather than on
    /// release (shared readers).
    pub fn advance_past(&self, ticket: u64) {
        let mut state = self.state.lock();
        if state.now_serving == ticket {
            state.now_serving = ticket + 1;
            state.drain_skips();
            state.last_advance = Instant::now();
            self.cond.notify_all();
        }
    }

    /// Stall check: true when waiters are blocked and the serving pointer
    /// has not moved within the stall window.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        let state = self.state.lock();
        state.waiters > 0 && state.last_advance.elapsed() >= self.stall_warn
    }

    #[cfg(test)]
    fn pending_skips(&self) -> usize {
        self.state.lock().skips.len()
    }
}

/// Permission to run for one ticket. Dropping it advances the gate.
#[derive(Debug)]
#[must_use = "the gate does not advance until the guard is dropped"]
pub struct ServingGuard<'a> {
    gate: &'a TicketGate,
    ticket: u64,
}

impl ServingGuard<'_> {
    /// The ticket this guard serves.
    #[must_use]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        // A reader path may have advanced past us already via advance_past.
        if state.now_serving == self.ticket {
            state.now_serving = self.ticket + 1;
            state.drain_skips();
        }
        state.last_advance = Instant::now();
        self.gate.cond.notify_all();
    }
}

/// The three ordered sequences every context maintains.
#[derive(Debug)]
pub struct TicketBooth {
    /// Orders event admission.
    pub create: TicketGate,
    /// Orders event execution.
    pub execute: TicketGate,
    /// Orders the commit barrier.
    pub commit: TicketGate,
}

impl TicketBooth {
    /// Creates a booth with all three gates sharing one stall window.
    #[must_use]
    pub fn new(stall_warn: Duration) -> Self {
        Self {
            create: TicketGate::new("create", stall_warn),
            execute: TicketGate::new("execute", stall_warn),
            commit: TicketGate::new("commit", stall_warn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn gate() -> TicketGate {
        TicketGate::new("test", Duration::from_secs(5))
    }

    #[test]
    fn tickets_are_strictly_increasing() {
        let gate = gate();
        let a = gate.issue();
        let b = gate.issue();
        let c = gate.issue();
        assert!(a < b && b < c);
    }

    #[test]
    fn guard_drop_advances_serving() {
        let gate = gate();
        let t1 = gate.issue();
        let t2 = gate.issue();
        {
            let _g = gate.wait_turn(t1, None).expect("t1 is first");
            assert_eq!(gate.now_serving(), t1);
        }
        assert_eq!(gate.now_serving(), t2);
    }

    #[test]
    fn skip_consumes_contiguous_gap() {
        let gate = gate();
        let t1 = gate.issue();
        let t2 = gate.issue();
        let t3 = gate.issue();
        gate.skip(t2);
        drop(gate.wait_turn(t1, None).expect("t1"));
        // t2 was skipped; t3 is served next.
        assert_eq!(gate.now_serving(), t3);
        drop(gate.wait_turn(t3, None).expect("t3"));
    }

    #[test]
    fn skip_of_served_ticket_leaves_no_residue() {
        let gate = gate();
        let t1 = gate.issue();
        let t2 = gate.issue();
        drop(gate.wait_turn(t1, None).expect("t1"));
        // t1 is behind the pointer; skipping it must not leave an entry
        // that the pointer can never reach.
        gate.skip(t1);
        assert_eq!(gate.pending_skips(), 0);
        assert_eq!(gate.now_serving(), t2);
        drop(gate.wait_turn(t2, None).expect("t2"));
    }

    #[test]
    fn skip_of_current_ticket_unblocks_waiter() {
        let gate = Arc::new(gate());
        let t1 = gate.issue();
        let t2 = gate.issue();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let g = gate.wait_turn(t2, None).expect("t2 served after skip");
                g.ticket()
            })
        };
        gate.skip(t1);
        assert_eq!(waiter.join().expect("join"), t2);
    }

    #[test]
    fn threads_serve_in_ticket_order() {
        let gate = Arc::new(gate());
        let order = Arc::new(Mutex::new(Vec::new()));
        let tickets: Vec<u64> = (0..8).map(|_| gate.issue()).collect();
        let handles: Vec<_> = tickets
            .iter()
            .rev()
            .map(|&t| {
                let gate = Arc::clone(&gate);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    let _g = gate.wait_turn(t, None).expect("served");
                    order.lock().push(t);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock(), tickets);
    }

    #[test]
    fn timeout_yields_gate_timeout() {
        let gate = gate();
        let _t1 = gate.issue();
        let t2 = gate.issue();
        let err = gate
            .wait_turn(t2, Some(Duration::from_millis(10)))
            .expect_err("t1 never releases");
        assert_eq!(err.kind(), ErrorKind::GateTimeout);
    }

    #[test]
    fn already_served_ticket_is_an_error() {
        let gate = gate();
        let t1 = gate.issue();
        drop(gate.wait_turn(t1, None).expect("t1"));
        let err = gate.wait_turn(t1, None).expect_err("t1 is gone");
        assert_eq!(err.kind(), ErrorKind::TicketOutOfOrder);
    }
}
