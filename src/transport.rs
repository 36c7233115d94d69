//! Seams to the out-of-process world.
//!
//! The engine never opens sockets itself. Everything that leaves the
//! node goes through a [`Transport`], and everything an application does
//! with an event body goes through an [`EventHandler`]. Both are traits
//! so the surrounding dispatch layer (or a test) supplies the real
//! implementation; [`LoopbackTransport`] is the in-process stand-in.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{Event, EventExecutionInfo};
use crate::types::{NodeAddr, OrderId};

/// Sends serialized bytes to another node.
pub trait Transport: Send + Sync {
    /// Delivers `payload` to `dest`. Failures are surfaced to the caller
    /// as retryable; the engine itself never retries.
    fn send(&self, dest: &NodeAddr, payload: &[u8]) -> Result<()>;
}

/// Application-side event body, supplied by the generated dispatch layer.
pub trait EventHandler: Send + Sync {
    /// Runs the body of `event` and returns the side effects to attach.
    /// Invoked while the event holds its context's access permit, so the
    /// body sees exclusive (or shared, for read methods) state.
    fn handle(&self, event: &Event) -> Result<EventExecutionInfo>;
}

/// Commit acknowledgement sent back to an event's creating node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNotice {
    /// The committed event.
    pub event: OrderId,
    /// The node the event committed on.
    pub committed_on: NodeAddr,
}

/// In-process transport that records every send, for tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<(NodeAddr, Vec<u8>)>>,
}

impl LoopbackTransport {
    /// Creates an empty loopback transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything sent so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<(NodeAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock())
    }

    /// Number of messages sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, dest: &NodeAddr, payload: &[u8]) -> Result<()> {
        self.sent.lock().push((dest.clone(), payload.to_vec()));
        Ok(())
    }
}

/// Handler that attaches no side effects; the default for contexts whose
/// methods are pure state transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn handle(&self, _event: &Event) -> Result<EventExecutionInfo> {
        Ok(EventExecutionInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Wire;
    use crate::types::ContextId;

    #[test]
    fn loopback_records_sends() {
        let transport = LoopbackTransport::new();
        transport
            .send(&NodeAddr::new("n2"), b"hello")
            .expect("loopback never fails");
        assert_eq!(transport.sent_count(), 1);
        let sent = transport.take_sent();
        assert_eq!(sent[0].0, NodeAddr::new("n2"));
        assert_eq!(sent[0].1, b"hello");
        assert_eq!(transport.sent_count(), 0);
    }

    #[test]
    fn commit_notice_round_trips() {
        let notice = CommitNotice {
            event: OrderId::new(ContextId(3), 7),
            committed_on: NodeAddr::new("n1"),
        };
        let bytes = notice.to_wire().expect("encode");
        assert_eq!(CommitNotice::from_wire(&bytes).expect("decode"), notice);
    }
}
