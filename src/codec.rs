//! Wire codec for protocol objects that travel between nodes.
//!
//! Lock requests, grant notifications, mapping snapshots and telemetry
//! reports are serialized with a compact binary codec behind the [`Wire`]
//! trait, so the transport layer only ever sees byte slices.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

/// Serialization to and from the node-to-node wire format.
///
/// Blanket-implemented for every serde-capable type; implementors never
/// write this by hand.
pub trait Wire: Sized {
    /// Encodes `self` into a fresh byte buffer.
    fn to_wire(&self) -> Result<Vec<u8>>;

    /// Decodes a value from `bytes`.
    fn from_wire(bytes: &[u8]) -> Result<Self>;
}

impl<T: Serialize + DeserializeOwned> Wire for T {
    fn to_wire(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::new(ErrorKind::EncodeFailed).with_source(e))
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::new(ErrorKind::DecodeFailed).with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextId, ContextName, OrderId};

    #[test]
    fn round_trip_order_id() {
        let id = OrderId::new(ContextId(3), 42);
        let bytes = id.to_wire().expect("encode");
        assert_eq!(OrderId::from_wire(&bytes).expect("decode"), id);
    }

    #[test]
    fn round_trip_context_name() {
        let name = ContextName::new("App.Room[9]");
        let bytes = name.to_wire().expect("encode");
        assert_eq!(ContextName::from_wire(&bytes).expect("decode"), name);
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let id = OrderId::new(ContextId(3), 42);
        let bytes = id.to_wire().expect("encode");
        let err = OrderId::from_wire(&bytes[..bytes.len() - 1]).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::DecodeFailed);
    }
}
