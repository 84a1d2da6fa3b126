//! Bus transport layer abstraction.
//!
//! Defines the `BusTransport` trait used by the firmware engine to talk to
//! node bootloaders, allowing different implementations (CAN driver,
//! simulated bus, etc.).

use std::sync::Arc;

use thiserror::Error;

use crate::id::NodeId;
use crate::protocol::SystemFunction;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Expected {expected}, got {actual} instead")]
    UnexpectedReply {
        expected: SystemFunction,
        actual: SystemFunction,
    },

    #[error("Payload of {len} bytes exceeds the {max} byte bus limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Bus disconnected")]
    Disconnected,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Abstract bus interface.
///
/// Implementations must correlate each `await_reply` with the node it
/// names, so that jobs on different nodes can wait concurrently.
pub trait BusTransport: Send + Sync {
    /// Queue a system command for `node`. Does not wait for the reply.
    fn send_command(
        &self,
        node: NodeId,
        function: SystemFunction,
        param: u8,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Block until `node` replies, or the transport timeout elapses.
    ///
    /// A reply with a function other than `expected` is an error.
    fn await_reply(&self, node: NodeId, expected: SystemFunction)
    -> Result<Vec<u8>, TransportError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Arc<T> {
    fn send_command(
        &self,
        node: NodeId,
        function: SystemFunction,
        param: u8,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        (**self).send_command(node, function, param, payload)
    }

    fn await_reply(
        &self,
        node: NodeId,
        expected: SystemFunction,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).await_reply(node, expected)
    }
}
