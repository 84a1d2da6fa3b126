//! Reply correlation for bus transports.
//!
//! The receive side of a transport pushes every system reply into the
//! router; request paths wait on it for the reply of one particular node.
//! Replies are queued per node, so a waiter never consumes a reply meant
//! for another job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use super::traits::TransportError;
use crate::id::NodeId;
use crate::protocol::SystemFunction;

/// A system reply received from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub function: SystemFunction,
    pub payload: Vec<u8>,
}

/// Per-node reply queues with blocking, timed waits.
#[derive(Debug, Default)]
pub struct ReplyRouter {
    pending: Mutex<HashMap<NodeId, VecDeque<Reply>>>,
    arrived: Condvar,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, VecDeque<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply from `node` and wake up waiters.
    pub fn deliver(&self, node: NodeId, function: SystemFunction, payload: Vec<u8>) {
        trace!(node = %node, function = %function, len = payload.len(), "Reply queued");
        self.lock()
            .entry(node)
            .or_default()
            .push_back(Reply { function, payload });
        self.arrived.notify_all();
    }

    /// Take the next reply from `node`, waiting up to `timeout` for one.
    pub fn wait(
        &self,
        node: NodeId,
        expected: SystemFunction,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();

        loop {
            if let Some(reply) = pending.get_mut(&node).and_then(VecDeque::pop_front) {
                if reply.function != expected {
                    return Err(TransportError::UnexpectedReply {
                        expected,
                        actual: reply.function,
                    });
                }
                return Ok(reply.payload);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            pending = self
                .arrived
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of queued replies from `node`.
    pub fn pending(&self, node: NodeId) -> usize {
        self.lock().get(&node).map_or(0, VecDeque::len)
    }

    /// Drop all queued replies from `node`.
    pub fn discard(&self, node: NodeId) {
        self.lock().remove(&node);
    }
}
