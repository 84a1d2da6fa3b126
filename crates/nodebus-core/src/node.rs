//! Managed node entity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::id::{NodeId, Udid};

/// Lifecycle state of a node as seen by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Bootloader,
    Running,
    Programming,
    Unresponsive,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unknown => write!(f, "unknown"),
            NodeState::Connecting => write!(f, "connecting"),
            NodeState::Connected => write!(f, "connected"),
            NodeState::Bootloader => write!(f, "bootloader"),
            NodeState::Running => write!(f, "running"),
            NodeState::Programming => write!(f, "programming"),
            NodeState::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

#[derive(Debug)]
struct NodeInner {
    state: NodeState,
    last_seen: DateTime<Utc>,
    attributes: HashMap<String, String>,
}

/// A device on the bus.
///
/// Identity is fixed at creation. State, last-seen time and attributes can
/// be changed through a shared reference, since nodes are handed out by the
/// registry as `Arc<Node>`.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    udid: Udid,
    inner: Mutex<NodeInner>,
}

impl Node {
    pub fn new(id: NodeId, udid: Udid) -> Self {
        Self {
            id,
            udid,
            inner: Mutex::new(NodeInner {
                state: NodeState::Unknown,
                last_seen: Utc::now(),
                attributes: HashMap::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn udid(&self) -> Udid {
        self.udid
    }

    pub fn state(&self) -> NodeState {
        self.inner().state
    }

    pub fn set_state(&self, state: NodeState) {
        let mut inner = self.inner();
        if inner.state != state {
            tracing::debug!(node = %self, from = %inner.state, to = %state, "Node state changed");
            inner.state = state;
        }
    }

    /// Record traffic from this node.
    pub fn touch(&self) {
        self.inner().last_seen = Utc::now();
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.inner().last_seen
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner().attributes.insert(name.into(), value.into());
    }

    /// Get an attribute, or an empty string if it is not set.
    pub fn attribute(&self, name: &str) -> String {
        self.inner()
            .attributes
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace every `$(name)` in `template` with the value of attribute `name`.
    ///
    /// Unset attributes expand to nothing. An unterminated `$(` is copied
    /// through as is.
    pub fn expand_attributes(&self, template: &str) -> String {
        let inner = self.inner();
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        loop {
            let Some(start) = rest.find("$(") else {
                result.push_str(rest);
                return result;
            };
            result.push_str(&rest[..start]);
            rest = &rest[start..];

            let Some(end) = rest.find(')') else {
                result.push_str(rest);
                return result;
            };
            if let Some(value) = inner.attributes.get(&rest[2..end]) {
                result.push_str(value);
            }
            rest = &rest[end + 1..];
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{} ({})", self.id, self.udid)
    }
}
