//! Node registry: the authoritative two-way index between hardware ids and
//! bus addresses.
//!
//! Lookups take a shared read lock; registration, removal and clearing take
//! the write lock. Address allocation prefers, in order:
//!
//! 1. the address the node cache remembers for this hardware id, if free;
//! 2. the lowest free address not remembered for some other hardware id;
//! 3. the lowest free address at all, overwriting its cache entry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{MemoryNodeCache, NodeCache};
use crate::id::{NodeId, Udid};
use crate::node::{Node, NodeState};
use crate::protocol::constants::MAX_NODES;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Cannot register a node with a null hardware id")]
    InvalidIdentifier,
    #[error("Maximum number of nodes ({}) has been reached", MAX_NODES - 1)]
    RegistryFull,
}

struct Slots<C> {
    nodes: [Option<Arc<Node>>; MAX_NODES],
    udids: HashMap<Udid, Arc<Node>>,
    cache: C,
}

impl<C: NodeCache> Slots<C> {
    fn is_free(&self, id: NodeId) -> bool {
        self.nodes[id.index()].is_none()
    }

    fn free_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..MAX_NODES as u8)
            .map(NodeId::new)
            .filter(|id| self.is_free(*id))
    }

    fn allocate(&self, udid: &Udid) -> Option<NodeId> {
        if let Some(id) = self.cache.lookup(udid)
            && id.is_assignable()
            && self.is_free(id)
        {
            debug!(udid = %udid, id = %id, "Reusing cached address");
            return Some(id);
        }

        if let Some(id) = self
            .free_ids()
            .find(|id| !self.cache.is_reserved(*id, udid))
        {
            return Some(id);
        }

        let id = self.free_ids().next()?;
        warn!(udid = %udid, id = %id, "All free addresses are cached for other nodes, reassigning");
        Some(id)
    }
}

/// Concurrent registry of the nodes currently on the bus.
pub struct NodeRegistry<C: NodeCache = MemoryNodeCache> {
    slots: RwLock<Slots<C>>,
}

impl NodeRegistry<MemoryNodeCache> {
    /// Registry backed by an empty in-memory cache.
    pub fn new() -> Self {
        Self::with_cache(MemoryNodeCache::new())
    }
}

impl Default for NodeRegistry<MemoryNodeCache> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: NodeCache> NodeRegistry<C> {
    pub fn with_cache(cache: C) -> Self {
        Self {
            slots: RwLock::new(Slots {
                nodes: std::array::from_fn(|_| None),
                udids: HashMap::new(),
                cache,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots<C>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots<C>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Node at bus address `id`.
    pub fn find(&self, id: NodeId) -> Option<Arc<Node>> {
        self.read().nodes.get(id.index())?.clone()
    }

    /// Node with hardware id `udid`.
    pub fn lookup(&self, udid: &Udid) -> Option<Arc<Node>> {
        self.read().udids.get(udid).cloned()
    }

    /// Visit every registered node in address order.
    ///
    /// The read lock is held for the whole iteration: calling `register`,
    /// `unregister` or `clear` from `visit` deadlocks. Use [`snapshot`] when
    /// the visitor needs to modify the registry.
    ///
    /// [`snapshot`]: NodeRegistry::snapshot
    pub fn each<F: FnMut(&Node)>(&self, mut visit: F) {
        let slots = self.read();
        for node in slots.nodes.iter().flatten() {
            visit(node);
        }
    }

    /// Registered nodes in address order, collected without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        self.read().nodes.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().udids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the node with hardware id `udid`, allocating an address if
    /// it is not registered yet.
    ///
    /// A node that is already registered keeps its address and is moved
    /// back to [`NodeState::Connecting`].
    pub fn register(&self, udid: Udid) -> Result<Arc<Node>, RegistryError> {
        if udid.is_null() {
            return Err(RegistryError::InvalidIdentifier);
        }

        if let Some(node) = self.lookup(&udid) {
            node.set_state(NodeState::Connecting);
            return Ok(node);
        }

        let mut slots = self.write();

        // Another caller may have registered it between the two locks.
        if let Some(node) = slots.udids.get(&udid).cloned() {
            node.set_state(NodeState::Connecting);
            return Ok(node);
        }

        let id = slots.allocate(&udid).ok_or(RegistryError::RegistryFull)?;
        let node = Arc::new(Node::new(id, udid));
        node.touch();

        slots.nodes[id.index()] = Some(Arc::clone(&node));
        slots.udids.insert(udid, Arc::clone(&node));
        slots.cache.set_entry(udid, id);

        info!(node = %node, "Registered node");
        Ok(node)
    }

    /// Remove `node` from the registry. Removing an unknown node is a no-op.
    pub fn unregister(&self, node: &Node) -> bool {
        let mut slots = self.write();

        if slots
            .udids
            .get(&node.udid())
            .is_some_and(|n| n.id() == node.id())
        {
            slots.udids.remove(&node.udid());
        }

        if let Some(slot) = slots.nodes.get_mut(node.id().index())
            && slot.as_ref().is_some_and(|n| n.udid() == node.udid())
        {
            *slot = None;
            info!(node = %node, "Unregistered node");
        }
        true
    }

    /// Remove every node. The cache is left untouched.
    pub fn clear(&self) {
        let mut slots = self.write();
        slots.udids.clear();
        slots.nodes.iter_mut().for_each(|slot| *slot = None);
        info!("Cleared node registry");
    }

    /// Run `f` with read access to the node cache.
    pub fn inspect_cache<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.read().cache)
    }
}
