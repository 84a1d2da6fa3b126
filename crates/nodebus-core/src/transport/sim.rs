//! Simulated bus of bootloader nodes for testing and dry runs.
//!
//! Each attached node holds a full flash image and answers the bootloader
//! command set the way a real node does. Replies go through a
//! [`ReplyRouter`], so waits behave like on a real bus: a node that does not
//! answer makes the caller time out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace, warn};

use super::router::ReplyRouter;
use super::traits::{BusTransport, TransportError};
use crate::id::{NodeId, Udid};
use crate::protocol::SystemFunction;
use crate::protocol::constants::*;

/// Command as it was put on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub node: NodeId,
    pub function: SystemFunction,
    pub param: u8,
    pub payload: Vec<u8>,
}

/// Misbehaviour injected into a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Carry out the command but never acknowledge it.
    Silent,
    /// Acknowledge with the given function instead of the right one.
    WrongReply(SystemFunction),
}

#[derive(Debug)]
struct InjectedFault {
    function: SystemFunction,
    nth: usize,
    fault: Fault,
}

#[derive(Debug)]
struct SimulatedNode {
    udid: Udid,
    online: bool,
    flash: Vec<u8>,
    address: u32,
    page: Vec<u8>,
    checksums: Vec<(u32, u32)>,
    crc_errors: usize,
    counts: HashMap<SystemFunction, usize>,
    faults: Vec<InjectedFault>,
}

impl SimulatedNode {
    fn new(udid: Udid) -> Self {
        Self {
            udid,
            online: true,
            flash: vec![FLASH_ERASED; FLASH_LENGTH as usize],
            address: FLASH_APP_ORIGIN,
            page: Vec::new(),
            checksums: Vec::new(),
            crc_errors: 0,
            counts: HashMap::new(),
            faults: Vec::new(),
        }
    }

    fn in_app_region(start: u32, len: usize) -> bool {
        let end = start as u64 + len as u64;
        start >= FLASH_APP_ORIGIN && end <= FLASH_LENGTH as u64
    }

    /// Carry out a command and build the acknowledgement payload.
    /// `None` means the command is ignored.
    fn execute(&mut self, function: SystemFunction, param: u8, payload: &[u8]) -> Option<Vec<u8>> {
        match function {
            SystemFunction::BootloaderSetAddress => {
                if param != PARAM_SPACE_FLASH || payload.len() != 4 {
                    return None;
                }
                self.address = BigEndian::read_u32(payload);
                self.page.clear();
                Some(vec![ACK_STATUS_OK])
            }
            SystemFunction::BootloaderErase => {
                let start = FLASH_APP_ORIGIN as usize;
                self.flash[start..].fill(FLASH_ERASED);
                Some(vec![ACK_STATUS_OK])
            }
            SystemFunction::BootloaderWrite if param == PARAM_WRITE_CHECKSUM => {
                if payload.len() != 4 {
                    return None;
                }
                let expected = BigEndian::read_u32(payload);
                let actual = PAGE_CRC.checksum(&self.page);
                let page_address = self.address - self.page.len() as u32;
                self.checksums.push((page_address, expected));
                self.page.clear();
                if expected == actual {
                    Some(vec![ACK_STATUS_OK])
                } else {
                    self.crc_errors += 1;
                    Some(vec![ACK_STATUS_CRC_MISMATCH])
                }
            }
            SystemFunction::BootloaderWrite => {
                if !Self::in_app_region(self.address, payload.len()) {
                    return Some(vec![ACK_STATUS_OUT_OF_RANGE]);
                }
                let start = self.address as usize;
                self.flash[start..start + payload.len()].copy_from_slice(payload);
                self.page.extend_from_slice(payload);
                self.address += payload.len() as u32;
                Some(vec![ACK_STATUS_OK])
            }
            SystemFunction::BootloaderRead => {
                let len = (param as usize).min(BUS_CHUNK_SIZE);
                if !Self::in_app_region(self.address, len) {
                    return Some(Vec::new());
                }
                let start = self.address as usize;
                self.address += len as u32;
                Some(self.flash[start..start + len].to_vec())
            }
            _ => None,
        }
    }

    fn take_fault(&mut self, function: SystemFunction) -> Option<Fault> {
        let count = self.counts.entry(function).or_insert(0);
        *count += 1;
        let nth = *count;
        self.faults
            .iter()
            .find(|f| f.function == function && f.nth == nth)
            .map(|f| f.fault)
    }
}

/// In-process bus with simulated bootloader nodes.
pub struct SimulatedBus {
    nodes: Mutex<HashMap<NodeId, SimulatedNode>>,
    router: ReplyRouter,
    timeout: Duration,
    sent: Mutex<Vec<SentCommand>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_EXPECT_TIMEOUT)
    }

    /// Bus whose reply waits give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            router: ReplyRouter::new(),
            timeout,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<NodeId, SimulatedNode>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a node with blank flash on the bus at address `id`.
    pub fn attach(&self, id: NodeId, udid: Udid) {
        debug!(node = %id, udid = %udid, "Simulated node attached");
        self.nodes().insert(id, SimulatedNode::new(udid));
    }

    /// Take the node at `id` off the bus. Replies it already queued are
    /// dropped and further commands to it fail with `Disconnected` until it
    /// is attached again.
    pub fn detach(&self, id: NodeId) {
        if let Some(node) = self.nodes().get_mut(&id) {
            debug!(node = %id, udid = %node.udid, "Simulated node detached");
            node.online = false;
        }
        self.router.discard(id);
    }

    /// Copy of the node's flash memory `[start, start + len)`.
    pub fn read_flash(&self, id: NodeId, start: u32, len: usize) -> Option<Vec<u8>> {
        let nodes = self.nodes();
        let node = nodes.get(&id)?;
        let start = start as usize;
        node.flash.get(start..start + len).map(<[u8]>::to_vec)
    }

    /// Overwrite part of the node's flash memory directly.
    pub fn load_flash(&self, id: NodeId, start: u32, data: &[u8]) {
        let start = start as usize;
        if let Some(dst) = self
            .nodes()
            .get_mut(&id)
            .and_then(|n| n.flash.get_mut(start..start + data.len()))
        {
            dst.copy_from_slice(data);
        }
    }

    /// Page checksums received by the node, as `(page address, crc)`.
    pub fn checksums(&self, id: NodeId) -> Vec<(u32, u32)> {
        self.nodes()
            .get(&id)
            .map(|n| n.checksums.clone())
            .unwrap_or_default()
    }

    /// Number of pages whose checksum did not match the written data.
    pub fn crc_errors(&self, id: NodeId) -> usize {
        self.nodes().get(&id).map_or(0, |n| n.crc_errors)
    }

    /// Apply `fault` to the `nth` (1-based) occurrence of `function` sent to `id`.
    pub fn inject_fault(&self, id: NodeId, function: SystemFunction, nth: usize, fault: Fault) {
        if let Some(node) = self.nodes().get_mut(&id) {
            node.faults.push(InjectedFault {
                function,
                nth,
                fault,
            });
        }
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands sent to one node.
    pub fn sent_to(&self, id: NodeId) -> Vec<SentCommand> {
        self.sent().into_iter().filter(|c| c.node == id).collect()
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for SimulatedBus {
    fn send_command(
        &self,
        node: NodeId,
        function: SystemFunction,
        param: u8,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if payload.len() > BUS_CHUNK_SIZE {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: BUS_CHUNK_SIZE,
            });
        }

        if function.is_ack() {
            return Err(TransportError::SendFailed(format!(
                "{function} is a reply, not a command"
            )));
        }

        trace!(node = %node, function = %function, param, len = payload.len(), "Command sent");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentCommand {
                node,
                function,
                param,
                payload: payload.to_vec(),
            });

        let mut nodes = self.nodes();
        let Some(sim) = nodes.get_mut(&node) else {
            // Nobody at this address: the command is lost.
            return Ok(());
        };
        if !sim.online {
            return Err(TransportError::Disconnected);
        }

        let fault = sim.take_fault(function);
        let Some(reply) = sim.execute(function, param, payload) else {
            warn!(node = %node, udid = %sim.udid, function = %function, "Simulated node ignored command");
            return Ok(());
        };
        let Some(ack) = function.ack() else {
            return Ok(());
        };
        drop(nodes);

        match fault {
            None => self.router.deliver(node, ack, reply),
            Some(Fault::Silent) => debug!(node = %node, function = %function, "Dropping acknowledgement"),
            Some(Fault::WrongReply(other)) => self.router.deliver(node, other, reply),
        }
        Ok(())
    }

    fn await_reply(
        &self,
        node: NodeId,
        expected: SystemFunction,
    ) -> Result<Vec<u8>, TransportError> {
        self.router.wait(node, expected, self.timeout)
    }
}
