//! Simulator context: owns the topology, the reassembly state and the host hooks, and runs
//! every entry point inside one critical section.

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tracing::{debug, info, trace, warn};

use crate::aux::{AuxMsg, Mailbox};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::guid::Guid;
use crate::host::HostBridge;
use crate::sideband::{encode_chunks, reply_header, Limits, Reassembler, ReassemblyState};
use crate::synth::synthesize;
use crate::topology::{Port, TopologyStore};

/// One sideband transfer: a single request chunk in, the encoded reply chunks out.
#[derive(Debug)]
pub struct SidebandMsg<'a> {
    pub request: &'a [u8],
    /// Caller-provided reply buffer; its length is the capacity.
    pub reply: &'a mut [u8],
    /// Bytes of `reply` written by the last transfer.
    pub reply_len: usize,
}

impl<'a> SidebandMsg<'a> {
    pub fn new(request: &'a [u8], reply: &'a mut [u8]) -> Self {
        Self {
            request,
            reply,
            reply_len: 0,
        }
    }

    pub fn reply_bytes(&self) -> &[u8] {
        &self.reply[..self.reply_len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The chunk was accepted; more fragments are needed before a reply exists.
    Pending,
    /// `reply_len` bytes of reply chunks were written.
    Replied,
}

/// Result of pushing one request chunk through the engine.
#[derive(Debug, Default)]
pub(crate) struct Handled {
    pub(crate) reply: Option<Vec<u8>>,
    pub(crate) hpd: bool,
}

/// A reply that did not fit the caller's buffer, kept for an identical retry.
#[derive(Debug)]
struct StashedReply {
    request: Vec<u8>,
    reply: Vec<u8>,
}

pub(crate) struct Engine {
    pub(crate) limits: Limits,
    pub(crate) store: TopologyStore,
    pub(crate) host: Box<dyn HostBridge>,
    pub(crate) mailbox: Mailbox,
    reassembler: Reassembler,
    stash: Option<StashedReply>,
}

impl Engine {
    /// Runs one request chunk through reassembly, synthesis and the host override hook.
    pub(crate) fn handle_chunk(&mut self, raw: &[u8]) -> Result<Handled> {
        let decoded = match self.reassembler.feed(raw) {
            Ok(ReassemblyState::NeedMoreFragments) => {
                trace!(len = raw.len(), "sideband fragment buffered");
                return Ok(Handled::default());
            }
            Ok(ReassemblyState::Complete(decoded)) => decoded,
            Err(err) => {
                warn!(%err, "malformed sideband chunk");
                return Err(err.into());
            }
        };

        let out = synthesize(&decoded.request, &mut self.store);
        let body = out.reply.encode_body();
        let mut reply = encode_chunks(
            reply_header(&decoded.header),
            &body,
            self.limits.max_chunk_len,
        )
        .concat();
        self.host.override_reply(&decoded.raw, &mut reply);
        Ok(Handled {
            reply: Some(reply),
            hpd: out.mutated,
        })
    }

    fn transfer(&mut self, msg: &mut SidebandMsg<'_>) -> Result<TransferStatus> {
        msg.reply_len = 0;
        if let Some(stash) = self.stash.take() {
            if stash.request == msg.request {
                debug!("replaying stashed sideband reply");
                return self.deliver(msg, stash.reply);
            }
        }

        let handled = self.handle_chunk(msg.request)?;
        if handled.hpd {
            self.host.notify_hpd_irq();
        }
        match handled.reply {
            None => Ok(TransferStatus::Pending),
            Some(reply) => self.deliver(msg, reply),
        }
    }

    fn deliver(&mut self, msg: &mut SidebandMsg<'_>, reply: Vec<u8>) -> Result<TransferStatus> {
        if reply.len() > msg.reply.len() {
            let err = SimError::BufferTooSmall {
                needed: reply.len(),
                capacity: msg.reply.len(),
            };
            self.stash = Some(StashedReply {
                request: msg.request.to_vec(),
                reply,
            });
            return Err(err);
        }
        msg.reply[..reply.len()].copy_from_slice(&reply);
        msg.reply_len = reply.len();
        Ok(TransferStatus::Replied)
    }

    fn update(&mut self, ports: &[Port]) -> Result<()> {
        let change = self.store.replace_ports(ports)?;
        if change.needs_hpd() {
            let guid = self.store.guid();
            self.mailbox
                .queue_up_requests(guid, &change.notifications, self.limits.max_chunk_len);
            self.host.notify_hpd_irq();
        }
        Ok(())
    }
}

enum Lifecycle {
    Ready(Box<Engine>),
    Destroyed,
}

/// A simulated DP 1.2 MST branch device.
///
/// All methods take `&self`; state lives behind a single mutex so the simulator can be shared
/// between the AUX transport and a scenario driver thread.
pub struct Simulator {
    guid: Guid,
    state: Mutex<Lifecycle>,
    /// Thread currently inside the critical section, for reentrancy detection.
    owner: Mutex<Option<ThreadId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the state lock and marks the current thread as its owner until dropped.
struct Entered<'a> {
    state: MutexGuard<'a, Lifecycle>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Entered<'_> {
    fn engine(&mut self) -> Result<&mut Engine> {
        match &mut *self.state {
            Lifecycle::Ready(engine) => Ok(engine.as_mut()),
            Lifecycle::Destroyed => Err(SimError::InvalidState("simulator destroyed")),
        }
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        *lock(self.owner) = None;
    }
}

impl Simulator {
    /// Creates a branch with only its input port.
    pub fn create(config: SimConfig, host: impl HostBridge + 'static) -> Result<Self> {
        let guid = config.validate()?;
        let engine = Engine {
            limits: config.limits,
            store: TopologyStore::new(guid, config.dpcd_revision),
            host: Box::new(host),
            mailbox: Mailbox::new(guid, config.dpcd_revision),
            reassembler: Reassembler::new(config.limits.max_message_len),
            stash: None,
        };
        info!(%guid, dpcd_revision = config.dpcd_revision, "MST branch simulator created");
        Ok(Self {
            guid,
            state: Mutex::new(Lifecycle::Ready(Box::new(engine))),
            owner: Mutex::new(None),
        })
    }

    fn enter(&self) -> Result<Entered<'_>> {
        let me = thread::current().id();
        if *lock(&self.owner) == Some(me) {
            warn!("reentrant simulator call from a host callback");
            return Err(SimError::InvalidState("reentrant call from host callback"));
        }
        let state = lock(&self.state);
        *lock(&self.owner) = Some(me);
        Ok(Entered {
            state,
            owner: &self.owner,
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn destroy(&self) -> Result<()> {
        let mut entered = self.enter()?;
        if matches!(*entered.state, Lifecycle::Destroyed) {
            return Err(SimError::InvalidState("simulator already destroyed"));
        }
        *entered.state = Lifecycle::Destroyed;
        info!(guid = %self.guid, "MST branch simulator destroyed");
        Ok(())
    }

    /// Whether [`Simulator::destroy`] has run. Always `false` when called from a host callback.
    pub fn is_destroyed(&self) -> bool {
        self.enter()
            .map(|entered| matches!(*entered.state, Lifecycle::Destroyed))
            .unwrap_or(false)
    }

    /// Processes one sideband request chunk.
    ///
    /// Returns [`TransferStatus::Pending`] (with `reply_len == 0`) while a multi-chunk request
    /// is incomplete. If the reply does not fit `msg.reply`, nothing is written and
    /// [`SimError::BufferTooSmall`] is returned; retrying the identical chunk with a larger
    /// buffer delivers the same reply without re-executing the request.
    pub fn transfer(&self, msg: &mut SidebandMsg<'_>) -> Result<TransferStatus> {
        let mut entered = self.enter()?;
        entered.engine()?.transfer(msg)
    }

    /// Replaces every downstream port. An empty list unplugs everything.
    pub fn update(&self, ports: &[Port]) -> Result<()> {
        let mut entered = self.enter()?;
        entered.engine()?.update(ports)
    }

    /// Native AUX or I2C-over-AUX transaction against the branch's own DPCD.
    pub fn aux_transfer(&self, msg: &mut AuxMsg) -> Result<usize> {
        let mut entered = self.enter()?;
        entered.engine()?.aux_transfer(msg)
    }

    pub fn port(&self, index: usize) -> Result<Port> {
        let mut entered = self.enter()?;
        Ok(entered.engine()?.store.get_port(index)?.clone())
    }

    /// Snapshot of every port, input port first.
    pub fn ports(&self) -> Result<Vec<Port>> {
        let mut entered = self.enter()?;
        Ok(entered.engine()?.store.ports().cloned().collect())
    }

    pub fn edid_window(&self, index: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut entered = self.enter()?;
        Ok(entered
            .engine()?
            .store
            .get_edid_window(index, offset, len)?
            .to_vec())
    }
}

impl core::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Simulator")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> Simulator {
        Simulator::create(SimConfig::with_guid(Guid([9; 16])), ()).unwrap()
    }

    #[test]
    fn create_requires_a_guid() {
        let err = Simulator::create(SimConfig::default(), ()).unwrap_err();
        assert_eq!(err.status_code(), -22);
    }

    #[test]
    fn destroy_is_one_shot() {
        let s = sim();
        s.destroy().unwrap();
        assert!(s.is_destroyed());
        assert!(matches!(s.destroy(), Err(SimError::InvalidState(_))));
        assert!(matches!(s.update(&[]), Err(SimError::InvalidState(_))));
        assert!(matches!(s.ports(), Err(SimError::InvalidState(_))));
    }

    #[test]
    fn simulator_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Simulator>();
    }

    #[test]
    fn malformed_chunks_are_reported() {
        let s = sim();
        let mut reply = [0u8; 64];
        let mut msg = SidebandMsg::new(&[0x10, 0x00, 0x00], &mut reply);
        let err = s.transfer(&mut msg).unwrap_err();
        assert!(matches!(err, SimError::MalformedMessage(_)));
        assert_eq!(msg.reply_len, 0);
    }
}
