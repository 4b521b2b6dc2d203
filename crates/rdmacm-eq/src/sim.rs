//! Connection manager simulation for testing without hardware.
//!
//! [`SimCm`] implements both collaborator traits. Raw events are scripted
//! with [`SimCm::push_event`]; every command the translator issues is
//! recorded as a [`SimCommand`] so tests can inspect the wire traffic and
//! feed the peer side. Any operation can be made to fail once with
//! [`SimCm::fail_once`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use crate::cm::{
    CmEvent, CmId, ConnParam, ConnectionManager, EndpointResources, PortSpace, RecvWorkRequest,
};
use crate::endpoint::EndpointId;
use crate::signal::EqSignal;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// Identifier allocation.
    CreateId,
    /// Listen.
    Listen,
    /// Address resolution.
    ResolveAddr,
    /// Route resolution.
    ResolveRoute,
    /// Connect.
    Connect,
    /// Accept.
    Accept,
    /// Reject.
    Reject,
    /// Establish.
    Establish,
    /// Disconnect.
    Disconnect,
    /// Identifier migration.
    Migrate,
    /// Transport resource creation.
    CreateResource,
    /// Receive posting.
    PostRecv,
}

/// A command issued through one of the collaborator traits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    /// An identifier was allocated.
    CreateId { id: CmId, port_space: PortSpace },
    /// Listening started.
    Listen { id: CmId, addr: SocketAddr },
    /// Address resolution started.
    ResolveAddr { id: CmId, dst: SocketAddr },
    /// Route resolution started.
    ResolveRoute { id: CmId },
    /// Connect sent.
    Connect { id: CmId, param: ConnParam },
    /// Accept sent.
    Accept { id: CmId, param: ConnParam },
    /// Reject sent.
    Reject { id: CmId, private_data: Bytes },
    /// Handshake completed locally.
    Establish { id: CmId },
    /// Disconnect initiated.
    Disconnect { id: CmId },
    /// Identifier migrated onto the queue.
    Migrate { id: CmId },
    /// Identifier released.
    Destroy { id: CmId },
    /// Transport resource created.
    CreateResource { ep: EndpointId, id: CmId, qp_num: u32 },
    /// Receive buffer posted.
    PostRecv { ep: EndpointId, wr_id: u64 },
}

/// Callback run once, right after the next raw event is pulled.
struct EventHook(Option<Box<dyn FnOnce() + Send>>);

impl std::fmt::Debug for EventHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() { "EventHook(armed)" } else { "EventHook" })
    }
}

#[derive(Debug)]
struct SimState {
    next_id: u64,
    next_qpn: u32,
    events: VecDeque<CmEvent>,
    commands: Vec<SimCommand>,
    failures: HashMap<SimOp, i32>,
    destroyed: HashSet<CmId>,
    signal: Option<Arc<EqSignal>>,
    hook: EventHook,
}

impl SimState {
    fn check(&mut self, op: SimOp) -> io::Result<()> {
        match self.failures.remove(&op) {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: SimOp, command: SimCommand) -> io::Result<()> {
        self.check(op)?;
        self.commands.push(command);
        Ok(())
    }
}

/// Scripted connection manager and endpoint data path.
#[derive(Debug, Clone)]
pub struct SimCm {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimCm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCm {
    /// Creates a simulator allocating identifiers from 1.
    pub fn new() -> Self {
        Self::with_id_base(1)
    }

    /// Creates a simulator allocating identifiers from `base`, so two
    /// simulated nodes never hand out the same identifier.
    pub fn with_id_base(base: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                next_id: base,
                next_qpn: 0x100,
                events: VecDeque::new(),
                commands: Vec::new(),
                failures: HashMap::new(),
                destroyed: HashSet::new(),
                signal: None,
                hook: EventHook(None),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a raw event and wakes any waiter on the bound queue.
    pub fn push_event(&self, event: CmEvent) {
        let signal = {
            let mut state = self.state();
            state.events.push_back(event);
            state.signal.clone()
        };
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Allocates an identifier the way an inbound request would get one.
    pub fn alloc_id(&self) -> CmId {
        let mut state = self.state();
        let id = CmId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Raw events not yet pulled.
    pub fn pending_events(&self) -> usize {
        self.state().events.len()
    }

    /// All commands recorded so far.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.state().commands.clone()
    }

    /// Drains the recorded commands.
    pub fn take_commands(&self) -> Vec<SimCommand> {
        std::mem::take(&mut self.state().commands)
    }

    /// Parameters of the last connect sent on `id`.
    pub fn connect_param(&self, id: CmId) -> Option<ConnParam> {
        self.state().commands.iter().rev().find_map(|cmd| match cmd {
            SimCommand::Connect { id: cid, param } if *cid == id => Some(param.clone()),
            _ => None,
        })
    }

    /// Parameters of the last accept sent on `id`.
    pub fn accept_param(&self, id: CmId) -> Option<ConnParam> {
        self.state().commands.iter().rev().find_map(|cmd| match cmd {
            SimCommand::Accept { id: cid, param } if *cid == id => Some(param.clone()),
            _ => None,
        })
    }

    /// Number of accepts sent on `id`.
    pub fn accept_count(&self, id: CmId) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|cmd| matches!(cmd, SimCommand::Accept { id: cid, .. } if *cid == id))
            .count()
    }

    /// True once `id` was destroyed.
    pub fn is_destroyed(&self, id: CmId) -> bool {
        self.state().destroyed.contains(&id)
    }

    /// Runs `f` once, after the next raw event is pulled and before it is
    /// translated.
    pub fn on_next_event(&self, f: impl FnOnce() + Send + 'static) {
        self.state().hook = EventHook(Some(Box::new(f)));
    }

    /// Makes the next call of `op` fail with `errno`.
    pub fn fail_once(&self, op: SimOp, errno: i32) {
        self.state().failures.insert(op, errno);
    }
}

impl ConnectionManager for SimCm {
    fn get_event(&mut self) -> Option<CmEvent> {
        let (event, hook) = {
            let mut state = self.state();
            let event = state.events.pop_front();
            let hook = match event {
                Some(_) => state.hook.0.take(),
                None => None,
            };
            (event, hook)
        };
        if let Some(hook) = hook {
            hook();
        }
        event
    }

    fn bind_signal(&mut self, signal: Arc<EqSignal>) {
        self.state().signal = Some(signal);
    }

    fn create_id(&mut self, port_space: PortSpace) -> io::Result<CmId> {
        let mut state = self.state();
        state.check(SimOp::CreateId)?;
        let id = CmId(state.next_id);
        state.next_id += 1;
        state.commands.push(SimCommand::CreateId { id, port_space });
        Ok(id)
    }

    fn listen(&mut self, id: CmId, addr: SocketAddr) -> io::Result<()> {
        self.state()
            .record(SimOp::Listen, SimCommand::Listen { id, addr })
    }

    fn resolve_addr(
        &mut self,
        id: CmId,
        _src: Option<SocketAddr>,
        dst: SocketAddr,
        _timeout: Duration,
    ) -> io::Result<()> {
        self.state()
            .record(SimOp::ResolveAddr, SimCommand::ResolveAddr { id, dst })
    }

    fn resolve_route(&mut self, id: CmId, _timeout: Duration) -> io::Result<()> {
        self.state()
            .record(SimOp::ResolveRoute, SimCommand::ResolveRoute { id })
    }

    fn connect(&mut self, id: CmId, param: &ConnParam) -> io::Result<()> {
        self.state().record(
            SimOp::Connect,
            SimCommand::Connect {
                id,
                param: param.clone(),
            },
        )
    }

    fn accept(&mut self, id: CmId, param: &ConnParam) -> io::Result<()> {
        self.state().record(
            SimOp::Accept,
            SimCommand::Accept {
                id,
                param: param.clone(),
            },
        )
    }

    fn reject(&mut self, id: CmId, private_data: &[u8]) -> io::Result<()> {
        self.state().record(
            SimOp::Reject,
            SimCommand::Reject {
                id,
                private_data: Bytes::copy_from_slice(private_data),
            },
        )
    }

    fn establish(&mut self, id: CmId) -> io::Result<()> {
        self.state()
            .record(SimOp::Establish, SimCommand::Establish { id })
    }

    fn disconnect(&mut self, id: CmId) -> io::Result<()> {
        self.state()
            .record(SimOp::Disconnect, SimCommand::Disconnect { id })
    }

    fn migrate_id(&mut self, id: CmId) -> io::Result<()> {
        self.state()
            .record(SimOp::Migrate, SimCommand::Migrate { id })
    }

    fn destroy_id(&mut self, id: CmId) {
        let mut state = self.state();
        state.destroyed.insert(id);
        state.commands.push(SimCommand::Destroy { id });
    }
}

impl EndpointResources for SimCm {
    fn create_transport_resource(&mut self, ep: EndpointId, id: CmId) -> io::Result<u32> {
        let mut state = self.state();
        state.check(SimOp::CreateResource)?;
        let qp_num = state.next_qpn;
        state.next_qpn += 1;
        state
            .commands
            .push(SimCommand::CreateResource { ep, id, qp_num });
        Ok(qp_num)
    }

    fn post_recv(&mut self, ep: EndpointId, wr: &RecvWorkRequest) -> io::Result<()> {
        self.state().record(
            SimOp::PostRecv,
            SimCommand::PostRecv {
                ep,
                wr_id: wr.wr_id,
            },
        )
    }
}
