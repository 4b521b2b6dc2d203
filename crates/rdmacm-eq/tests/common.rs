//! Two-node wire harness for integration tests.
//!
//! Each node owns an event queue over its own [`SimCm`]. [`Pair::pump`]
//! turns the commands one node issued into the raw events the other node
//! (and the issuer) would observe on a real fabric.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use rdmacm_eq::sim::{SimCm, SimCommand};
use rdmacm_eq::{
    AddressFormat, CmEvent, CmEventKind, CmId, ConnectionHints, EndpointAttr, EndpointId,
    EpProtocol, EqConfig, EqError, ErrorEntry, EventKind, EventQueue, ListenerId, PortSpace,
    QueueEntry, ReadFlags, RouteInfo,
};

pub const DEVICE: &str = "mlx5_0";
pub const READ_CAPACITY: usize = 512;

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Something a node's application read from its queue.
#[derive(Debug, Clone)]
pub enum Seen {
    Entry(QueueEntry),
    Error(ErrorEntry),
}

impl Seen {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Seen::Entry(entry) => Some(entry.kind),
            Seen::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

pub struct Node {
    pub sim: SimCm,
    pub eq: EventQueue,
    pub addr: SocketAddr,
    pub listener: ListenerId,
    pub listen_id: CmId,
    pub protocol: EpProtocol,
    pub srqn: u32,
    /// Endpoints created by auto-accept.
    pub accepted: Vec<EndpointId>,
    /// Everything the application read so far.
    pub log: Vec<Seen>,
    /// Payload returned with every auto-accept; `None` rejects instead.
    pub accept_data: Option<Vec<u8>>,
}

impl Node {
    pub fn new(
        id_base: u64,
        addr: SocketAddr,
        port_space: PortSpace,
        protocol: EpProtocol,
        config: EqConfig,
    ) -> Self {
        let sim = SimCm::with_id_base(id_base);
        let eq = EventQueue::open(config, sim.clone(), sim.clone()).unwrap();
        let listener = eq
            .listen(addr, port_space, ConnectionHints::any(protocol))
            .unwrap();
        let listen_id = sim
            .take_commands()
            .iter()
            .find_map(|cmd| match cmd {
                SimCommand::Listen { id, .. } => Some(*id),
                _ => None,
            })
            .unwrap();
        Self {
            sim,
            eq,
            addr,
            listener,
            listen_id,
            protocol,
            srqn: id_base as u32 + 7,
            accepted: Vec::new(),
            log: Vec::new(),
            accept_data: Some(Vec::new()),
        }
    }

    /// Endpoint attributes for connecting to `peer`.
    pub fn attr_to(&self, peer: &Node, port_space: PortSpace) -> EndpointAttr {
        let attr = match self.protocol {
            EpProtocol::RdmaCm => EndpointAttr::msg(Some(peer.addr)),
            EpProtocol::RdmaCmXrc => EndpointAttr::xrc(Some(peer.addr), self.addr.port(), self.srqn),
        };
        attr.with_port_space(port_space)
    }

    fn passive_attr(&self) -> EndpointAttr {
        match self.protocol {
            EpProtocol::RdmaCm => EndpointAttr::msg(None),
            EpProtocol::RdmaCmXrc => EndpointAttr::xrc(None, self.addr.port(), self.srqn),
        }
    }

    /// Reads until the queue has nothing more, answering connect requests.
    fn drain(&mut self) -> usize {
        let mut count = 0;
        loop {
            let seen = match self.eq.read(READ_CAPACITY, ReadFlags::NONE) {
                Ok(entry) => Seen::Entry(entry),
                Err(EqError::ErrorAvailable) => Seen::Error(self.eq.read_error(READ_CAPACITY).unwrap()),
                Err(EqError::WouldBlock) => break,
                Err(err) => panic!("read failed: {err}"),
            };
            if let Seen::Entry(entry) = &seen {
                if entry.kind == EventKind::ConnReq {
                    self.answer(entry);
                }
            }
            self.log.push(seen);
            count += 1;
        }
        count
    }

    fn answer(&mut self, entry: &QueueEntry) {
        let Some(req) = entry.info.as_ref() else {
            return;
        };
        match self.accept_data.clone() {
            Some(data) => {
                let ep = self.eq.create_endpoint(self.passive_attr()).unwrap();
                self.eq.accept(ep, req, &data).unwrap();
                self.accepted.push(ep);
            }
            None => self.eq.reject(req, b"busy").unwrap(),
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.log.iter().filter(|seen| seen.kind() == Some(kind)).count()
    }

    pub fn errors(&self) -> Vec<&ErrorEntry> {
        self.log
            .iter()
            .filter_map(|seen| match seen {
                Seen::Error(err) => Some(err),
                Seen::Entry(_) => None,
            })
            .collect()
    }

    pub fn entries(&self, kind: EventKind) -> Vec<&QueueEntry> {
        self.log
            .iter()
            .filter_map(|seen| match seen {
                Seen::Entry(entry) if entry.kind == kind => Some(entry),
                _ => None,
            })
            .collect()
    }
}

/// Two nodes joined by a simulated fabric.
pub struct Pair {
    pub a: Node,
    pub b: Node,
    pub port_space: PortSpace,
    links: HashMap<CmId, CmId>,
    last_connect: HashMap<CmId, (Side, CmEvent)>,
    answered: HashSet<CmId>,
    down: HashSet<CmId>,
    /// Holds back accept responses for the original leg of A.
    pub hold_original_response: bool,
    held: Vec<(Side, CmEvent)>,
    /// Connects from A fail with a timeout instead of reaching B.
    pub fail_connects_from_a: bool,
    /// This many connects from B fail with a timeout before one gets through.
    pub fail_next_connects_from_b: usize,
    /// A answers reciprocal connects with a header B cannot parse.
    pub garble_reciprocal_accepts: bool,
    /// Requests superseded by a retransmission; rejects of these are the
    /// requester's CM discarding a duplicate and never reach it.
    superseded: HashSet<CmId>,
    /// Every command seen, tagged with its issuer.
    pub wire: Vec<(Side, SimCommand)>,
}

impl Pair {
    pub fn new(protocol: EpProtocol, port_space: PortSpace, config: EqConfig) -> Self {
        init_tracing();
        let a = Node::new(
            1,
            "10.0.0.1:7001".parse().unwrap(),
            port_space,
            protocol,
            config.clone(),
        );
        let b = Node::new(
            10_000,
            "10.0.0.2:7002".parse().unwrap(),
            port_space,
            protocol,
            config,
        );
        Self {
            a,
            b,
            port_space,
            links: HashMap::new(),
            last_connect: HashMap::new(),
            answered: HashSet::new(),
            down: HashSet::new(),
            hold_original_response: false,
            held: Vec::new(),
            fail_connects_from_a: false,
            fail_next_connects_from_b: 0,
            garble_reciprocal_accepts: false,
            superseded: HashSet::new(),
            wire: Vec::new(),
        }
    }

    pub fn xrc(port_space: PortSpace) -> Self {
        Self::new(EpProtocol::RdmaCmXrc, port_space, EqConfig::default())
    }

    pub fn node(&self, side: Side) -> &Node {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    fn node_mut(&mut self, side: Side) -> &mut Node {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    fn push(&self, side: Side, event: CmEvent) {
        self.node(side).sim.push_event(event);
    }

    fn ephemeral(&self, side: Side, id: CmId) -> SocketAddr {
        SocketAddr::new(self.node(side).addr.ip(), 40_000 + (id.0 % 20_000) as u16)
    }

    fn route(&self, side: Side, id: CmId) -> RouteInfo {
        RouteInfo {
            src: self.ephemeral(side, id),
            dst: self.node(side.peer()).addr,
            device: DEVICE.to_string(),
            format: AddressFormat::Ip,
        }
    }

    fn deliver_connect_request(&mut self, from: Side, id: CmId, event: CmEvent) {
        let to = from.peer();
        let peer_id = self.node(to).sim.alloc_id();
        self.links.insert(id, peer_id);
        self.links.insert(peer_id, id);
        let event = CmEvent {
            id: peer_id,
            listen_id: Some(self.node(to).listen_id),
            ..event
        };
        self.push(to, event);
    }

    fn route_command(&mut self, from: Side, cmd: SimCommand) {
        let to = from.peer();
        self.wire.push((from, cmd.clone()));
        match cmd {
            SimCommand::ResolveAddr { id, .. } => {
                self.push(from, CmEvent::new(CmEventKind::AddrResolved, id));
            }
            SimCommand::ResolveRoute { id } => {
                let route = self.route(from, id);
                self.push(
                    from,
                    CmEvent::new(CmEventKind::RouteResolved, id).with_route(route),
                );
            }
            SimCommand::Connect { id, param } => {
                if from == Side::A && self.fail_connects_from_a {
                    self.push(
                        from,
                        CmEvent::new(CmEventKind::ConnectError, id).with_status(-110),
                    );
                    return;
                }
                if from == Side::B && self.fail_next_connects_from_b > 0 {
                    self.fail_next_connects_from_b -= 1;
                    self.push(
                        from,
                        CmEvent::new(CmEventKind::ConnectError, id).with_status(-110),
                    );
                    return;
                }
                let route = RouteInfo {
                    src: self.node(to).addr,
                    dst: self.ephemeral(from, id),
                    device: DEVICE.to_string(),
                    format: AddressFormat::Ip,
                };
                let event = CmEvent::new(CmEventKind::ConnectRequest, id)
                    .with_route(route)
                    .with_private_data(param.private_data)
                    .with_qp_num(param.qp_num)
                    .with_port_space(self.port_space);
                self.last_connect.insert(id, (from, event.clone()));
                self.deliver_connect_request(from, id, event);
            }
            SimCommand::Accept { id, param } => {
                let Some(&peer_id) = self.links.get(&id) else {
                    return;
                };
                // resent SIDR responses reach a requester that already has its answer
                if !self.answered.insert(peer_id) {
                    return;
                }
                let connectionless = self.port_space.is_connectionless();
                let kind = if connectionless {
                    CmEventKind::Established
                } else {
                    CmEventKind::ConnectResponse
                };
                let requester = self.last_connect.get(&peer_id).map(|(side, _)| *side);
                // A only ever connects original legs, B only reciprocal ones
                let is_original_of_a = to == Side::A && requester == Some(Side::A);
                let is_reciprocal_of_b = to == Side::B && requester == Some(Side::B);
                let private_data = if self.garble_reciprocal_accepts && is_reciprocal_of_b {
                    param.private_data.slice(0..0)
                } else {
                    param.private_data
                };
                let response = CmEvent::new(kind, peer_id)
                    .with_private_data(private_data)
                    .with_qp_num(param.qp_num)
                    .with_port_space(self.port_space);
                if self.hold_original_response && is_original_of_a {
                    self.held.push((to, response));
                } else {
                    self.push(to, response);
                }
                if !connectionless {
                    self.push(from, CmEvent::new(CmEventKind::Established, id));
                }
            }
            SimCommand::Reject { id, private_data } => {
                if self.superseded.contains(&id) {
                    return;
                }
                let Some(&peer_id) = self.links.get(&id) else {
                    return;
                };
                let event = if self.port_space.is_connectionless() {
                    CmEvent::new(CmEventKind::Unreachable, peer_id)
                        .with_status(2)
                        .with_port_space(PortSpace::Udp)
                } else {
                    CmEvent::new(CmEventKind::Rejected, peer_id).with_status(28)
                };
                self.push(to, event.with_private_data(private_data));
            }
            SimCommand::Disconnect { id } => {
                if !self.down.insert(id) {
                    return;
                }
                self.push(from, CmEvent::new(CmEventKind::Disconnected, id));
                self.push(from, CmEvent::new(CmEventKind::TimewaitExit, id));
                if let Some(&peer_id) = self.links.get(&id) {
                    if self.down.insert(peer_id) {
                        self.push(to, CmEvent::new(CmEventKind::Disconnected, peer_id));
                        self.push(to, CmEvent::new(CmEventKind::TimewaitExit, peer_id));
                    }
                }
            }
            _ => {}
        }
    }

    /// Routes all pending commands. Returns how many there were.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        for side in [Side::A, Side::B] {
            let commands = self.node(side).sim.take_commands();
            moved += commands.len();
            for cmd in commands {
                self.route_command(side, cmd);
            }
        }
        moved
    }

    /// Pumps and drains both nodes until nothing moves.
    pub fn settle(&mut self) {
        for _ in 0..200 {
            let moved = self.pump();
            let read = self.a.drain() + self.b.drain();
            let pending = self.a.sim.pending_events() + self.b.sim.pending_events();
            if moved == 0 && read == 0 && pending == 0 {
                return;
            }
        }
        panic!("fabric did not settle");
    }

    pub fn release_held(&mut self) {
        for (side, event) in std::mem::take(&mut self.held) {
            self.push(side, event);
        }
    }

    /// Replays the last connect request sent on `id` under a fresh
    /// identifier at the receiver, as a lost response would cause.
    pub fn retransmit(&mut self, id: CmId) -> CmId {
        let (from, event) = self.last_connect.get(&id).cloned().unwrap();
        let peer_id = self.node(from.peer()).sim.alloc_id();
        if let Some(&earlier) = self.links.get(&id) {
            self.superseded.insert(earlier);
        }
        self.links.insert(peer_id, id);
        let event = CmEvent {
            id: peer_id,
            listen_id: Some(self.node(from.peer()).listen_id),
            ..event
        };
        self.push(from.peer(), event);
        peer_id
    }

    /// Connects a new endpoint on A to B.
    pub fn connect(&mut self, data: &[u8]) -> EndpointId {
        let attr = self.a.attr_to(&self.b, self.port_space);
        let ep = self.a.eq.create_endpoint(attr).unwrap();
        self.a.eq.connect(ep, data).unwrap();
        ep
    }

    pub fn wire_count(&self, side: Side, pred: impl Fn(&SimCommand) -> bool) -> usize {
        self.wire
            .iter()
            .filter(|(s, cmd)| *s == side && pred(cmd))
            .count()
    }
}
