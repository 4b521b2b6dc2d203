//! Endpoint and listener records kept by the translator.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::cm::{CmId, ConnParam, PortSpace, RecvWorkRequest};
use crate::conn_tag::ConnTag;
use crate::connreq::ConnectionHints;
use crate::sidr::SidrKey;

/// Generation-checked endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub(crate) Handle);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Generation-checked listener handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub(crate) Handle);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pep{}", self.0)
    }
}

/// Connection flavour of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    /// Plain reliable connected endpoint.
    Msg,
    /// Shared receive side endpoint built from two unidirectional legs.
    Xrc,
}

/// Endpoint creation attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttr {
    /// Connection flavour.
    pub ep_type: EndpointType,
    /// Port space for identifiers this endpoint creates.
    pub port_space: PortSpace,
    /// Local address to bind, if any.
    pub src_addr: Option<SocketAddr>,
    /// Peer address for active connects. Filled from the request on accept.
    pub dest_addr: Option<SocketAddr>,
    /// Local listener port advertised to the peer for the reciprocal leg.
    pub local_pep_port: u16,
    /// Local shared receive queue number advertised to the peer.
    pub srqn: u32,
}

impl EndpointAttr {
    /// Attributes for a plain connected endpoint.
    pub fn msg(dest_addr: Option<SocketAddr>) -> Self {
        Self {
            ep_type: EndpointType::Msg,
            port_space: PortSpace::Tcp,
            src_addr: None,
            dest_addr,
            local_pep_port: 0,
            srqn: 0,
        }
    }

    /// Attributes for an XRC endpoint.
    pub fn xrc(dest_addr: Option<SocketAddr>, local_pep_port: u16, srqn: u32) -> Self {
        Self {
            ep_type: EndpointType::Xrc,
            port_space: PortSpace::Tcp,
            src_addr: None,
            dest_addr,
            local_pep_port,
            srqn,
        }
    }

    /// Switches identifiers to the given port space.
    pub fn with_port_space(mut self, port_space: PortSpace) -> Self {
        self.port_space = port_space;
        self
    }
}

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpState {
    /// Created, never connected.
    Idle,
    /// Waiting for address resolution.
    ResolvingAddress,
    /// Waiting for route resolution.
    ResolvingRoute,
    /// Connect handshake sent.
    Connecting,
    /// Inbound request accepted, waiting for establishment.
    Accepting,
    /// Connected.
    Connected,
    /// Disconnected or failed.
    Disconnected,
    /// Fatal error.
    Error,
}

/// Progress of the two XRC legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XrcConnState {
    /// No connect in progress.
    Idle,
    /// Original leg handshake in flight.
    OrigConnecting,
    /// Original leg up, reciprocal not started.
    OrigConnected,
    /// Reciprocal leg handshake in flight.
    RecipConnecting,
    /// Both legs up.
    RecipConnected,
    /// Setup failed.
    Error,
}

impl XrcConnState {
    /// State after the current step completes.
    pub fn next(self) -> Self {
        match self {
            XrcConnState::Idle => XrcConnState::OrigConnecting,
            XrcConnState::OrigConnecting => XrcConnState::OrigConnected,
            XrcConnState::OrigConnected => XrcConnState::RecipConnecting,
            XrcConnState::RecipConnecting => XrcConnState::RecipConnected,
            other => other,
        }
    }

    /// State before the last step.
    pub fn prev(self) -> Self {
        match self {
            XrcConnState::OrigConnecting => XrcConnState::Idle,
            XrcConnState::OrigConnected => XrcConnState::OrigConnecting,
            XrcConnState::RecipConnecting => XrcConnState::OrigConnected,
            XrcConnState::RecipConnected => XrcConnState::RecipConnecting,
            other => other,
        }
    }
}

/// Which side of the original handshake an XRC endpoint was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XrcRole {
    /// Issued the original connect; accepts the reciprocal leg.
    Active,
    /// Accepted the original connect; issues the reciprocal leg.
    Passive,
}

/// One of the two unidirectional XRC legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    /// Leg carrying the application's connect.
    Original,
    /// Hidden leg in the opposite direction.
    Reciprocal,
}

/// Which connection identifier slots are still occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiveLegs {
    /// Both slots are empty.
    None,
    /// Only the original leg identifier is held.
    OriginalOnly,
    /// Only the reciprocal leg identifier is held.
    ReciprocalOnly,
    /// Both identifiers are held.
    Both,
}

/// Connection identifier slots of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnIds {
    /// Identifier of the original leg.
    pub original: Option<CmId>,
    /// Identifier of the reciprocal leg.
    pub reciprocal: Option<CmId>,
}

impl ConnIds {
    /// Identifier held for `leg`.
    pub fn get(&self, leg: Leg) -> Option<CmId> {
        match leg {
            Leg::Original => self.original,
            Leg::Reciprocal => self.reciprocal,
        }
    }

    /// Stores `id` for `leg`, returning the previous identifier.
    pub fn set(&mut self, leg: Leg, id: CmId) -> Option<CmId> {
        match leg {
            Leg::Original => self.original.replace(id),
            Leg::Reciprocal => self.reciprocal.replace(id),
        }
    }

    /// Empties the slot for `leg`.
    pub fn take(&mut self, leg: Leg) -> Option<CmId> {
        match leg {
            Leg::Original => self.original.take(),
            Leg::Reciprocal => self.reciprocal.take(),
        }
    }

    /// Leg that `id` belongs to.
    pub fn leg_of(&self, id: CmId) -> Option<Leg> {
        if self.original == Some(id) {
            Some(Leg::Original)
        } else if self.reciprocal == Some(id) {
            Some(Leg::Reciprocal)
        } else {
            None
        }
    }

    /// Occupancy of both slots.
    pub fn live(&self) -> LiveLegs {
        match (self.original, self.reciprocal) {
            (None, None) => LiveLegs::None,
            (Some(_), None) => LiveLegs::OriginalOnly,
            (None, Some(_)) => LiveLegs::ReciprocalOnly,
            (Some(_), Some(_)) => LiveLegs::Both,
        }
    }

    /// Both identifiers that are held.
    pub fn iter(&self) -> impl Iterator<Item = CmId> {
        self.original.into_iter().chain(self.reciprocal)
    }
}

/// Per-connect XRC bookkeeping, released once both legs are up.
#[derive(Debug, Clone)]
pub(crate) struct XrcSetup {
    /// Our registered tag (active side only).
    pub conn_tag: Option<ConnTag>,
    /// Tag received from the active peer, echoed on the reciprocal request.
    pub peer_tag: Option<u32>,
    pub retry_count: u32,
    /// Encoded application private data for (re)issuing the connect.
    pub pending_param: Bytes,
    /// Application data from the original leg, surfaced with the final
    /// Connected event.
    pub event_data: Bytes,
    pub recip_req_seen: bool,
}

impl XrcSetup {
    pub fn new(pending_param: Bytes) -> Self {
        Self {
            conn_tag: None,
            peer_tag: None,
            retry_count: 0,
            pending_param,
            event_data: Bytes::new(),
            recip_req_seen: false,
        }
    }
}

/// Accept response kept so a retransmitted SIDR request can be answered.
#[derive(Debug, Clone)]
pub(crate) struct SidrEntry {
    pub key: SidrKey,
    pub accept_param: ConnParam,
}

#[derive(Debug, Clone)]
pub(crate) struct XrcEndpoint {
    pub role: Option<XrcRole>,
    pub conn_state: XrcConnState,
    pub setup: Option<XrcSetup>,
    /// Peer's shared receive queue and target queue pair, learned from
    /// its XRC header.
    pub peer_srqn: u32,
    pub peer_qpn: u32,
    pub remote_pep_port: u16,
    pub sidr: Option<SidrEntry>,
}

impl XrcEndpoint {
    fn new() -> Self {
        Self {
            role: None,
            conn_state: XrcConnState::Idle,
            setup: None,
            peer_srqn: 0,
            peer_qpn: 0,
            remote_pep_port: 0,
            sidr: None,
        }
    }

    /// Leg whose identifier we initiated.
    pub fn initiator_leg(&self) -> Leg {
        match self.role {
            Some(XrcRole::Passive) => Leg::Reciprocal,
            _ => Leg::Original,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub attr: EndpointAttr,
    pub state: EpState,
    pub ids: ConnIds,
    /// Local transport resource once created.
    pub qp_num: Option<u32>,
    pub prepost: VecDeque<RecvWorkRequest>,
    /// Encoded private data for a plain connect.
    pub conn_data: Bytes,
    pub xrc: Option<XrcEndpoint>,
}

impl Endpoint {
    pub fn new(attr: EndpointAttr) -> Self {
        let xrc = match attr.ep_type {
            EndpointType::Xrc => Some(XrcEndpoint::new()),
            EndpointType::Msg => None,
        };
        Self {
            attr,
            state: EpState::Idle,
            ids: ConnIds::default(),
            qp_num: None,
            prepost: VecDeque::new(),
            conn_data: Bytes::new(),
            xrc,
        }
    }

    pub fn is_xrc(&self) -> bool {
        self.xrc.is_some()
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            state: self.state,
            xrc_state: self.xrc.as_ref().map(|x| x.conn_state),
            role: self.xrc.as_ref().and_then(|x| x.role),
            retry_count: self
                .xrc
                .as_ref()
                .and_then(|x| x.setup.as_ref())
                .map(|s| s.retry_count)
                .unwrap_or(0),
            conn_tag: self
                .xrc
                .as_ref()
                .and_then(|x| x.setup.as_ref())
                .and_then(|s| s.conn_tag),
            recip_req_seen: self
                .xrc
                .as_ref()
                .and_then(|x| x.setup.as_ref())
                .map(|s| s.recip_req_seen)
                .unwrap_or(false),
            setup_live: self.xrc.as_ref().is_some_and(|x| x.setup.is_some()),
            sidr_recorded: self.xrc.as_ref().is_some_and(|x| x.sidr.is_some()),
            peer_srqn: self.xrc.as_ref().map(|x| x.peer_srqn),
            peer_qpn: self.xrc.as_ref().map(|x| x.peer_qpn),
            ids: self.ids,
            qp_num: self.qp_num,
            preposted: self.prepost.len(),
        }
    }
}

/// Point-in-time view of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    /// Connection state.
    pub state: EpState,
    /// XRC leg progress, for XRC endpoints.
    pub xrc_state: Option<XrcConnState>,
    /// XRC role once a connect or accept started.
    pub role: Option<XrcRole>,
    /// Transparent connect retries spent on the current attempt.
    pub retry_count: u32,
    /// Registered connection tag, if any.
    pub conn_tag: Option<ConnTag>,
    /// A reciprocal request arrived and is waiting for the original leg.
    pub recip_req_seen: bool,
    /// XRC setup state (tag, saved data, pending params) is still held.
    pub setup_live: bool,
    /// A SIDR accept response is recorded for retransmissions.
    pub sidr_recorded: bool,
    /// Shared receive queue number the peer advertised, for XRC endpoints.
    pub peer_srqn: Option<u32>,
    /// Target queue pair number the peer advertised, for XRC endpoints.
    pub peer_qpn: Option<u32>,
    /// Connection identifier slots.
    pub ids: ConnIds,
    /// Local transport resource.
    pub qp_num: Option<u32>,
    /// Receive buffers queued until the transport resource exists.
    pub preposted: usize,
}

#[derive(Debug)]
pub(crate) struct Listener {
    pub id: CmId,
    pub hints: ConnectionHints,
}
