//! Connection manager collaborator interface.
//!
//! The event queue never talks to hardware directly. Raw connection manager
//! notifications are pulled from a [`ConnectionManager`], and every command the
//! translator issues (route resolution, connect, accept, reject, disconnect,
//! identifier migration) goes back through the same trait. Transport resource
//! creation and receive posting belong to the endpoint data path and are
//! reached through [`EndpointResources`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;
use crate::signal::EqSignal;

/// Low-level connection identifier owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CmId(pub u64);

impl std::fmt::Display for CmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cm#{}", self.0)
    }
}

/// Port space of a connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSpace {
    /// Reliable connected handshake.
    Tcp,
    /// Connectionless (SIDR) handshake.
    Udp,
    /// Native InfiniBand port space.
    Ib,
}

impl PortSpace {
    /// True for the connectionless bootstrap used by shared XRC connections.
    pub fn is_connectionless(self) -> bool {
        self == PortSpace::Udp
    }
}

/// Address family a route was resolved over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFormat {
    /// IPv4 / IPv6 addressing.
    Ip,
    /// Native InfiniBand addressing; handshakes carry a transport preamble.
    Ib,
}

/// Kind of a raw connection manager event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmEventKind {
    /// Address resolution finished.
    AddrResolved,
    /// Address resolution failed.
    AddrError,
    /// Route resolution finished.
    RouteResolved,
    /// Route resolution failed.
    RouteError,
    /// Inbound connect request on a listener.
    ConnectRequest,
    /// Active side received the accept.
    ConnectResponse,
    /// Handshake failed.
    ConnectError,
    /// Peer is unreachable (also reported for SIDR rejects).
    Unreachable,
    /// Peer rejected the connect.
    Rejected,
    /// Passive side connection established.
    Established,
    /// Connection torn down.
    Disconnected,
    /// Device went away.
    DeviceRemoval,
    /// Local address changed.
    AddrChange,
    /// Identifier left the timewait state.
    TimewaitExit,
    /// Any kind this layer does not know about.
    Unknown(u32),
}

/// Routing details attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Local address of the identifier.
    pub src: SocketAddr,
    /// Peer address of the identifier.
    pub dst: SocketAddr,
    /// Name of the device the identifier is bound to.
    pub device: String,
    /// Address family the route was resolved over.
    pub format: AddressFormat,
}

/// A raw notification from the connection manager.
#[derive(Debug, Clone)]
pub struct CmEvent {
    /// Event kind.
    pub kind: CmEventKind,
    /// Identifier the event pertains to.
    pub id: CmId,
    /// Listening identifier for connect requests.
    pub listen_id: Option<CmId>,
    /// Status code; negative values are errno-style failures.
    pub status: i32,
    /// Handshake private data.
    pub private_data: Bytes,
    /// Port space of `id`.
    pub port_space: PortSpace,
    /// Routing details, when known.
    pub route: Option<RouteInfo>,
    /// Queue pair number advertised by the peer.
    pub qp_num: u32,
    /// True if the connection manager owns the queue pair of `id`.
    pub cm_manages_qp: bool,
}

impl CmEvent {
    /// Creates an event of `kind` on `id` with no payload.
    pub fn new(kind: CmEventKind, id: CmId) -> Self {
        Self {
            kind,
            id,
            listen_id: None,
            status: 0,
            private_data: Bytes::new(),
            port_space: PortSpace::Tcp,
            route: None,
            qp_num: 0,
            cm_manages_qp: true,
        }
    }

    /// Sets the private data.
    pub fn with_private_data(mut self, data: impl Into<Bytes>) -> Self {
        self.private_data = data.into();
        self
    }

    /// Sets the status code.
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    /// Sets the listening identifier.
    pub fn with_listen_id(mut self, listen_id: CmId) -> Self {
        self.listen_id = Some(listen_id);
        self
    }

    /// Sets the port space.
    pub fn with_port_space(mut self, port_space: PortSpace) -> Self {
        self.port_space = port_space;
        self
    }

    /// Sets the route details.
    pub fn with_route(mut self, route: RouteInfo) -> Self {
        self.route = Some(route);
        self
    }

    /// Sets the advertised queue pair number.
    pub fn with_qp_num(mut self, qp_num: u32) -> Self {
        self.qp_num = qp_num;
        self
    }

    /// Marks the queue pair as not managed by the connection manager.
    pub fn with_unmanaged_qp(mut self) -> Self {
        self.cm_manages_qp = false;
        self
    }
}

/// Parameters passed to connect and accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnParam {
    /// Encoded private data.
    pub private_data: Bytes,
    /// Local queue pair number.
    pub qp_num: u32,
}

/// Scatter/gather element of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterGatherElement {
    /// Buffer address.
    pub address: u64,
    /// Buffer length.
    pub length: u32,
    /// Local key of the registered region.
    pub lkey: u32,
}

/// A receive buffer queued before the transport resource exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWorkRequest {
    /// Caller-chosen identifier reported on completion.
    pub wr_id: u64,
    /// Buffers to receive into.
    pub sg_list: Vec<ScatterGatherElement>,
}

/// Source of raw events and sink for handshake commands.
pub trait ConnectionManager: Send {
    /// Pulls the next raw event without blocking.
    fn get_event(&mut self) -> Option<CmEvent>;

    /// Registers the queue's readiness signal; called once at open.
    fn bind_signal(&mut self, _signal: Arc<EqSignal>) {}

    /// Allocates a new identifier in `port_space`.
    fn create_id(&mut self, port_space: PortSpace) -> io::Result<CmId>;

    /// Starts listening on `addr`.
    fn listen(&mut self, id: CmId, addr: SocketAddr) -> io::Result<()>;

    /// Starts address resolution towards `dst`.
    fn resolve_addr(
        &mut self,
        id: CmId,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout: Duration,
    ) -> io::Result<()>;

    /// Starts route resolution.
    fn resolve_route(&mut self, id: CmId, timeout: Duration) -> io::Result<()>;

    /// Sends the connect handshake.
    fn connect(&mut self, id: CmId, param: &ConnParam) -> io::Result<()>;

    /// Accepts an inbound request (also used to resend a lost SIDR response).
    fn accept(&mut self, id: CmId, param: &ConnParam) -> io::Result<()>;

    /// Rejects an inbound request.
    fn reject(&mut self, id: CmId, private_data: &[u8]) -> io::Result<()>;

    /// Completes the handshake for a queue pair the manager does not own.
    fn establish(&mut self, id: CmId) -> io::Result<()>;

    /// Initiates disconnect.
    fn disconnect(&mut self, id: CmId) -> io::Result<()>;

    /// Moves `id` onto this queue's event channel.
    fn migrate_id(&mut self, id: CmId) -> io::Result<()>;

    /// Releases `id`.
    fn destroy_id(&mut self, id: CmId);
}

/// Endpoint data-path operations invoked during connection setup.
pub trait EndpointResources: Send {
    /// Creates the local transport resource (queue pair) for `ep` on `id`.
    /// Returns the local queue pair number.
    fn create_transport_resource(&mut self, ep: EndpointId, id: CmId) -> io::Result<u32>;

    /// Posts a receive buffer on the transport resource of `ep`.
    fn post_recv(&mut self, ep: EndpointId, wr: &RecvWorkRequest) -> io::Result<()>;
}
