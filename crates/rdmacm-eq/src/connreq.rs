//! Candidate connection info for inbound connect requests.
//!
//! A listener carries hints (domain, fabric, protocol, capabilities). When a
//! connect request arrives the hints are merged with the addressing the
//! connection manager resolved for the new identifier, producing the
//! [`ConnRequest`] the application accepts or rejects.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cm::{AddressFormat, CmEvent, CmId, PortSpace};
use crate::endpoint::ListenerId;
use crate::error::{EqError, EqResult};
use crate::private_data::XrcCmData;

/// Wildcard domain hint: any device may take the request.
pub const ANY_DOMAIN: &str = "any_domain";

/// Wildcard fabric hint: the fabric name is left unset in candidate info.
pub const ANY_FABRIC: &str = "any_fabric";

/// Suffix carried by XRC domain names.
pub const XRC_DOMAIN_SUFFIX: &str = "-xrc";

/// Wire protocol of a listener or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpProtocol {
    /// Plain connection manager handshake.
    RdmaCm,
    /// Handshake carrying the XRC negotiation header.
    RdmaCmXrc,
}

/// Listener hints used to build candidate info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHints {
    /// Domain name or [`ANY_DOMAIN`].
    pub domain_name: String,
    /// Fabric name or [`ANY_FABRIC`].
    pub fabric_name: String,
    /// Handshake protocol.
    pub protocol: EpProtocol,
    /// Capability bits passed through to the candidate.
    pub caps: u64,
}

impl ConnectionHints {
    /// Wildcard hints for `protocol`.
    pub fn any(protocol: EpProtocol) -> Self {
        Self {
            domain_name: ANY_DOMAIN.to_string(),
            fabric_name: ANY_FABRIC.to_string(),
            protocol,
            caps: 0,
        }
    }

    /// Restricts the hints to `domain_name`.
    pub fn with_domain(mut self, domain_name: impl Into<String>) -> Self {
        self.domain_name = domain_name.into();
        self
    }

    /// Restricts the hints to `fabric_name`.
    pub fn with_fabric(mut self, fabric_name: impl Into<String>) -> Self {
        self.fabric_name = fabric_name.into();
        self
    }

    /// True for XRC listeners.
    pub fn is_xrc(&self) -> bool {
        self.protocol == EpProtocol::RdmaCmXrc
    }
}

/// Candidate connection info handed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnInfo {
    /// Domain the request arrived on.
    pub domain_name: String,
    /// Fabric name, unset for wildcard fabric hints.
    pub fabric_name: Option<String>,
    /// Handshake protocol.
    pub protocol: EpProtocol,
    /// Capability bits from the listener hints.
    pub caps: u64,
    /// Port space of the inbound identifier.
    pub port_space: PortSpace,
    /// Address family of the resolved route.
    pub address_format: AddressFormat,
    /// Local address of the inbound identifier.
    pub src_addr: SocketAddr,
    /// Peer address of the inbound identifier.
    pub dest_addr: SocketAddr,
}

/// XRC negotiation fields carried by an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XrcConnInfo {
    /// Request belongs to the hidden reciprocal leg.
    pub reciprocal: bool,
    /// Tag of the originating connect.
    pub conn_tag: u32,
    /// Listener port of the requester.
    pub port: u16,
    /// Target queue pair number of the requester.
    pub tgt_qpn: u32,
    /// Shared receive queue number of the requester.
    pub peer_srqn: u32,
}

impl From<XrcCmData> for XrcConnInfo {
    fn from(data: XrcCmData) -> Self {
        Self {
            reciprocal: data.reciprocal,
            conn_tag: data.conn_tag,
            port: data.port,
            tgt_qpn: data.tgt_qpn,
            peer_srqn: data.srqn,
        }
    }
}

/// Inbound connect request awaiting accept or reject.
#[derive(Debug, Clone)]
pub struct ConnRequest {
    pub(crate) id: CmId,
    pub(crate) listener: ListenerId,
    /// Merged candidate info.
    pub info: ConnInfo,
    /// XRC negotiation fields for XRC requests.
    pub xrc: Option<XrcConnInfo>,
    peer_qpn: u32,
}

impl ConnRequest {
    /// Listener the request arrived on.
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Connection identifier that will carry the connection once accepted.
    pub fn cm_id(&self) -> CmId {
        self.id
    }

    /// Queue pair number advertised by the requester.
    pub fn peer_qpn(&self) -> u32 {
        self.peer_qpn
    }

    /// True for requests that carry the XRC negotiation header.
    pub fn is_xrc(&self) -> bool {
        self.xrc.is_some()
    }
}

/// Strips the XRC suffix from a domain name, if present.
pub fn base_domain_name(name: &str) -> &str {
    name.strip_suffix(XRC_DOMAIN_SUFFIX).unwrap_or(name)
}

fn domain_matches(hints: &ConnectionHints, device: &str) -> bool {
    if hints.is_xrc() {
        base_domain_name(&hints.domain_name) == device
    } else {
        hints.domain_name == device
    }
}

/// Merges listener hints with the addressing of an inbound request.
pub(crate) fn build_conn_request(
    listener: ListenerId,
    hints: &ConnectionHints,
    event: &CmEvent,
) -> EqResult<ConnRequest> {
    let route = event.route.as_ref().ok_or_else(|| {
        EqError::NoMatchingData(format!("connect request on {} without a route", event.id))
    })?;

    let domain_name = if hints.domain_name == ANY_DOMAIN {
        if hints.is_xrc() {
            format!("{}{}", route.device, XRC_DOMAIN_SUFFIX)
        } else {
            route.device.clone()
        }
    } else if domain_matches(hints, &route.device) {
        hints.domain_name.clone()
    } else {
        warn!(
            domain = %hints.domain_name,
            device = %route.device,
            "listener domain does not match the device the request arrived on"
        );
        return Err(EqError::NoMatchingData(format!(
            "domain {} does not match device {}",
            hints.domain_name, route.device
        )));
    };

    let fabric_name = if hints.fabric_name == ANY_FABRIC {
        None
    } else {
        Some(hints.fabric_name.clone())
    };

    let xrc = if hints.is_xrc() {
        Some(XrcConnInfo::from(XrcCmData::decode(&event.private_data)?))
    } else {
        None
    };

    debug!(id = %event.id, src = %route.src, dst = %route.dst, "connect request");

    Ok(ConnRequest {
        id: event.id,
        listener,
        info: ConnInfo {
            domain_name,
            fabric_name,
            protocol: hints.protocol,
            caps: hints.caps,
            port_space: event.port_space,
            address_format: route.format,
            src_addr: route.src,
            dest_addr: route.dst,
        },
        xrc,
        peer_qpn: event.qp_num,
    })
}
