//! Handshake private data layout.
//!
//! Every payload exchanged during the handshake is laid out as
//!
//! ```text
//! [transport preamble (IB addressing only)][XRC header (XRC only)][size:1][app bytes...]
//! ```
//!
//! The transport may pad private data to a fixed block, so the one-byte size
//! header is the only trustworthy length of the application payload.

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EqError, EqResult};

/// Length of the application payload size header.
pub const CM_DATA_HDR_LEN: usize = 1;

/// Largest application payload the size header can describe.
pub const MAX_APP_DATA_LEN: usize = u8::MAX as usize;

/// Length of the transport preamble carried on IB-addressed handshakes
/// (version:1 + ip_version:1 + port:2 + src:16 + dst:16).
pub const PREAMBLE_LEN: usize = 36;

/// Length of the XRC negotiation header
/// (version:1 + reciprocal:1 + port:2 + tgt_qpn:4 + srqn:4 + conn_tag:4).
pub const XRC_CM_DATA_LEN: usize = 16;

/// XRC negotiation header version.
pub const XRC_CM_DATA_VERSION: u8 = 1;

/// Size header of a zero-length application payload.
pub const EMPTY_CM_DATA: [u8; CM_DATA_HDR_LEN] = [0];

/// Encodes an application payload behind its size header.
pub fn encode_cm_data(app: &[u8]) -> EqResult<Bytes> {
    if app.len() > MAX_APP_DATA_LEN {
        return Err(EqError::InvalidArgument(format!(
            "private data too long: {} bytes (max {})",
            app.len(),
            MAX_APP_DATA_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(CM_DATA_HDR_LEN + app.len());
    buf.put_u8(app.len() as u8);
    buf.put_slice(app);
    Ok(buf.freeze())
}

/// Copies out at most `capacity` bytes of the declared application payload.
pub fn decode_cm_data(data: &[u8], capacity: usize) -> Bytes {
    let Some((&size, rest)) = data.split_first() else {
        return Bytes::new();
    };
    let len = (size as usize).min(rest.len()).min(capacity);
    Bytes::copy_from_slice(&rest[..len])
}

/// Builds the transport preamble for an IB-addressed handshake.
pub fn encode_preamble(src: SocketAddr, dst: SocketAddr) -> [u8; PREAMBLE_LEN] {
    let mut out = [0u8; PREAMBLE_LEN];
    out[0] = 0;
    out[1] = match src.ip() {
        IpAddr::V4(_) => 4 << 4,
        IpAddr::V6(_) => 6 << 4,
    };
    out[2..4].copy_from_slice(&src.port().to_be_bytes());
    out[4..20].copy_from_slice(&ip_bytes(src.ip()));
    out[20..36].copy_from_slice(&ip_bytes(dst.ip()));
    out
}

fn ip_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Skips the transport preamble when the payload is long enough to carry one.
pub fn skip_preamble(data: &[u8]) -> &[u8] {
    if data.len() > PREAMBLE_LEN {
        &data[PREAMBLE_LEN..]
    } else {
        data
    }
}

/// Skips the XRC negotiation header when the payload is long enough to carry one.
pub fn skip_xrc_cm_data(data: &[u8]) -> &[u8] {
    if data.len() > XRC_CM_DATA_LEN {
        &data[XRC_CM_DATA_LEN..]
    } else {
        data
    }
}

/// Extracts the application payload: preamble first, then the XRC header,
/// then the declared number of bytes.
pub fn app_payload(data: &[u8], preamble: bool, xrc: bool, capacity: usize) -> Bytes {
    let mut data = data;
    if preamble {
        data = skip_preamble(data);
    }
    if xrc {
        data = skip_xrc_cm_data(data);
    }
    decode_cm_data(data, capacity)
}

/// XRC negotiation header exchanged on both legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XrcCmData {
    /// True on the hidden reciprocal leg.
    pub reciprocal: bool,
    /// Listener port of the sender, used to key SIDR retransmissions.
    pub port: u16,
    /// Target queue pair number of the sender.
    pub tgt_qpn: u32,
    /// Shared receive queue number of the sender.
    pub srqn: u32,
    /// Tag correlating the reciprocal request with the original connect.
    pub conn_tag: u32,
}

impl XrcCmData {
    /// Serializes the header in network byte order.
    pub fn encode(&self) -> [u8; XRC_CM_DATA_LEN] {
        let mut out = [0u8; XRC_CM_DATA_LEN];
        out[0] = XRC_CM_DATA_VERSION;
        out[1] = self.reciprocal as u8;
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.tgt_qpn.to_be_bytes());
        out[8..12].copy_from_slice(&self.srqn.to_be_bytes());
        out[12..16].copy_from_slice(&self.conn_tag.to_be_bytes());
        out
    }

    /// Parses and validates the header at the start of `data`.
    pub fn decode(data: &[u8]) -> EqResult<Self> {
        if data.len() < XRC_CM_DATA_LEN {
            return Err(EqError::InvalidArgument(format!(
                "XRC private data too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != XRC_CM_DATA_VERSION {
            return Err(EqError::InvalidArgument(format!(
                "XRC private data version {} (expected {})",
                data[0], XRC_CM_DATA_VERSION
            )));
        }
        Ok(Self {
            reciprocal: data[1] != 0,
            port: u16::from_be_bytes([data[2], data[3]]),
            tgt_qpn: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            srqn: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            conn_tag: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// Assembles wire private data from its optional layers.
pub fn build_private_data(
    preamble: Option<[u8; PREAMBLE_LEN]>,
    xrc: Option<&XrcCmData>,
    cm_data: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + XRC_CM_DATA_LEN + cm_data.len());
    if let Some(preamble) = preamble {
        buf.put_slice(&preamble);
    }
    if let Some(xrc) = xrc {
        buf.put_slice(&xrc.encode());
    }
    buf.put_slice(cm_data);
    buf.freeze()
}
