//! XRC bidirectional connection setup.
//!
//! An XRC connection only carries traffic in one direction, so a logical
//! connection is two handshakes. The active side connects the original leg,
//! advertising a connection tag; once the passive side sees that leg
//! established it connects the reciprocal leg back, echoing the tag so the
//! active side can find the endpoint. The application sees exactly one
//! `Connected` per side, emitted when the reciprocal leg completes, carrying
//! the private data of the original handshake.
//!
//! Over connectionless (SIDR) transports an accept is final the moment it is
//! sent. Accept responses are remembered in the SIDR map so a retransmitted
//! request can be answered again without creating new state.

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cm::{CmEvent, CmEventKind, CmId, ConnParam};
use crate::conn_tag::{ConnTag, TagTable};
use crate::connreq::{ConnRequest, XrcConnInfo};
use crate::endpoint::{
    EndpointId, EpState, Leg, LiveLegs, SidrEntry, XrcConnState, XrcEndpoint, XrcRole, XrcSetup,
};
use crate::eq::{ErrorEntry, EventKind, EventSource, QueueEntry};
use crate::error::{EqError, EqResult, ErrorCode};
use crate::private_data::{
    app_payload, build_private_data, decode_cm_data, skip_xrc_cm_data, XrcCmData, EMPTY_CM_DATA,
    MAX_APP_DATA_LEN,
};
use crate::sidr::SidrKey;
use crate::translator::{errno_of, Dispatch, Owner, Translator};

/// Reject status set when the peer application rejected a connect.
pub const REJ_CONSUMER_DEFINED: i32 = 28;

/// Reject status set when the peer application rejected a SIDR request.
pub const REJ_SIDR_CONSUMER_DEFINED: i32 = 2;

/// Who declined a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RejectClass {
    /// The peer application rejected the request. Worth feeding into any
    /// upstream retry decision.
    PeerApplication,
    /// The fabric or the peer's connection manager rejected it.
    Infrastructure,
}

impl RejectClass {
    /// Classifies a reject status.
    pub fn from_status(status: i32) -> Self {
        match status {
            REJ_CONSUMER_DEFINED | REJ_SIDR_CONSUMER_DEFINED => RejectClass::PeerApplication,
            _ => RejectClass::Infrastructure,
        }
    }
}

/// Drops per-connect setup state, returning it so the caller can pull out
/// the saved event data.
fn release_setup(tags: &mut TagTable, xrc: &mut XrcEndpoint) -> Option<XrcSetup> {
    let setup = xrc.setup.take()?;
    if let Some(tag) = setup.conn_tag {
        tags.remove(tag);
    }
    Some(setup)
}

fn establish_if_needed(translator: &mut Translator, event: &CmEvent) {
    // the active side completes the handshake itself for queue pairs the
    // connection manager does not own
    if event.kind == CmEventKind::ConnectResponse && !event.cm_manages_qp {
        if let Err(err) = translator.cm.establish(event.id) {
            warn!(id = %event.id, error = %err, "establish failed");
        }
    }
}

impl Translator {
    pub(crate) fn on_xrc_connect_request(
        &mut self,
        req: ConnRequest,
        xrc: XrcConnInfo,
        event: &CmEvent,
    ) -> Dispatch {
        if event.port_space.is_connectionless() {
            let key = SidrKey::new(req.info.dest_addr.ip(), xrc.port, xrc.reciprocal);
            if let Some(ep) = self.sidr.get(&key) {
                debug!(%ep, reciprocal = xrc.reciprocal, "SIDR request retry received");
                self.resend_sidr_accept(ep, event.id);
                self.cm.destroy_id(event.id);
                return Dispatch::Deferred;
            }
        }

        if !xrc.reciprocal {
            let data = app_payload(&event.private_data, false, true, MAX_APP_DATA_LEN);
            let listener = req.listener;
            self.pending_connreqs.insert(event.id, listener);
            return Dispatch::Handled(QueueEntry::connreq(listener, req, data));
        }

        self.on_reciprocal_request(xrc, event)
    }

    fn resend_sidr_accept(&mut self, ep: EndpointId, id: CmId) {
        let param = self
            .endpoints
            .get(ep.0)
            .and_then(|endpoint| endpoint.xrc.as_ref())
            .and_then(|xrc| xrc.sidr.as_ref())
            .map(|sidr| sidr.accept_param.clone());
        match param {
            Some(param) => match self.cm.accept(id, &param) {
                Ok(()) => self.stats.sidr_resend(),
                Err(err) => warn!(%ep, %id, error = %err, "SIDR accept resend failure"),
            },
            None => warn!(%ep, %id, "SIDR entry without an accept response"),
        }
    }

    fn drop_request(&mut self, id: CmId) -> Dispatch {
        self.cm.destroy_id(id);
        Dispatch::Deferred
    }

    /// Correlates a reciprocal request with the endpoint that sent the
    /// original connect. The request is accepted now if the original leg is
    /// up, otherwise when it comes up.
    fn on_reciprocal_request(&mut self, xrc_info: XrcConnInfo, event: &CmEvent) -> Dispatch {
        let tag = ConnTag(xrc_info.conn_tag);
        let Some(ep) = self.tags.get(tag) else {
            warn!(%tag, "reciprocal XRC connection tag not found");
            return self.drop_request(event.id);
        };
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            warn!(%ep, %tag, "XRC endpoint is not valid");
            self.tags.remove(tag);
            return self.drop_request(event.id);
        };
        let Some(xrc) = endpoint.xrc.as_mut() else {
            return self.drop_request(event.id);
        };
        let Some(setup) = xrc.setup.as_mut() else {
            warn!(%ep, "bad state, no connection data");
            return self.drop_request(event.id);
        };
        if setup.conn_tag != Some(tag) {
            warn!(%ep, %tag, "connection tag mismatch");
            return self.drop_request(event.id);
        }
        if !matches!(
            xrc.conn_state,
            XrcConnState::OrigConnecting | XrcConnState::OrigConnected
        ) {
            warn!(%ep, state = ?xrc.conn_state, "reciprocal request in unexpected state");
            return self.drop_request(event.id);
        }

        // last request wins
        if let Some(old) = endpoint.ids.take(Leg::Reciprocal) {
            warn!(%ep, %old, new = %event.id, "replacing deferred reciprocal request");
            self.owners.remove(&old);
            if let Err(err) = self.cm.reject(old, &[]) {
                debug!(%old, error = %err, "reject of replaced request failed");
            }
            self.cm.destroy_id(old);
        }

        setup.recip_req_seen = true;
        xrc.remote_pep_port = xrc_info.port;
        endpoint.ids.set(Leg::Reciprocal, event.id);
        self.owners.insert(event.id, Owner::Endpoint(ep, Leg::Reciprocal));

        if let Err(err) = self.cm.migrate_id(event.id) {
            warn!(%ep, id = %event.id, error = %err, "could not migrate CM ID");
            if let Err(err) = self.cm.reject(event.id, &[]) {
                debug!(id = %event.id, error = %err, "reject failed");
            }
            self.cm.destroy_id(event.id);
            self.owners.remove(&event.id);
            endpoint.ids.take(Leg::Reciprocal);
            setup.recip_req_seen = false;
            return Dispatch::Deferred;
        }

        if xrc.conn_state == XrcConnState::OrigConnected {
            return self.accept_recip_conn(ep);
        }
        debug!(%ep, %tag, "reciprocal request deferred until original leg connects");
        Dispatch::Deferred
    }

    /// Accepts the deferred or just-arrived reciprocal request. On
    /// connectionless transports this completes the logical connection.
    fn accept_recip_conn(&mut self, ep: EndpointId) -> Dispatch {
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let (Some(xrc), Some(id)) = (endpoint.xrc.as_mut(), endpoint.ids.reciprocal) else {
            return Dispatch::Deferred;
        };
        let Some(setup) = xrc.setup.as_mut() else {
            return Dispatch::Deferred;
        };
        if let Some(tag) = setup.conn_tag.take() {
            self.tags.remove(tag);
        }
        setup.recip_req_seen = false;

        let qp_num = endpoint.qp_num.unwrap_or(0);
        let hdr = XrcCmData {
            reciprocal: true,
            port: endpoint.attr.local_pep_port,
            tgt_qpn: qp_num,
            srqn: endpoint.attr.srqn,
            conn_tag: 0,
        };
        let param = ConnParam {
            private_data: build_private_data(None, Some(&hdr), &EMPTY_CM_DATA),
            qp_num,
        };
        if let Err(err) = self.cm.accept(id, &param) {
            warn!(%ep, %id, error = %err, "reciprocal XRC accept failed");
            return self.connection_error(EventSource::Endpoint(ep), &err.into());
        }
        xrc.conn_state = XrcConnState::RecipConnecting;
        debug!(%ep, %id, "reciprocal XRC connection accepted");

        if !endpoint.attr.port_space.is_connectionless() {
            return Dispatch::Deferred;
        }

        let Some(dest) = endpoint.attr.dest_addr else {
            return Dispatch::Deferred;
        };
        let key = SidrKey::new(dest.ip(), xrc.remote_pep_port, true);
        self.record_sidr(ep, key, param);

        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let Some(xrc) = endpoint.xrc.as_mut() else {
            return Dispatch::Deferred;
        };
        xrc.conn_state = XrcConnState::RecipConnected;
        endpoint.state = EpState::Connected;
        let data = release_setup(&mut self.tags, xrc)
            .map(|setup| setup.event_data)
            .unwrap_or_default();
        debug!(%ep, "SIDR XRC connection established");
        Dispatch::Handled(QueueEntry::new(
            EventKind::Connected,
            EventSource::Endpoint(ep),
            data,
        ))
    }

    /// Remembers the accept response for SIDR retransmissions.
    pub(crate) fn record_sidr(&mut self, ep: EndpointId, key: SidrKey, accept_param: ConnParam) {
        if let Err(err) = self.sidr.insert(key, ep) {
            warn!(%ep, error = %err, "SIDR conn map entry insert error");
            return;
        }
        if let Some(xrc) = self
            .endpoints
            .get_mut(ep.0)
            .and_then(|endpoint| endpoint.xrc.as_mut())
        {
            if let Some(old) = xrc.sidr.replace(SidrEntry { key, accept_param }) {
                self.sidr.remove(&old.key, ep);
            }
        }
    }

    /// Starts the reciprocal leg from the passive side.
    pub(crate) fn start_reciprocal(&mut self, ep: EndpointId) -> EqResult<()> {
        match self.connect_leg(ep, Leg::Reciprocal) {
            Ok(()) => {
                if let Some(xrc) = self
                    .endpoints
                    .get_mut(ep.0)
                    .and_then(|endpoint| endpoint.xrc.as_mut())
                {
                    xrc.conn_state = XrcConnState::RecipConnecting;
                }
                Ok(())
            }
            Err(err) => {
                warn!(%ep, error = %err, "reciprocal XRC connect failed");
                let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
                    return Err(err);
                };
                if let Some(xrc) = endpoint.xrc.as_mut() {
                    xrc.conn_state = XrcConnState::OrigConnecting;
                }
                if let Some(id) = endpoint.ids.original {
                    if let Err(err) = self.cm.disconnect(id) {
                        debug!(%id, error = %err, "disconnect failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub(crate) fn on_xrc_connected(&mut self, ep: EndpointId, leg: Leg, event: &CmEvent) -> Dispatch {
        let Some(xrc) = self
            .endpoints
            .get_mut(ep.0)
            .and_then(|endpoint| endpoint.xrc.as_mut())
        else {
            return Dispatch::Deferred;
        };
        match (xrc.conn_state, leg) {
            (XrcConnState::OrigConnecting, Leg::Original) => {
                xrc.conn_state = XrcConnState::OrigConnected;
                let role = xrc.role;
                debug!(%ep, ?role, "original XRC connection done");
                match role {
                    Some(XrcRole::Active) => self.active_orig_connected(ep, event),
                    Some(XrcRole::Passive) => match self.start_reciprocal(ep) {
                        Ok(()) => Dispatch::Deferred,
                        // the original leg is already being disconnected
                        Err(err) => self.connection_error(EventSource::Endpoint(ep), &err),
                    },
                    None => Dispatch::Deferred,
                }
            }
            (XrcConnState::RecipConnecting, Leg::Reciprocal) => self.recip_connected(ep, event),
            (state, leg) => {
                warn!(%ep, ?state, ?leg, "unexpected XRC connected event");
                Dispatch::Deferred
            }
        }
    }

    fn active_orig_connected(&mut self, ep: EndpointId, event: &CmEvent) -> Dispatch {
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let Some(xrc) = endpoint.xrc.as_mut() else {
            return Dispatch::Deferred;
        };
        let hdr = match XrcCmData::decode(&event.private_data) {
            Ok(hdr) => hdr,
            Err(err) => {
                warn!(%ep, error = %err, "invalid XRC connect response");
                xrc.conn_state = xrc.conn_state.prev();
                if let Err(err) = self.cm.disconnect(event.id) {
                    debug!(id = %event.id, error = %err, "disconnect failed");
                }
                return Dispatch::Deferred;
            }
        };
        xrc.peer_srqn = hdr.srqn;
        xrc.peer_qpn = hdr.tgt_qpn;
        let recip_req_seen = match xrc.setup.as_mut() {
            Some(setup) => {
                setup.event_data = app_payload(&event.private_data, false, true, MAX_APP_DATA_LEN);
                setup.recip_req_seen
            }
            None => false,
        };
        establish_if_needed(self, event);

        if recip_req_seen {
            return self.accept_recip_conn(ep);
        }
        Dispatch::Deferred
    }

    fn recip_connected(&mut self, ep: EndpointId, event: &CmEvent) -> Dispatch {
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let Some(xrc) = endpoint.xrc.as_mut() else {
            return Dispatch::Deferred;
        };
        xrc.conn_state = XrcConnState::RecipConnected;

        // the passive side initiated this leg and gets the peer's header back
        let mismatch = if xrc.role == Some(XrcRole::Passive) {
            match XrcCmData::decode(&event.private_data) {
                Ok(hdr) => {
                    xrc.peer_srqn = hdr.srqn;
                    xrc.peer_qpn = hdr.tgt_qpn;
                    false
                }
                Err(err) => {
                    warn!(%ep, error = %err, "reciprocal connection protocol mismatch");
                    true
                }
            }
        } else {
            false
        };

        let data = release_setup(&mut self.tags, xrc)
            .map(|setup| setup.event_data)
            .unwrap_or_default();
        if mismatch {
            xrc.conn_state = XrcConnState::Error;
            endpoint.state = EpState::Error;
            return Dispatch::Error(ErrorEntry::new(
                EventSource::Endpoint(ep),
                ErrorCode::Protocol,
                ErrorCode::Protocol.errno(),
            ));
        }
        endpoint.state = EpState::Connected;
        if xrc.role == Some(XrcRole::Passive) {
            establish_if_needed(self, event);
        }
        debug!(%ep, "reciprocal XRC connection done");
        Dispatch::Handled(QueueEntry::new(
            EventKind::Connected,
            EventSource::Endpoint(ep),
            data,
        ))
    }

    /// Disconnect on one leg tears down the paired leg.
    pub(crate) fn on_xrc_disconnected(&mut self, ep: EndpointId, id: CmId) {
        let Some(endpoint) = self.endpoints.get(ep.0) else {
            return;
        };
        let paired: Vec<CmId> = endpoint.ids.iter().filter(|other| *other != id).collect();
        for other in paired {
            debug!(%ep, %other, "disconnecting paired XRC leg");
            if let Err(err) = self.cm.disconnect(other) {
                debug!(%other, error = %err, "disconnect failed");
            }
        }
    }

    /// Releases the identifier of one leg; ancillary state goes once both
    /// legs are released, whichever order they come in.
    pub(crate) fn on_xrc_timewait(&mut self, ep: EndpointId, leg: Leg, id: CmId) {
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return;
        };
        if endpoint.ids.get(leg) == Some(id) {
            endpoint.ids.take(leg);
            self.owners.remove(&id);
            self.cm.destroy_id(id);
        }
        if endpoint.ids.live() != LiveLegs::None {
            return;
        }
        if let Some(xrc) = endpoint.xrc.as_mut() {
            release_setup(&mut self.tags, xrc);
            if let Some(sidr) = xrc.sidr.take() {
                self.sidr.remove(&sidr.key, ep);
            }
        }
        debug!(%ep, "XRC connection resources released");
    }

    pub(crate) fn on_xrc_rejected(&mut self, ep: EndpointId, event: &CmEvent) -> Dispatch {
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let Some(xrc) = endpoint.xrc.as_mut() else {
            return Dispatch::Deferred;
        };
        let state = xrc.conn_state;
        if endpoint.ids.get(xrc.initiator_leg()) != Some(event.id)
            || !matches!(
                state,
                XrcConnState::OrigConnecting | XrcConnState::RecipConnecting
            )
        {
            warn!(%ep, status = event.status, "stale or invalid CM reject received");
            return Dispatch::Deferred;
        }

        let class = RejectClass::from_status(event.status);
        match class {
            RejectClass::PeerApplication => {
                if !event.private_data.is_empty()
                    && XrcCmData::decode(&event.private_data).is_err()
                {
                    warn!(%ep, "CM reject private data not valid");
                    return Dispatch::Deferred;
                }
            }
            RejectClass::Infrastructure => {
                warn!(%ep, status = event.status, "non-application generated CM reject");
                if !event.private_data.is_empty() {
                    warn!(%ep, "unexpected CM reject private data");
                }
                if state != XrcConnState::OrigConnecting {
                    xrc.conn_state = XrcConnState::Error;
                    return Dispatch::Deferred;
                }
            }
        }
        xrc.conn_state = XrcConnState::Error;

        Dispatch::Error(ErrorEntry {
            data: decode_cm_data(skip_xrc_cm_data(&event.private_data), MAX_APP_DATA_LEN),
            reject: Some(class),
            ..ErrorEntry::new(
                EventSource::Endpoint(ep),
                ErrorCode::ConnectionRefused,
                errno_of(event.status),
            )
        })
    }

    pub(crate) fn on_xrc_cm_error(
        &mut self,
        ep: EndpointId,
        leg: Leg,
        event: &CmEvent,
        prev_state: EpState,
    ) -> Dispatch {
        let Some(endpoint) = self.endpoints.get(ep.0) else {
            return Dispatch::Deferred;
        };
        let Some(xrc) = endpoint.xrc.as_ref() else {
            return Dispatch::Deferred;
        };
        let initiator = xrc.initiator_leg();
        let is_initiator = leg == initiator;
        // connect errors are reported on either side, everything else on
        // the active side only
        if !is_initiator && event.kind != CmEventKind::ConnectError {
            warn!(%ep, kind = ?event.kind, "CM error not valid for endpoint");
            return Dispatch::Deferred;
        }

        let can_retry = is_initiator
            && xrc
                .setup
                .as_ref()
                .is_some_and(|setup| setup.retry_count < self.max_connect_retries);
        if can_retry {
            match self.retry_connect(ep, leg, event.id, prev_state) {
                Ok(()) => return Dispatch::Deferred,
                Err(err) => warn!(%ep, error = %err, "XRC connect retry failed"),
            }
        }

        warn!(%ep, kind = ?event.kind, status = event.status, "XRC connection error");
        if let Some(xrc) = self
            .endpoints
            .get_mut(ep.0)
            .and_then(|endpoint| endpoint.xrc.as_mut())
        {
            xrc.conn_state = XrcConnState::Error;
        }
        Dispatch::Handled(QueueEntry::new(
            EventKind::Shutdown,
            EventSource::Endpoint(ep),
            Bytes::new(),
        ))
    }

    /// Releases the failed identifier and its tag, then reissues the same
    /// connect on a fresh identifier.
    fn retry_connect(
        &mut self,
        ep: EndpointId,
        leg: Leg,
        id: CmId,
        prev_state: EpState,
    ) -> EqResult<()> {
        self.owners.remove(&id);
        self.cm.destroy_id(id);
        self.clear_conn_tag(ep);

        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        endpoint.ids.take(leg);
        let setup = endpoint
            .xrc
            .as_mut()
            .and_then(|xrc| xrc.setup.as_mut())
            .ok_or_else(|| EqError::InvalidArgument("no XRC connection setup".to_string()))?;
        setup.retry_count += 1;
        debug!(%ep, ?leg, retry = setup.retry_count, "retrying XRC connect");
        if leg == Leg::Reciprocal {
            endpoint.state = prev_state;
        }
        self.stats.xrc_retry();
        self.connect_leg(ep, leg)
    }
}
