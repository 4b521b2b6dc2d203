//! Connection manager event translator.
//!
//! Each raw event is dispatched by kind and yields exactly one [`Dispatch`]
//! outcome: a visible entry, nothing (the event was consumed internally), or
//! a structured error for the queue's error slot. XRC endpoints are routed
//! through the handlers in [`crate::xrc`]. Every method runs with the queue's
//! `event_lock` held, which is what serialises endpoint, tag table and SIDR
//! map mutation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::arena::Arena;
use crate::cm::{
    AddressFormat, CmEvent, CmEventKind, CmId, ConnParam, ConnectionManager, EndpointResources,
    PortSpace, RecvWorkRequest,
};
use crate::config::EqConfig;
use crate::conn_tag::TagTable;
use crate::connreq::{build_conn_request, ConnRequest, ConnectionHints};
use crate::endpoint::{
    Endpoint, EndpointAttr, EndpointId, EndpointStatus, EpState, Leg, Listener, ListenerId,
    XrcConnState, XrcRole, XrcSetup,
};
use crate::eq::{ErrorEntry, EventKind, EventSource, QueueEntry};
use crate::error::{EqError, EqResult, ErrorCode};
use crate::private_data::{
    app_payload, build_private_data, decode_cm_data, encode_cm_data, encode_preamble, XrcCmData,
    EMPTY_CM_DATA, MAX_APP_DATA_LEN,
};
use crate::sidr::{SidrKey, SidrMap};
use crate::stats::EqStats;
use crate::xrc::RejectClass;

/// Outcome of translating one raw event.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Deliver this entry.
    Handled(QueueEntry),
    /// Consumed internally; keep pulling.
    Deferred,
    /// Record this error.
    Error(ErrorEntry),
}

/// What a connection identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Endpoint(EndpointId, Leg),
    Listener(ListenerId),
}

pub(crate) struct Translator {
    pub(crate) cm: Box<dyn ConnectionManager>,
    pub(crate) resources: Box<dyn EndpointResources>,
    pub(crate) stats: Arc<EqStats>,
    pub(crate) endpoints: Arena<Endpoint>,
    pub(crate) listeners: Arena<Listener>,
    pub(crate) owners: HashMap<CmId, Owner>,
    /// Connect requests surfaced to the application and not yet answered.
    pub(crate) pending_connreqs: HashMap<CmId, ListenerId>,
    pub(crate) tags: TagTable,
    pub(crate) sidr: SidrMap,
    pub(crate) max_connect_retries: u32,
    resolve_timeout: Duration,
}

/// Provider errno carried by a connection manager status. Statuses are
/// negated errnos; the sign is dropped without overflowing on `i32::MIN`.
pub(crate) fn errno_of(status: i32) -> i32 {
    status.saturating_neg()
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("endpoints", &self.endpoints.len())
            .field("listeners", &self.listeners.len())
            .field("tags", &self.tags.len())
            .field("sidr", &self.sidr.len())
            .finish()
    }
}

impl Translator {
    pub(crate) fn new(
        config: &EqConfig,
        cm: Box<dyn ConnectionManager>,
        resources: Box<dyn EndpointResources>,
        stats: Arc<EqStats>,
    ) -> Self {
        Self {
            cm,
            resources,
            stats,
            endpoints: Arena::new(),
            listeners: Arena::new(),
            owners: HashMap::new(),
            pending_connreqs: HashMap::new(),
            tags: TagTable::new(config.xrc.conn_tag_index_bits),
            sidr: SidrMap::new(),
            max_connect_retries: config.xrc.max_connect_retries,
            resolve_timeout: config.resolve_timeout(),
        }
    }

    pub(crate) fn next_raw(&mut self) -> Option<CmEvent> {
        self.cm.get_event()
    }

    /// Translates one raw event.
    pub(crate) fn process(&mut self, event: CmEvent) -> Dispatch {
        self.stats.raw_event();
        trace!(kind = ?event.kind, id = %event.id, status = event.status, "cm event");
        match event.kind {
            CmEventKind::AddrResolved => self.on_addr_resolved(&event),
            CmEventKind::RouteResolved => self.on_route_resolved(&event),
            CmEventKind::ConnectRequest => self.on_connect_request(&event),
            CmEventKind::ConnectResponse | CmEventKind::Established => self.on_connected(&event),
            CmEventKind::Disconnected => self.on_disconnected(&event),
            CmEventKind::TimewaitExit => self.on_timewait_exit(&event),
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::ConnectError
            | CmEventKind::Unreachable => self.on_cm_error(&event),
            CmEventKind::Rejected => self.on_rejected(&event),
            CmEventKind::DeviceRemoval => self.fatal(&event, ErrorCode::NoDevice),
            CmEventKind::AddrChange => self.fatal(&event, ErrorCode::AddressNotAvailable),
            CmEventKind::Unknown(code) => {
                self.stats.unknown();
                warn!(code, id = %event.id, "unknown connection manager event");
                Dispatch::Deferred
            }
        }
    }

    fn lookup(&self, event: &CmEvent) -> Option<(EndpointId, Leg)> {
        match self.owners.get(&event.id) {
            Some(Owner::Endpoint(ep, leg)) if self.endpoints.contains(ep.0) => Some((*ep, *leg)),
            _ => {
                warn!(id = %event.id, kind = ?event.kind, "event for unknown connection identifier");
                None
            }
        }
    }

    fn source_of(&self, id: CmId) -> EventSource {
        match self.owners.get(&id) {
            Some(Owner::Endpoint(ep, _)) => EventSource::Endpoint(*ep),
            Some(Owner::Listener(listener)) => EventSource::Listener(*listener),
            None => EventSource::None,
        }
    }

    pub(crate) fn connection_error(&self, source: EventSource, err: &EqError) -> Dispatch {
        Dispatch::Error(ErrorEntry::new(source, err.code(), err.prov_errno()))
    }

    fn set_state(&mut self, ep: EndpointId, state: EpState) {
        if let Some(endpoint) = self.endpoints.get_mut(ep.0) {
            endpoint.state = state;
        }
    }

    fn on_addr_resolved(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, leg)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        if let Err(err) = self.resolve_route_for(ep, leg, event.id) {
            warn!(%ep, id = %event.id, error = %err, "address resolved handling failed");
            self.set_state(ep, EpState::Disconnected);
            return self.connection_error(EventSource::Endpoint(ep), &err);
        }
        Dispatch::Deferred
    }

    fn resolve_route_for(&mut self, ep: EndpointId, leg: Leg, id: CmId) -> EqResult<()> {
        // the reciprocal leg reuses the resource created for the original
        if leg == Leg::Original {
            self.prepare_transport(ep, id)?;
            self.set_state(ep, EpState::ResolvingRoute);
        }
        self.cm.resolve_route(id, self.resolve_timeout)?;
        Ok(())
    }

    /// Creates the transport resource once and replays pre-posted receives.
    pub(crate) fn prepare_transport(&mut self, ep: EndpointId, id: CmId) -> EqResult<()> {
        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        if endpoint.qp_num.is_none() {
            endpoint.qp_num = Some(self.resources.create_transport_resource(ep, id)?);
        }
        while let Some(wr) = endpoint.prepost.front() {
            self.resources.post_recv(ep, wr)?;
            endpoint.prepost.pop_front();
        }
        Ok(())
    }

    fn on_route_resolved(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, leg)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        if let Err(err) = self.issue_connect(ep, leg, event) {
            warn!(%ep, id = %event.id, error = %err, "connect failed");
            self.set_state(ep, EpState::Disconnected);
            return self.connection_error(EventSource::Endpoint(ep), &err);
        }
        Dispatch::Deferred
    }

    fn issue_connect(&mut self, ep: EndpointId, leg: Leg, event: &CmEvent) -> EqResult<()> {
        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        let qp_num = endpoint.qp_num.unwrap_or(0);
        let private_data = match endpoint.xrc.as_ref() {
            None => {
                let preamble = event
                    .route
                    .as_ref()
                    .filter(|route| route.format == AddressFormat::Ib)
                    .map(|route| encode_preamble(route.src, route.dst));
                build_private_data(preamble, None, &endpoint.conn_data)
            }
            Some(xrc) => {
                let setup = xrc.setup.as_ref().ok_or_else(|| {
                    EqError::InvalidArgument("no XRC connection setup in progress".to_string())
                })?;
                let conn_tag = match leg {
                    Leg::Original => setup.conn_tag.map(|tag| tag.0),
                    Leg::Reciprocal => setup.peer_tag,
                };
                let hdr = XrcCmData {
                    reciprocal: leg == Leg::Reciprocal,
                    port: endpoint.attr.local_pep_port,
                    tgt_qpn: qp_num,
                    srqn: endpoint.attr.srqn,
                    conn_tag: conn_tag.unwrap_or(0),
                };
                build_private_data(None, Some(&hdr), &setup.pending_param)
            }
        };
        if leg == Leg::Original {
            endpoint.state = EpState::Connecting;
        }
        self.cm.connect(
            event.id,
            &ConnParam {
                private_data,
                qp_num,
            },
        )?;
        Ok(())
    }

    fn on_connect_request(&mut self, event: &CmEvent) -> Dispatch {
        let listener = match event.listen_id.and_then(|id| self.owners.get(&id)) {
            Some(Owner::Listener(listener)) if self.listeners.contains(listener.0) => *listener,
            _ => {
                warn!(id = %event.id, "connect request for unknown listener");
                self.cm.destroy_id(event.id);
                return Dispatch::Deferred;
            }
        };
        let Some(hints) = self.listeners.get(listener.0).map(|l| l.hints.clone()) else {
            return Dispatch::Deferred;
        };
        let req = match build_conn_request(listener, &hints, event) {
            Ok(req) => req,
            Err(err) => {
                warn!(%listener, id = %event.id, error = %err, "cannot build connect request");
                self.cm.destroy_id(event.id);
                return self.connection_error(EventSource::Listener(listener), &err);
            }
        };
        if let Some(xrc) = req.xrc {
            return self.on_xrc_connect_request(req, xrc, event);
        }
        let preamble = req.info.address_format == AddressFormat::Ib;
        let data = app_payload(&event.private_data, preamble, false, MAX_APP_DATA_LEN);
        self.pending_connreqs.insert(event.id, listener);
        Dispatch::Handled(QueueEntry::connreq(listener, req, data))
    }

    fn on_connected(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, leg)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        self.pending_connreqs.remove(&event.id);
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        if endpoint.is_xrc() {
            return self.on_xrc_connected(ep, leg, event);
        }
        endpoint.state = EpState::Connected;
        debug!(%ep, id = %event.id, "connected");
        let data = app_payload(&event.private_data, false, false, MAX_APP_DATA_LEN);
        Dispatch::Handled(QueueEntry::new(
            EventKind::Connected,
            EventSource::Endpoint(ep),
            data,
        ))
    }

    fn on_disconnected(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, _)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        // a transfer error already produced the shutdown
        if endpoint.state == EpState::Disconnected {
            return Dispatch::Deferred;
        }
        endpoint.state = EpState::Disconnected;
        if endpoint.is_xrc() {
            self.on_xrc_disconnected(ep, event.id);
            return Dispatch::Deferred;
        }
        debug!(%ep, id = %event.id, "disconnected");
        Dispatch::Handled(QueueEntry::new(
            EventKind::Shutdown,
            EventSource::Endpoint(ep),
            Bytes::new(),
        ))
    }

    fn on_timewait_exit(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, leg)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        if self.endpoints.get(ep.0).is_some_and(|e| e.is_xrc()) {
            self.on_xrc_timewait(ep, leg, event.id);
        }
        Dispatch::Deferred
    }

    fn on_cm_error(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, leg)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        let prev_state = endpoint.state;
        endpoint.state = EpState::Disconnected;
        if endpoint.is_xrc() {
            // SIDR rejects arrive as unreachable with a non-negative status
            if event.port_space.is_connectionless()
                && event.kind == CmEventKind::Unreachable
                && event.status >= 0
            {
                self.stats.reject();
                return self.on_xrc_rejected(ep, event);
            }
            return self.on_xrc_cm_error(ep, leg, event, prev_state);
        }
        warn!(%ep, kind = ?event.kind, status = event.status, "connection error");
        Dispatch::Error(ErrorEntry::new(
            EventSource::Endpoint(ep),
            ErrorCode::TimedOut,
            errno_of(event.status),
        ))
    }

    fn on_rejected(&mut self, event: &CmEvent) -> Dispatch {
        let Some((ep, _)) = self.lookup(event) else {
            return Dispatch::Deferred;
        };
        self.stats.reject();
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Dispatch::Deferred;
        };
        endpoint.state = EpState::Disconnected;
        if endpoint.is_xrc() {
            return self.on_xrc_rejected(ep, event);
        }
        debug!(%ep, status = event.status, "connect rejected");
        Dispatch::Error(ErrorEntry {
            data: decode_cm_data(&event.private_data, MAX_APP_DATA_LEN),
            reject: Some(RejectClass::from_status(event.status)),
            ..ErrorEntry::new(
                EventSource::Endpoint(ep),
                ErrorCode::ConnectionRefused,
                errno_of(event.status),
            )
        })
    }

    fn fatal(&mut self, event: &CmEvent, code: ErrorCode) -> Dispatch {
        let source = self.source_of(event.id);
        if let EventSource::Endpoint(ep) = source {
            self.set_state(ep, EpState::Error);
        }
        warn!(id = %event.id, ?source, %code, "fatal connection manager event");
        let prov_errno = if event.status < 0 { errno_of(event.status) } else { 0 };
        Dispatch::Error(ErrorEntry::new(source, code, prov_errno))
    }

    pub(crate) fn create_endpoint(&mut self, attr: EndpointAttr) -> EndpointId {
        let ep = EndpointId(self.endpoints.insert(Endpoint::new(attr)));
        debug!(%ep, "endpoint created");
        ep
    }

    pub(crate) fn listen(
        &mut self,
        addr: SocketAddr,
        port_space: PortSpace,
        hints: ConnectionHints,
    ) -> EqResult<ListenerId> {
        let id = self.cm.create_id(port_space)?;
        if let Err(err) = self.cm.listen(id, addr) {
            self.cm.destroy_id(id);
            return Err(err.into());
        }
        let listener = ListenerId(self.listeners.insert(Listener { id, hints }));
        self.owners.insert(id, Owner::Listener(listener));
        info!(%listener, %addr, "listening");
        Ok(listener)
    }

    pub(crate) fn destroy_listener(&mut self, listener: ListenerId) -> EqResult<()> {
        let removed = self
            .listeners
            .remove(listener.0)
            .ok_or(EqError::StaleHandle)?;
        self.owners.remove(&removed.id);
        self.cm.destroy_id(removed.id);
        let orphaned: Vec<CmId> = self
            .pending_connreqs
            .iter()
            .filter(|(_, l)| **l == listener)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            self.pending_connreqs.remove(&id);
            self.cm.destroy_id(id);
        }
        Ok(())
    }

    pub(crate) fn prepost_recv(&mut self, ep: EndpointId, wr: RecvWorkRequest) -> EqResult<()> {
        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        if endpoint.qp_num.is_some() {
            self.resources.post_recv(ep, &wr)?;
        } else {
            endpoint.prepost.push_back(wr);
        }
        Ok(())
    }

    pub(crate) fn connect(&mut self, ep: EndpointId, data: &[u8]) -> EqResult<()> {
        let cm_data = encode_cm_data(data)?;
        let endpoint = self.endpoints.get(ep.0).ok_or(EqError::StaleHandle)?;
        if !matches!(
            endpoint.state,
            EpState::Idle | EpState::Disconnected | EpState::Error
        ) {
            return Err(EqError::InvalidArgument(format!(
                "cannot connect endpoint in state {:?}",
                endpoint.state
            )));
        }
        if endpoint.attr.dest_addr.is_none() {
            return Err(EqError::InvalidArgument(
                "endpoint has no destination address".to_string(),
            ));
        }
        self.release_ids(ep);

        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return Err(EqError::StaleHandle);
        };
        match endpoint.xrc.as_mut() {
            Some(xrc) => {
                xrc.role = Some(XrcRole::Active);
                xrc.conn_state = XrcConnState::OrigConnecting;
                xrc.setup = Some(XrcSetup::new(cm_data));
            }
            None => endpoint.conn_data = cm_data,
        }

        if let Err(err) = self.connect_leg(ep, Leg::Original) {
            if let Some(endpoint) = self.endpoints.get_mut(ep.0) {
                endpoint.state = EpState::Disconnected;
                if let Some(xrc) = endpoint.xrc.as_mut() {
                    xrc.conn_state = XrcConnState::Idle;
                    xrc.setup = None;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Starts address resolution for one leg on a fresh identifier. The
    /// original leg of an active XRC endpoint registers its tag first.
    pub(crate) fn connect_leg(&mut self, ep: EndpointId, leg: Leg) -> EqResult<()> {
        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        let dest = endpoint.attr.dest_addr.ok_or_else(|| {
            EqError::InvalidArgument("endpoint has no destination address".to_string())
        })?;
        let dest = match (leg, endpoint.xrc.as_ref()) {
            (Leg::Reciprocal, Some(xrc)) => SocketAddr::new(dest.ip(), xrc.remote_pep_port),
            _ => dest,
        };
        let src = endpoint.attr.src_addr;

        if leg == Leg::Original {
            if let Some(xrc) = endpoint.xrc.as_mut() {
                if let (Some(XrcRole::Active), Some(setup)) = (xrc.role, xrc.setup.as_mut()) {
                    if setup.conn_tag.is_none() {
                        setup.conn_tag = Some(self.tags.insert(ep)?);
                    }
                }
            }
        }

        let id = match self.cm.create_id(endpoint.attr.port_space) {
            Ok(id) => id,
            Err(err) => {
                self.clear_conn_tag(ep);
                return Err(err.into());
            }
        };
        endpoint.ids.set(leg, id);
        self.owners.insert(id, Owner::Endpoint(ep, leg));

        if let Err(err) = self.cm.resolve_addr(id, src, dest, self.resolve_timeout) {
            self.abandon_leg(ep, leg);
            return Err(err.into());
        }
        if leg == Leg::Original {
            self.set_state(ep, EpState::ResolvingAddress);
        }
        debug!(%ep, ?leg, %id, %dest, "resolving address");
        Ok(())
    }

    fn abandon_leg(&mut self, ep: EndpointId, leg: Leg) {
        if let Some(id) = self
            .endpoints
            .get_mut(ep.0)
            .and_then(|endpoint| endpoint.ids.take(leg))
        {
            self.owners.remove(&id);
            self.cm.destroy_id(id);
        }
        if leg == Leg::Original {
            self.clear_conn_tag(ep);
        }
    }

    pub(crate) fn clear_conn_tag(&mut self, ep: EndpointId) {
        let tag = self
            .endpoints
            .get_mut(ep.0)
            .and_then(|endpoint| endpoint.xrc.as_mut())
            .and_then(|xrc| xrc.setup.as_mut())
            .and_then(|setup| setup.conn_tag.take());
        if let Some(tag) = tag {
            if self.tags.remove(tag).is_none() {
                warn!(%ep, %tag, "invalid XRC connection tag");
            }
        }
    }

    /// Destroys every identifier an endpoint still holds.
    fn release_ids(&mut self, ep: EndpointId) {
        self.clear_conn_tag(ep);
        let Some(endpoint) = self.endpoints.get_mut(ep.0) else {
            return;
        };
        for leg in [Leg::Original, Leg::Reciprocal] {
            if let Some(id) = endpoint.ids.take(leg) {
                self.owners.remove(&id);
                self.cm.destroy_id(id);
            }
        }
    }

    /// Accepts `req` on a fresh endpoint. Nothing is committed until the
    /// accept has been sent, so a failed accept leaves the request pending.
    pub(crate) fn accept(&mut self, ep: EndpointId, req: &ConnRequest, data: &[u8]) -> EqResult<()> {
        let cm_data = encode_cm_data(data)?;
        if self.pending_connreqs.get(&req.id) != Some(&req.listener) {
            return Err(EqError::InvalidArgument(format!(
                "connect request {} is not pending",
                req.id
            )));
        }
        let endpoint = self.endpoints.get(ep.0).ok_or(EqError::StaleHandle)?;
        if endpoint.state != EpState::Idle {
            return Err(EqError::InvalidArgument(format!(
                "cannot accept on endpoint in state {:?}",
                endpoint.state
            )));
        }
        if endpoint.is_xrc() != req.is_xrc() {
            return Err(EqError::InvalidArgument(
                "endpoint type does not match the request".to_string(),
            ));
        }

        self.prepare_transport(ep, req.id)?;

        let endpoint = self.endpoints.get_mut(ep.0).ok_or(EqError::StaleHandle)?;
        let qp_num = endpoint.qp_num.unwrap_or(0);
        let param = match req.xrc {
            Some(peer) => {
                let hdr = XrcCmData {
                    reciprocal: false,
                    port: endpoint.attr.local_pep_port,
                    tgt_qpn: qp_num,
                    srqn: endpoint.attr.srqn,
                    conn_tag: peer.conn_tag,
                };
                ConnParam {
                    private_data: build_private_data(None, Some(&hdr), &cm_data),
                    qp_num,
                }
            }
            None => ConnParam {
                private_data: cm_data,
                qp_num,
            },
        };
        self.cm.accept(req.id, &param)?;

        self.pending_connreqs.remove(&req.id);
        self.owners.insert(req.id, Owner::Endpoint(ep, Leg::Original));
        endpoint.ids.set(Leg::Original, req.id);
        endpoint.state = EpState::Accepting;
        endpoint.attr.port_space = req.info.port_space;
        endpoint.attr.dest_addr = Some(match req.xrc {
            Some(xrc) => SocketAddr::new(req.info.dest_addr.ip(), xrc.port),
            None => req.info.dest_addr,
        });

        let (Some(xrc), Some(peer)) = (endpoint.xrc.as_mut(), req.xrc) else {
            debug!(%ep, id = %req.id, "accepted");
            return Ok(());
        };
        let mut setup = XrcSetup::new(Bytes::from_static(&EMPTY_CM_DATA));
        setup.peer_tag = Some(peer.conn_tag);
        xrc.role = Some(XrcRole::Passive);
        xrc.conn_state = XrcConnState::OrigConnecting;
        xrc.setup = Some(setup);
        xrc.peer_srqn = peer.peer_srqn;
        xrc.peer_qpn = peer.tgt_qpn;
        xrc.remote_pep_port = peer.port;
        debug!(%ep, id = %req.id, tag = peer.conn_tag, "accepted original XRC connection");

        if req.info.port_space.is_connectionless() {
            let key = SidrKey::new(req.info.dest_addr.ip(), peer.port, false);
            self.record_sidr(ep, key, param);
            // a SIDR accept completes the original leg
            if let Some(xrc) = self
                .endpoints
                .get_mut(ep.0)
                .and_then(|endpoint| endpoint.xrc.as_mut())
            {
                xrc.conn_state = XrcConnState::OrigConnected;
            }
            self.start_reciprocal(ep)?;
        }
        Ok(())
    }

    pub(crate) fn reject(&mut self, req: &ConnRequest, data: &[u8]) -> EqResult<()> {
        if self.pending_connreqs.get(&req.id) != Some(&req.listener) {
            return Err(EqError::InvalidArgument(format!(
                "connect request {} is not pending",
                req.id
            )));
        }
        let cm_data = encode_cm_data(data)?;
        self.pending_connreqs.remove(&req.id);
        let payload = match req.xrc {
            Some(peer) => {
                let hdr = XrcCmData {
                    reciprocal: peer.reciprocal,
                    conn_tag: peer.conn_tag,
                    ..XrcCmData::default()
                };
                build_private_data(None, Some(&hdr), &cm_data)
            }
            None => cm_data,
        };
        let result = self.cm.reject(req.id, &payload);
        self.cm.destroy_id(req.id);
        debug!(id = %req.id, "connect request rejected");
        result.map_err(EqError::from)
    }

    pub(crate) fn shutdown(&mut self, ep: EndpointId) -> EqResult<()> {
        let endpoint = self.endpoints.get(ep.0).ok_or(EqError::StaleHandle)?;
        let ids: Vec<CmId> = endpoint.ids.iter().collect();
        for id in ids {
            self.cm.disconnect(id)?;
        }
        Ok(())
    }

    pub(crate) fn destroy_endpoint(&mut self, ep: EndpointId) -> EqResult<()> {
        let endpoint = self.endpoints.remove(ep.0).ok_or(EqError::StaleHandle)?;
        for id in endpoint.ids.iter() {
            self.owners.remove(&id);
            self.pending_connreqs.remove(&id);
            self.cm.destroy_id(id);
        }
        if let Some(xrc) = endpoint.xrc {
            if let Some(tag) = xrc.setup.and_then(|setup| setup.conn_tag) {
                self.tags.remove(tag);
            }
            if let Some(sidr) = xrc.sidr {
                self.sidr.remove(&sidr.key, ep);
            }
        }
        debug!(%ep, "endpoint destroyed");
        Ok(())
    }

    pub(crate) fn endpoint_status(&self, ep: EndpointId) -> EqResult<EndpointStatus> {
        self.endpoints
            .get(ep.0)
            .map(Endpoint::status)
            .ok_or(EqError::StaleHandle)
    }

    /// Drops tag and SIDR tables at close.
    pub(crate) fn teardown(&mut self) {
        if !self.sidr.is_empty() {
            warn!(entries = self.sidr.len(), "SIDR connection map not empty at close");
        }
        self.tags.clear();
        self.sidr.clear();
        self.pending_connreqs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::RouteInfo;
    use crate::connreq::EpProtocol;
    use crate::sim::{SimCm, SimCommand, SimOp};

    fn translator(sim: &SimCm) -> Translator {
        Translator::new(
            &EqConfig::default(),
            Box::new(sim.clone()),
            Box::new(sim.clone()),
            Arc::new(EqStats::new()),
        )
    }

    fn route() -> RouteInfo {
        RouteInfo {
            src: "10.0.0.1:40000".parse().unwrap(),
            dst: "10.0.0.2:7000".parse().unwrap(),
            device: "mlx5_0".to_string(),
            format: AddressFormat::Ip,
        }
    }

    fn active_msg(t: &mut Translator, sim: &SimCm) -> (EndpointId, CmId) {
        let ep = t.create_endpoint(EndpointAttr::msg(Some("10.0.0.2:7000".parse().unwrap())));
        t.connect(ep, b"hello").unwrap();
        let id = t.endpoints.get(ep.0).unwrap().ids.original.unwrap();
        assert!(sim.commands().contains(&SimCommand::ResolveAddr {
            id,
            dst: "10.0.0.2:7000".parse().unwrap()
        }));
        (ep, id)
    }

    /// Surfaces an inbound plain connect request on `id`.
    fn inbound_request(t: &mut Translator, id: CmId) -> ConnRequest {
        let listener = t
            .listen(
                "10.0.0.2:7000".parse().unwrap(),
                PortSpace::Tcp,
                ConnectionHints::any(EpProtocol::RdmaCm),
            )
            .unwrap();
        let listen_id = t.listeners.get(listener.0).unwrap().id;
        let event = CmEvent::new(CmEventKind::ConnectRequest, id)
            .with_listen_id(listen_id)
            .with_route(route())
            .with_qp_num(0x42)
            .with_private_data(encode_cm_data(b"hi").unwrap());
        match t.process(event) {
            Dispatch::Handled(entry) => entry.info.unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_accept_leaves_request_pending() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let req = inbound_request(&mut t, CmId(500));
        assert_eq!(req.peer_qpn(), 0x42);
        let ep = t.create_endpoint(EndpointAttr::msg(None));

        sim.fail_once(SimOp::CreateResource, 12);
        assert!(matches!(t.accept(ep, &req, b"ok"), Err(EqError::Cm(_))));
        let status = t.endpoint_status(ep).unwrap();
        assert_eq!(status.state, EpState::Idle);
        assert_eq!(status.ids.original, None);
        assert!(!t.owners.contains_key(&CmId(500)));

        sim.fail_once(SimOp::Accept, 104);
        assert!(t.accept(ep, &req, b"ok").is_err());
        assert_eq!(t.endpoint_status(ep).unwrap().state, EpState::Idle);
        assert_eq!(sim.accept_count(CmId(500)), 0);

        t.accept(ep, &req, b"ok").unwrap();
        let status = t.endpoint_status(ep).unwrap();
        assert_eq!(status.state, EpState::Accepting);
        assert_eq!(status.ids.original, Some(CmId(500)));
        assert_eq!(sim.accept_count(CmId(500)), 1);
        assert!(t.pending_connreqs.is_empty());
    }

    #[test]
    fn test_failed_accept_can_still_be_rejected() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let req = inbound_request(&mut t, CmId(501));
        let ep = t.create_endpoint(EndpointAttr::msg(None));

        sim.fail_once(SimOp::Accept, 104);
        assert!(t.accept(ep, &req, b"ok").is_err());
        t.reject(&req, b"no").unwrap();
        assert!(sim.is_destroyed(CmId(501)));
        assert!(t.pending_connreqs.is_empty());
    }

    #[test]
    fn test_extreme_status_does_not_overflow() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (_ep, id) = active_msg(&mut t, &sim);
        match t.process(CmEvent::new(CmEventKind::Rejected, id).with_status(i32::MIN)) {
            Dispatch::Error(err) => {
                assert_eq!(err.prov_errno, i32::MAX);
                assert_eq!(err.reject, Some(RejectClass::Infrastructure));
            }
            other => panic!("unexpected {:?}", other),
        }

        let (_ep, id) = active_msg(&mut t, &sim);
        match t.process(CmEvent::new(CmEventKind::RouteError, id).with_status(i32::MIN)) {
            Dispatch::Error(err) => assert_eq!(err.prov_errno, i32::MAX),
            other => panic!("unexpected {:?}", other),
        }
        match t.process(CmEvent::new(CmEventKind::DeviceRemoval, id).with_status(i32::MIN)) {
            Dispatch::Error(err) => {
                assert_eq!(err.code, ErrorCode::NoDevice);
                assert_eq!(err.prov_errno, i32::MAX);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_msg_active_connect_flow() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let wr = RecvWorkRequest {
            wr_id: 5,
            sg_list: Vec::new(),
        };
        let (ep, id) = active_msg(&mut t, &sim);
        t.prepost_recv(ep, wr).unwrap();
        assert_eq!(t.endpoint_status(ep).unwrap().preposted, 1);

        let d = t.process(CmEvent::new(CmEventKind::AddrResolved, id));
        assert!(matches!(d, Dispatch::Deferred));
        let status = t.endpoint_status(ep).unwrap();
        assert_eq!(status.state, EpState::ResolvingRoute);
        assert_eq!(status.preposted, 0);
        assert!(status.qp_num.is_some());
        assert!(sim.commands().contains(&SimCommand::PostRecv { ep, wr_id: 5 }));

        let d = t.process(CmEvent::new(CmEventKind::RouteResolved, id).with_route(route()));
        assert!(matches!(d, Dispatch::Deferred));
        assert_eq!(t.endpoint_status(ep).unwrap().state, EpState::Connecting);
        let param = sim.connect_param(id).unwrap();
        assert_eq!(decode_cm_data(&param.private_data, 64).as_ref(), b"hello");

        let reply = encode_cm_data(b"welcome").unwrap();
        match t.process(CmEvent::new(CmEventKind::ConnectResponse, id).with_private_data(reply)) {
            Dispatch::Handled(entry) => {
                assert_eq!(entry.kind, EventKind::Connected);
                assert_eq!(entry.source, EventSource::Endpoint(ep));
                assert_eq!(entry.data.as_ref(), b"welcome");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.endpoint_status(ep).unwrap().state, EpState::Connected);
    }

    #[test]
    fn test_ib_route_prepends_preamble() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (_ep, id) = active_msg(&mut t, &sim);
        t.process(CmEvent::new(CmEventKind::AddrResolved, id));
        let mut ib = route();
        ib.format = AddressFormat::Ib;
        t.process(CmEvent::new(CmEventKind::RouteResolved, id).with_route(ib));
        let param = sim.connect_param(id).unwrap();
        assert_eq!(
            app_payload(&param.private_data, true, false, 64).as_ref(),
            b"hello"
        );
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (ep, id) = active_msg(&mut t, &sim);
        t.process(CmEvent::new(CmEventKind::AddrResolved, id));
        t.process(CmEvent::new(CmEventKind::RouteResolved, id).with_route(route()));
        t.process(CmEvent::new(CmEventKind::ConnectResponse, id));
        match t.process(CmEvent::new(CmEventKind::Disconnected, id)) {
            Dispatch::Handled(entry) => {
                assert_eq!(entry.kind, EventKind::Shutdown);
                assert_eq!(entry.source, EventSource::Endpoint(ep));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            t.process(CmEvent::new(CmEventKind::Disconnected, id)),
            Dispatch::Deferred
        ));
    }

    #[test]
    fn test_addr_resolved_failure_is_fatal() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (ep, id) = active_msg(&mut t, &sim);
        sim.fail_once(crate::sim::SimOp::CreateResource, 12);
        match t.process(CmEvent::new(CmEventKind::AddrResolved, id)) {
            Dispatch::Error(err) => {
                assert_eq!(err.code, ErrorCode::NoMemory);
                assert_eq!(err.source, EventSource::Endpoint(ep));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.endpoint_status(ep).unwrap().state, EpState::Disconnected);
    }

    #[test]
    fn test_route_error_times_out() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (ep, id) = active_msg(&mut t, &sim);
        match t.process(CmEvent::new(CmEventKind::RouteError, id).with_status(-110)) {
            Dispatch::Error(err) => {
                assert_eq!(err.code, ErrorCode::TimedOut);
                assert_eq!(err.prov_errno, 110);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.endpoint_status(ep).unwrap().state, EpState::Disconnected);
    }

    #[test]
    fn test_msg_reject_carries_payload() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (_ep, id) = active_msg(&mut t, &sim);
        let event = CmEvent::new(CmEventKind::Rejected, id)
            .with_status(28)
            .with_private_data(encode_cm_data(b"busy").unwrap());
        match t.process(event) {
            Dispatch::Error(err) => {
                assert_eq!(err.code, ErrorCode::ConnectionRefused);
                assert_eq!(err.data.as_ref(), b"busy");
                assert_eq!(err.reject, Some(RejectClass::PeerApplication));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_for_unknown_id_deferred() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        for kind in [
            CmEventKind::AddrResolved,
            CmEventKind::Established,
            CmEventKind::Disconnected,
            CmEventKind::Rejected,
        ] {
            assert!(matches!(
                t.process(CmEvent::new(kind, CmId(404))),
                Dispatch::Deferred
            ));
        }
    }

    #[test]
    fn test_connect_requires_idle_endpoint() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (ep, _id) = active_msg(&mut t, &sim);
        assert!(matches!(
            t.connect(ep, b"again"),
            Err(EqError::InvalidArgument(_))
        ));
        let no_dest = t.create_endpoint(EndpointAttr::msg(None));
        assert!(t.connect(no_dest, b"").is_err());
    }

    #[test]
    fn test_destroyed_endpoint_is_stale() {
        let sim = SimCm::new();
        let mut t = translator(&sim);
        let (ep, id) = active_msg(&mut t, &sim);
        t.destroy_endpoint(ep).unwrap();
        assert!(sim.commands().contains(&SimCommand::Destroy { id }));
        assert!(matches!(t.endpoint_status(ep), Err(EqError::StaleHandle)));
        assert!(matches!(
            t.process(CmEvent::new(CmEventKind::AddrResolved, id)),
            Dispatch::Deferred
        ));
    }
}
