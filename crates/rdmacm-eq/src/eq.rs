//! Application-facing event queue.
//!
//! The queue owns a FIFO of entries and a single error slot. Reads drain the
//! FIFO first; when it is empty they pull raw events from the connection
//! manager and run them through the translator until one produces a visible
//! entry or the source runs dry. Translation happens on the reading thread
//! under `event_lock`; the FIFO lock is only taken for O(1) queue operations,
//! always after `event_lock` when both are held.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cm::{ConnectionManager, EndpointResources, PortSpace, RecvWorkRequest};
use crate::config::{EqConfig, WaitObj};
use crate::connreq::{ConnRequest, ConnectionHints};
use crate::endpoint::{EndpointAttr, EndpointId, EndpointStatus, ListenerId};
use crate::error::{EqError, EqResult, ErrorCode};
use crate::signal::EqSignal;
use crate::stats::{EqStats, EqStatsSnapshot};
use crate::translator::{Dispatch, Translator};
use crate::xrc::RejectClass;

/// Kind of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Application notification.
    Notify,
    /// Inbound connect request on a listener.
    ConnReq,
    /// Endpoint connected.
    Connected,
    /// Endpoint shut down.
    Shutdown,
    /// Memory registration completed.
    MrComplete,
    /// Address vector insert completed.
    AvComplete,
    /// Multicast join completed.
    JoinComplete,
}

/// Object an entry or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventSource {
    /// An active or accepted endpoint.
    Endpoint(EndpointId),
    /// A listener.
    Listener(ListenerId),
    /// No particular object.
    None,
}

/// One application-visible event.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Event kind.
    pub kind: EventKind,
    /// Object the event pertains to.
    pub source: EventSource,
    /// Candidate connection info for `ConnReq` entries.
    pub info: Option<ConnRequest>,
    /// Payload bytes.
    pub data: Bytes,
}

impl QueueEntry {
    /// Creates an entry without connection info.
    pub fn new(kind: EventKind, source: EventSource, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            source,
            info: None,
            data: data.into(),
        }
    }

    pub(crate) fn connreq(listener: ListenerId, req: ConnRequest, data: Bytes) -> Self {
        Self {
            kind: EventKind::ConnReq,
            source: EventSource::Listener(listener),
            info: Some(req),
            data,
        }
    }

    /// Payload length; the caller's capacity must cover it.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the entry carries no payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Structured error held in the error slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Object that failed.
    pub source: EventSource,
    /// Errno-style error code.
    pub code: ErrorCode,
    /// Provider specific errno.
    pub prov_errno: i32,
    /// Error payload, such as the peer's reject data.
    pub data: Bytes,
    /// Classification for connect rejects.
    pub reject: Option<RejectClass>,
}

impl ErrorEntry {
    /// Error without payload.
    pub fn new(source: EventSource, code: ErrorCode, prov_errno: i32) -> Self {
        Self {
            source,
            code,
            prov_errno,
            data: Bytes::new(),
            reject: None,
        }
    }
}

/// Flags accepted by the read calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Return the head entry without consuming it.
    pub peek: bool,
}

impl ReadFlags {
    /// Consuming read.
    pub const NONE: ReadFlags = ReadFlags { peek: false };
    /// Non-destructive read.
    pub const PEEK: ReadFlags = ReadFlags { peek: true };
}

/// External resource domain holding a reference on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    err: Option<ErrorEntry>,
    domains: HashSet<DomainId>,
    closed: bool,
}

/// Connection management event queue.
pub struct EventQueue {
    config: EqConfig,
    wait_obj: WaitObj,
    event_lock: Mutex<Translator>,
    state: Mutex<QueueState>,
    signal: Arc<EqSignal>,
    stats: Arc<EqStats>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("config", &self.config)
            .field("wait_obj", &self.wait_obj)
            .field("stats", &self.stats)
            .finish()
    }
}

impl EventQueue {
    /// Opens a queue over a connection manager and an endpoint data path.
    pub fn open<C, R>(config: EqConfig, cm: C, resources: R) -> EqResult<Self>
    where
        C: ConnectionManager + 'static,
        R: EndpointResources + 'static,
    {
        let wait_obj = config.wait_obj.normalize()?;
        let signal = Arc::new(EqSignal::new());
        let stats = Arc::new(EqStats::new());

        let mut cm: Box<dyn ConnectionManager> = Box::new(cm);
        cm.bind_signal(Arc::clone(&signal));
        let translator = Translator::new(&config, cm, Box::new(resources), Arc::clone(&stats));

        info!(writable = config.writable, ?wait_obj, "event queue opened");
        Ok(Self {
            config,
            wait_obj,
            event_lock: Mutex::new(translator),
            state: Mutex::new(QueueState::default()),
            signal,
            stats,
        })
    }

    fn translator(&self) -> MutexGuard<'_, Translator> {
        self.event_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_queued(&self, capacity: usize, flags: ReadFlags) -> EqResult<Option<QueueEntry>> {
        let mut state = self.state();
        if state.closed {
            return Err(EqError::Closed);
        }
        if state.err.is_some() {
            return Err(EqError::ErrorAvailable);
        }
        match state.entries.front() {
            None => Ok(None),
            Some(head) if head.len() > capacity => Err(EqError::TooSmall {
                needed: head.len(),
                available: capacity,
            }),
            Some(head) if flags.peek => Ok(Some(head.clone())),
            Some(_) => Ok(state.entries.pop_front()),
        }
    }

    /// Non-blocking read of the next entry.
    ///
    /// A recorded error takes precedence over queued entries and is reported
    /// as [`EqError::ErrorAvailable`] until [`EventQueue::read_error`] drains
    /// it. With an empty FIFO, raw connection manager events are translated
    /// until one yields an entry; [`EqError::WouldBlock`] means none did.
    pub fn read(&self, capacity: usize, flags: ReadFlags) -> EqResult<QueueEntry> {
        if let Some(entry) = self.read_queued(capacity, flags)? {
            self.stats.delivered();
            return Ok(entry);
        }

        let mut translator = self.translator();
        while let Some(event) = translator.next_raw() {
            match translator.process(event) {
                Dispatch::Deferred => self.stats.internal(),
                Dispatch::Error(err) => {
                    debug!(source = ?err.source, code = ?err.code, "error recorded");
                    self.stats.error_recorded();
                    self.state().err = Some(err);
                    return Err(EqError::ErrorAvailable);
                }
                Dispatch::Handled(entry) => {
                    if entry.len() > capacity {
                        let needed = entry.len();
                        // ahead of anything written while translating
                        self.state().entries.push_front(entry);
                        return Err(EqError::TooSmall {
                            needed,
                            available: capacity,
                        });
                    }
                    if flags.peek {
                        self.state().entries.push_front(entry.clone());
                    }
                    self.stats.delivered();
                    return Ok(entry);
                }
            }
        }
        Err(EqError::WouldBlock)
    }

    /// Drains the recorded error. The record stays in place if its payload
    /// does not fit in `capacity`.
    pub fn read_error(&self, capacity: usize) -> EqResult<ErrorEntry> {
        let mut state = self.state();
        match &state.err {
            None => Err(EqError::WouldBlock),
            Some(err) if err.data.len() > capacity => Err(EqError::TooSmall {
                needed: err.data.len(),
                available: capacity,
            }),
            Some(_) => state.err.take().ok_or(EqError::WouldBlock),
        }
    }

    /// Appends an application entry. Returns the payload length.
    pub fn write(&self, kind: EventKind, data: impl Into<Bytes>) -> EqResult<usize> {
        self.write_entry(QueueEntry::new(kind, EventSource::None, data))
    }

    /// Appends a fully formed entry. Returns the payload length.
    pub fn write_entry(&self, entry: QueueEntry) -> EqResult<usize> {
        if !self.config.writable {
            return Err(EqError::InvalidArgument(
                "event queue not opened for writing".to_string(),
            ));
        }
        let len = entry.len();
        {
            let mut state = self.state();
            if state.closed {
                return Err(EqError::Closed);
            }
            state.entries.push_back(entry);
        }
        self.signal.notify();
        Ok(len)
    }

    /// Blocking read. `None` waits forever; expiry yields
    /// [`EqError::WouldBlock`].
    pub fn sread(
        &self,
        capacity: usize,
        timeout: Option<Duration>,
        flags: ReadFlags,
    ) -> EqResult<QueueEntry> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.signal.sequence();
            match self.read(capacity, flags) {
                Err(EqError::WouldBlock) => {}
                other => return other,
            }
            let remaining = match remaining(deadline) {
                Some(Duration::ZERO) => return Err(EqError::WouldBlock),
                other => other,
            };
            if !self.signal.wait_since(seen, remaining) {
                return Err(EqError::WouldBlock);
            }
        }
    }

    /// Async variant of [`EventQueue::sread`]. Translation still runs on the
    /// calling task; no task is spawned.
    pub async fn sread_async(
        &self,
        capacity: usize,
        timeout: Option<Duration>,
        flags: ReadFlags,
    ) -> EqResult<QueueEntry> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.signal.sequence();
            match self.read(capacity, flags) {
                Err(EqError::WouldBlock) => {}
                other => return other,
            }
            let remaining = match remaining(deadline) {
                Some(Duration::ZERO) => return Err(EqError::WouldBlock),
                other => other,
            };
            if !self.signal.wait_since_async(seen, remaining).await {
                return Err(EqError::WouldBlock);
            }
        }
    }

    /// `Ok` when the FIFO is empty and blocking on the wait object is safe.
    pub fn try_wait(&self) -> EqResult<()> {
        if self.state().entries.is_empty() {
            Ok(())
        } else {
            Err(EqError::WouldBlock)
        }
    }

    /// Normalised wait object.
    pub fn wait_obj(&self) -> WaitObj {
        self.wait_obj
    }

    /// Readiness signal for external waiters.
    pub fn signal(&self) -> Arc<EqSignal> {
        Arc::clone(&self.signal)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EqStatsSnapshot {
        self.stats.snapshot()
    }

    /// Records an external reference that blocks [`EventQueue::close`].
    pub fn attach_domain(&self, domain: DomainId) -> EqResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(EqError::Closed);
        }
        if !state.domains.insert(domain) {
            return Err(EqError::InvalidArgument(format!(
                "domain {} already attached",
                domain.0
            )));
        }
        Ok(())
    }

    /// Drops an external reference.
    pub fn detach_domain(&self, domain: DomainId) -> EqResult<()> {
        if self.state().domains.remove(&domain) {
            Ok(())
        } else {
            Err(EqError::InvalidArgument(format!(
                "domain {} not attached",
                domain.0
            )))
        }
    }

    /// Purges queued entries that refer to `source`. Returns how many were
    /// removed.
    pub fn remove_events(&self, source: EventSource) -> usize {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.source != source);
        before - state.entries.len()
    }

    /// Closes the queue. Fails with [`EqError::Busy`] while domains are
    /// attached, leaving everything untouched.
    pub fn close(&self) -> EqResult<()> {
        let mut translator = self.translator();
        {
            let mut state = self.state();
            if state.closed {
                return Err(EqError::Closed);
            }
            if !state.domains.is_empty() {
                return Err(EqError::Busy {
                    refs: state.domains.len(),
                });
            }
            if !state.entries.is_empty() {
                debug!(abandoned = state.entries.len(), "closing with queued entries");
            }
            state.entries.clear();
            state.err = None;
            state.closed = true;
        }
        translator.teardown();
        drop(translator);
        self.signal.notify();
        info!("event queue closed");
        Ok(())
    }

    /// Creates an endpoint bound to this queue.
    pub fn create_endpoint(&self, attr: EndpointAttr) -> EqResult<EndpointId> {
        self.ensure_open()?;
        Ok(self.translator().create_endpoint(attr))
    }

    /// Starts a listener; inbound requests surface as `ConnReq` entries.
    pub fn listen(
        &self,
        addr: SocketAddr,
        port_space: PortSpace,
        hints: ConnectionHints,
    ) -> EqResult<ListenerId> {
        self.ensure_open()?;
        self.translator().listen(addr, port_space, hints)
    }

    /// Stops a listener and drops its queued entries.
    pub fn destroy_listener(&self, listener: ListenerId) -> EqResult<()> {
        let mut translator = self.translator();
        translator.destroy_listener(listener)?;
        self.remove_events(EventSource::Listener(listener));
        Ok(())
    }

    /// Queues a receive buffer, posting it once the transport resource exists.
    pub fn prepost_recv(&self, ep: EndpointId, wr: RecvWorkRequest) -> EqResult<()> {
        self.translator().prepost_recv(ep, wr)
    }

    /// Starts an active connect carrying `data` to the peer.
    pub fn connect(&self, ep: EndpointId, data: &[u8]) -> EqResult<()> {
        self.ensure_open()?;
        self.translator().connect(ep, data)
    }

    /// Accepts `req` on `ep`, replying with `data`.
    pub fn accept(&self, ep: EndpointId, req: &ConnRequest, data: &[u8]) -> EqResult<()> {
        self.ensure_open()?;
        self.translator().accept(ep, req, data)
    }

    /// Rejects `req`, passing `data` to the peer.
    pub fn reject(&self, req: &ConnRequest, data: &[u8]) -> EqResult<()> {
        self.translator().reject(req, data)
    }

    /// Disconnects every live leg of `ep`.
    pub fn shutdown(&self, ep: EndpointId) -> EqResult<()> {
        self.translator().shutdown(ep)
    }

    /// Destroys `ep`, releasing its identifiers, tag and SIDR entry, and
    /// purging its queued entries.
    pub fn destroy_endpoint(&self, ep: EndpointId) -> EqResult<()> {
        let mut translator = self.translator();
        translator.destroy_endpoint(ep)?;
        let purged = self.remove_events(EventSource::Endpoint(ep));
        if purged > 0 {
            warn!(%ep, purged, "destroyed endpoint had queued events");
        }
        Ok(())
    }

    /// Current state of `ep`.
    pub fn endpoint_state(&self, ep: EndpointId) -> EqResult<EndpointStatus> {
        self.translator().endpoint_status(ep)
    }

    fn ensure_open(&self) -> EqResult<()> {
        if self.state().closed {
            Err(EqError::Closed)
        } else {
            Ok(())
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::{CmEvent, CmEventKind, CmId};
    use crate::sim::SimCm;

    fn open(writable: bool) -> (EventQueue, SimCm) {
        let sim = SimCm::new();
        let config = EqConfig {
            writable,
            ..EqConfig::default()
        };
        let eq = EventQueue::open(config, sim.clone(), sim.clone()).unwrap();
        (eq, sim)
    }

    #[test]
    fn test_empty_read_would_block() {
        let (eq, _sim) = open(false);
        assert!(matches!(eq.read(64, ReadFlags::NONE), Err(EqError::WouldBlock)));
        assert!(eq.try_wait().is_ok());
    }

    #[test]
    fn test_write_requires_permission() {
        let (eq, _sim) = open(false);
        let err = eq.write(EventKind::Notify, &b"x"[..]).unwrap_err();
        assert!(matches!(err, EqError::InvalidArgument(_)));
    }

    #[test]
    fn test_write_read_fifo() {
        let (eq, _sim) = open(true);
        eq.write(EventKind::Notify, &b"one"[..]).unwrap();
        eq.write(EventKind::MrComplete, &b"two"[..]).unwrap();
        assert!(eq.try_wait().is_err());
        let first = eq.read(16, ReadFlags::NONE).unwrap();
        assert_eq!(first.kind, EventKind::Notify);
        assert_eq!(first.data.as_ref(), b"one");
        let second = eq.read(16, ReadFlags::NONE).unwrap();
        assert_eq!(second.data.as_ref(), b"two");
        assert!(eq.read(16, ReadFlags::NONE).unwrap_err().is_would_block());
    }

    #[test]
    fn test_peek_then_read_same_entry() {
        let (eq, _sim) = open(true);
        eq.write(EventKind::Notify, &b"peeked"[..]).unwrap();
        let peeked = eq.read(16, ReadFlags::PEEK).unwrap();
        let read = eq.read(16, ReadFlags::NONE).unwrap();
        assert_eq!(peeked.data, read.data);
        assert_eq!(peeked.kind, read.kind);
    }

    #[test]
    fn test_too_small_keeps_entry() {
        let (eq, _sim) = open(true);
        eq.write(EventKind::Notify, &b"abcdef"[..]).unwrap();
        let err = eq.read(2, ReadFlags::NONE).unwrap_err();
        assert!(matches!(
            err,
            EqError::TooSmall {
                needed: 6,
                available: 2
            }
        ));
        assert_eq!(eq.read(6, ReadFlags::NONE).unwrap().data.as_ref(), b"abcdef");
    }

    /// Queues a connect request whose translation runs a racing write.
    fn racing_request(eq: &Arc<EventQueue>, sim: &SimCm) -> ListenerId {
        use crate::cm::{AddressFormat, RouteInfo};
        use crate::connreq::EpProtocol;
        use crate::private_data::encode_cm_data;
        use crate::sim::SimCommand;

        let listener = eq
            .listen(
                "10.0.0.2:7000".parse().unwrap(),
                PortSpace::Tcp,
                ConnectionHints::any(EpProtocol::RdmaCm),
            )
            .unwrap();
        let listen_id = sim
            .commands()
            .iter()
            .find_map(|cmd| match cmd {
                SimCommand::Listen { id, .. } => Some(*id),
                _ => None,
            })
            .unwrap();
        let route = RouteInfo {
            src: "10.0.0.2:7000".parse().unwrap(),
            dst: "10.0.0.1:40000".parse().unwrap(),
            device: "mlx5_0".to_string(),
            format: AddressFormat::Ip,
        };
        sim.push_event(
            CmEvent::new(CmEventKind::ConnectRequest, CmId(50))
                .with_listen_id(listen_id)
                .with_route(route)
                .with_private_data(encode_cm_data(b"hello").unwrap()),
        );
        let writer = Arc::downgrade(eq);
        sim.on_next_event(move || {
            if let Some(eq) = writer.upgrade() {
                eq.write(EventKind::Notify, &b"racing"[..]).unwrap();
            }
        });
        listener
    }

    #[test]
    fn test_peeked_translation_stays_ahead_of_racing_write() {
        let (eq, sim) = open(true);
        let eq = Arc::new(eq);
        let listener = racing_request(&eq, &sim);

        let peeked = eq.read(64, ReadFlags::PEEK).unwrap();
        assert_eq!(peeked.kind, EventKind::ConnReq);
        assert_eq!(peeked.source, EventSource::Listener(listener));
        let read = eq.read(64, ReadFlags::NONE).unwrap();
        assert_eq!(read.kind, EventKind::ConnReq);
        assert_eq!(read.data, peeked.data);
        assert_eq!(eq.read(64, ReadFlags::NONE).unwrap().data.as_ref(), b"racing");
    }

    #[test]
    fn test_too_small_translation_stays_ahead_of_racing_write() {
        let (eq, sim) = open(true);
        let eq = Arc::new(eq);
        racing_request(&eq, &sim);

        assert!(matches!(
            eq.read(2, ReadFlags::NONE),
            Err(EqError::TooSmall {
                needed: 5,
                available: 2
            })
        ));
        let entry = eq.read(64, ReadFlags::NONE).unwrap();
        assert_eq!(entry.kind, EventKind::ConnReq);
        assert_eq!(entry.data.as_ref(), b"hello");
        assert_eq!(eq.read(64, ReadFlags::NONE).unwrap().data.as_ref(), b"racing");
    }

    #[test]
    fn test_error_precedence_over_queued_entries() {
        let (eq, sim) = open(true);
        sim.push_event(CmEvent::new(CmEventKind::DeviceRemoval, CmId(77)));
        assert!(matches!(eq.read(16, ReadFlags::NONE), Err(EqError::ErrorAvailable)));
        eq.write(EventKind::Notify, &b"queued"[..]).unwrap();
        for _ in 0..3 {
            assert!(matches!(eq.read(16, ReadFlags::NONE), Err(EqError::ErrorAvailable)));
        }
        let err = eq.read_error(0).unwrap();
        assert_eq!(err.code, ErrorCode::NoDevice);
        assert_eq!(err.source, EventSource::None);
        assert_eq!(eq.read(16, ReadFlags::NONE).unwrap().data.as_ref(), b"queued");
        assert!(eq.read_error(0).unwrap_err().is_would_block());
    }

    #[test]
    fn test_unknown_event_skipped() {
        let (eq, sim) = open(false);
        sim.push_event(CmEvent::new(CmEventKind::Unknown(99), CmId(1)));
        assert!(eq.read(16, ReadFlags::NONE).unwrap_err().is_would_block());
        let stats = eq.stats();
        assert_eq!(stats.unknown_events, 1);
        assert_eq!(stats.events_internal, 1);
    }

    #[test]
    fn test_close_busy_then_ok() {
        let (eq, _sim) = open(true);
        eq.attach_domain(DomainId(1)).unwrap();
        eq.write(EventKind::Notify, &b"x"[..]).unwrap();
        assert!(matches!(eq.close(), Err(EqError::Busy { refs: 1 })));
        // nothing was torn down
        assert_eq!(eq.read(16, ReadFlags::PEEK).unwrap().data.as_ref(), b"x");
        eq.detach_domain(DomainId(1)).unwrap();
        eq.close().unwrap();
        assert!(matches!(eq.read(16, ReadFlags::NONE), Err(EqError::Closed)));
        assert!(matches!(eq.close(), Err(EqError::Closed)));
    }

    #[test]
    fn test_sread_times_out() {
        let (eq, _sim) = open(false);
        let timeout = Duration::from_millis(30);
        let start = Instant::now();
        let err = eq.sread(16, Some(timeout), ReadFlags::NONE).unwrap_err();
        assert!(err.is_would_block());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_sread_wakes_on_write() {
        let (eq, _sim) = open(true);
        let eq = Arc::new(eq);
        let writer = Arc::clone(&eq);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.write(EventKind::Notify, &b"late"[..]).unwrap();
        });
        let entry = eq
            .sread(16, Some(Duration::from_secs(5)), ReadFlags::NONE)
            .unwrap();
        assert_eq!(entry.data.as_ref(), b"late");
        handle.join().unwrap();
    }

    #[test]
    fn test_unsupported_wait_obj() {
        let sim = SimCm::new();
        let config = EqConfig {
            wait_obj: WaitObj::Yield,
            ..EqConfig::default()
        };
        let err = EventQueue::open(config, sim.clone(), sim).unwrap_err();
        assert!(matches!(err, EqError::NotSupported(_)));
    }

    #[test]
    fn test_remove_events_by_source() {
        let (eq, _sim) = open(true);
        let ep = eq.create_endpoint(EndpointAttr::msg(None)).unwrap();
        eq.write_entry(QueueEntry::new(
            EventKind::Shutdown,
            EventSource::Endpoint(ep),
            Bytes::new(),
        ))
        .unwrap();
        eq.write(EventKind::Notify, &b"keep"[..]).unwrap();
        eq.destroy_endpoint(ep).unwrap();
        assert_eq!(eq.read(16, ReadFlags::NONE).unwrap().data.as_ref(), b"keep");
        assert!(eq.read(16, ReadFlags::NONE).unwrap_err().is_would_block());
    }
}
