#![warn(missing_docs)]

//! RDMA connection manager event queue: translates raw connection manager
//! events into application-visible entries and drives XRC bidirectional
//! connection setup.

pub mod arena;
pub mod cm;
pub mod config;
pub mod conn_tag;
pub mod connreq;
pub mod endpoint;
pub mod eq;
pub mod error;
pub mod private_data;
pub mod sidr;
pub mod signal;
pub mod sim;
pub mod stats;
mod translator;
pub mod xrc;

pub use cm::{
    AddressFormat, CmEvent, CmEventKind, CmId, ConnParam, ConnectionManager, EndpointResources,
    PortSpace, RecvWorkRequest, RouteInfo, ScatterGatherElement,
};
pub use config::{EqConfig, WaitObj, XrcConfig};
pub use connreq::{ConnInfo, ConnRequest, ConnectionHints, EpProtocol, XrcConnInfo};
pub use endpoint::{
    EndpointAttr, EndpointId, EndpointStatus, EndpointType, EpState, ListenerId, XrcConnState,
    XrcRole,
};
pub use eq::{DomainId, ErrorEntry, EventKind, EventQueue, EventSource, QueueEntry, ReadFlags};
pub use error::{EqError, EqResult, ErrorCode};
pub use signal::EqSignal;
pub use stats::EqStatsSnapshot;
pub use xrc::RejectClass;
