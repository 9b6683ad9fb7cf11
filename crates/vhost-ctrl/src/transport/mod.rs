//! The vhost-user transport as seen by the controller layer.
//!
//! The transport owns the endpoint sockets and the per-connection sessions. Controllers only ask
//! it for what a session negotiated (vrings, features, the guest memory table) and hand ring
//! cursors back when a session ends.

mod loopback;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use vhost_virtq::{MemoryTable, Vring};

use crate::error::{SessionId, TransportError};

pub use loopback::{LoopbackTransport, SessionSetup, TransportOp};

/// Connection events raised by the transport for a registered endpoint.
///
/// Implementations must not block; the transport may call them from its own threads.
pub trait SessionEvents: Send + Sync {
    /// A guest finished negotiating a session on the endpoint named `ifname`.
    fn session_started(&self, ifname: &str, session: SessionId);

    /// The guest side of `session` went away.
    fn session_stopped(&self, session: SessionId);
}

/// Event sink used until the registry is wired to a control loop.
#[derive(Debug, Default)]
pub(crate) struct UnroutedEvents;

impl SessionEvents for UnroutedEvents {
    fn session_started(&self, ifname: &str, session: SessionId) {
        debug!(ifname, %session, "session started with no control loop attached");
    }

    fn session_stopped(&self, session: SessionId) {
        debug!(%session, "session stopped with no control loop attached");
    }
}

pub trait VhostTransport: Send + Sync {
    /// Number of vrings the session set up.
    fn vring_num(&self, session: SessionId) -> Result<u16, TransportError>;

    fn vring(&self, session: SessionId, queue: u16) -> Result<Vring, TransportError>;

    /// Toggles the guest's "notify me" override for `queue`.
    fn enable_guest_notification(
        &self,
        session: SessionId,
        queue: u16,
        enable: bool,
    ) -> Result<(), TransportError>;

    fn negotiated_features(&self, session: SessionId) -> Result<u64, TransportError>;

    fn mem_table(&self, session: SessionId) -> Result<MemoryTable, TransportError>;

    /// Stores ring cursors so a later session on the same endpoint resumes where this one stopped.
    fn set_vring_base(
        &self,
        session: SessionId,
        queue: u16,
        last_avail_idx: u16,
        last_used_idx: u16,
    ) -> Result<(), TransportError>;

    fn driver_register(&self, path: &Path) -> Result<(), TransportError>;

    fn set_features(&self, path: &Path, features: u64) -> Result<(), TransportError>;

    fn disable_features(&self, path: &Path, features: u64) -> Result<(), TransportError>;

    fn callback_register(
        &self,
        path: &Path,
        events: Arc<dyn SessionEvents>,
    ) -> Result<(), TransportError>;

    /// Starts accepting connections on `path`.
    fn driver_start(&self, path: &Path) -> Result<(), TransportError>;

    fn driver_unregister(&self, path: &Path) -> Result<(), TransportError>;
}
