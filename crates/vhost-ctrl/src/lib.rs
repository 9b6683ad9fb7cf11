#![forbid(unsafe_code)]

//! Controller layer for vhost-user devices.
//!
//! A [`Registry`] holds the registered controllers and their endpoints. When the transport reports
//! a negotiated session the controller builds its [`DeviceState`] (one [`vhost_virtq::VirtQueue`]
//! per vring plus the guest memory table) and is bound to a reactor core chosen by the
//! [`LoadTable`]. The [`ControlLoop`] serializes all of this on one task and drives the per-core
//! drain cycle through each controller's [`VhostBackend`].

pub mod backend;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod reactor;
pub mod registry;
pub mod transport;

pub use backend::{BackendError, VhostBackend, ZeroBackend};
pub use config::{Config, ConfigError, ControllerConfig};
pub use control::{
    ControlHandle, ControlLoop, ControlMsg, ShutdownSummary, SHUTDOWN_DRAIN_TIMEOUT,
};
pub use device::{DeviceState, VhostDev, MAX_VHOST_VRINGS};
pub use error::{ErrorKind, QueueSetupError, SessionId, TransportError, VhostError};
pub use reactor::{parse_core_mask, CoreMask, LoadTable, DEFAULT_CORE, MAX_CORES};
pub use registry::{
    normalize_socket_dir, DeviceSlot, Registry, RegistryConfig, MAX_VHOST_DEVICES, PATH_MAX,
};
pub use transport::{LoopbackTransport, SessionEvents, SessionSetup, TransportOp, VhostTransport};
