use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vhost_virtq::{AddressNotMapped, VirtQueueError};

use crate::backend::BackendError;

/// Opaque handle of one active transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Failure reported by the vhost-user transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no active {0}")]
    NoSession(SessionId),

    #[error("{session} has no vring {queue}")]
    NoQueue { session: SessionId, queue: u16 },

    #[error("no endpoint registered at {}", .0.display())]
    NotRegistered(PathBuf),

    #[error("an endpoint is already registered at {}", .0.display())]
    AlreadyRegistered(PathBuf),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Coarse classification of [`VhostError`], used by callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Capacity,
    Conflict,
    State,
    Transport,
    ProtocolViolation,
    Backend,
}

/// Per-queue failure while building device state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueSetupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ring(#[from] VirtQueueError),
}

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("controller name must not be empty")]
    InvalidName,

    #[error("controller {0:?} already exists")]
    DuplicateName(String),

    #[error("controller {0:?} not found")]
    UnknownDevice(String),

    #[error("controller {name:?} has no vring {queue}")]
    UnknownQueue { name: String, queue: u16 },

    #[error("no controller is attached to {0}")]
    UnknownSession(SessionId),

    #[error("invalid core mask {text:?}: {reason}")]
    InvalidCoreMask { text: String, reason: &'static str },

    #[error("controller registry is full ({capacity} slots)")]
    RegistryFull { capacity: usize },

    #[error("session reports {count} vrings, at most {max} are supported")]
    TooManyQueues { count: u16, max: u16 },

    #[error("endpoint path is {len} bytes, limit is {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("{} exists and is not a socket", .0.display())]
    EndpointConflict(PathBuf),

    #[error("failed to prepare endpoint {}", .path.display())]
    EndpointIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to register session at {}", .path.display())]
    SessionRegisterFailed {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("failed to set features on {}", .path.display())]
    FeatureNegotiationFailed {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("failed to register callbacks on {}", .path.display())]
    CallbackRegisterFailed {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("failed to start session at {}", .path.display())]
    SessionStartFailed {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("failed to unregister session at {}", .path.display())]
    SessionUnregisterFailed {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("failed to set up vring {queue}")]
    QueueSetupFailed {
        queue: u16,
        #[source]
        source: QueueSetupError,
    },

    #[error("failed to query negotiated features")]
    FeatureQueryFailed(#[source] TransportError),

    #[error("failed to fetch guest memory table")]
    MemoryTableFailed(#[source] TransportError),

    #[error("controller {name:?} is still bound to core {core}")]
    DeviceBusy { name: String, core: u32 },

    #[error("controller {name:?} has {count} tasks in flight")]
    TasksPending { name: String, count: u32 },

    #[error("task reference count of {0:?} underflowed")]
    TaskUnderflow(String),

    #[error("task reference count of {0:?} overflowed")]
    TaskOverflow(String),

    #[error("controller {0:?} has no active session")]
    NotAttached(String),

    #[error("controller {name:?} is already attached to {session}")]
    AlreadyAttached { name: String, session: SessionId },

    #[error("guest violated the ring protocol on {name:?} vring {queue}")]
    Protocol {
        name: String,
        queue: u16,
        #[source]
        source: VirtQueueError,
    },

    #[error("guest address of {name:?} is not mapped")]
    AddressNotMapped {
        name: String,
        #[source]
        source: AddressNotMapped,
    },

    #[error("backend of {name:?} failed")]
    Backend {
        name: String,
        #[source]
        source: BackendError,
    },
}

impl VhostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName
            | Self::UnknownDevice(_)
            | Self::UnknownSession(_)
            | Self::UnknownQueue { .. }
            | Self::InvalidCoreMask { .. }
            | Self::PathTooLong { .. } => ErrorKind::Validation,
            Self::RegistryFull { .. } | Self::TooManyQueues { .. } => ErrorKind::Capacity,
            Self::DuplicateName(_) | Self::EndpointConflict(_) => ErrorKind::Conflict,
            Self::DeviceBusy { .. }
            | Self::TasksPending { .. }
            | Self::TaskUnderflow(_)
            | Self::TaskOverflow(_)
            | Self::NotAttached(_)
            | Self::AlreadyAttached { .. } => ErrorKind::State,
            Self::EndpointIo { .. }
            | Self::SessionRegisterFailed { .. }
            | Self::FeatureNegotiationFailed { .. }
            | Self::CallbackRegisterFailed { .. }
            | Self::SessionStartFailed { .. }
            | Self::SessionUnregisterFailed { .. }
            | Self::FeatureQueryFailed(_)
            | Self::MemoryTableFailed(_) => ErrorKind::Transport,
            Self::QueueSetupFailed { source, .. } => match source {
                QueueSetupError::Transport(_) => ErrorKind::Transport,
                QueueSetupError::Ring(_) => ErrorKind::ProtocolViolation,
            },
            Self::Protocol { .. } | Self::AddressNotMapped { .. } => ErrorKind::ProtocolViolation,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }
}
