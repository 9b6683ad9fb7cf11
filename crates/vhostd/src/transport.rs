//! Unix socket endpoints for the daemon.
//!
//! Each registered controller gets a listening socket. The vhost-user message protocol is not
//! spoken here: accepted connections are logged and closed, so no session ever reaches the
//! controller layer through this transport.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vhost_ctrl::{SessionEvents, SessionId, TransportError, VhostTransport};
use vhost_virtq::{MemoryTable, Vring};

#[derive(Default)]
struct Endpoint {
    features: u64,
    disabled_features: u64,
    events: Option<Arc<dyn SessionEvents>>,
    accept: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct UnixSocketTransport {
    endpoints: Mutex<HashMap<PathBuf, Endpoint>>,
}

impl UnixSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<PathBuf, Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_endpoint<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Result<R, TransportError> {
        let mut endpoints = self.endpoints();
        let endpoint = endpoints
            .get_mut(path)
            .ok_or_else(|| TransportError::NotRegistered(path.to_path_buf()))?;
        Ok(f(endpoint))
    }

    /// Features advertised on `path` after masking the disabled set.
    pub fn advertised_features(&self, path: &Path) -> Option<u64> {
        self.endpoints()
            .get(path)
            .map(|endpoint| endpoint.features & !endpoint.disabled_features)
    }
}

async fn accept_loop(listener: UnixListener, path: PathBuf) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                warn!(
                    path = %path.display(),
                    "vhost-user negotiation is not available on this endpoint; closing connection"
                );
                drop(stream);
            }
            Err(err) => {
                warn!(path = %path.display(), "accept failed: {err}");
                return;
            }
        }
    }
}

impl VhostTransport for UnixSocketTransport {
    fn vring_num(&self, session: SessionId) -> Result<u16, TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn vring(&self, session: SessionId, _queue: u16) -> Result<Vring, TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn enable_guest_notification(
        &self,
        session: SessionId,
        _queue: u16,
        _enable: bool,
    ) -> Result<(), TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn negotiated_features(&self, session: SessionId) -> Result<u64, TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn mem_table(&self, session: SessionId) -> Result<MemoryTable, TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn set_vring_base(
        &self,
        session: SessionId,
        _queue: u16,
        _last_avail_idx: u16,
        _last_used_idx: u16,
    ) -> Result<(), TransportError> {
        Err(TransportError::NoSession(session))
    }

    fn driver_register(&self, path: &Path) -> Result<(), TransportError> {
        let mut endpoints = self.endpoints();
        if endpoints.contains_key(path) {
            return Err(TransportError::AlreadyRegistered(path.to_path_buf()));
        }
        endpoints.insert(path.to_path_buf(), Endpoint::default());
        debug!(path = %path.display(), "endpoint registered");
        Ok(())
    }

    fn set_features(&self, path: &Path, features: u64) -> Result<(), TransportError> {
        self.with_endpoint(path, |endpoint| endpoint.features = features)
    }

    fn disable_features(&self, path: &Path, features: u64) -> Result<(), TransportError> {
        self.with_endpoint(path, |endpoint| endpoint.disabled_features |= features)
    }

    fn callback_register(
        &self,
        path: &Path,
        events: Arc<dyn SessionEvents>,
    ) -> Result<(), TransportError> {
        self.with_endpoint(path, |endpoint| endpoint.events = Some(events))
    }

    fn driver_start(&self, path: &Path) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let mut endpoints = self.endpoints();
        let endpoint = endpoints
            .get_mut(path)
            .ok_or_else(|| TransportError::NotRegistered(path.to_path_buf()))?;
        if endpoint.accept.is_some() {
            return Err(TransportError::Rejected(format!(
                "{} is already accepting connections",
                path.display()
            )));
        }

        // UnixListener::bind registers with the reactor, so it has to run inside the runtime.
        let listener = {
            let _guard = runtime.enter();
            UnixListener::bind(path)?
        };
        endpoint.accept = Some(runtime.spawn(accept_loop(listener, path.to_path_buf())));
        debug!(path = %path.display(), "endpoint listening");
        Ok(())
    }

    fn driver_unregister(&self, path: &Path) -> Result<(), TransportError> {
        let endpoint = self
            .endpoints()
            .remove(path)
            .ok_or_else(|| TransportError::NotRegistered(path.to_path_buf()))?;
        if let Some(accept) = endpoint.accept {
            accept.abort();
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(path = %path.display(), "endpoint unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_socket_follows_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhost.0");
        let transport = UnixSocketTransport::new();

        transport.driver_register(&path).unwrap();
        assert!(matches!(
            transport.driver_register(&path),
            Err(TransportError::AlreadyRegistered(_))
        ));
        transport.set_features(&path, 0b111).unwrap();
        transport.disable_features(&path, 0b010).unwrap();
        assert_eq!(transport.advertised_features(&path), Some(0b101));

        transport.driver_start(&path).unwrap();
        assert!(path.exists());

        // Connections are accepted and dropped.
        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        drop(stream);

        transport.driver_unregister(&path).unwrap();
        assert!(!path.exists());
        assert!(matches!(
            transport.driver_unregister(&path),
            Err(TransportError::NotRegistered(_))
        ));
    }

    #[test]
    fn sessions_are_never_negotiated() {
        let transport = UnixSocketTransport::new();
        assert_eq!(
            transport.vring_num(SessionId(3)),
            Err(TransportError::NoSession(SessionId(3)))
        );
        assert!(transport.mem_table(SessionId(3)).is_err());
    }

    #[test]
    fn start_requires_registration() {
        let transport = UnixSocketTransport::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            transport.driver_start(&dir.path().join("missing")),
            Err(TransportError::NotRegistered(_))
        ));
    }
}
