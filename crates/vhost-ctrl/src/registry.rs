//! Fixed-capacity controller registry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::backend::{BackendError, VhostBackend};
use crate::device::{DeviceState, VhostDev};
use crate::error::{SessionId, TransportError, VhostError};
use crate::reactor::{CoreMask, LoadTable};
use crate::transport::{SessionEvents, UnroutedEvents, VhostTransport};

/// Default number of controller slots.
pub const MAX_VHOST_DEVICES: usize = 15;

/// Longest endpoint path the platform accepts, including the terminating NUL.
pub const PATH_MAX: usize = 4096;

/// Normalizes the endpoint base directory: a `/` is appended unless the value is empty or already
/// ends with one.
pub fn normalize_socket_dir(dir: &str) -> Result<String, VhostError> {
    let max = PATH_MAX - 3;
    if dir.len() > max {
        return Err(VhostError::PathTooLong {
            len: dir.len(),
            max,
        });
    }

    let mut dir = dir.to_string();
    if !dir.is_empty() && !dir.ends_with('/') {
        dir.push('/');
    }
    Ok(dir)
}

/// Position of a controller in the registry; used as an iteration cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSlot(usize);

impl DeviceSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix of every endpoint path, normalized by [`normalize_socket_dir`].
    pub socket_dir: String,
    pub capacity: usize,
    /// Cores the application may run reactors on.
    pub app_mask: CoreMask,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            socket_dir: String::new(),
            capacity: MAX_VHOST_DEVICES,
            app_mask: CoreMask::from_bits(1),
        }
    }
}

struct Slot {
    dev: VhostDev,
    backend: Arc<dyn VhostBackend>,
}

pub struct Registry {
    transport: Arc<dyn VhostTransport>,
    config: RegistryConfig,
    slots: Vec<Option<Slot>>,
    events: Arc<dyn SessionEvents>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("controllers", &self.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(transport: Arc<dyn VhostTransport>, config: RegistryConfig) -> Self {
        let slots = std::iter::repeat_with(|| None)
            .take(config.capacity)
            .collect();
        Self {
            transport,
            config,
            slots,
            events: Arc::new(UnroutedEvents),
        }
    }

    /// Routes session events of endpoints registered from now on to `events`.
    pub fn set_session_events(&mut self, events: Arc<dyn SessionEvents>) {
        self.events = events;
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn endpoint_path(&self, name: &str) -> Result<PathBuf, VhostError> {
        let path = format!("{}{}", self.config.socket_dir, name);
        if path.len() >= PATH_MAX {
            return Err(VhostError::PathTooLong {
                len: path.len(),
                max: PATH_MAX - 1,
            });
        }
        Ok(PathBuf::from(path))
    }

    /// Registers a controller and starts its endpoint.
    ///
    /// Nothing is inserted unless every step succeeds.
    pub fn register(
        &mut self,
        name: &str,
        cpumask: CoreMask,
        backend: Arc<dyn VhostBackend>,
    ) -> Result<DeviceSlot, VhostError> {
        if name.is_empty() {
            error!("can't register controller with no name");
            return Err(VhostError::InvalidName);
        }
        if self.find_by_name(name).is_some() {
            error!(controller = name, "controller already exists");
            return Err(VhostError::DuplicateName(name.to_string()));
        }

        let Some(index) = self.slots.iter().position(Option::is_none) else {
            error!(controller = name, capacity = self.capacity(), "registry is full");
            return Err(VhostError::RegistryFull {
                capacity: self.capacity(),
            });
        };

        let path = self.endpoint_path(name)?;
        prepare_endpoint(&path)?;
        if let Err(err) = self.start_endpoint(&path, backend.as_ref()) {
            error!(controller = name, "failed to start endpoint: {err}");
            return Err(err);
        }

        info!(
            controller = name,
            kind = backend.kind(),
            path = %path.display(),
            %cpumask,
            "controller added"
        );
        self.slots[index] = Some(Slot {
            dev: VhostDev::new(name, cpumask),
            backend,
        });
        Ok(DeviceSlot(index))
    }

    fn start_endpoint(&self, path: &Path, backend: &dyn VhostBackend) -> Result<(), VhostError> {
        self.transport
            .driver_register(path)
            .map_err(|source| VhostError::SessionRegisterFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let started = self.configure_endpoint(path, backend);
        if started.is_err() {
            if let Err(err) = self.transport.driver_unregister(path) {
                warn!(path = %path.display(), "failed to roll back endpoint: {err}");
            }
        }
        started
    }

    fn configure_endpoint(&self, path: &Path, backend: &dyn VhostBackend) -> Result<(), VhostError> {
        let negotiation = |source: TransportError| VhostError::FeatureNegotiationFailed {
            path: path.to_path_buf(),
            source,
        };
        self.transport
            .set_features(path, backend.virtio_features())
            .map_err(negotiation)?;
        self.transport
            .disable_features(path, backend.disabled_features())
            .map_err(negotiation)?;

        self.transport
            .callback_register(path, self.events.clone())
            .map_err(|source| VhostError::CallbackRegisterFailed {
                path: path.to_path_buf(),
                source,
            })?;

        self.transport
            .driver_start(path)
            .map_err(|source| VhostError::SessionStartFailed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Stops a controller's endpoint and frees its slot.
    ///
    /// The controller must not be bound to a core, i.e. its session must be detached first.
    pub fn unregister(&mut self, name: &str) -> Result<(), VhostError> {
        let index = self
            .slot_of_name(name)
            .ok_or_else(|| VhostError::UnknownDevice(name.to_string()))?;
        let dev = self.device_at(index)?;
        if let Some(core) = dev.lcore() {
            error!(controller = name, core, "controller still bound to a core");
            return Err(VhostError::DeviceBusy {
                name: name.to_string(),
                core,
            });
        }

        let path = self.endpoint_path(dev.name())?;
        self.transport
            .driver_unregister(&path)
            .map_err(|source| VhostError::SessionUnregisterFailed {
                path: path.clone(),
                source,
            })?;

        info!(controller = name, "controller removed");
        self.slots[index] = None;
        Ok(())
    }

    fn device_at(&self, index: usize) -> Result<&VhostDev, VhostError> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|slot| &slot.dev)
            .ok_or_else(|| VhostError::UnknownDevice(format!("slot {index}")))
    }

    fn slot_of_name(&self, name: &str) -> Option<usize> {
        let name = name
            .strip_prefix(self.config.socket_dir.as_str())
            .unwrap_or(name);
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.dev.name() == name))
    }

    fn slot_of_session(&self, session: SessionId) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| slot.dev.session() == Some(session))
        })
    }

    /// Looks a controller up by name or by full endpoint path.
    pub fn find_by_name(&self, name: &str) -> Option<&VhostDev> {
        let index = self.slot_of_name(name)?;
        self.slots[index].as_ref().map(|slot| &slot.dev)
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut VhostDev> {
        let index = self.slot_of_name(name)?;
        self.slots[index].as_mut().map(|slot| &mut slot.dev)
    }

    pub fn find_by_session(&self, session: SessionId) -> Option<&VhostDev> {
        let index = self.slot_of_session(session)?;
        self.slots[index].as_ref().map(|slot| &slot.dev)
    }

    pub fn find_by_session_mut(&mut self, session: SessionId) -> Option<&mut VhostDev> {
        let index = self.slot_of_session(session)?;
        self.slots[index].as_mut().map(|slot| &mut slot.dev)
    }

    pub fn get(&self, slot: DeviceSlot) -> Option<&VhostDev> {
        self.slots.get(slot.0)?.as_ref().map(|slot| &slot.dev)
    }

    /// Slot of the first controller after `prev`, or of the first controller at all.
    pub fn next(&self, prev: Option<DeviceSlot>) -> Option<DeviceSlot> {
        let start = prev.map_or(0, |slot| slot.0 + 1);
        (start..self.slots.len())
            .find(|&index| self.slots[index].is_some())
            .map(DeviceSlot)
    }

    /// Controllers in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceSlot, &VhostDev)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (DeviceSlot(index), &slot.dev)))
    }

    /// Cores with at least one bound controller.
    pub fn active_cores(&self) -> CoreMask {
        self.iter()
            .filter_map(|(_, dev)| dev.lcore())
            .fold(CoreMask::EMPTY, |mask, core| {
                CoreMask::from_bits(mask.bits() | CoreMask::single(core).bits())
            })
    }

    /// Binds a freshly negotiated session to the controller whose endpoint it arrived on.
    pub fn attach_session(
        &mut self,
        ifname: &str,
        session: SessionId,
        loads: &mut LoadTable,
    ) -> Result<u32, VhostError> {
        let index = self
            .slot_of_name(ifname)
            .ok_or_else(|| VhostError::UnknownDevice(ifname.to_string()))?;
        let app_mask = self.config.app_mask;
        let transport = self.transport.clone();
        let Some(slot) = self.slots[index].as_mut() else {
            return Err(VhostError::UnknownDevice(ifname.to_string()));
        };
        if let Some(existing) = slot.dev.session() {
            return Err(VhostError::AlreadyAttached {
                name: slot.dev.name().to_string(),
                session: existing,
            });
        }

        let state = DeviceState::construct(transport.as_ref(), session)?;
        slot.dev.attach(session, state);
        if let Err(source) = slot.backend.construct(&slot.dev) {
            if let Some((session, state)) = slot.dev.detach() {
                state.destruct(transport.as_ref(), session);
            }
            return Err(backend_error(&slot.dev, source));
        }

        let core = loads.allocate(slot.dev.cpumask(), app_mask);
        slot.dev.bind(core);
        info!(
            controller = slot.dev.name(),
            %session,
            queues = slot.dev.num_queues(),
            core,
            "session attached"
        );
        Ok(core)
    }

    /// Tears down the state of `session` and releases its core.
    ///
    /// Fails with [`VhostError::TasksPending`] while the controller has tasks in flight; the
    /// caller retries once they complete.
    pub fn detach_session(
        &mut self,
        session: SessionId,
        loads: &mut LoadTable,
    ) -> Result<(), VhostError> {
        let index = self
            .slot_of_session(session)
            .ok_or(VhostError::UnknownSession(session))?;
        let transport = self.transport.clone();
        let Some(slot) = self.slots[index].as_mut() else {
            return Err(VhostError::UnknownSession(session));
        };
        let count = slot.dev.pending_tasks();
        if count > 0 {
            return Err(VhostError::TasksPending {
                name: slot.dev.name().to_string(),
                count,
            });
        }

        teardown(slot, transport.as_ref(), loads);
        info!(controller = slot.dev.name(), %session, "session detached");
        Ok(())
    }

    /// Sum of the pending task counts of every controller.
    pub fn tasks_in_flight(&self) -> u32 {
        self.iter()
            .map(|(_, dev)| dev.pending_tasks())
            .fold(0, u32::saturating_add)
    }

    /// Runs one drain cycle for every controller bound to `core`.
    pub fn poll_core(&mut self, core: u32) -> usize {
        self.slots
            .iter_mut()
            .flatten()
            .filter(|slot| slot.dev.lcore() == Some(core))
            .map(|slot| slot.dev.poll(slot.backend.as_ref()))
            .sum()
    }

    /// Unregisters every controller's endpoint and removes every idle controller, detaching its
    /// session first. Returns how many controllers were removed.
    ///
    /// A controller with tasks in flight keeps its session state and its slot; only its endpoint
    /// goes away. Failures are logged and do not stop the sweep.
    pub fn shutdown(&mut self, loads: &mut LoadTable) -> usize {
        let transport = self.transport.clone();
        let mut removed = 0;
        for index in 0..self.slots.len() {
            let Some(name) = self.slots[index].as_ref().map(|slot| slot.dev.name().to_string())
            else {
                continue;
            };

            match self.endpoint_path(&name) {
                Ok(path) => {
                    if let Err(err) = transport.driver_unregister(&path) {
                        error!(controller = %name, "could not unregister controller: {err}");
                    }
                }
                Err(err) => error!(controller = %name, "{err}"),
            }

            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };
            let pending = slot.dev.pending_tasks();
            if pending > 0 {
                warn!(controller = %name, pending, "leaving controller with tasks in flight");
                continue;
            }
            teardown(slot, transport.as_ref(), loads);
            self.slots[index] = None;
            removed += 1;
        }
        removed
    }
}

fn teardown(slot: &mut Slot, transport: &dyn VhostTransport, loads: &mut LoadTable) {
    if slot.dev.session().is_some() {
        slot.backend.destruct(&slot.dev);
    }
    if let Some(core) = slot.dev.unbind() {
        loads.free(core);
    }
    if let Some((session, state)) = slot.dev.detach() {
        state.destruct(transport, session);
    }
}

fn backend_error(dev: &VhostDev, source: BackendError) -> VhostError {
    VhostError::Backend {
        name: dev.name().to_string(),
        source,
    }
}

/// Makes `path` available for a new endpoint socket: a stale socket is removed, anything else
/// is a conflict.
fn prepare_endpoint(path: &Path) -> Result<(), VhostError> {
    let io_err = |source: io::Error| VhostError::EndpointIo {
        path: path.to_path_buf(),
        source,
    };
    match fs::metadata(path) {
        Ok(meta) if is_socket(&meta.file_type()) => fs::remove_file(path).map_err(io_err),
        Ok(_) => {
            error!(path = %path.display(), "cannot create endpoint: file exists and is not a socket");
            Err(VhostError::EndpointConflict(path.to_path_buf()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(err)),
    }
}

#[cfg(unix)]
fn is_socket(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &fs::FileType) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ZeroBackend;
    use crate::error::ErrorKind;
    use crate::transport::{LoopbackTransport, TransportOp};

    fn registry(dir: &Path) -> (Arc<LoopbackTransport>, Registry) {
        let transport = Arc::new(LoopbackTransport::new());
        let config = RegistryConfig {
            socket_dir: normalize_socket_dir(&dir.to_string_lossy()).unwrap(),
            capacity: MAX_VHOST_DEVICES,
            app_mask: CoreMask::from_bits(0b1111),
        };
        (transport.clone(), Registry::new(transport, config))
    }

    fn zero() -> Arc<dyn VhostBackend> {
        Arc::new(ZeroBackend)
    }

    #[test]
    fn normalizes_socket_dir() {
        assert_eq!(normalize_socket_dir("/var/run").unwrap(), "/var/run/");
        assert_eq!(normalize_socket_dir("/var/run/").unwrap(), "/var/run/");
        assert_eq!(normalize_socket_dir("").unwrap(), "");
        let long = "a".repeat(PATH_MAX - 1);
        assert_eq!(
            normalize_socket_dir(&long).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn socket_dir_leaves_room_for_separator_and_nul() {
        let fits = "a".repeat(PATH_MAX - 3);
        assert_eq!(normalize_socket_dir(&fits).unwrap().len(), PATH_MAX - 2);

        let too_long = "a".repeat(PATH_MAX - 2);
        assert!(matches!(
            normalize_socket_dir(&too_long),
            Err(VhostError::PathTooLong { len, max }) if len == PATH_MAX - 2 && max == PATH_MAX - 3
        ));
    }

    #[test]
    fn rejects_empty_and_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        let mask = CoreMask::from_bits(1);

        assert_eq!(
            registry.register("", mask, zero()).unwrap_err().kind(),
            ErrorKind::Validation
        );
        registry.register("vhost.0", mask, zero()).unwrap();
        assert_eq!(
            registry.register("vhost.0", mask, zero()).unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn finds_by_bare_name_and_by_endpoint_path() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        registry
            .register("vhost.3", CoreMask::from_bits(1), zero())
            .unwrap();

        let path = registry.endpoint_path("vhost.3").unwrap();
        assert!(registry.find_by_name("vhost.3").is_some());
        assert!(registry.find_by_name(&path.to_string_lossy()).is_some());
        assert!(registry.find_by_name("vhost.4").is_none());
    }

    #[test]
    fn path_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        let name = "n".repeat(PATH_MAX);
        let err = registry
            .register(&name, CoreMask::from_bits(1), zero())
            .unwrap_err();
        assert!(matches!(err, VhostError::PathTooLong { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.is_empty());
    }

    #[test]
    fn endpoint_that_is_not_a_socket_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        fs::write(dir.path().join("vhost.0"), b"not a socket").unwrap();

        let err = registry
            .register("vhost.0", CoreMask::from_bits(1), zero())
            .unwrap_err();
        assert!(matches!(err, VhostError::EndpointConflict(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut registry) = registry(dir.path());
        let path = dir.path().join("vhost.0");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(listener);
        assert!(path.exists());

        registry
            .register("vhost.0", CoreMask::from_bits(1), zero())
            .unwrap();
        assert!(!path.exists());
        assert!(transport.is_started(&path));
    }

    #[test]
    fn transport_failures_leave_nothing_behind() {
        let cases = [
            TransportOp::DriverRegister,
            TransportOp::SetFeatures,
            TransportOp::DisableFeatures,
            TransportOp::CallbackRegister,
            TransportOp::DriverStart,
        ];
        for op in cases {
            let dir = tempfile::tempdir().unwrap();
            let (transport, mut registry) = registry(dir.path());
            transport.fail_next(op);

            let err = registry
                .register("vhost.0", CoreMask::from_bits(1), zero())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport, "{op:?}");
            assert!(registry.is_empty(), "{op:?}");
            assert!(
                !transport.is_registered(&dir.path().join("vhost.0")),
                "{op:?}"
            );

            // The failure was one-shot; a retry goes through.
            registry
                .register("vhost.0", CoreMask::from_bits(1), zero())
                .unwrap();
        }
    }

    #[test]
    fn features_reach_the_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut registry) = registry(dir.path());
        registry
            .register("vhost.0", CoreMask::from_bits(1), zero())
            .unwrap();
        assert_eq!(
            transport.endpoint_features(&dir.path().join("vhost.0")),
            Some(ZeroBackend.virtio_features())
        );
    }

    #[test]
    fn unregister_unknown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        assert!(matches!(
            registry.unregister("vhost.9"),
            Err(VhostError::UnknownDevice(_))
        ));
    }

    #[test]
    fn failed_unregister_keeps_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut registry) = registry(dir.path());
        registry
            .register("vhost.0", CoreMask::from_bits(1), zero())
            .unwrap();

        transport.fail_next(TransportOp::DriverUnregister);
        let err = registry.unregister("vhost.0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(registry.find_by_name("vhost.0").is_some());

        registry.unregister("vhost.0").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn iteration_follows_slot_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut registry) = registry(dir.path());
        for name in ["a", "b", "c"] {
            registry.register(name, CoreMask::from_bits(1), zero()).unwrap();
        }
        registry.unregister("b").unwrap();
        registry.register("d", CoreMask::from_bits(1), zero()).unwrap();

        let mut names = Vec::new();
        let mut cursor = registry.next(None);
        while let Some(slot) = cursor {
            names.push(registry.get(slot).unwrap().name().to_string());
            cursor = registry.next(Some(slot));
        }
        assert_eq!(names, ["a", "d", "c"]);

        let via_iter: Vec<_> = registry.iter().map(|(_, dev)| dev.name()).collect();
        assert_eq!(via_iter, ["a", "d", "c"]);
    }
}
