use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use vhost_virtq::{MemoryTable, Vring};

use super::{SessionEvents, VhostTransport};
use crate::error::{SessionId, TransportError};

/// Transport operations that can be made to fail with [`LoopbackTransport::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    VringNum,
    Vring,
    EnableGuestNotification,
    NegotiatedFeatures,
    MemTable,
    SetVringBase,
    DriverRegister,
    SetFeatures,
    DisableFeatures,
    CallbackRegister,
    DriverStart,
    DriverUnregister,
}

/// What a connecting guest negotiated with the endpoint.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub vrings: Vec<Vring>,
    pub features: u64,
    pub mem_table: MemoryTable,
}

#[derive(Default)]
struct Endpoint {
    features: u64,
    disabled_features: u64,
    events: Option<Arc<dyn SessionEvents>>,
    started: bool,
}

struct Session {
    path: PathBuf,
    setup: SessionSetup,
    guest_notification: Vec<bool>,
    closed: bool,
    /// Cursors were handed back through `set_vring_base`.
    persisted: bool,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<PathBuf, Endpoint>,
    sessions: BTreeMap<SessionId, Session>,
    bases: HashMap<(PathBuf, u16), (u16, u16)>,
    next_session: u32,
    failures: Vec<TransportOp>,
}

impl State {
    fn check(&mut self, op: TransportOp) -> Result<(), TransportError> {
        match self.failures.iter().position(|&f| f == op) {
            Some(pos) => {
                self.failures.remove(pos);
                Err(TransportError::Rejected(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn session(&self, session: SessionId) -> Result<&Session, TransportError> {
        self.sessions
            .get(&session)
            .ok_or(TransportError::NoSession(session))
    }

    fn endpoint_mut(&mut self, path: &Path) -> Result<&mut Endpoint, TransportError> {
        self.endpoints
            .get_mut(path)
            .ok_or_else(|| TransportError::NotRegistered(path.to_path_buf()))
    }
}

/// In-process transport: guests are simulated by calling [`LoopbackTransport::connect`] with
/// ring memory the caller owns.
///
/// Session state outlives [`LoopbackTransport::disconnect`] so the controller can still persist
/// cursors while tearing down, even if that teardown waits for a reconnect. A closed session is
/// dropped by the next connect to its endpoint once its cursors were persisted, or when the
/// endpoint is unregistered.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<State>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("LoopbackTransport")
            .field("endpoints", &state.endpoints.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next call of `op` fail with [`TransportError::Rejected`].
    pub fn fail_next(&self, op: TransportOp) {
        self.state().failures.push(op);
    }

    /// Simulates a guest connecting to the endpoint at `path`.
    ///
    /// Ring cursors persisted by an earlier session on the same endpoint override the ones in
    /// `setup` when the controller fetches the vrings.
    pub fn connect(&self, path: &Path, setup: SessionSetup) -> Result<SessionId, TransportError> {
        let (session, events) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let endpoint = state
                .endpoints
                .get(path)
                .filter(|endpoint| endpoint.started)
                .ok_or_else(|| TransportError::NotRegistered(path.to_path_buf()))?;
            let events = endpoint.events.clone();

            state
                .sessions
                .retain(|_, old| !(old.closed && old.persisted && old.path == path));
            let session = SessionId(state.next_session);
            state.next_session = state.next_session.wrapping_add(1);
            let queues = setup.vrings.len();
            state.sessions.insert(
                session,
                Session {
                    path: path.to_path_buf(),
                    setup,
                    guest_notification: vec![true; queues],
                    closed: false,
                    persisted: false,
                },
            );
            (session, events)
        };

        if let Some(events) = events {
            events.session_started(&path.to_string_lossy(), session);
        }
        Ok(session)
    }

    /// Simulates the guest side of `session` going away.
    pub fn disconnect(&self, session: SessionId) -> Result<(), TransportError> {
        let events = {
            let mut guard = self.state();
            let state = &mut *guard;
            let entry = state
                .sessions
                .get_mut(&session)
                .filter(|entry| !entry.closed)
                .ok_or(TransportError::NoSession(session))?;
            entry.closed = true;
            state
                .endpoints
                .get(&entry.path)
                .and_then(|endpoint| endpoint.events.clone())
        };

        if let Some(events) = events {
            events.session_stopped(session);
        }
        Ok(())
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.state().endpoints.contains_key(path)
    }

    pub fn is_started(&self, path: &Path) -> bool {
        self.state()
            .endpoints
            .get(path)
            .is_some_and(|endpoint| endpoint.started)
    }

    /// Features the endpoint offers: the set ones minus the disabled ones.
    pub fn endpoint_features(&self, path: &Path) -> Option<u64> {
        self.state()
            .endpoints
            .get(path)
            .map(|endpoint| endpoint.features & !endpoint.disabled_features)
    }

    /// Cursors persisted for `queue` of the endpoint at `path`, as `(last_avail_idx, last_used_idx)`.
    pub fn vring_base(&self, path: &Path, queue: u16) -> Option<(u16, u16)> {
        self.state()
            .bases
            .get(&(path.to_path_buf(), queue))
            .copied()
    }

    pub fn guest_notification_enabled(&self, session: SessionId, queue: u16) -> Option<bool> {
        self.state()
            .sessions
            .get(&session)
            .and_then(|entry| entry.guest_notification.get(usize::from(queue)).copied())
    }
}

impl VhostTransport for LoopbackTransport {
    fn vring_num(&self, session: SessionId) -> Result<u16, TransportError> {
        let mut state = self.state();
        state.check(TransportOp::VringNum)?;
        let count = state.session(session)?.setup.vrings.len();
        Ok(u16::try_from(count).unwrap_or(u16::MAX))
    }

    fn vring(&self, session: SessionId, queue: u16) -> Result<Vring, TransportError> {
        let mut state = self.state();
        state.check(TransportOp::Vring)?;
        let entry = state.session(session)?;
        let mut vring = entry
            .setup
            .vrings
            .get(usize::from(queue))
            .cloned()
            .ok_or(TransportError::NoQueue { session, queue })?;
        if let Some(&(last_avail_idx, last_used_idx)) =
            state.bases.get(&(entry.path.clone(), queue))
        {
            vring.last_avail_idx = last_avail_idx;
            vring.last_used_idx = last_used_idx;
        }
        Ok(vring)
    }

    fn enable_guest_notification(
        &self,
        session: SessionId,
        queue: u16,
        enable: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::EnableGuestNotification)?;
        let slot = state
            .sessions
            .get_mut(&session)
            .ok_or(TransportError::NoSession(session))?
            .guest_notification
            .get_mut(usize::from(queue))
            .ok_or(TransportError::NoQueue { session, queue })?;
        *slot = enable;
        Ok(())
    }

    fn negotiated_features(&self, session: SessionId) -> Result<u64, TransportError> {
        let mut state = self.state();
        state.check(TransportOp::NegotiatedFeatures)?;
        Ok(state.session(session)?.setup.features)
    }

    fn mem_table(&self, session: SessionId) -> Result<MemoryTable, TransportError> {
        let mut state = self.state();
        state.check(TransportOp::MemTable)?;
        Ok(state.session(session)?.setup.mem_table.clone())
    }

    fn set_vring_base(
        &self,
        session: SessionId,
        queue: u16,
        last_avail_idx: u16,
        last_used_idx: u16,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::SetVringBase)?;
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(TransportError::NoSession(session))?;
        if usize::from(queue) >= entry.setup.vrings.len() {
            return Err(TransportError::NoQueue { session, queue });
        }
        entry.persisted = true;
        let key = (entry.path.clone(), queue);
        state.bases.insert(key, (last_avail_idx, last_used_idx));
        Ok(())
    }

    fn driver_register(&self, path: &Path) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::DriverRegister)?;
        if state.endpoints.contains_key(path) {
            return Err(TransportError::AlreadyRegistered(path.to_path_buf()));
        }
        state.endpoints.insert(path.to_path_buf(), Endpoint::default());
        Ok(())
    }

    fn set_features(&self, path: &Path, features: u64) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::SetFeatures)?;
        state.endpoint_mut(path)?.features = features;
        Ok(())
    }

    fn disable_features(&self, path: &Path, features: u64) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::DisableFeatures)?;
        state.endpoint_mut(path)?.disabled_features |= features;
        Ok(())
    }

    fn callback_register(
        &self,
        path: &Path,
        events: Arc<dyn SessionEvents>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::CallbackRegister)?;
        state.endpoint_mut(path)?.events = Some(events);
        Ok(())
    }

    fn driver_start(&self, path: &Path) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::DriverStart)?;
        state.endpoint_mut(path)?.started = true;
        Ok(())
    }

    fn driver_unregister(&self, path: &Path) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check(TransportOp::DriverUnregister)?;
        if state.endpoints.remove(path).is_none() {
            return Err(TransportError::NotRegistered(path.to_path_buf()));
        }
        state.sessions.retain(|_, entry| entry.path != path);
        state.bases.retain(|(endpoint, _), _| endpoint != path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhost_virtq::{NotifyCounter, SharedMemory, VringLayout};

    fn setup(queues: u16) -> SessionSetup {
        let mem = Arc::new(SharedMemory::new(0x4000));
        let call = Arc::new(NotifyCounter::new());
        let vrings = (0..queues)
            .map(|queue| Vring {
                mem: mem.clone(),
                layout: VringLayout::contiguous(0x1000 * u64::from(queue), 8),
                last_avail_idx: 0,
                last_used_idx: 0,
                call: call.clone(),
            })
            .collect();
        SessionSetup {
            vrings,
            features: 0,
            mem_table: MemoryTable::new(Vec::new(), mem),
        }
    }

    #[test]
    fn connect_requires_started_endpoint() {
        let transport = LoopbackTransport::new();
        let path = Path::new("vhost.0");
        assert_eq!(
            transport.connect(path, setup(1)),
            Err(TransportError::NotRegistered(path.to_path_buf()))
        );

        transport.driver_register(path).unwrap();
        assert!(transport.connect(path, setup(1)).is_err());
        transport.driver_start(path).unwrap();
        let session = transport.connect(path, setup(2)).unwrap();
        assert_eq!(transport.vring_num(session), Ok(2));
    }

    #[test]
    fn injected_failures_fire_once() {
        let transport = LoopbackTransport::new();
        let path = Path::new("vhost.0");
        transport.fail_next(TransportOp::DriverRegister);
        assert!(matches!(
            transport.driver_register(path),
            Err(TransportError::Rejected(_))
        ));
        transport.driver_register(path).unwrap();
        assert_eq!(
            transport.driver_register(path),
            Err(TransportError::AlreadyRegistered(path.to_path_buf()))
        );
    }

    #[test]
    fn persisted_bases_apply_to_the_next_session() {
        let transport = LoopbackTransport::new();
        let path = Path::new("vhost.0");
        transport.driver_register(path).unwrap();
        transport.driver_start(path).unwrap();

        let first = transport.connect(path, setup(1)).unwrap();
        transport.set_vring_base(first, 0, 7, 5).unwrap();
        transport.disconnect(first).unwrap();
        assert_eq!(transport.vring_base(path, 0), Some((7, 5)));

        let second = transport.connect(path, setup(1)).unwrap();
        let vring = transport.vring(second, 0).unwrap();
        assert_eq!((vring.last_avail_idx, vring.last_used_idx), (7, 5));
        assert_eq!(
            transport.vring_num(first),
            Err(TransportError::NoSession(first))
        );
    }

    #[test]
    fn closed_session_survives_reconnect_until_persisted() {
        let transport = LoopbackTransport::new();
        let path = Path::new("vhost.0");
        transport.driver_register(path).unwrap();
        transport.driver_start(path).unwrap();

        let first = transport.connect(path, setup(1)).unwrap();
        transport.disconnect(first).unwrap();
        let second = transport.connect(path, setup(1)).unwrap();

        // The first session still accepts its cursors after the reconnect.
        transport.set_vring_base(first, 0, 4, 3).unwrap();
        let vring = transport.vring(second, 0).unwrap();
        assert_eq!((vring.last_avail_idx, vring.last_used_idx), (4, 3));

        transport.disconnect(second).unwrap();
        let third = transport.connect(path, setup(1)).unwrap();
        assert_eq!(
            transport.vring_num(first),
            Err(TransportError::NoSession(first))
        );
        // `second` never persisted anything, so it is kept.
        assert_eq!(transport.vring_num(second), Ok(1));
        assert_eq!(transport.vring_num(third), Ok(1));
    }
}
