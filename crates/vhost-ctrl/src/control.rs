//! Control loop: owns the registry and the load table, applies session events and drives the
//! drain cycle until a shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{SessionId, VhostError};
use crate::reactor::LoadTable;
use crate::registry::Registry;
use crate::transport::SessionEvents;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    SessionStarted { ifname: String, session: SessionId },
    SessionStopped { session: SessionId },
    Shutdown,
}

/// Sending side of the control loop.
///
/// Every method only enqueues a message, so it is safe to call from signal watchers and
/// transport threads.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlMsg>,
}

impl ControlHandle {
    /// Asks the control loop to tear every controller down and return. Returns `false` if the
    /// loop has already exited.
    pub fn request_shutdown(&self) -> bool {
        self.tx.send(ControlMsg::Shutdown).is_ok()
    }
}

impl SessionEvents for ControlHandle {
    fn session_started(&self, ifname: &str, session: SessionId) {
        let msg = ControlMsg::SessionStarted {
            ifname: ifname.to_string(),
            session,
        };
        if self.tx.send(msg).is_err() {
            warn!(ifname, %session, "control loop is gone, dropping new session");
        }
    }

    fn session_stopped(&self, session: SessionId) {
        if self.tx.send(ControlMsg::SessionStopped { session }).is_err() {
            warn!(%session, "control loop is gone, dropping session stop");
        }
    }
}

/// How long shutdown keeps draining controllers with tasks in flight before giving up on them.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a finished control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Controllers removed during shutdown.
    pub removed: usize,
    /// Controllers left in place because their tasks never drained. Their endpoints are
    /// unregistered but their session state is not torn down.
    pub busy: usize,
}

/// Serializes registry mutation and drives the data path.
///
/// Per-core reactors are collapsed onto this one task: each tick drains the active cores one
/// after another, so the core picked by the [`LoadTable`] groups controllers but does not give
/// them a thread of their own.
#[derive(Debug)]
pub struct ControlLoop {
    registry: Registry,
    loads: LoadTable,
    rx: mpsc::UnboundedReceiver<ControlMsg>,
    poll_interval: Duration,
    drain_timeout: Duration,
    /// Sessions whose teardown waits for in-flight tasks.
    deferred_detach: Vec<SessionId>,
    /// New sessions that arrived while their controller was still tearing down an old one.
    deferred_attach: Vec<(String, SessionId)>,
}

impl ControlLoop {
    /// Wraps `registry`; endpoints registered afterwards report their sessions to this loop.
    pub fn new(
        mut registry: Registry,
        loads: LoadTable,
        poll_interval: Duration,
    ) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ControlHandle { tx };
        registry.set_session_events(Arc::new(handle.clone()));
        let control = Self {
            registry,
            loads,
            rx,
            poll_interval,
            drain_timeout: SHUTDOWN_DRAIN_TIMEOUT,
            deferred_detach: Vec::new(),
            deferred_attach: Vec::new(),
        };
        (control, handle)
    }

    /// Replaces [`SHUTDOWN_DRAIN_TIMEOUT`].
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn loads(&self) -> &LoadTable {
        &self.loads
    }

    /// Runs until [`ControlHandle::request_shutdown`] is called, then unregisters every
    /// controller.
    ///
    /// Controllers with tasks in flight keep being drained for up to the drain timeout. Any that
    /// are still busy after that are not torn down.
    pub async fn run(mut self) -> ShutdownSummary {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ControlMsg::SessionStarted { ifname, session }) => {
                        self.session_started(&ifname, session);
                    }
                    Some(ControlMsg::SessionStopped { session }) => {
                        self.session_stopped(session);
                    }
                    Some(ControlMsg::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        info!("shutting down controllers");
        self.drain(&mut ticker).await;
        let removed = self.registry.shutdown(&mut self.loads);
        let busy = self.registry.len();
        if busy > 0 {
            warn!(removed, busy, "controllers still busy at shutdown");
        } else {
            info!(removed, "all controllers removed");
        }
        ShutdownSummary { removed, busy }
    }

    /// Keeps ticking until no controller has tasks in flight or the drain timeout passes. New
    /// sessions are refused; stopped ones are still detached.
    async fn drain(&mut self, ticker: &mut tokio::time::Interval) {
        let deadline = Instant::now() + self.drain_timeout;
        self.deferred_attach.clear();
        while self.registry.tasks_in_flight() > 0 {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ControlMsg::SessionStopped { session }) => self.session_stopped(session),
                    Some(ControlMsg::SessionStarted { ifname, session }) => {
                        debug!(ifname = %ifname, %session, "ignoring session during shutdown");
                    }
                    Some(ControlMsg::Shutdown) => {}
                    None => return,
                },
                _ = ticker.tick() => self.tick(),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        pending = self.registry.tasks_in_flight(),
                        "tasks still in flight after the drain timeout"
                    );
                    return;
                }
            }
        }
    }

    fn session_started(&mut self, ifname: &str, session: SessionId) {
        match self
            .registry
            .attach_session(ifname, session, &mut self.loads)
        {
            Ok(_) => {}
            Err(VhostError::AlreadyAttached { name, session: old })
                if self.deferred_detach.contains(&old) =>
            {
                debug!(controller = %name, %session, %old, "deferring attach until the old session detaches");
                self.deferred_attach.push((ifname.to_string(), session));
            }
            Err(err) => error!(ifname, %session, "failed to attach session: {err}"),
        }
    }

    fn session_stopped(&mut self, session: SessionId) {
        if let Some(pos) = self
            .deferred_attach
            .iter()
            .position(|(_, waiting)| *waiting == session)
        {
            debug!(%session, "session stopped before it was attached");
            self.deferred_attach.remove(pos);
            return;
        }

        match self.registry.detach_session(session, &mut self.loads) {
            Ok(()) => {}
            Err(VhostError::TasksPending { name, count }) => {
                debug!(controller = %name, %session, count, "deferring detach until tasks finish");
                self.deferred_detach.push(session);
            }
            Err(err) => error!(%session, "failed to detach session: {err}"),
        }
    }

    /// One drain cycle on every active core, then a retry of deferred detaches and of the
    /// attaches that were waiting on them.
    fn tick(&mut self) {
        for core in self.registry.active_cores().iter() {
            self.registry.poll_core(core);
        }

        for session in std::mem::take(&mut self.deferred_detach) {
            self.session_stopped(session);
        }
        for (ifname, session) in std::mem::take(&mut self.deferred_attach) {
            self.session_started(&ifname, session);
        }
    }
}
