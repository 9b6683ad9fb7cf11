//! Controller state and its session-scoped queue/memory state.

use tracing::{debug, warn};
use vhost_virtq::{MemoryTable, VirtQueue};

use crate::backend::VhostBackend;
use crate::error::{QueueSetupError, SessionId, VhostError};
use crate::reactor::CoreMask;
use crate::transport::VhostTransport;

/// Most vrings a single session may bring.
pub const MAX_VHOST_VRINGS: u16 = 256;

/// Everything a controller learns from an active session.
#[derive(Debug)]
pub struct DeviceState {
    queues: Vec<VirtQueue>,
    features: u64,
    mem: MemoryTable,
}

impl DeviceState {
    /// Builds queue and memory state for `session`.
    ///
    /// Either every queue is set up and the memory table fetched, or an error is returned and
    /// nothing is kept.
    pub fn construct(transport: &dyn VhostTransport, session: SessionId) -> Result<Self, VhostError> {
        let count = transport
            .vring_num(session)
            .map_err(|source| VhostError::QueueSetupFailed {
                queue: 0,
                source: source.into(),
            })?;
        if count > MAX_VHOST_VRINGS {
            return Err(VhostError::TooManyQueues {
                count,
                max: MAX_VHOST_VRINGS,
            });
        }

        let mut queues = Vec::with_capacity(usize::from(count));
        for queue in 0..count {
            let vq = setup_queue(transport, session, queue)
                .map_err(|source| VhostError::QueueSetupFailed { queue, source })?;
            queues.push(vq);
        }

        let features = transport
            .negotiated_features(session)
            .map_err(VhostError::FeatureQueryFailed)?;
        let mem = transport
            .mem_table(session)
            .map_err(VhostError::MemoryTableFailed)?;

        Ok(Self {
            queues,
            features,
            mem,
        })
    }

    /// Hands every queue's cursors back to the transport and drops the state.
    pub fn destruct(self, transport: &dyn VhostTransport, session: SessionId) {
        for (queue, vq) in (0u16..).zip(&self.queues) {
            if let Err(err) =
                transport.set_vring_base(session, queue, vq.last_avail_idx(), vq.last_used_idx())
            {
                warn!(%session, queue, "failed to persist vring base: {err}");
            }
        }
    }
}

fn setup_queue(
    transport: &dyn VhostTransport,
    session: SessionId,
    queue: u16,
) -> Result<VirtQueue, QueueSetupError> {
    let vring = transport.vring(session, queue)?;
    // Completion interrupts are decided per enqueue; the guest's override stays off.
    transport.enable_guest_notification(session, queue, false)?;
    Ok(VirtQueue::new(vring)?)
}

/// One registered vhost controller.
#[derive(Debug)]
pub struct VhostDev {
    name: String,
    cpumask: CoreMask,
    lcore: Option<u32>,
    task_cnt: u32,
    session: Option<SessionId>,
    state: Option<DeviceState>,
}

impl VhostDev {
    pub fn new(name: impl Into<String>, cpumask: CoreMask) -> Self {
        Self {
            name: name.into(),
            cpumask,
            lcore: None,
            task_cnt: 0,
            session: None,
            state: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpumask(&self) -> CoreMask {
        self.cpumask
    }

    /// Reactor the controller is bound to while a session is attached.
    pub fn lcore(&self) -> Option<u32> {
        self.lcore
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn pending_tasks(&self) -> u32 {
        self.task_cnt
    }

    pub fn num_queues(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.queues.len())
    }

    pub fn negotiated_features(&self) -> u64 {
        self.state.as_ref().map_or(0, |state| state.features)
    }

    pub fn memory(&self) -> Option<&MemoryTable> {
        self.state.as_ref().map(|state| &state.mem)
    }

    pub fn queue(&self, queue: u16) -> Option<&VirtQueue> {
        self.state.as_ref()?.queues.get(usize::from(queue))
    }

    pub fn queue_mut(&mut self, queue: u16) -> Option<&mut VirtQueue> {
        self.state.as_mut()?.queues.get_mut(usize::from(queue))
    }

    /// Borrows one queue mutably together with the memory table and negotiated features, which
    /// is what a backend needs to serve requests.
    pub fn split_queue(&mut self, queue: u16) -> Option<(&mut VirtQueue, &MemoryTable, u64)> {
        let state = self.state.as_mut()?;
        let vq = state.queues.get_mut(usize::from(queue))?;
        Some((vq, &state.mem, state.features))
    }

    /// Translates a guest physical address through the attached session's memory table.
    pub fn translate(&self, gpa: u64) -> Result<u64, VhostError> {
        let mem = self
            .memory()
            .ok_or_else(|| VhostError::NotAttached(self.name.clone()))?;
        mem.translate(gpa)
            .map_err(|source| VhostError::AddressNotMapped {
                name: self.name.clone(),
                source,
            })
    }

    /// Publishes a completion on `queue` using the session's negotiated features.
    pub fn enqueue_completion(&mut self, queue: u16, id: u16, len: u32) -> Result<bool, VhostError> {
        let features = self.negotiated_features();
        let name = &self.name;
        let vq = self
            .state
            .as_mut()
            .ok_or_else(|| VhostError::NotAttached(name.clone()))?
            .queues
            .get_mut(usize::from(queue))
            .ok_or_else(|| VhostError::UnknownQueue {
                name: name.clone(),
                queue,
            })?;
        vq.enqueue_completion(features, id, len)
            .map_err(|source| VhostError::Protocol {
                name: name.clone(),
                queue,
                source,
            })
    }

    pub fn task_ref(&mut self) -> Result<(), VhostError> {
        self.task_cnt = self
            .task_cnt
            .checked_add(1)
            .ok_or_else(|| VhostError::TaskOverflow(self.name.clone()))?;
        Ok(())
    }

    pub fn task_unref(&mut self) -> Result<(), VhostError> {
        self.task_cnt = self
            .task_cnt
            .checked_sub(1)
            .ok_or_else(|| VhostError::TaskUnderflow(self.name.clone()))?;
        Ok(())
    }

    pub(crate) fn attach(&mut self, session: SessionId, state: DeviceState) {
        self.session = Some(session);
        self.state = Some(state);
    }

    pub(crate) fn detach(&mut self) -> Option<(SessionId, DeviceState)> {
        let session = self.session.take()?;
        let state = self.state.take()?;
        Some((session, state))
    }

    pub(crate) fn bind(&mut self, core: u32) {
        self.lcore = Some(core);
    }

    pub(crate) fn unbind(&mut self) -> Option<u32> {
        self.lcore.take()
    }

    /// Runs one drain cycle over every healthy queue. Returns the number of requests handled.
    ///
    /// A queue on which the guest broke the ring protocol is marked faulted and skipped from then
    /// on; the other queues keep running.
    pub fn poll(&mut self, backend: &dyn VhostBackend) -> usize {
        let mut handled = 0;
        for queue in 0..self.num_queues() {
            let queue = queue as u16;
            if self.queue(queue).map_or(true, VirtQueue::is_faulted) {
                continue;
            }

            match backend.process_queue(self, queue) {
                Ok(count) => handled += count,
                Err(err) => {
                    warn!(
                        controller = %self.name,
                        queue,
                        kind = backend.kind(),
                        "guest violated the ring protocol, disabling queue: {err}"
                    );
                    if let Some(vq) = self.queue_mut(queue) {
                        vq.mark_faulted();
                    }
                }
            }
        }
        if handled > 0 {
            debug!(controller = %self.name, handled, "drained");
        }
        handled
    }
}
