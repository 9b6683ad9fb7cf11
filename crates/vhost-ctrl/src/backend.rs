//! Device-kind capability trait and the zero-fill backend.

use thiserror::Error;
use vhost_virtq::{VirtQueueError, VIRTIO_F_NOTIFY_ON_EMPTY};

use crate::device::VhostDev;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend refused the device: {0}")]
    Refused(String),
}

/// Behaviour of one device kind (block, SCSI, ...), selected when a controller is registered.
///
/// Hooks run on the control context. `process_queue` runs once per drain cycle for every queue
/// of an attached device that has not faulted.
pub trait VhostBackend: Send + Sync {
    /// Short name of the device kind, used in logs.
    fn kind(&self) -> &'static str;

    /// Virtio features offered to the guest.
    fn virtio_features(&self) -> u64;

    /// Features withdrawn from the transport's default set.
    fn disabled_features(&self) -> u64 {
        0
    }

    /// Called after a session's queues and memory table are in place.
    fn construct(&self, _dev: &VhostDev) -> Result<(), BackendError> {
        Ok(())
    }

    /// Drains available requests of `queue` and completes them. Returns the number of requests
    /// handled.
    fn process_queue(&self, dev: &mut VhostDev, queue: u16) -> Result<usize, VirtQueueError>;

    /// Called before the session state is torn down.
    fn destruct(&self, _dev: &VhostDev) {}
}

/// A device whose every read returns zeroes.
///
/// Each writable descriptor of a chain is zero-filled and the chain completes with the number of
/// bytes written. Readable descriptors are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroBackend;

impl ZeroBackend {
    /// Requests taken from a queue per drain cycle.
    pub const BATCH: usize = 32;
}

impl VhostBackend for ZeroBackend {
    fn kind(&self) -> &'static str {
        "zero"
    }

    fn virtio_features(&self) -> u64 {
        VIRTIO_F_NOTIFY_ON_EMPTY
    }

    fn process_queue(&self, dev: &mut VhostDev, queue: u16) -> Result<usize, VirtQueueError> {
        let Some((vq, mem, features)) = dev.split_queue(queue) else {
            return Ok(0);
        };

        let mut heads = [0u16; Self::BATCH];
        let count = vq.fetch_available(&mut heads)?;
        for &head in &heads[..count] {
            let mut written = 0u32;
            for item in vq.chain(head) {
                let (_, desc) = item?;
                if !desc.is_writable() {
                    continue;
                }
                let len = u64::from(desc.len);
                let addr = mem.translate_range(desc.addr, len)?;
                mem.host_memory().fill(addr, len, 0)?;
                written = written.saturating_add(desc.len);
            }
            vq.enqueue_completion(features, head, written)?;
        }
        Ok(count)
    }
}
