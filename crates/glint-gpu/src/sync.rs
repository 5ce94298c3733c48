//! Host/GPU synchronization.
//!
//! One timeline semaphore serves as the renderer's monotonic fence: every
//! submission signals the next counter value and the host blocks on it before
//! touching dependent resources or reusing the command buffer.

use crate::error::Result;
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited value was reached.
    Complete,
    /// The timeout elapsed before the value was reached.
    TimedOut,
}

/// Monotonic fence built on a timeline semaphore.
///
/// Values are strictly increasing across the lifetime of the fence; a wait on
/// value `v` is satisfied only once the queue has completed all work submitted
/// with signal value >= `v`.
pub struct TimelineFence {
    semaphore: vk::Semaphore,
    value: AtomicU64,
}

impl TimelineFence {
    /// Create the fence with an initial counter of zero.
    ///
    /// # Safety
    /// The device must be valid and support timeline semaphores.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = device.create_semaphore(&create_info, None)?;

        Ok(Self {
            semaphore,
            value: AtomicU64::new(0),
        })
    }

    /// Raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Reserve and return the value the next submission will signal.
    pub fn next_value(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently reserved signal value.
    pub fn last_value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Completed counter value on the GPU timeline.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn completed_value(&self, device: &ash::Device) -> Result<u64> {
        let value = device.get_semaphore_counter_value(self.semaphore)?;
        Ok(value)
    }

    /// Wait until the timeline reaches `value`, or until `timeout_ns` elapses.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(
        &self,
        device: &ash::Device,
        value: u64,
        timeout_ns: u64,
    ) -> Result<WaitOutcome> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match device.wait_semaphores(&wait_info, timeout_ns) {
            Ok(()) => Ok(WaitOutcome::Complete),
            Err(vk::Result::TIMEOUT) => Ok(WaitOutcome::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the timeline reaches `value`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_blocking(&self, device: &ash::Device, value: u64) -> Result<()> {
        // With an unbounded timeout the only outcome is Complete.
        self.wait(device, value, u64::MAX)?;
        Ok(())
    }

    /// Destroy the semaphore.
    ///
    /// # Safety
    /// The device must be valid and no wait may be in flight.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.semaphore, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_strictly_increase() {
        let fence = TimelineFence {
            semaphore: vk::Semaphore::null(),
            value: AtomicU64::new(0),
        };

        let mut last = 0;
        for _ in 0..16 {
            let v = fence.next_value();
            assert!(v > last);
            last = v;
        }
        assert_eq!(fence.last_value(), 16);
    }
}
