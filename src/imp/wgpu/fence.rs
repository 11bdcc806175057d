// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::fence::{Fence, FenceError};
use crate::sys::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wgpu::PollType;

#[derive(Debug)]
struct Armed {
    submission: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

/**
A fence over work submitted to a wgpu queue.

Arm it right after `Queue::submit` with the returned index.  Completion is observed through
`Queue::on_submitted_work_done`, which wgpu only delivers while the device is being polled;
[`Fence::poll`] and [`Fence::wait`] both drive the device.

wgpu's blocking poll has no caller-provided timeout, so `wait` relies on wgpu's own device
timeout and reports its failures as [`FenceError::DeviceLost`].  A fence that has been reset
and not re-armed covers no submission and never signals.
*/
#[derive(Debug)]
pub struct WgpuFence {
    device: wgpu::Device,
    armed: Option<Armed>,
}

impl WgpuFence {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, submission: wgpu::SubmissionIndex) -> Self {
        let mut fence = WgpuFence {
            device: device.clone(),
            armed: None,
        };
        fence.arm(queue, submission);
        fence
    }

    /// Points the fence at newly submitted work.
    pub fn arm(&mut self, queue: &wgpu::Queue, submission: wgpu::SubmissionIndex) {
        let done = Arc::new(AtomicBool::new(false));
        let move_done = done.clone();
        queue.on_submitted_work_done(move || {
            move_done.store(true, Ordering::Release);
        });
        self.armed = Some(Armed { submission, done });
    }

    fn lost(error: wgpu::PollError) -> FenceError {
        FenceError::DeviceLost {
            reason: error.to_string(),
        }
    }
}

impl Fence for WgpuFence {
    fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let Some(armed) = &self.armed else {
            return Err(FenceError::Timeout { waited: timeout });
        };
        if armed.done.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device
            .poll(PollType::WaitForSubmissionIndex(armed.submission.clone()))
            .map_err(Self::lost)?;
        Ok(())
    }

    fn poll(&self) -> Result<bool, FenceError> {
        let Some(armed) = &self.armed else {
            return Ok(false);
        };
        if !armed.done.load(Ordering::Acquire) {
            self.device.poll(PollType::Poll).map_err(Self::lost)?;
        }
        Ok(armed.done.load(Ordering::Acquire))
    }

    fn reset(&mut self) {
        self.armed = None;
    }
}
