// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! CPU-observable completion signals for submitted GPU work.
//!
//! # Overview
//!
//! A [`Fence`] is associated with one batch of submitted work.  The frame tracker holds one
//! fence per frame slot and waits on it before the slot's memory is rewritten; that wait is the
//! only point where the recording thread blocks on the GPU.
//!
//! Fence failures are never retried.  A timeout or a lost device means the CPU can no longer
//! know which memory the GPU is still reading, so [`FenceError`] is fatal to the caller.
//!
//! # Implementations
//!
//! - [`ManualFence`]: signaled explicitly by whoever completes the work.  Clones share state,
//!   so a harness thread (or a CPU-side job system) can signal a fence that the tracker owns.
//! - [`SignaledFence`]: always complete; for timelines where work finishes synchronously.
//! - `WgpuFence` (with `backend_wgpu`): waits on a wgpu submission index.

use crate::sys::time::{Duration, Instant};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// How long a fence wait may block before the device is considered hung.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FenceError {
    #[error("Fence was not signaled within {waited:?}")]
    Timeout { waited: Duration },
    #[error("Device lost: {reason}")]
    DeviceLost { reason: String },
}

/// A completion signal for a batch of submitted GPU work.
pub trait Fence {
    /**
    Blocks until the fence is signaled.

    Fails with [`FenceError::Timeout`] if `timeout` elapses first, or with
    [`FenceError::DeviceLost`] if the work can never complete.
    */
    fn wait(&self, timeout: Duration) -> Result<(), FenceError>;

    /// Checks the fence without blocking.
    fn poll(&self) -> Result<bool, FenceError>;

    /// Returns the fence to the unsignaled state so it can be armed for new work.
    fn reset(&mut self);
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    lost: Option<String>,
    waiters: Vec<r#continue::Sender<()>>,
}

impl FenceState {
    fn outcome(&self) -> Option<Result<(), FenceError>> {
        if let Some(reason) = &self.lost {
            Some(Err(FenceError::DeviceLost {
                reason: reason.clone(),
            }))
        } else if self.signaled {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn wake_async_waiters(&mut self) {
        for sender in self.waiters.drain(..) {
            sender.send(());
        }
    }
}

impl Drop for FenceState {
    fn drop(&mut self) {
        //resume anyone still awaiting; they will observe an unsignaled fence
        self.wake_async_waiters();
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<FenceState>,
    condvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/**
A fence signaled explicitly with [`ManualFence::signal`].

```
use arenas_and_fences::fence::{Fence, ManualFence};
use std::time::Duration;

let fence = ManualFence::new();
let signaler = fence.clone();
let t = std::thread::spawn(move || signaler.signal());
fence.wait(Duration::from_secs(5)).unwrap();
t.join().unwrap();
```
*/
#[derive(Debug, Clone, Default)]
pub struct ManualFence {
    shared: Arc<Shared>,
}

impl ManualFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fence that is already signaled.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    /// Marks the work complete and wakes every waiter.
    pub fn signal(&self) {
        let mut state = self.shared.lock();
        state.signaled = true;
        state.wake_async_waiters();
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Reports that the work will never complete; every current and future wait fails.
    pub fn lose_device(&self, reason: &str) {
        let mut state = self.shared.lock();
        state.lost = Some(reason.to_string());
        state.wake_async_waiters();
        drop(state);
        self.shared.condvar.notify_all();
    }

    /**
    Resolves once the fence is signaled or the device is lost.

    This lets async render loops pace themselves on a fence without parking a thread.
    */
    pub fn completion(&self) -> impl Future<Output = Result<(), FenceError>> + use<> {
        let shared = self.shared.clone();
        async move {
            loop {
                let receiver = {
                    let mut state = shared.lock();
                    if let Some(outcome) = state.outcome() {
                        return outcome;
                    }
                    let (sender, receiver) = r#continue::continuation();
                    state.waiters.push(sender);
                    receiver
                };
                receiver.await;
            }
        }
    }
}

impl Fence for ManualFence {
    fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let start = Instant::now();
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .condvar
            .wait_timeout_while(state, timeout, |s| s.outcome().is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome().unwrap_or(Err(FenceError::Timeout {
            waited: start.elapsed(),
        }))
    }

    fn poll(&self) -> Result<bool, FenceError> {
        match self.shared.lock().outcome() {
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    fn reset(&mut self) {
        self.shared.lock().signaled = false;
    }
}

/// A fence whose work is always already complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignaledFence;

impl Fence for SignaledFence {
    fn wait(&self, _timeout: Duration) -> Result<(), FenceError> {
        Ok(())
    }
    fn poll(&self) -> Result<bool, FenceError> {
        Ok(true)
    }
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsignaled_fence_times_out() {
        let fence = ManualFence::new();
        let err = fence.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FenceError::Timeout { .. }));
        assert_eq!(fence.poll(), Ok(false));
    }

    #[test]
    fn signal_from_another_thread_releases_wait() {
        let fence = ManualFence::new();
        let signaler = fence.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        fence.wait(Duration::from_secs(5)).unwrap();
        t.join().unwrap();
        assert_eq!(fence.poll(), Ok(true));
    }

    #[test]
    fn lost_device_fails_every_wait() {
        let fence = ManualFence::new();
        fence.lose_device("hung");
        let expected = FenceError::DeviceLost {
            reason: "hung".to_string(),
        };
        assert_eq!(fence.wait(Duration::from_secs(1)), Err(expected.clone()));
        assert_eq!(fence.poll(), Err(expected));
    }

    #[test]
    fn reset_clears_the_signal() {
        let mut fence = ManualFence::signaled();
        assert_eq!(fence.poll(), Ok(true));
        fence.reset();
        assert_eq!(fence.poll(), Ok(false));
    }

    #[test]
    fn completion_resolves_after_signal() {
        let fence = ManualFence::new();
        let signaler = fence.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        let outcome = test_executors::spin_on(fence.completion());
        assert_eq!(outcome, Ok(()));
        t.join().unwrap();
    }
}
