// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Frame slots: one generation's worth of GPU-facing state.
//!
//! A [`TrackedFrame`] bundles the staging arena, fence, and command-list branches used by one
//! frame.  The tracker cycles through an array of them, and each slot moves through these states:
//!
//! - `Uninitialized`: created, never used
//! - `Idle`: reset and ready to record
//! - `Recording`: the CPU is recording the frame
//! - `Submitted`: handed to the GPU; the fence may still be pending
//!
//! A slot's resources are only reset after its fence has signaled (or when it never had one).
//! The tracker enforces this; slots cannot be reset or disposed from outside the crate.

use crate::buffer::{BufferMemory, GpuBuffer};
use crate::command_list::{Branches, CommandList, CommandListPool};
use crate::fence::{Fence, FenceError};
use crate::sys::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Uninitialized,
    Idle,
    Recording,
    Submitted,
}

/// Per-frame staging arena, fence, and command-list branches.
#[derive(Debug)]
pub struct TrackedFrame<F, M, C> {
    slot_index: usize,
    state: SlotState,
    staging: GpuBuffer<M>,
    //size asked of the memory source; backends may round the real size up
    staging_request: usize,
    fence: Option<F>,
    frame_id: Option<u64>,
    branches: Branches<C>,
}

impl<F: Fence, M: BufferMemory, C: CommandList> TrackedFrame<F, M, C> {
    pub(crate) fn new(slot_index: usize, staging: GpuBuffer<M>, staging_request: usize) -> Self {
        TrackedFrame {
            slot_index,
            state: SlotState::Uninitialized,
            staging,
            staging_request,
            fence: None,
            frame_id: None,
            branches: Branches::default(),
        }
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn staging_buffer(&self) -> &GpuBuffer<M> {
        &self.staging
    }

    pub(crate) fn staging_buffer_mut(&mut self) -> &mut GpuBuffer<M> {
        &mut self.staging
    }

    /// The fence armed when this slot was last submitted; `None` before first use and after reset.
    pub fn fence(&self) -> Option<&F> {
        self.fence.as_ref()
    }

    /// The id stamped at submission; `None` unless the slot is submitted.
    pub fn frame_id(&self) -> Option<u64> {
        self.frame_id
    }

    pub fn branch_count(&self) -> usize {
        self.branches.branch_count()
    }

    pub fn branch_len(&self, branch: usize) -> usize {
        self.branches.branch_len(branch)
    }

    pub fn tracked_count(&self) -> usize {
        self.branches.tracked_count()
    }

    /// Whether the slot's resources may be rewritten without waiting.
    pub fn is_idle(&self) -> Result<bool, FenceError> {
        match &self.fence {
            None => Ok(true),
            Some(fence) => fence.poll(),
        }
    }

    /**
    Blocks until the slot's fence (if any) has signaled.

    Returns whether the call actually had to block.
    */
    pub(crate) fn wait(&self, timeout: Duration) -> Result<bool, FenceError> {
        let Some(fence) = &self.fence else {
            return Ok(false);
        };
        if fence.poll()? {
            return Ok(false);
        }
        let _wait = logwise::perfwarn_begin!("TrackedFrame::wait");
        logwise::trace_sync!(
            "Waiting on fence for slot {slot}",
            slot = logwise::privacy::LogIt(self.slot_index)
        );
        fence.wait(timeout)?;
        Ok(true)
    }

    /**
    Releases the slot's command lists and clears its bookkeeping.

    The caller guarantees the fence has signaled.  The reset fence is returned so it can be
    re-armed for later work.
    */
    pub(crate) fn reset(&mut self, pool: &mut CommandListPool<C>) -> Option<F> {
        debug_assert_ne!(self.state, SlotState::Recording);
        self.branches.release_into(pool);
        self.staging.reset();
        self.frame_id = None;
        self.state = SlotState::Idle;
        self.fence.take().map(|mut fence| {
            fence.reset();
            fence
        })
    }

    pub(crate) fn staging_request(&self) -> usize {
        self.staging_request
    }

    pub(crate) fn replace_staging(&mut self, staging: GpuBuffer<M>, staging_request: usize) {
        debug_assert_eq!(self.state, SlotState::Idle);
        self.staging = staging;
        self.staging_request = staging_request;
    }

    pub(crate) fn begin_recording(&mut self) {
        debug_assert_eq!(self.state, SlotState::Idle);
        self.state = SlotState::Recording;
    }

    pub(crate) fn track(&mut self, branch: usize, list: C) {
        self.branches.track(branch, list);
    }

    pub(crate) fn submit(&mut self, frame_id: u64, fence: F) {
        debug_assert_eq!(self.state, SlotState::Recording);
        self.frame_id = Some(frame_id);
        self.fence = Some(fence);
        self.state = SlotState::Submitted;
    }

    /// Permanently frees the slot.  The caller guarantees the slot is idle.
    pub(crate) fn dispose(mut self, pool: &mut CommandListPool<C>) {
        self.branches.release_into(pool);
        logwise::info_sync!(
            "Disposing frame slot {slot} ({bytes} staging bytes)",
            slot = logwise::privacy::LogIt(self.slot_index),
            bytes = logwise::privacy::LogIt(self.staging.size_in_bytes())
        );
    }
}
