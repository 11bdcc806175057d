// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Frame pipelining.

[`FrameResourceTracker`] lets the CPU record frame *n+1* (and beyond) while the GPU executes
frame *n*, without ever rewriting memory the GPU may still be reading.  It owns a ring of
[`TrackedFrame`] slots, one per frame in flight.

# Frame protocol

```text
start_frame ──► record (staging_buffer, track) ──► end_frame(fence) ──► start_frame ...
```

`start_frame` picks the slot at the current frame index and, if that slot was submitted
earlier, waits on its fence.  That wait is the backpressure: the CPU can never be more than
`buffering_depth` frames ahead of the GPU.  Once the wait succeeds the slot's command lists are
recycled and its staging arena is emptied.

`end_frame` stamps the slot with a monotonic frame id, arms it with the fence for the submitted
work, and advances the frame index.

# Failure

A fence that times out or reports a lost device is fatal.  The tracker returns
[`TrackerError::Synchronization`] once and refuses every later frame with
[`TrackerError::Faulted`]; the engine must tear down and rebuild its render state.

# Resizing

[`FrameResourceTracker::request_buffering_depth`] takes effect at the next `start_frame`.
Growing adds slots.  Shrinking removes slots from rotation immediately, but a removed slot is
only disposed once its fence has signaled, so nothing the GPU is reading is freed early.
*/

use crate::buffer::{BufferUsage, CreateError, GpuBuffer, MemorySource};
use crate::command_list::{CommandList, CommandListPool};
use crate::config::{ConfigError, FrameConfig, validate_buffering_depth, validate_staging_bytes};
use crate::fence::{Fence, FenceError};
use crate::frame::TrackedFrame;
use crate::sys::time::{Duration, Instant};

/// Identifies the frame being recorded.  Returned by [`FrameResourceTracker::start_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken {
    /// Index of the slot this frame records into.
    pub frame_index: usize,
    /// Number of slots in rotation for this frame.
    pub buffering_depth: usize,
    /// The id that `end_frame` will stamp on this frame.
    pub frame_id: u64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrackerError {
    #[error("Fence wait failed; GPU memory can no longer be trusted: {0}")]
    Synchronization(FenceError),
    #[error("Tracker is faulted by an earlier synchronization failure: {0}")]
    Faulted(FenceError),
    #[error("A frame is already being recorded")]
    FrameInProgress,
    #[error("No frame is being recorded")]
    NoFrameInProgress,
    #[error("Can't create staging arena: {0}")]
    Memory(#[from] CreateError),
    #[error("Invalid frame configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Counters describing how the pipeline has behaved so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub frames_submitted: u64,
    /// Fence waits in `start_frame` that actually had to block.
    pub blocking_waits: u64,
    /// Total time `start_frame` spent blocked on fences.
    pub time_waiting: Duration,
    pub slots_created: u64,
    pub slots_disposed: u64,
    /// CPU time between the most recent `start_frame` and `end_frame`.
    pub last_recording_time: Option<Duration>,
}

/**
Cycles frame slots so the CPU can record ahead of the GPU.

See the [module documentation](self) for the frame protocol.

`S` creates the per-slot staging arenas, `F` is the fence type the caller arms at `end_frame`,
and `C` is the command-list type recycled between frames.
*/
#[derive(Debug)]
pub struct FrameResourceTracker<S: MemorySource, F: Fence, C: CommandList> {
    source: S,
    //slots are boxed so growing the ring never moves a slot that holds a pending fence
    slots: Vec<Box<TrackedFrame<F, S::Memory, C>>>,
    current_size: usize,
    frame_index: usize,
    config: FrameConfig,
    requested_depth: Option<usize>,
    requested_staging_bytes: Option<usize>,
    next_frame_id: u64,
    recording_since: Option<Instant>,
    faulted: Option<FenceError>,
    pool: CommandListPool<C>,
    spare_fences: Vec<F>,
    stats: TrackerStats,
}

impl<S: MemorySource, F: Fence, C: CommandList> FrameResourceTracker<S, F, C> {
    /// Creates a tracker with `config.buffering_depth` slots, each with its own staging arena.
    pub fn new(source: S, config: FrameConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        let mut tracker = FrameResourceTracker {
            source,
            slots: Vec::with_capacity(config.buffering_depth),
            current_size: config.buffering_depth,
            frame_index: 0,
            config,
            requested_depth: None,
            requested_staging_bytes: None,
            next_frame_id: 0,
            recording_since: None,
            faulted: None,
            pool: CommandListPool::new(),
            spare_fences: Vec::new(),
            stats: TrackerStats::default(),
        };
        tracker.grow_to(tracker.current_size)?;
        logwise::info_sync!(
            "FrameResourceTracker: depth {depth}, staging {staging} bytes per slot",
            depth = logwise::privacy::LogIt(tracker.current_size),
            staging = logwise::privacy::LogIt(tracker.config.max_staging_bytes)
        );
        Ok(tracker)
    }

    fn create_staging(&self, slot_index: usize) -> Result<GpuBuffer<S::Memory>, CreateError> {
        GpuBuffer::create(
            &self.source,
            self.config.max_staging_bytes,
            BufferUsage::Upload,
            self.config.staging_alignment,
            &format!("staging slot {slot_index}"),
        )
    }

    fn grow_to(&mut self, size: usize) -> Result<(), TrackerError> {
        while self.slots.len() < size {
            let slot_index = self.slots.len();
            let staging = self.create_staging(slot_index)?;
            self.slots.push(Box::new(TrackedFrame::new(
                slot_index,
                staging,
                self.config.max_staging_bytes,
            )));
            self.stats.slots_created += 1;
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<(), TrackerError> {
        match &self.faulted {
            Some(e) => Err(TrackerError::Faulted(e.clone())),
            None => Ok(()),
        }
    }

    fn fault(&mut self, error: FenceError) -> TrackerError {
        logwise::error_sync!(
            "Fence failure; refusing further frames: {error}",
            error = logwise::privacy::LogIt(&error)
        );
        self.faulted = Some(error.clone());
        TrackerError::Synchronization(error)
    }

    fn apply_requests(&mut self) -> Result<(), TrackerError> {
        if let Some(bytes) = self.requested_staging_bytes.take() {
            //existing slots pick up the new size as they are reset
            self.config.max_staging_bytes = bytes;
        }
        if let Some(depth) = self.requested_depth.take() {
            if depth != self.current_size {
                logwise::info_sync!(
                    "Buffering depth {old} -> {new}",
                    old = logwise::privacy::LogIt(self.current_size),
                    new = logwise::privacy::LogIt(depth)
                );
                self.grow_to(depth)?;
                self.current_size = depth;
                self.config.buffering_depth = depth;
                if self.frame_index >= depth {
                    self.frame_index = 0;
                }
            }
        }
        Ok(())
    }

    /// Keeps at most one spare fence per slot; callers that arm fresh fences never drain the list.
    fn recycle_fence(&mut self, fence: F) {
        if self.spare_fences.len() < self.slots.len() {
            self.spare_fences.push(fence);
        }
    }

    /// Disposes trailing slots outside the rotation whose fences have signaled.
    fn dispose_retired(&mut self) -> Result<(), TrackerError> {
        while self.slots.len() > self.current_size {
            let idle = match self.slots.last() {
                Some(slot) => slot.is_idle(),
                None => break,
            };
            match idle {
                Ok(true) => {
                    if let Some(mut slot) = self.slots.pop() {
                        if let Some(fence) = slot.reset(&mut self.pool) {
                            self.recycle_fence(fence);
                        }
                        slot.dispose(&mut self.pool);
                        self.stats.slots_disposed += 1;
                    }
                }
                Ok(false) => break,
                Err(e) => return Err(self.fault(e)),
            }
        }
        Ok(())
    }

    /**
    Begins recording a frame.

    Applies pending configuration changes, then blocks until the GPU has finished with the
    slot this frame will reuse.  On return the slot's staging arena is empty and its command
    lists are back in the pool.
    */
    pub fn start_frame(&mut self) -> Result<FrameToken, TrackerError> {
        self.check_usable()?;
        if self.recording_since.is_some() {
            return Err(TrackerError::FrameInProgress);
        }
        self.apply_requests()?;

        let timeout = self.config.fence_timeout;
        let wait_start = Instant::now();
        let blocked = match self.slots[self.frame_index].wait(timeout) {
            Ok(blocked) => blocked,
            Err(e) => return Err(self.fault(e)),
        };
        if blocked {
            self.stats.blocking_waits += 1;
            self.stats.time_waiting += wait_start.elapsed();
        }

        if let Some(fence) = self.slots[self.frame_index].reset(&mut self.pool) {
            self.recycle_fence(fence);
        }
        if self.slots[self.frame_index].staging_request() != self.config.max_staging_bytes {
            let staging = self.create_staging(self.frame_index)?;
            self.slots[self.frame_index].replace_staging(staging, self.config.max_staging_bytes);
        }

        self.dispose_retired()?;

        self.slots[self.frame_index].begin_recording();
        self.recording_since = Some(Instant::now());
        logwise::trace_sync!(
            "start_frame {id} in slot {slot}",
            id = logwise::privacy::LogIt(self.next_frame_id),
            slot = logwise::privacy::LogIt(self.frame_index)
        );
        Ok(FrameToken {
            frame_index: self.frame_index,
            buffering_depth: self.current_size,
            frame_id: self.next_frame_id,
        })
    }

    /**
    Finishes the frame being recorded.

    `fence` must signal once the GPU work submitted for this frame completes.  Returns the id
    stamped on the frame.
    */
    pub fn end_frame(&mut self, fence: F) -> Result<u64, TrackerError> {
        self.check_usable()?;
        let Some(since) = self.recording_since.take() else {
            return Err(TrackerError::NoFrameInProgress);
        };
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.slots[self.frame_index].submit(frame_id, fence);
        self.frame_index = (self.frame_index + 1) % self.current_size;
        self.stats.frames_submitted += 1;
        self.stats.last_recording_time = Some(since.elapsed());
        Ok(frame_id)
    }

    /// Registers `list` on `branch` of the current frame, to be recycled when the slot is reused.
    pub fn track(&mut self, branch: usize, list: C) -> Result<(), TrackerError> {
        self.current_frame_mut()?.track(branch, list);
        Ok(())
    }

    /// A recycled command list, if one is available.
    pub fn acquire_command_list(&mut self) -> Option<C> {
        self.pool.acquire()
    }

    /// A fence from a recycled slot, already reset, ready to be armed for new work.
    pub fn take_spare_fence(&mut self) -> Option<F> {
        self.spare_fences.pop()
    }

    pub fn current_frame(&self) -> Result<&TrackedFrame<F, S::Memory, C>, TrackerError> {
        if self.recording_since.is_none() {
            return Err(TrackerError::NoFrameInProgress);
        }
        Ok(&self.slots[self.frame_index])
    }

    fn current_frame_mut(&mut self) -> Result<&mut TrackedFrame<F, S::Memory, C>, TrackerError> {
        if self.recording_since.is_none() {
            return Err(TrackerError::NoFrameInProgress);
        }
        Ok(&mut self.slots[self.frame_index])
    }

    /// The staging arena of the frame being recorded.
    pub fn staging_buffer(&mut self) -> Result<&mut GpuBuffer<S::Memory>, TrackerError> {
        Ok(self.current_frame_mut()?.staging_buffer_mut())
    }

    /// Changes the number of frames in flight, starting with the next `start_frame`.
    pub fn request_buffering_depth(&mut self, depth: usize) -> Result<(), TrackerError> {
        validate_buffering_depth(depth)?;
        self.requested_depth = Some(depth);
        Ok(())
    }

    /// Changes each slot's staging arena size, starting with the next `start_frame`.
    pub fn request_max_staging_bytes(&mut self, bytes: usize) -> Result<(), TrackerError> {
        validate_staging_bytes(bytes)?;
        self.requested_staging_bytes = Some(bytes);
        Ok(())
    }

    /// Number of slots in rotation.
    pub fn buffering_depth(&self) -> usize {
        self.current_size
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Number of live slots, including retired slots still waiting on their fences.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&TrackedFrame<F, S::Memory, C>> {
        self.slots.get(index).map(Box::as_ref)
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    /// Blocks until every submitted slot's fence has signaled.
    pub fn wait_idle(&mut self) -> Result<(), TrackerError> {
        self.check_usable()?;
        let timeout = self.config.fence_timeout;
        for index in 0..self.slots.len() {
            if let Err(e) = self.slots[index].wait(timeout) {
                return Err(self.fault(e));
            }
        }
        Ok(())
    }
}

impl<S: MemorySource, F: Fence, C: CommandList> Drop for FrameResourceTracker<S, F, C> {
    fn drop(&mut self) {
        if self.faulted.is_some() {
            return;
        }
        if let Err(e) = self.wait_idle() {
            logwise::error_sync!(
                "Dropping tracker with GPU work outstanding: {error}",
                error = logwise::privacy::LogIt(&e)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostMemorySource;
    use crate::fence::{ManualFence, SignaledFence};

    #[derive(Debug, Default)]
    struct Pass {
        draws: u32,
    }

    impl CommandList for Pass {
        fn reset(&mut self) {
            self.draws = 0;
        }
    }

    fn config(depth: usize) -> FrameConfig {
        FrameConfig {
            buffering_depth: depth,
            max_staging_bytes: 1024,
            staging_alignment: 16,
            fence_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn frame_ids_and_indices_advance() {
        let mut tracker: FrameResourceTracker<_, SignaledFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(3)).unwrap();
        for expected in 0..7u64 {
            let token = tracker.start_frame().unwrap();
            assert_eq!(token.frame_id, expected);
            assert_eq!(token.frame_index, (expected % 3) as usize);
            assert_eq!(tracker.end_frame(SignaledFence).unwrap(), expected);
        }
        assert_eq!(tracker.stats().frames_submitted, 7);
        assert_eq!(tracker.stats().blocking_waits, 0);
        assert_eq!(tracker.stats().slots_created, 3);
    }

    #[test]
    fn protocol_misuse_is_reported() {
        let mut tracker: FrameResourceTracker<_, SignaledFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(2)).unwrap();
        assert_eq!(
            tracker.end_frame(SignaledFence),
            Err(TrackerError::NoFrameInProgress)
        );
        assert_eq!(
            tracker.track(0, Pass::default()),
            Err(TrackerError::NoFrameInProgress)
        );
        tracker.start_frame().unwrap();
        assert_eq!(tracker.start_frame(), Err(TrackerError::FrameInProgress));
    }

    #[test]
    fn tracked_lists_are_recycled_when_the_slot_comes_around() {
        let mut tracker: FrameResourceTracker<_, SignaledFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(1)).unwrap();
        tracker.start_frame().unwrap();
        tracker.track(0, Pass { draws: 10 }).unwrap();
        tracker.track(2, Pass { draws: 20 }).unwrap();
        assert_eq!(tracker.current_frame().unwrap().branch_count(), 3);
        assert!(tracker.acquire_command_list().is_none());
        tracker.end_frame(SignaledFence).unwrap();

        tracker.start_frame().unwrap();
        assert_eq!(tracker.current_frame().unwrap().tracked_count(), 0);
        let recycled = tracker.acquire_command_list().unwrap();
        assert_eq!(recycled.draws, 0);
    }

    #[test]
    fn staging_is_emptied_and_resized_between_uses() {
        let mut tracker: FrameResourceTracker<_, SignaledFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(1)).unwrap();
        tracker.start_frame().unwrap();
        let staging = tracker.staging_buffer().unwrap();
        let root = staging.root();
        staging
            .allocate(root, 4, 16, BufferUsage::Upload, 16)
            .unwrap();
        assert_eq!(staging.allocated_bytes(), 64);
        tracker.end_frame(SignaledFence).unwrap();

        tracker.request_max_staging_bytes(4096).unwrap();
        tracker.start_frame().unwrap();
        let staging = tracker.staging_buffer().unwrap();
        assert_eq!(staging.allocated_bytes(), 0);
        assert_eq!(staging.size_in_bytes(), 4096);
    }

    #[test]
    fn fence_failure_faults_the_tracker() {
        let mut tracker: FrameResourceTracker<_, ManualFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(1)).unwrap();
        tracker.start_frame().unwrap();
        let fence = ManualFence::new();
        tracker.end_frame(fence.clone()).unwrap();
        fence.lose_device("removed");

        let lost = FenceError::DeviceLost {
            reason: "removed".to_string(),
        };
        assert_eq!(
            tracker.start_frame(),
            Err(TrackerError::Synchronization(lost.clone()))
        );
        assert!(tracker.is_faulted());
        assert_eq!(tracker.start_frame(), Err(TrackerError::Faulted(lost)));
    }

    #[test]
    fn spare_fences_stay_bounded() {
        let mut tracker: FrameResourceTracker<_, ManualFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(2)).unwrap();
        for _ in 0..1000 {
            tracker.start_frame().unwrap();
            tracker.end_frame(ManualFence::signaled()).unwrap();
        }
        assert_eq!(tracker.spare_fences.len(), 2);

        tracker.request_buffering_depth(1).unwrap();
        for _ in 0..10 {
            tracker.start_frame().unwrap();
            tracker.end_frame(ManualFence::signaled()).unwrap();
        }
        assert_eq!(tracker.slot_count(), 1);
        assert!(tracker.spare_fences.len() <= 2);
        assert!(tracker.take_spare_fence().is_some());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut tracker: FrameResourceTracker<_, SignaledFence, Pass> =
            FrameResourceTracker::new(HostMemorySource::new(), config(2)).unwrap();
        assert_eq!(
            tracker.request_buffering_depth(0),
            Err(TrackerError::Config(ConfigError::ZeroBufferingDepth))
        );
        assert_eq!(
            tracker.request_max_staging_bytes(0),
            Err(TrackerError::Config(ConfigError::ZeroStagingSize))
        );
        assert!(matches!(
            FrameResourceTracker::<_, SignaledFence, Pass>::new(HostMemorySource::new(), config(0)),
            Err(TrackerError::Config(ConfigError::ZeroBufferingDepth))
        ));
    }
}
