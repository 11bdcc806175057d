// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Transient upload memory that is thrown away every frame.

[`GpuDiscardBuffer`] keeps one *set* of upload arenas per frame in flight.  During a frame,
allocations are served from whichever arena of the current set has room; when none does, a new
arena of `max(min_allocation_size, request)` bytes is added to the set.

[`GpuDiscardBuffer::prepare`] is called once per frame with the token from
[`crate::tracker::FrameResourceTracker::start_frame`].  By then the tracker has waited on the
slot's fence, so everything in that slot's set can be reused.  A set that needed several arenas
last time around is consolidated into one arena of the combined size, so steady-state frames
settle on a single allocation.

```
use arenas_and_fences::buffer::HostMemorySource;
use arenas_and_fences::discard::GpuDiscardBuffer;
use arenas_and_fences::tracker::FrameToken;

let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 1024, 16).unwrap();
pool.prepare(FrameToken { frame_index: 0, buffering_depth: 2, frame_id: 0 }).unwrap();
let constants = pool.allocate(64, 4, 256).unwrap();
pool.write(&constants, 0, &[1, 2, 3, 4]).unwrap();
assert_eq!(pool.buffer_count(), 1);
```
*/

use crate::buffer::{BufferError, BufferUsage, CreateError, GpuBuffer, MemorySource, SubBuffer};
use crate::tracker::FrameToken;
use std::ops::Range;

/// A region handed out by [`GpuDiscardBuffer::allocate`], valid until the next `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscardAllocation {
    frame_id: u64,
    buffer_index: usize,
    region: SubBuffer,
    size: usize,
}

impl DiscardAllocation {
    /// Index of the arena within the current frame's set.
    pub fn buffer_index(&self) -> usize {
        self.buffer_index
    }

    pub fn region(&self) -> SubBuffer {
        self.region
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscardError {
    #[error("prepare has not been called")]
    NotPrepared,
    #[error("Frame index {frame_index} is outside buffering depth {buffering_depth}")]
    InvalidToken {
        frame_index: usize,
        buffering_depth: usize,
    },
    #[error("Allocation from frame {allocated_in} used during frame {current}")]
    Expired { allocated_in: u64, current: u64 },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Create(#[from] CreateError),
}

#[derive(Debug)]
struct Prepared {
    frame_index: usize,
    frame_id: u64,
}

/// Per-frame pools of upload arenas.
#[derive(Debug)]
pub struct GpuDiscardBuffer<S: MemorySource> {
    source: S,
    min_allocation_size: usize,
    alignment: usize,
    sets: Vec<Vec<GpuBuffer<S::Memory>>>,
    prepared: Option<Prepared>,
}

impl<S: MemorySource> GpuDiscardBuffer<S> {
    /**
    Creates an empty pool.

    New arenas are at least `min_allocation_size` bytes, and their roots carry the
    `alignment` contract.
    */
    pub fn new(source: S, min_allocation_size: usize, alignment: usize) -> Result<Self, DiscardError> {
        if !alignment.is_power_of_two() {
            return Err(BufferError::InvalidAlignment(alignment).into());
        }
        if min_allocation_size == 0 {
            return Err(BufferError::ZeroSized.into());
        }
        Ok(GpuDiscardBuffer {
            source,
            min_allocation_size,
            alignment,
            sets: Vec::new(),
            prepared: None,
        })
    }

    fn create_arena(&self, frame_index: usize, byte_len: usize) -> Result<GpuBuffer<S::Memory>, CreateError> {
        GpuBuffer::create(
            &self.source,
            byte_len,
            BufferUsage::Upload,
            self.alignment,
            &format!("discard set {frame_index}"),
        )
    }

    /**
    Selects the arena set for the frame described by `token` and empties it.

    Call once per frame, after the tracker's `start_frame` has returned `token`.  Until this
    succeeds, no set is selected and `allocate` fails with [`DiscardError::NotPrepared`].
    */
    pub fn prepare(&mut self, token: FrameToken) -> Result<(), DiscardError> {
        //the previous frame's set is in flight from here on
        self.prepared = None;
        if token.frame_index >= token.buffering_depth {
            return Err(DiscardError::InvalidToken {
                frame_index: token.frame_index,
                buffering_depth: token.buffering_depth,
            });
        }
        if self.sets.len() != token.buffering_depth {
            //sets beyond the new depth belong to retired slots; dropping the arenas
            //leaves any in-flight device buffers to the backend's own lifetime tracking
            self.sets.resize_with(token.buffering_depth, Vec::new);
        }
        let index = token.frame_index;
        for arena in &mut self.sets[index] {
            arena.reset();
        }
        if self.sets[index].len() > 1 {
            let count = self.sets[index].len();
            let total: usize = self.sets[index].iter().map(GpuBuffer::size_in_bytes).sum();
            logwise::debuginternal_sync!(
                "Consolidating {count} discard arenas into {total} bytes",
                count = logwise::privacy::LogIt(count),
                total = logwise::privacy::LogIt(total)
            );
            match self.create_arena(index, total) {
                Ok(consolidated) => self.sets[index] = vec![consolidated],
                Err(e) => {
                    //the reset arenas still serve the frame
                    logwise::warn_sync!(
                        "Keeping {count} discard arenas, can't consolidate: {error}",
                        count = logwise::privacy::LogIt(count),
                        error = logwise::privacy::LogIt(&e)
                    );
                }
            }
        }
        self.prepared = Some(Prepared {
            frame_index: index,
            frame_id: token.frame_id,
        });
        Ok(())
    }

    fn current(&self) -> Result<&Prepared, DiscardError> {
        self.prepared.as_ref().ok_or(DiscardError::NotPrepared)
    }

    /**
    Carves `element_count` elements of `stride` bytes out of the current frame's set.

    Existing arenas are scanned in creation order; a new arena is added only when none
    has room.
    */
    pub fn allocate(
        &mut self,
        stride: usize,
        element_count: usize,
        alignment: usize,
    ) -> Result<DiscardAllocation, DiscardError> {
        let (frame_index, frame_id) = {
            let prepared = self.current()?;
            (prepared.frame_index, prepared.frame_id)
        };
        let required = stride
            .checked_mul(element_count)
            .ok_or(BufferError::OutOfCapacity {
                requested: usize::MAX,
                available: 0,
                debug_name: "discard".to_string(),
            })?;
        if required == 0 {
            return Err(BufferError::ZeroSized.into());
        }
        if !alignment.is_power_of_two() {
            return Err(BufferError::InvalidAlignment(alignment).into());
        }

        let mut chosen = None;
        for (i, arena) in self.sets[frame_index].iter().enumerate() {
            if arena.can_fit(arena.root(), required, alignment)? {
                chosen = Some(i);
                break;
            }
        }
        let buffer_index = match chosen {
            Some(i) => i,
            None => {
                let byte_len = self.min_allocation_size.max(required);
                logwise::trace_sync!(
                    "New discard arena of {bytes} bytes for frame slot {slot}",
                    bytes = logwise::privacy::LogIt(byte_len),
                    slot = logwise::privacy::LogIt(frame_index)
                );
                let arena = self.create_arena(frame_index, byte_len)?;
                self.sets[frame_index].push(arena);
                self.sets[frame_index].len() - 1
            }
        };
        let arena = &mut self.sets[frame_index][buffer_index];
        let root = arena.root();
        let region = arena.allocate(root, stride, element_count, BufferUsage::Upload, alignment)?;
        Ok(DiscardAllocation {
            frame_id,
            buffer_index,
            region,
            size: required,
        })
    }

    fn check_live(&self, allocation: &DiscardAllocation) -> Result<usize, DiscardError> {
        let prepared = self.current()?;
        if prepared.frame_id != allocation.frame_id {
            return Err(DiscardError::Expired {
                allocated_in: allocation.frame_id,
                current: prepared.frame_id,
            });
        }
        Ok(prepared.frame_index)
    }

    /// Writes `data` at byte `offset` within `allocation`.
    pub fn write(
        &mut self,
        allocation: &DiscardAllocation,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DiscardError> {
        let frame_index = self.check_live(allocation)?;
        let arena = self.sets[frame_index]
            .get_mut(allocation.buffer_index)
            .ok_or(BufferError::ForeignHandle)?;
        arena.write(allocation.region, offset, data)?;
        Ok(())
    }

    /// The arena holding `allocation`, for binding it to a draw.
    pub fn arena(&self, allocation: &DiscardAllocation) -> Result<&GpuBuffer<S::Memory>, DiscardError> {
        let frame_index = self.check_live(allocation)?;
        Ok(self.sets[frame_index]
            .get(allocation.buffer_index)
            .ok_or(BufferError::ForeignHandle)?)
    }

    /// Byte range of `allocation` within its arena's backing memory.
    pub fn byte_range(&self, allocation: &DiscardAllocation) -> Result<Range<usize>, DiscardError> {
        Ok(self.arena(allocation)?.byte_range(allocation.region)?)
    }

    /// Number of arenas across every frame set.
    pub fn buffer_count(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    /// Total bytes of the arenas in the current frame's set.
    pub fn current_set_capacity(&self) -> usize {
        match &self.prepared {
            Some(prepared) => self.sets[prepared.frame_index]
                .iter()
                .map(GpuBuffer::size_in_bytes)
                .sum(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostMemorySource;

    fn token(frame_id: u64, depth: usize) -> FrameToken {
        FrameToken {
            frame_index: (frame_id % depth as u64) as usize,
            buffering_depth: depth,
            frame_id,
        }
    }

    #[test]
    fn allocation_requires_prepare() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 256, 16).unwrap();
        assert_eq!(pool.allocate(4, 4, 16), Err(DiscardError::NotPrepared));
    }

    #[test]
    fn existing_arenas_are_filled_before_new_ones() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 256, 16).unwrap();
        pool.prepare(token(0, 2)).unwrap();
        let a = pool.allocate(1, 100, 16).unwrap();
        let b = pool.allocate(1, 100, 16).unwrap();
        assert_eq!(a.buffer_index(), 0);
        assert_eq!(b.buffer_index(), 0);
        let c = pool.allocate(1, 100, 16).unwrap();
        assert_eq!(c.buffer_index(), 1);
        //oversized requests get an arena of their own size
        let d = pool.allocate(1, 1000, 16).unwrap();
        assert_eq!(d.buffer_index(), 2);
        assert_eq!(pool.current_set_capacity(), 256 + 256 + 1000);
    }

    #[test]
    fn allocations_expire_at_the_next_prepare() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 256, 16).unwrap();
        pool.prepare(token(0, 1)).unwrap();
        let a = pool.allocate(4, 4, 16).unwrap();
        pool.write(&a, 0, &[9; 16]).unwrap();
        pool.prepare(token(1, 1)).unwrap();
        assert_eq!(
            pool.write(&a, 0, &[1]),
            Err(DiscardError::Expired {
                allocated_in: 0,
                current: 1
            })
        );
    }

    #[test]
    fn failed_consolidation_keeps_the_reset_arenas() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::with_limit(300), 256, 16).unwrap();
        pool.prepare(token(0, 2)).unwrap();
        pool.allocate(1, 200, 16).unwrap();
        pool.allocate(1, 200, 16).unwrap();
        assert_eq!(pool.buffer_count(), 2);
        pool.prepare(token(1, 2)).unwrap();
        let in_flight = pool.allocate(1, 100, 16).unwrap();

        //512 bytes exceeds the limit, so frame 0's two arenas stay
        pool.prepare(token(2, 2)).unwrap();
        assert_eq!(pool.current_set_capacity(), 512);
        let a = pool.allocate(1, 200, 16).unwrap();
        let b = pool.allocate(1, 200, 16).unwrap();
        assert_eq!((a.buffer_index(), b.buffer_index()), (0, 1));
        assert_eq!(a.frame_id(), 2);
        assert_eq!(pool.buffer_count(), 3);
        assert!(matches!(
            pool.write(&in_flight, 0, &[1]),
            Err(DiscardError::Expired { allocated_in: 1, current: 2 })
        ));
    }

    #[test]
    fn tokens_outside_the_depth_are_rejected() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 256, 16).unwrap();
        pool.prepare(token(0, 1)).unwrap();
        pool.allocate(4, 4, 16).unwrap();
        for (frame_index, buffering_depth) in [(2, 2), (0, 0)] {
            let bad = FrameToken {
                frame_index,
                buffering_depth,
                frame_id: 1,
            };
            assert_eq!(
                pool.prepare(bad),
                Err(DiscardError::InvalidToken {
                    frame_index,
                    buffering_depth
                })
            );
            //the previous frame's set is no longer served
            assert_eq!(pool.allocate(4, 4, 16), Err(DiscardError::NotPrepared));
        }
        assert_eq!(pool.buffer_count(), 1);
    }

    #[test]
    fn bad_alignment_creates_no_arena() {
        let mut pool = GpuDiscardBuffer::new(HostMemorySource::new(), 256, 16).unwrap();
        pool.prepare(token(0, 1)).unwrap();
        assert_eq!(
            pool.allocate(4, 4, 3),
            Err(DiscardError::Buffer(BufferError::InvalidAlignment(3)))
        );
        assert_eq!(pool.buffer_count(), 0);
    }

    #[test]
    fn bad_construction_is_rejected() {
        assert!(GpuDiscardBuffer::new(HostMemorySource::new(), 256, 3).is_err());
        assert!(GpuDiscardBuffer::new(HostMemorySource::new(), 0, 16).is_err());
    }
}
