// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Sub-allocatable GPU buffers.

# Overview

A [`GpuBuffer`] is an *arena*: one fixed-size device allocation that is carved into smaller
regions on demand.  Each region is itself sub-allocatable, so an engine can reserve e.g. a
per-pass region out of a large vertex arena and then carve per-draw regions out of that.

Regions are named by [`SubBuffer`] handles.  The arena owns every region; a handle is only a
name, and a region's record of its parent is lookup-only.  Handles are generational, so a
handle to a region that was freed (or released by [`GpuBuffer::reset`]) is detected rather
than silently aliasing whatever reused that slot.

# Allocation strategy

Allocation is a bump pointer with a best-fit free list layered on top:

1. Regions returned with [`GpuBuffer::free`] are kept on their parent's free list.
   A request is first served by the *smallest* free block that fits (and that starts at the
   requested alignment).  The block keeps its reserved size.
2. Otherwise the parent's bump pointer is aligned up and advanced.  If the parent's region
   cannot hold the request, allocation fails with [`BufferError::OutOfCapacity`]; the caller
   decides whether to grow the arena, defer, or drop the draw.

Free blocks are never coalesced.  Regions are expected to be frame-scoped and released in bulk
with [`GpuBuffer::reset`].

# Example

```
use arenas_and_fences::buffer::{BufferUsage, GpuBuffer, HostMemory, MapType};

let memory = HostMemory::new(1024, MapType::Write, "example");
let mut arena = GpuBuffer::new(memory, BufferUsage::Vertex, 16, "example").unwrap();
let root = arena.root();

let first = arena.allocate(root, 1, 100, BufferUsage::Vertex, 16).unwrap();
let second = arena.allocate(root, 1, 50, BufferUsage::Vertex, 16).unwrap();
assert_eq!(arena.describe(second).unwrap().offset, 112);
assert_eq!(arena.describe(root).unwrap().allocated_bytes, 162);

arena.free(first).unwrap();
let third = arena.allocate(root, 1, 90, BufferUsage::Vertex, 16).unwrap();
assert_eq!(arena.describe(third).unwrap().offset, 0);
assert_eq!(arena.describe(root).unwrap().allocated_bytes, 162);
```
*/

mod free_list;
mod memory;
mod shared;
mod usage;

pub use memory::{BufferMemory, HostMemory, HostMemorySource, MemoryError, MemorySource};
pub use shared::SharedGpuBuffer;
pub use usage::{BufferUsage, MapType};

use crate::bittricks::align_up;
use free_list::FreeList;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

const ROOT_SLOT: u32 = 0;

/**
Names a region of a [`GpuBuffer`].

Handles are cheap to copy and carry no ownership.  They are only meaningful to the arena that
produced them.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubBuffer {
    arena: u64,
    slot: u32,
    generation: u32,
}

/// A snapshot of one region's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Bytes per element.
    pub stride: usize,
    pub element_count: usize,
    /// `stride * element_count`.
    pub size_in_bytes: usize,
    /// Bytes set aside for this region.  At least `size_in_bytes`; larger when the region
    /// reuses a bigger free block.
    pub reserved_bytes: usize,
    pub alignment: usize,
    /// Byte offset within the parent region (0 for the root).
    pub offset: usize,
    /// Byte offset within the arena's backing memory.
    pub absolute_offset: usize,
    /// High-water mark of bump allocation inside this region.
    pub allocated_bytes: usize,
    pub parent: Option<SubBuffer>,
    pub usage: BufferUsage,
    /// Live children.
    pub allocations: usize,
    /// Children returned with `free` and available for reuse.
    pub free_allocations: usize,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BufferError {
    #[error("Arena {debug_name} can't fit {requested} bytes ({available} available)")]
    OutOfCapacity {
        requested: usize,
        available: usize,
        debug_name: String,
    },
    #[error("Can't free a buffer that has no parent")]
    NoParent,
    #[error("Buffer is not owned by the given parent")]
    NotOwner,
    #[error("Buffer handle refers to a region that was freed")]
    StaleHandle,
    #[error("Buffer handle belongs to a different arena")]
    ForeignHandle,
    #[error("Zero-sized buffers are not allowed")]
    ZeroSized,
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    WriteOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Live,
    /// On its parent's free list.
    Free,
    /// Slot is unused and may be recycled for a new region.
    Vacant,
}

#[derive(Debug)]
struct Node {
    generation: u32,
    state: NodeState,
    parent: Option<u32>,
    start: usize,
    reserved: usize,
    stride: usize,
    element_count: usize,
    alignment: usize,
    usage: BufferUsage,
    allocated_bytes: usize,
    allocations: Vec<u32>,
    free: FreeList,
}

impl Node {
    fn size_in_bytes(&self) -> usize {
        self.stride * self.element_count
    }
}

/**
A fixed-size arena of device memory that hands out sub-regions.

See the [module documentation](self) for the allocation strategy.
*/
#[derive(Debug)]
pub struct GpuBuffer<M> {
    id: u64,
    memory: M,
    nodes: Vec<Node>,
    vacant: Vec<u32>,
    debug_name: String,
}

impl<M: BufferMemory> GpuBuffer<M> {
    /**
    Wraps `memory` as an arena whose root region spans all of it.

    `alignment` is the alignment contract of the root; the root always starts at offset 0.
    */
    pub fn new(
        memory: M,
        usage: BufferUsage,
        alignment: usize,
        debug_name: &str,
    ) -> Result<Self, BufferError> {
        let byte_len = memory.byte_len();
        Self::with_layout(memory, 1, byte_len, usage, alignment, debug_name)
    }

    /// Wraps `memory` as an arena of `element_count` elements of `stride` bytes.
    pub fn with_layout(
        memory: M,
        stride: usize,
        element_count: usize,
        usage: BufferUsage,
        alignment: usize,
        debug_name: &str,
    ) -> Result<Self, BufferError> {
        validate_alignment(alignment)?;
        let size = required_bytes(stride, element_count)?;
        if size > memory.byte_len() {
            return Err(BufferError::OutOfCapacity {
                requested: size,
                available: memory.byte_len(),
                debug_name: debug_name.to_string(),
            });
        }
        let root = Node {
            generation: 0,
            state: NodeState::Live,
            parent: None,
            start: 0,
            reserved: size,
            stride,
            element_count,
            alignment,
            usage,
            allocated_bytes: 0,
            allocations: Vec::new(),
            free: FreeList::default(),
        };
        logwise::trace_sync!(
            "GpuBuffer::new {name} size {size}",
            name = logwise::privacy::LogIt(debug_name),
            size = logwise::privacy::LogIt(size)
        );
        Ok(GpuBuffer {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            memory,
            nodes: vec![root],
            vacant: Vec::new(),
            debug_name: debug_name.to_string(),
        })
    }

    /// Creates a fresh arena of `byte_len` bytes from `source`.
    pub fn create<S>(
        source: &S,
        byte_len: usize,
        usage: BufferUsage,
        alignment: usize,
        debug_name: &str,
    ) -> Result<Self, CreateError>
    where
        S: MemorySource<Memory = M>,
    {
        let memory = source.create(byte_len, usage, debug_name)?;
        Ok(Self::new(memory, usage, alignment, debug_name)?)
    }

    /// Handle to the region spanning the whole arena.
    pub fn root(&self) -> SubBuffer {
        SubBuffer {
            arena: self.id,
            slot: ROOT_SLOT,
            generation: self.nodes[ROOT_SLOT as usize].generation,
        }
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Size of the root region.
    pub fn size_in_bytes(&self) -> usize {
        self.nodes[ROOT_SLOT as usize].size_in_bytes()
    }

    /// High-water mark of the root region.
    pub fn allocated_bytes(&self) -> usize {
        self.nodes[ROOT_SLOT as usize].allocated_bytes
    }

    fn handle(&self, slot: u32) -> SubBuffer {
        SubBuffer {
            arena: self.id,
            slot,
            generation: self.nodes[slot as usize].generation,
        }
    }

    fn resolve(&self, buffer: SubBuffer) -> Result<u32, BufferError> {
        if buffer.arena != self.id {
            return Err(BufferError::ForeignHandle);
        }
        match self.nodes.get(buffer.slot as usize) {
            Some(node) if node.generation == buffer.generation && node.state == NodeState::Live => {
                Ok(buffer.slot)
            }
            Some(_) => Err(BufferError::StaleHandle),
            None => Err(BufferError::ForeignHandle),
        }
    }

    /**
    Carves `element_count` elements of `stride` bytes out of `parent`.

    The smallest suitable block on `parent`'s free list is reused when there is one;
    otherwise the region is bump-allocated at the next `alignment` boundary.
    */
    pub fn allocate(
        &mut self,
        parent: SubBuffer,
        stride: usize,
        element_count: usize,
        usage: BufferUsage,
        alignment: usize,
    ) -> Result<SubBuffer, BufferError> {
        let parent_slot = self.resolve(parent)?;
        validate_alignment(alignment)?;
        let required = required_bytes(stride, element_count)?;

        if let Some(reused) = self.nodes[parent_slot as usize]
            .free
            .take_best_fit(required, alignment)
        {
            let node = &mut self.nodes[reused as usize];
            node.state = NodeState::Live;
            node.stride = stride;
            node.element_count = element_count;
            node.usage = usage;
            node.alignment = alignment;
            self.nodes[parent_slot as usize].allocations.push(reused);
            logwise::trace_sync!(
                "{name}: reused free block for {required} bytes",
                name = logwise::privacy::LogIt(&self.debug_name),
                required = logwise::privacy::LogIt(required)
            );
            return Ok(self.handle(reused));
        }

        let (region_start, region_end, high_water) = {
            let p = &self.nodes[parent_slot as usize];
            (p.start, p.start + p.reserved, p.start + p.allocated_bytes)
        };
        let aligned = align_up(high_water, alignment).unwrap_or(usize::MAX);
        let available = region_end.saturating_sub(aligned);
        if available < required {
            logwise::warn_sync!(
                "{name}: out of capacity; requested {requested} bytes, {available} available",
                name = logwise::privacy::LogIt(&self.debug_name),
                requested = logwise::privacy::LogIt(required),
                available = logwise::privacy::LogIt(available)
            );
            return Err(BufferError::OutOfCapacity {
                requested: required,
                available,
                debug_name: self.debug_name.clone(),
            });
        }
        self.nodes[parent_slot as usize].allocated_bytes = aligned + required - region_start;

        let node = Node {
            generation: 0,
            state: NodeState::Live,
            parent: Some(parent_slot),
            start: aligned,
            reserved: required,
            stride,
            element_count,
            alignment,
            usage,
            allocated_bytes: 0,
            allocations: Vec::new(),
            free: FreeList::default(),
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                let generation = self.nodes[slot as usize].generation;
                self.nodes[slot as usize] = Node { generation, ..node };
                slot
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        self.nodes[parent_slot as usize].allocations.push(slot);
        Ok(self.handle(slot))
    }

    /// Convenience for allocating directly out of the root region.
    pub fn allocate_root(
        &mut self,
        stride: usize,
        element_count: usize,
        usage: BufferUsage,
        alignment: usize,
    ) -> Result<SubBuffer, BufferError> {
        self.allocate(self.root(), stride, element_count, usage, alignment)
    }

    /**
    Returns `child` to `parent`'s free list.

    Fails with [`BufferError::NotOwner`] unless `parent` is `child`'s direct parent.
    Everything `child` had itself carved out is released along with it, and every
    handle into that subtree becomes stale.
    */
    pub fn free_child(&mut self, parent: SubBuffer, child: SubBuffer) -> Result<(), BufferError> {
        let parent_slot = self.resolve(parent)?;
        let child_slot = self.resolve(child)?;
        if self.nodes[child_slot as usize].parent != Some(parent_slot) {
            return Err(BufferError::NotOwner);
        }
        self.nodes[parent_slot as usize]
            .allocations
            .retain(|s| *s != child_slot);
        self.release_descendants(child_slot);

        let node = &mut self.nodes[child_slot as usize];
        node.state = NodeState::Free;
        node.generation = node.generation.wrapping_add(1);
        node.allocated_bytes = 0;
        let (start, reserved) = (node.start, node.reserved);
        self.nodes[parent_slot as usize]
            .free
            .insert(child_slot, start, reserved);
        Ok(())
    }

    /// Returns `buffer` to its own parent's free list.
    pub fn free(&mut self, buffer: SubBuffer) -> Result<(), BufferError> {
        let slot = self.resolve(buffer)?;
        let parent_slot = self.nodes[slot as usize]
            .parent
            .ok_or(BufferError::NoParent)?;
        let parent = self.handle(parent_slot);
        self.free_child(parent, buffer)
    }

    fn release_descendants(&mut self, slot: u32) {
        let node = &mut self.nodes[slot as usize];
        let mut pending: Vec<u32> = node.allocations.drain(..).collect();
        pending.extend(node.free.drain_slots());
        while let Some(next) = pending.pop() {
            let node = &mut self.nodes[next as usize];
            pending.extend(node.allocations.drain(..));
            pending.extend(node.free.drain_slots());
            self.vacate(next);
        }
    }

    fn vacate(&mut self, slot: u32) {
        let node = &mut self.nodes[slot as usize];
        node.state = NodeState::Vacant;
        node.generation = node.generation.wrapping_add(1);
        node.allocated_bytes = 0;
        node.parent = None;
        self.vacant.push(slot);
    }

    /**
    Releases every region of the arena at once.

    All outstanding handles other than [`GpuBuffer::root`] become stale.
    */
    pub fn reset(&mut self) {
        self.release_descendants(ROOT_SLOT);
        self.nodes[ROOT_SLOT as usize].allocated_bytes = 0;
    }

    pub fn describe(&self, buffer: SubBuffer) -> Result<BufferInfo, BufferError> {
        let slot = self.resolve(buffer)?;
        let node = &self.nodes[slot as usize];
        let parent_start = node
            .parent
            .map(|p| self.nodes[p as usize].start)
            .unwrap_or(0);
        Ok(BufferInfo {
            stride: node.stride,
            element_count: node.element_count,
            size_in_bytes: node.size_in_bytes(),
            reserved_bytes: node.reserved,
            alignment: node.alignment,
            offset: node.start - parent_start,
            absolute_offset: node.start,
            allocated_bytes: node.allocated_bytes,
            parent: node.parent.map(|p| self.handle(p)),
            usage: node.usage,
            allocations: node.allocations.len(),
            free_allocations: node.free.len(),
        })
    }

    /// Live children of `buffer`, in allocation order.
    pub fn allocations(&self, buffer: SubBuffer) -> Result<Vec<SubBuffer>, BufferError> {
        let slot = self.resolve(buffer)?;
        Ok(self.nodes[slot as usize]
            .allocations
            .iter()
            .map(|s| self.handle(*s))
            .collect())
    }

    /// The bytes of the backing memory that `buffer` covers.
    pub fn byte_range(&self, buffer: SubBuffer) -> Result<Range<usize>, BufferError> {
        let slot = self.resolve(buffer)?;
        let node = &self.nodes[slot as usize];
        Ok(node.start..node.start + node.size_in_bytes())
    }

    /**
    Whether `parent` could currently serve a request of `required` bytes at `alignment`,
    either from its free list or from its remaining bump capacity.
    */
    pub fn can_fit(
        &self,
        parent: SubBuffer,
        required: usize,
        alignment: usize,
    ) -> Result<bool, BufferError> {
        let slot = self.resolve(parent)?;
        validate_alignment(alignment)?;
        let node = &self.nodes[slot as usize];
        if node.free.has_fit(required, alignment) {
            return Ok(true);
        }
        let available = align_up(node.start + node.allocated_bytes, alignment)
            .map(|aligned| (node.start + node.reserved).saturating_sub(aligned))
            .unwrap_or(0);
        Ok(available >= required)
    }

    /// Bytes of `buffer` not yet claimed by bump allocation, plus bytes on its free list.
    pub fn unused_bytes(&self, buffer: SubBuffer) -> Result<usize, BufferError> {
        let slot = self.resolve(buffer)?;
        let node = &self.nodes[slot as usize];
        Ok(node.reserved - node.allocated_bytes + node.free.free_bytes())
    }

    /// Writes `data` at byte `offset` within `buffer`.
    pub fn write(&mut self, buffer: SubBuffer, offset: usize, data: &[u8]) -> Result<(), BufferError> {
        let range = self.byte_range(buffer)?;
        let size = range.len();
        if offset.checked_add(data.len()).is_none_or(|end| end > size) {
            return Err(BufferError::WriteOutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        self.memory.write(range.start + offset, data);
        Ok(())
    }
}

/// Error creating an arena from a [`MemorySource`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CreateError {
    #[error("Can't create backing memory: {0}")]
    Memory(#[from] MemoryError),
    #[error("Can't set up arena: {0}")]
    Buffer(#[from] BufferError),
}

fn validate_alignment(alignment: usize) -> Result<(), BufferError> {
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(BufferError::InvalidAlignment(alignment))
    }
}

fn required_bytes(stride: usize, element_count: usize) -> Result<usize, BufferError> {
    match stride.checked_mul(element_count) {
        Some(0) => Err(BufferError::ZeroSized),
        Some(bytes) => Ok(bytes),
        None => Err(BufferError::OutOfCapacity {
            requested: usize::MAX,
            available: 0,
            debug_name: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(bytes: usize) -> GpuBuffer<HostMemory> {
        GpuBuffer::new(
            HostMemory::new(bytes, MapType::Write, "test"),
            BufferUsage::Upload,
            16,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn bump_allocation_aligns_offsets() {
        let mut a = arena(1024);
        let first = a.allocate_root(1, 100, BufferUsage::Vertex, 16).unwrap();
        let second = a.allocate_root(1, 50, BufferUsage::Vertex, 16).unwrap();
        assert_eq!(a.describe(first).unwrap().offset, 0);
        assert_eq!(a.describe(second).unwrap().offset, 112);
        assert_eq!(a.allocated_bytes(), 162);
        assert_eq!(a.allocations(a.root()).unwrap(), vec![first, second]);
    }

    #[test]
    fn reused_block_keeps_reservation() {
        let mut a = arena(1024);
        let first = a.allocate_root(4, 25, BufferUsage::Vertex, 16).unwrap();
        a.free(first).unwrap();
        let again = a.allocate_root(2, 40, BufferUsage::Index, 16).unwrap();
        let info = a.describe(again).unwrap();
        assert_eq!(info.size_in_bytes, 80);
        assert_eq!(info.reserved_bytes, 100);
        assert_eq!(info.usage, BufferUsage::Index);
        assert_eq!(a.describe(first), Err(BufferError::StaleHandle));
    }

    #[test]
    fn freeing_root_is_an_error() {
        let mut a = arena(64);
        let root = a.root();
        assert_eq!(a.free(root), Err(BufferError::NoParent));
    }

    #[test]
    fn freeing_through_wrong_parent_is_an_error() {
        let mut a = arena(1024);
        let outer = a.allocate_root(1, 256, BufferUsage::Vertex, 16).unwrap();
        let inner = a.allocate(outer, 1, 64, BufferUsage::Vertex, 16).unwrap();
        let root = a.root();
        assert_eq!(a.free_child(root, inner), Err(BufferError::NotOwner));
        assert!(a.free_child(outer, inner).is_ok());
    }

    #[test]
    fn child_never_allocates_past_its_region() {
        let mut a = arena(1024);
        let _pad = a.allocate_root(1, 112, BufferUsage::Vertex, 16).unwrap();
        let child = a.allocate_root(1, 128, BufferUsage::Vertex, 16).unwrap();
        let _grandchild = a.allocate(child, 1, 100, BufferUsage::Vertex, 16).unwrap();
        let err = a.allocate(child, 1, 20, BufferUsage::Vertex, 16).unwrap_err();
        assert!(matches!(
            err,
            BufferError::OutOfCapacity {
                requested: 20,
                available: 16,
                ..
            }
        ));
    }

    #[test]
    fn freeing_parent_releases_subtree() {
        let mut a = arena(1024);
        let child = a.allocate_root(1, 256, BufferUsage::Vertex, 16).unwrap();
        let grandchild = a.allocate(child, 1, 32, BufferUsage::Vertex, 16).unwrap();
        a.free(child).unwrap();
        assert_eq!(a.describe(grandchild), Err(BufferError::StaleHandle));
        let reused = a.allocate_root(1, 200, BufferUsage::Vertex, 16).unwrap();
        assert_eq!(a.describe(reused).unwrap().allocated_bytes, 0);
        assert_eq!(a.describe(reused).unwrap().allocations, 0);
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut a = arena(256);
        let child = a.allocate_root(1, 64, BufferUsage::Vertex, 16).unwrap();
        a.reset();
        assert_eq!(a.allocated_bytes(), 0);
        assert_eq!(a.describe(child), Err(BufferError::StaleHandle));
        let fresh = a.allocate_root(1, 64, BufferUsage::Vertex, 16).unwrap();
        assert_ne!(fresh, child);
        assert_eq!(a.describe(fresh).unwrap().offset, 0);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut a = arena(256);
        let b = arena(256);
        assert_eq!(
            a.allocate(b.root(), 1, 8, BufferUsage::Vertex, 16),
            Err(BufferError::ForeignHandle)
        );
    }

    #[test]
    fn bad_requests_are_rejected() {
        let mut a = arena(256);
        assert_eq!(
            a.allocate_root(0, 8, BufferUsage::Vertex, 16),
            Err(BufferError::ZeroSized)
        );
        assert_eq!(
            a.allocate_root(1, 8, BufferUsage::Vertex, 12),
            Err(BufferError::InvalidAlignment(12))
        );
    }

    #[test]
    fn writes_land_at_absolute_offsets() {
        let mut a = arena(256);
        let _pad = a.allocate_root(1, 16, BufferUsage::Vertex, 16).unwrap();
        let child = a.allocate_root(1, 8, BufferUsage::Vertex, 16).unwrap();
        a.write(child, 2, &[1, 2, 3]).unwrap();
        assert_eq!(&a.memory().as_slice()[16..24], &[0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(matches!(
            a.write(child, 6, &[1, 2, 3]),
            Err(BufferError::WriteOutOfBounds { .. })
        ));
    }

    #[test]
    fn can_fit_considers_free_list_and_bump_space() {
        let mut a = arena(128);
        let big = a.allocate_root(1, 128, BufferUsage::Vertex, 16).unwrap();
        let root = a.root();
        assert!(!a.can_fit(root, 64, 16).unwrap());
        a.free(big).unwrap();
        assert!(a.can_fit(root, 64, 16).unwrap());
        assert_eq!(a.unused_bytes(root).unwrap(), 128);
    }
}
