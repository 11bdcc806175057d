// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Usage declarations for arenas and sub-buffers.
//!
//! When carving a region out of an arena, callers declare what the region will be used for
//! ([`BufferUsage`]) and the arena declares how the CPU intends to map it ([`MapType`]).
//! Backends use these to pick memory placement and usage flags; the sub-allocator itself
//! only records them.
//!
//! # Examples
//!
//! ```
//! use arenas_and_fences::buffer::{BufferUsage, MapType};
//!
//! // A region holding a batch of vertices
//! let usage = BufferUsage::Vertex;
//! assert!(usage.is_vertex_input());
//!
//! // Upload arenas are written by the CPU
//! let map = MapType::Write;
//! assert!(map.cpu_writable());
//! ```

/// Describes how a buffer region will be used on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// The region contains vertex attribute data.
    Vertex,
    /// The region contains index data for indexed drawing.
    Index,
    /// The region is bound as a uniform/constant buffer.
    ///
    /// Backends typically require 256-byte alignment for these.
    Constant,
    /// The region is bound as a read-only or read-write storage buffer.
    Storage,
    /// The region is transient CPU-written data staged for a copy into GPU-local memory.
    Upload,
}

impl BufferUsage {
    /// Whether the region feeds the input assembler.
    pub fn is_vertex_input(self) -> bool {
        matches!(self, BufferUsage::Vertex | BufferUsage::Index)
    }
}

/// Whether an arena can be mapped to the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MapType {
    /// The arena can be mapped to the CPU for reading.
    Read,
    /// The arena can be mapped to the CPU for writing.
    Write,
    /// The arena is GPU-private.
    None,
}

impl MapType {
    pub fn cpu_writable(self) -> bool {
        matches!(self, MapType::Write)
    }

    /// Default mapping intention for an arena holding regions of `usage`.
    pub fn for_usage(usage: BufferUsage) -> Self {
        match usage {
            BufferUsage::Upload => MapType::Write,
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Constant | BufferUsage::Storage => {
                MapType::None
            }
        }
    }
}
