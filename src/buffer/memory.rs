// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Backing memory for arenas.

A [`crate::buffer::GpuBuffer`] never talks to a graphics API directly.  It owns exactly one
[`BufferMemory`] value, and everything it carves out is a byte range of that memory.

Arenas that are created on demand (per-frame staging buffers, discard pools) are created
through a [`MemorySource`], so the frame logic can be exercised without a device by using
[`HostMemorySource`].
*/

use crate::buffer::usage::{BufferUsage, MapType};

/// A contiguous region of device (or host) memory that can be written at byte offsets.
pub trait BufferMemory {
    /// Size of the memory in bytes.
    fn byte_len(&self) -> usize;

    /// Writes `data` at `offset`.
    ///
    /// Callers guarantee `offset + data.len() <= self.byte_len()`.
    fn write(&mut self, offset: usize, data: &[u8]);
}

/// Creates backing memory for new arenas.
pub trait MemorySource {
    type Memory: BufferMemory;

    fn create(
        &self,
        byte_len: usize,
        usage: BufferUsage,
        debug_name: &str,
    ) -> Result<Self::Memory, MemoryError>;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemoryError {
    #[error("Zero-sized memory requested for {debug_name}")]
    ZeroSized { debug_name: String },
    #[error("Can't allocate {requested} bytes for {debug_name}; the device limit is {limit}")]
    ExceedsLimit {
        requested: usize,
        limit: usize,
        debug_name: String,
    },
}

/**
Memory that lives on the host.

Used for CPU-only timelines and for tests, where the contents can be inspected
with [`HostMemory::as_slice`].
*/
#[derive(Debug, Clone)]
pub struct HostMemory {
    bytes: Box<[u8]>,
    map_type: MapType,
    debug_name: String,
}

impl HostMemory {
    pub fn new(byte_len: usize, map_type: MapType, debug_name: &str) -> Self {
        HostMemory {
            bytes: vec![0; byte_len].into_boxed_slice(),
            map_type,
            debug_name: debug_name.to_string(),
        }
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
    pub fn map_type(&self) -> MapType {
        self.map_type
    }
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

impl BufferMemory for HostMemory {
    fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.bytes.len(),
            "Write out of bounds"
        );
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Creates [`HostMemory`] arenas, optionally enforcing a maximum size.
#[derive(Debug, Clone, Default)]
pub struct HostMemorySource {
    max_byte_len: Option<usize>,
}

impl HostMemorySource {
    pub fn new() -> Self {
        Self::default()
    }
    /// Refuses to create memory larger than `max_byte_len`, like a device with a
    /// `max_buffer_size` limit would.
    pub fn with_limit(max_byte_len: usize) -> Self {
        HostMemorySource {
            max_byte_len: Some(max_byte_len),
        }
    }
}

impl MemorySource for HostMemorySource {
    type Memory = HostMemory;

    fn create(
        &self,
        byte_len: usize,
        usage: BufferUsage,
        debug_name: &str,
    ) -> Result<HostMemory, MemoryError> {
        if byte_len == 0 {
            return Err(MemoryError::ZeroSized {
                debug_name: debug_name.to_string(),
            });
        }
        if let Some(limit) = self.max_byte_len {
            if byte_len > limit {
                return Err(MemoryError::ExceedsLimit {
                    requested: byte_len,
                    limit,
                    debug_name: debug_name.to_string(),
                });
            }
        }
        Ok(HostMemory::new(byte_len, MapType::for_usage(usage), debug_name))
    }
}
