// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Device memory for arenas.
//!
//! wgpu only accepts `Queue::write_buffer` calls whose offset and length are multiples of
//! `COPY_BUFFER_ALIGNMENT`, while sub-allocations can be any size.  [`WgpuMemory`] therefore
//! keeps a host copy of the buffer's contents and uploads the aligned span around each write.

use crate::bittricks::align_up;
use crate::buffer::{BufferMemory, BufferUsage, MemoryError, MemorySource};
use std::ops::Range;
use wgpu::{BufferDescriptor, BufferUsages, Label};

const COPY_ALIGNMENT: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

/// wgpu usage flags for an arena holding regions of `usage`.
fn usages_for(usage: BufferUsage) -> BufferUsages {
    let base = match usage {
        BufferUsage::Vertex => BufferUsages::VERTEX,
        BufferUsage::Index => BufferUsages::INDEX,
        BufferUsage::Constant => BufferUsages::UNIFORM,
        BufferUsage::Storage => BufferUsages::STORAGE,
        BufferUsage::Upload => BufferUsages::COPY_SRC,
    };
    //every arena is filled through Queue::write_buffer
    base | BufferUsages::COPY_DST
}

/// Widens `offset..offset + len` to copy-aligned bounds, clamped to `buffer_len`.
fn aligned_span(offset: usize, len: usize, buffer_len: usize) -> Range<usize> {
    let start = offset & !(COPY_ALIGNMENT - 1);
    let end = align_up(offset + len, COPY_ALIGNMENT).unwrap_or(buffer_len);
    start..end.min(buffer_len)
}

/// A `wgpu::Buffer` used as arena memory.
#[derive(Debug)]
pub struct WgpuMemory {
    buffer: wgpu::Buffer,
    queue: wgpu::Queue,
    shadow: Box<[u8]>,
}

impl WgpuMemory {
    /// The underlying buffer, for binding regions to passes.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl BufferMemory for WgpuMemory {
    fn byte_len(&self) -> usize {
        self.shadow.len()
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.shadow[offset..offset + data.len()].copy_from_slice(data);
        let span = aligned_span(offset, data.len(), self.shadow.len());
        self.queue
            .write_buffer(&self.buffer, span.start as u64, &self.shadow[span]);
    }
}

/// Creates [`WgpuMemory`] on a device.
#[derive(Debug, Clone)]
pub struct WgpuMemorySource {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuMemorySource {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        WgpuMemorySource { device, queue }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

impl MemorySource for WgpuMemorySource {
    type Memory = WgpuMemory;

    fn create(
        &self,
        byte_len: usize,
        usage: BufferUsage,
        debug_name: &str,
    ) -> Result<WgpuMemory, MemoryError> {
        if byte_len == 0 {
            return Err(MemoryError::ZeroSized {
                debug_name: debug_name.to_string(),
            });
        }
        let limit = self.device.limits().max_buffer_size;
        let allocated_size = align_up(byte_len, COPY_ALIGNMENT)
            .filter(|size| *size as u64 <= limit)
            .ok_or_else(|| MemoryError::ExceedsLimit {
                requested: byte_len,
                limit: usize::try_from(limit).unwrap_or(usize::MAX),
                debug_name: debug_name.to_string(),
            })?;
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Label::from(debug_name),
            size: allocated_size as u64,
            usage: usages_for(usage),
            mapped_at_creation: false,
        });
        logwise::trace_sync!(
            "Created wgpu arena {name} ({size} bytes)",
            name = logwise::privacy::LogIt(debug_name),
            size = logwise::privacy::LogIt(allocated_size)
        );
        Ok(WgpuMemory {
            buffer,
            queue: self.queue.clone(),
            shadow: vec![0; allocated_size].into_boxed_slice(),
        })
    }
}
