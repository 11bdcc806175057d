// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
An arena shared between recording threads.

[`GpuBuffer`] is mutated through `&mut self` and assumes a single recording thread.  When
several threads record command lists against the same arena, allocation and free calls must be
serialized; [`SharedGpuBuffer`] does that with a mutex around the whole arena.

Engines that can afford it should prefer one arena per recording thread instead.
*/

use super::{BufferError, BufferMemory, BufferUsage, GpuBuffer, SubBuffer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct SharedGpuBuffer<M> {
    inner: Arc<Mutex<GpuBuffer<M>>>,
}

impl<M> Clone for SharedGpuBuffer<M> {
    fn clone(&self) -> Self {
        SharedGpuBuffer {
            inner: self.inner.clone(),
        }
    }
}

impl<M: BufferMemory> SharedGpuBuffer<M> {
    pub fn new(buffer: GpuBuffer<M>) -> Self {
        SharedGpuBuffer {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GpuBuffer<M>> {
        //arena operations leave the node table consistent before anything can panic,
        //so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> SubBuffer {
        self.lock().root()
    }

    pub fn allocate(
        &self,
        parent: SubBuffer,
        stride: usize,
        element_count: usize,
        usage: BufferUsage,
        alignment: usize,
    ) -> Result<SubBuffer, BufferError> {
        self.lock()
            .allocate(parent, stride, element_count, usage, alignment)
    }

    pub fn free(&self, buffer: SubBuffer) -> Result<(), BufferError> {
        self.lock().free(buffer)
    }

    pub fn write(&self, buffer: SubBuffer, offset: usize, data: &[u8]) -> Result<(), BufferError> {
        self.lock().write(buffer, offset, data)
    }

    /// Runs `f` with exclusive access to the arena.
    pub fn with<R>(&self, f: impl FnOnce(&mut GpuBuffer<M>) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{HostMemory, MapType};
    use std::collections::HashSet;

    #[test]
    fn concurrent_allocations_do_not_overlap() {
        let arena = GpuBuffer::new(
            HostMemory::new(64 * 1024, MapType::Write, "shared"),
            BufferUsage::Upload,
            16,
            "shared",
        )
        .unwrap();
        let shared = SharedGpuBuffer::new(arena);
        let root = shared.root();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| {
                            shared
                                .allocate(root, 1, 100, BufferUsage::Upload, 16)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut starts = HashSet::new();
        for thread in threads {
            for buffer in thread.join().unwrap() {
                let range = shared.with(|a| a.byte_range(buffer)).unwrap();
                assert_eq!(range.len(), 100);
                assert!(starts.insert(range.start), "two threads got the same region");
            }
        }
        assert_eq!(starts.len(), 128);
        assert_eq!(shared.with(|a| a.allocated_bytes()), 127 * 112 + 100);
    }
}
