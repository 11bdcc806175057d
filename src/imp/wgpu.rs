// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! wgpu implementations of the memory and fence seams.

mod buffer;
mod fence;

pub use buffer::{WgpuMemory, WgpuMemorySource};
pub use fence::WgpuFence;
