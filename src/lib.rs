// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! arenas_and_fences is the GPU memory sub-allocation and frame-pipelining core of a
real-time renderer.

It manages a small number of large device buffers, carves them into per-draw regions on
demand, and coordinates their reuse across several frames that may be in flight at once.
The one guarantee everything here is built around: the CPU never overwrites memory the GPU
has not finished reading.

# Pieces

| Type                                    | Role                                                         |
|-----------------------------------------|--------------------------------------------------------------|
| [`buffer::GpuBuffer`]                   | Arena with a bump pointer and best-fit free list             |
| [`fence::Fence`]                        | CPU-observable completion of submitted work                  |
| [`frame::TrackedFrame`]                 | One frame slot: staging arena, fence, command-list branches  |
| [`tracker::FrameResourceTracker`]       | Ring of frame slots; backpressure at `start_frame`           |
| [`discard::GpuDiscardBuffer`]           | Per-frame upload memory that is thrown away every frame      |
| [`command_list::CommandListPool`]       | Recycles command lists once their frame has retired          |

# A frame

```
use arenas_and_fences::buffer::{BufferUsage, HostMemorySource};
use arenas_and_fences::command_list::CommandList;
use arenas_and_fences::config::FrameConfig;
use arenas_and_fences::fence::ManualFence;
use arenas_and_fences::tracker::FrameResourceTracker;

#[derive(Default)]
struct Commands(Vec<u32>);
impl CommandList for Commands {
    fn reset(&mut self) {
        self.0.clear();
    }
}

let mut tracker: FrameResourceTracker<_, ManualFence, Commands> =
    FrameResourceTracker::new(HostMemorySource::new(), FrameConfig::default()).unwrap();

let token = tracker.start_frame().unwrap();
let staging = tracker.staging_buffer().unwrap();
let root = staging.root();
let vertices = staging.allocate(root, 32, 3, BufferUsage::Upload, 16).unwrap();
staging.write(vertices, 0, &[0u8; 96]).unwrap();

let commands = tracker.acquire_command_list().unwrap_or_default();
tracker.track(0, commands).unwrap();

//the backend signals this once the frame's GPU work completes
let fence = ManualFence::signaled();
assert_eq!(tracker.end_frame(fence).unwrap(), token.frame_id);
```

# Backends

With the default `backend_wgpu` feature, [`WgpuMemorySource`] and [`WgpuFence`] back arenas
and fences with [wgpu](https://wgpu.rs).  Everything else is backend-independent and can run
against [`buffer::HostMemorySource`] and [`fence::ManualFence`] without a device.
*/

logwise::declare_logging_domain!();

mod bittricks;
pub mod buffer;
pub mod command_list;
pub mod config;
pub mod discard;
pub mod fence;
pub mod frame;
mod imp;
mod sys;
pub mod tracker;

#[cfg(feature = "backend_wgpu")]
pub use imp::{WgpuFence, WgpuMemory, WgpuMemorySource};
