// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Platform shims.

pub mod time {
    //! Clock types for fence timeouts and frame statistics.
    //!
    //! `std::time::Instant::now` panics on `wasm32-unknown-unknown`, so wasm builds use
    //! `web_time` instead.

    #[cfg(not(target_arch = "wasm32"))]
    pub use std::time::{Duration, Instant};

    #[cfg(target_arch = "wasm32")]
    pub use web_time::{Duration, Instant};
}
