//! # Kernel logging
//!
//! A [`log::Log`] implementation that formats records straight into a
//! [`LogSink`] without touching the heap, so it is usable from the page
//! allocator and the fault handler.
//!
//! Two sinks are provided:
//!
//! - [`DebugPortSink`] writes to QEMU's debug console port (feature `qemu`,
//!   x86 targets only).
//! - [`RingSink`] keeps the most recent output in a fixed in-memory ring;
//!   hosted runs and tests read it back.
//!
//! ```rust
//! use kernel_log::{KernelLogger, RingSink};
//! use log::LevelFilter;
//!
//! static LOGGER: KernelLogger<RingSink<1024>> =
//!     KernelLogger::new(LevelFilter::Info, RingSink::new());
//!
//! LOGGER.init().unwrap();
//! log::warn!("memory pressure encountered");
//! assert!(LOGGER.sink().contains("memory pressure encountered"));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;
mod sink;

pub use logger::KernelLogger;
#[cfg(all(feature = "qemu", any(target_arch = "x86", target_arch = "x86_64")))]
pub use sink::DebugPortSink;
pub use sink::{LogSink, RingSink};
