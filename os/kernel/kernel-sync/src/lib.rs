//! # Kernel synchronization primitives
//!
//! The memory manager only ever holds locks for a handful of instructions and
//! never sleeps while holding one, so everything here spins:
//!
//! - [`SpinLock`]: test-and-test-and-set lock with an RAII guard.
//! - [`SyncOnceCell`]: write-once cell for boot-time singletons.
//! - [`PerCpu`]: a fixed array of per-CPU slots selected by the current CPU id.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod per_cpu;
mod spin_lock;
mod sync_once_cell;

pub use per_cpu::{MAX_CPUS, PerCpu, current_cpu_id, register_cpu_id_source};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
