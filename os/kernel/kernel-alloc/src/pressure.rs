//! # Memory pressure
//!
//! Subsystems that hold on to reclaimable memory (caches, mostly) register a
//! [`MemoryPressureHandler`]. When the page allocator runs low it asks them,
//! most important first, to give memory back; the first handler that manages
//! to do so ends the round.
//!
//! Only one round runs at a time. A CPU that finds a round in flight waits
//! for it to end and then retries its allocation; a handler that allocates
//! on the compacting CPU does not start a nested round.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_sync::{SpinLock, current_cpu_id};
use log::{debug, error, info, warn};

/// Something that can release memory on request.
pub trait MemoryPressureHandler: Send + Sync {
    /// Short human-readable name for logs.
    fn description(&self) -> &str;

    /// Try to free memory. Returns whether anything was released.
    ///
    /// Runs without the allocator lock held; handlers may free and even
    /// allocate pages.
    fn compact(&self) -> bool;
}

/// Order in which handlers are asked; `Highest` goes first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PressurePriority {
    Highest,
    High,
    Normal,
    Low,
    Lowest,
}

type Registered = (PressurePriority, Arc<dyn MemoryPressureHandler>);

/// `owner` while no round is in flight.
const NO_OWNER: usize = usize::MAX;

/// What a pressure check ended up doing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Round {
    /// Enough pages were free.
    NotNeeded,
    /// This CPU asked the handlers; `released` tells whether one gave memory back.
    Ran { released: bool },
    /// Another CPU was compacting; this one waited for it to finish.
    Joined,
    /// A handler on this CPU allocated while its round was running.
    Nested,
}

pub struct MemoryPressureManager {
    handlers: SpinLock<Vec<Registered>>,
    /// Id of the CPU running a compaction round, or [`NO_OWNER`].
    owner: AtomicUsize,
    /// Set from the first round of a pressure episode until a check finds
    /// enough pages again.
    did_hit: AtomicBool,
}

impl MemoryPressureManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: SpinLock::new(Vec::new()),
            owner: AtomicUsize::new(NO_OWNER),
            did_hit: AtomicBool::new(false),
        }
    }

    /// Add a handler. Handlers of equal priority are asked in registration order.
    pub fn register(&self, handler: Arc<dyn MemoryPressureHandler>, priority: PressurePriority) {
        let mut handlers = self.handlers.lock();
        let at = handlers.partition_point(|(p, _)| *p <= priority);
        debug!("pressure handler '{}' registered at {priority:?}", handler.description());
        handlers.insert(at, (priority, handler));
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn unregister(&self, handler: &Arc<dyn MemoryPressureHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(_, h)| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask handlers, highest priority first, until one releases memory.
    pub fn compact(&self) -> bool {
        // Snapshot so handlers can (un)register without deadlocking.
        let handlers: Vec<Registered> = self.handlers.lock().clone();
        for (priority, handler) in handlers {
            if handler.compact() {
                debug!("'{}' ({priority:?}) released memory", handler.description());
                return true;
            }
        }
        false
    }

    /// Called by the allocator, without its lock, before handing out a page.
    pub(crate) fn check(&self, free_pages: usize, high_watermark: usize) -> Round {
        if free_pages < high_watermark {
            return self.relieve(free_pages);
        }
        if self.owner.load(Ordering::Acquire) == NO_OWNER
            && self.did_hit.swap(false, Ordering::Relaxed)
        {
            info!("pressure was hit, but is no longer being hit");
        }
        Round::NotNeeded
    }

    /// Run a compaction round, or wait for the one another CPU is running.
    ///
    /// Warnings are logged once per pressure episode; later rounds of the
    /// same episode only log at debug level.
    pub(crate) fn relieve(&self, free_pages: usize) -> Round {
        let me = current_cpu_id();
        match self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(owner) if owner == me => return Round::Nested,
            Err(_) => {
                while self.owner.load(Ordering::Acquire) != NO_OWNER {
                    spin_loop();
                }
                return Round::Joined;
            }
        }

        let entering = !self.did_hit.swap(true, Ordering::Relaxed);
        if entering {
            warn!("memory pressure encountered, performing a compact ({free_pages} pages free)");
        } else {
            debug!("still under memory pressure, compacting ({free_pages} pages free)");
        }
        let released = self.compact();
        match (entering, released) {
            (true, true) => info!("compact was successful"),
            (true, false) => error!("compact did not alleviate any memory pressure"),
            (false, released) => debug!("compact released memory: {released}"),
        }

        self.owner.store(NO_OWNER, Ordering::Release);
        Round::Ran { released }
    }
}

impl Default for MemoryPressureManager {
    fn default() -> Self {
        Self::new()
    }
}
