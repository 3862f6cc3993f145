#![allow(dead_code)]

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{
    AddressSpace, Escrow, FrameSource, HostedAddressSpace, HostedRam, SpaceKind, X86AddressSpace,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const RAM_BASE: u64 = 0x0010_0000;

/// Frame source over all of a [`HostedRam`], with pin counting.
pub struct TestFrames {
    free: SpinLock<Vec<PhysicalAddress>>,
    pins: SpinLock<BTreeMap<PhysicalAddress, usize>>,
    escrow: Escrow,
}

impl TestFrames {
    pub fn new(ram: &HostedRam) -> Arc<Self> {
        let mut frames: Vec<PhysicalAddress> = (ram.base().as_u64()..ram.end().as_u64())
            .step_by(PAGE_SIZE as usize)
            .map(PhysicalAddress::new)
            .collect();
        // Lowest frame is handed out first.
        frames.reverse();
        Arc::new(Self {
            free: SpinLock::new(frames),
            pins: SpinLock::new(BTreeMap::new()),
            escrow: Escrow::new(),
        })
    }

    /// Free frames, counting the one parked in the escrow.
    pub fn available(&self) -> usize {
        self.free.lock().len() + self.escrow.held()
    }
}

impl FrameSource for TestFrames {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.free.lock().pop()
    }

    fn release_frame(&self, frame: PhysicalAddress) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&frame) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&frame);
            }
            return;
        }
        drop(pins);

        let mut free = self.free.lock();
        assert!(!free.contains(&frame), "double free of {frame:?}");
        free.push(frame);
    }

    fn pin_frame(&self, frame: PhysicalAddress) {
        *self.pins.lock().entry(frame).or_default() += 1;
    }

    fn is_frame_pinned(&self, frame: PhysicalAddress) -> bool {
        self.pins.lock().contains_key(&frame)
    }

    fn escrow(&self) -> &Escrow {
        &self.escrow
    }
}

pub struct Fixture {
    pub ram: Arc<HostedRam>,
    pub frames: Arc<TestFrames>,
}

impl Fixture {
    pub fn new(frames: usize) -> Self {
        let ram = Arc::new(HostedRam::new(PhysicalAddress::new(RAM_BASE), frames));
        let frames = TestFrames::new(&ram);
        Self { ram, frames }
    }

    pub fn x86(&self, kind: SpaceKind) -> Arc<dyn AddressSpace> {
        Arc::new(X86AddressSpace::create(kind, self.frames.clone(), self.ram.clone()).unwrap())
    }

    pub fn hosted(&self, kind: SpaceKind) -> Arc<dyn AddressSpace> {
        Arc::new(HostedAddressSpace::new(
            kind,
            self.frames.clone(),
            self.ram.clone(),
        ))
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.frames.allocate_frame().unwrap()
    }
}
