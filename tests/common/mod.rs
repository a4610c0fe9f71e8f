//! Shared fixtures: host buffers standing in for real storage.

#![allow(dead_code)]

use realcore::init::MemoryArea;
use realcore::kernel::mm::{PhysAddr, RealMemory};
use realcore::{KernelConfig, KernelState};

/// Real address the first test region pretends to live at
pub const BASE: usize = 0x10_0000;

/// Host memory backing one region
pub struct Backing {
    buf: Box<[u64]>,
}

impl Backing {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u64; size / 8].into_boxed_slice(),
        }
    }

    pub fn area(&mut self, base: usize) -> MemoryArea {
        MemoryArea {
            base: PhysAddr::new(base),
            size: self.buf.len() * 8,
            mapping: self.buf.as_mut_ptr().cast(),
        }
    }
}

/// A bare allocator over one region of `size` bytes
pub fn memory(size: usize) -> (RealMemory, Backing) {
    let memory = RealMemory::new();
    let mut backing = Backing::new(size);
    let area = backing.area(BASE);
    unsafe { memory.add_region(area.base, area.size, area.mapping) }.unwrap();
    (memory, backing)
}

/// A fully booted kernel over one region of `size` bytes
pub fn kernel(size: usize) -> (KernelState, Backing) {
    let kernel = KernelState::new(KernelConfig::DEFAULT);
    let mut backing = Backing::new(size);
    let area = backing.area(BASE);
    unsafe { kernel.boot(&[area], |_| Ok(())) }.unwrap();
    (kernel, backing)
}
