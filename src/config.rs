// src/config.rs

//! Kernel constants and configuration values
//!
//! Compile-time geometry of the real-storage allocator and the segment/page
//! tables lives here, together with the runtime [`KernelConfig`] consumed by
//! the boot sequence in [`crate::init`].

use log::LevelFilter;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Low-order bits of an address that select a byte within a page
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// log2 of the bytes covered by one segment table entry (1 MiB)
pub const SEGMENT_SHIFT: u32 = 20;

/// Page table entries per segment (1 MiB / 4 KiB)
pub const PAGES_PER_SEGMENT: usize = 1 << (SEGMENT_SHIFT - PAGE_SHIFT);

/// Segment table entries (2048 × 1 MiB = 2 GiB of virtual space)
pub const SEGMENT_COUNT: usize = 2048;

/// Size of one segment or page table entry
pub const TABLE_ENTRY_SIZE: usize = 8;

/// Bytes occupied by one segment table
pub const SEGMENT_TABLE_BYTES: usize = SEGMENT_COUNT * TABLE_ENTRY_SIZE;

/// Bytes occupied by one page table
pub const PAGE_TABLE_BYTES: usize = PAGES_PER_SEGMENT * TABLE_ENTRY_SIZE;

/// Highest virtual address (exclusive) a segment table can translate
pub const VIRTUAL_LIMIT: usize = SEGMENT_COUNT << SEGMENT_SHIFT;

/// Capacity of the region table; the table itself never grows
pub const MAX_REGIONS: usize = 8;

/// Block descriptors reserved in a region's head block at registration
pub const INITIAL_DESCRIPTORS: usize = 32;

/// Descriptors added per pool growth, in the head block or as a new segment
pub const DESCRIPTOR_GROWTH: usize = 32;

/// Alignment of the head block and of every region base
pub const REGION_ALIGN: usize = 16;

/// Job slots added to the job table per arena segment
pub const JOB_SEGMENT_SLOTS: usize = 16;

/// Runtime configuration handed to the boot sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Owner of the bootstrap job and of jobs created before login
    pub boot_user: u16,
    /// Name of the job created by the scheduler's init
    pub bootstrap_job: &'static str,
    /// Name of the task created by the scheduler's init
    pub bootstrap_task: &'static str,
    /// Maximum log level forwarded to the console sink
    pub log_level: LevelFilter,
    /// Stack size used when a caller asks for the default stack
    pub default_stack_size: usize,
    /// Number of auxiliary processors to send reset signals to at boot
    pub auxiliary_processors: u8,
}

impl KernelConfig {
    /// Configuration used when the boot protocol supplies nothing
    pub const DEFAULT: Self = Self {
        boot_user: 0,
        bootstrap_job: "KERNEL",
        bootstrap_task: "BOOT",
        log_level: LevelFilter::Info,
        default_stack_size: 8 * PAGE_SIZE,
        auxiliary_processors: 0,
    };

    /// Override the log level
    #[must_use]
    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Override the boot user
    #[must_use]
    pub const fn with_boot_user(mut self, uid: u16) -> Self {
        self.boot_user = uid;
        self
    }

    /// Override the number of auxiliary processors
    #[must_use]
    pub const fn with_auxiliary_processors(mut self, count: u8) -> Self {
        self.auxiliary_processors = count;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
