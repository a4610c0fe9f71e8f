// src/kernel/mm/mod.rs
//! メモリ管理モジュール
//!
//! 実記憶アロケータ、ジョブごとのアドレス空間、プログラムデータブロック。

pub mod allocator;
pub mod paging;
pub mod pdb;
pub mod region;
pub mod types;

pub use allocator::{KernelHeap, MemoryStats, RealMemory};
pub use paging::{AddressSpace, PageFlags};
pub use region::{BlockInfo, BlockState};
pub use types::{LayoutSize, PhysAddr, VirtAddr};
