// src/lib.rs
//! realcore - 実記憶・アドレス空間・スケジューラのカーネルコア
//!
//! リージョン単位の実記憶アロケータ、セグメント/ページ 2 段の
//! アドレス空間、ジョブ/タスク/スレッドのラウンドロビンスケジューラを
//! 提供します。アーキテクチャ依存部分は [`arch`] の trait の背後にあり、
//! 開発ホスト上でもそのままテストできます。

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod init;
pub mod kernel;
pub mod logger;
pub mod panic;
pub mod sync;

pub use config::KernelConfig;
pub use kernel::core::{ErrorKind, KernelError, KernelResult};
pub use kernel::{KernelState, Trap};

use crate::arch::{ArchCpu, Cpu};

/// Halt loop
#[inline]
pub fn hlt_loop() -> ! {
    loop {
        ArchCpu::halt();
    }
}

/// グローバルヒープアロケータ
///
/// [`kernel::state::install`] で生成した状態の実記憶から確保します。
/// 生成前の確保要求は失敗します。
#[cfg(target_os = "none")]
struct GlobalHeap;

#[cfg(target_os = "none")]
// SAFETY: 確保・解放はすべて KernelHeap に委譲する
unsafe impl core::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        match kernel::state::try_kernel() {
            // SAFETY: 呼び出し側の契約をそのまま引き継ぐ
            Some(k) => unsafe {
                core::alloc::GlobalAlloc::alloc(&kernel::mm::KernelHeap::new(k.memory()), layout)
            },
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        if let Some(k) = kernel::state::try_kernel() {
            // SAFETY: ptr は同じアロケータから得たもの
            unsafe {
                core::alloc::GlobalAlloc::dealloc(&kernel::mm::KernelHeap::new(k.memory()), ptr, layout)
            }
        }
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: GlobalHeap = GlobalHeap;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::panic::handler::handle_panic(info)
}
