// src/kernel/mod.rs
//! カーネル本体
//!
//! 実記憶管理・アドレス空間・ジョブ/タスク/スレッドとスケジューラ。
//! すべての状態は [`state::KernelState`] が保持します。

pub mod core;
pub mod mm;
pub mod process;
pub mod scheduler;
pub mod state;
pub mod trap;

pub use state::KernelState;
pub use trap::Trap;
