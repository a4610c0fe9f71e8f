// src/kernel/state.rs
//! カーネル状態
//!
//! 実記憶・ジョブテーブル・プロセッサ状態・割り込み状態を 1 つの値に
//! まとめます。ハードウェア上では [`install`] で一度だけ生成した値を
//! 割り込み入口から [`kernel`] で参照し、テストでは独立した値を
//! いくつでも作れます。
//!
//! ロック順序: ジョブテーブル → プロセッサ状態 → アドレス空間 → リージョン

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8};

use spin::Once;

use crate::arch::{ArchContext, ArchCpu, Cpu, ProcessorContext};
use crate::config::KernelConfig;
use crate::init::InitPhase;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::pdb::{Encoding, ProgramDataBlock};
use crate::kernel::mm::RealMemory;
use crate::kernel::process::{CpuState, JobTable};
use crate::sync::{InterruptState, SpinLock};

/// カーネル全体の状態
pub struct KernelState<C: ProcessorContext = ArchContext> {
    pub(crate) config: KernelConfig,
    pub(crate) memory: RealMemory,
    pub(crate) jobs: SpinLock<JobTable<C>>,
    pub(crate) cpu: SpinLock<CpuState<C>>,
    pub(crate) interrupts: InterruptState,
    pub(crate) phase: AtomicU8,
    pub(crate) next_task: AtomicU64,
    pub(crate) next_thread: AtomicU64,
    resets: SpinLock<Vec<u16>>,
}

/// プロセッサ状態の写し
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    /// タイマー割り込みの回数
    pub ticks: u64,
    /// ディスパッチ回数
    pub switches: u64,
    /// TLB パージの回数
    pub tlb_flushes: u64,
    /// ロード中の変換ルート
    pub translation_root: Option<u64>,
}

impl<C: ProcessorContext> KernelState<C> {
    /// 未初期化の状態を作成
    ///
    /// リージョンもジョブも持たず、割り込みはマスクされています。
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            memory: RealMemory::new(),
            jobs: SpinLock::new(JobTable::new()),
            cpu: SpinLock::new(CpuState::default()),
            interrupts: InterruptState::new(),
            phase: AtomicU8::new(InitPhase::NotStarted as u8),
            next_task: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            resets: SpinLock::new(Vec::new()),
        }
    }

    /// 起動設定
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// 実記憶マネージャ
    pub const fn memory(&self) -> &RealMemory {
        &self.memory
    }

    /// 割り込み状態
    pub const fn interrupts(&self) -> &InterruptState {
        &self.interrupts
    }

    /// 登録済みジョブ数
    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// プロセッサ状態の写しを取得
    pub fn cpu_snapshot(&self) -> CpuSnapshot {
        let cpu = self.cpu.lock();
        CpuSnapshot {
            ticks: cpu.ticks(),
            switches: cpu.switches(),
            tlb_flushes: cpu.tlb_flushes(),
            translation_root: cpu.translation_root(),
        }
    }

    /// トラップ入口の退避領域を操作する
    ///
    /// 割り込み入口はレジスタをここへ書き込んでから
    /// [`KernelState::handle_trap`] を呼び、戻る直前にここから読み戻します。
    pub fn with_scratch<R>(&self, f: impl FnOnce(&mut C::Scratch) -> R) -> R {
        f(self.cpu.lock().scratch_mut())
    }

    /// 補助プロセッサにリセット信号を送る
    ///
    /// 補助プロセッサはスケジューリングの対象になりません。送った
    /// アドレスを記録し、送信数を返します。
    pub fn reset_auxiliary_processors(&self) -> usize {
        let mut resets = self.resets.lock();
        for address in 1..=u16::from(self.config.auxiliary_processors) {
            ArchCpu::signal_reset(address);
            resets.push(address);
            log::debug!("reset signal sent to processor {}", address);
        }
        usize::from(self.config.auxiliary_processors)
    }

    /// これまでにリセット信号を送ったプロセッサアドレス
    pub fn reset_signals(&self) -> Vec<u16> {
        self.resets.lock().clone()
    }

    /// 現在の実記憶の状態からプログラムデータブロックを作る
    ///
    /// # Errors
    ///
    /// コマンドラインが長すぎる場合は [`ErrorKind::InvalidParam`]
    pub fn program_data_block(
        &self,
        cmdline: &[u8],
        encoding: Encoding,
    ) -> KernelResult<ProgramDataBlock> {
        ProgramDataBlock::snapshot(&self.memory, cmdline, encoding)
    }
}

static KERNEL: Once<KernelState> = Once::new();

/// 全体で共有するカーネル状態を生成する
///
/// 2 回目以降の呼び出しは最初の値を返し、`config` は無視されます。
pub fn install(config: KernelConfig) -> &'static KernelState {
    KERNEL.call_once(|| KernelState::new(config))
}

/// 共有カーネル状態（未生成なら `None`）
pub fn try_kernel() -> Option<&'static KernelState> {
    KERNEL.get()
}

/// 共有カーネル状態
///
/// # Errors
///
/// [`install`] 前なら [`ErrorKind::InvalidSetup`]
pub fn kernel() -> KernelResult<&'static KernelState> {
    try_kernel().ok_or(KernelError::with_context(
        ErrorKind::InvalidSetup,
        "kernel state not installed",
    ))
}
