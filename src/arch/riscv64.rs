// src/arch/riscv64.rs

//! RISC-V (S モード) のプロセッサコンテキスト

use crate::arch::{Cpu, ProcessorContext};
use crate::kernel::mm::types::VirtAddr;

/// `sstatus` のビット
pub mod sstatus {
    /// スーパーバイザ割り込み許可
    pub const SIE: u64 = 1 << 1;
    /// sret 後の割り込み許可
    pub const SPIE: u64 = 1 << 5;
    /// 直前の特権モード（1 = S モード）
    pub const SPP: u64 = 1 << 8;
    /// S モードからユーザーページへのアクセス許可
    pub const SUM: u64 = 1 << 18;
}

/// sp（x2）
const STACK_REGISTER: usize = 2;

/// トラップ入口の退避領域
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct RiscvScratch {
    /// x0..x31（x0 は常に 0）
    pub regs: [u64; 32],
    /// 復帰先（sepc）
    pub sepc: u64,
    /// 復帰時の状態（sstatus）
    pub sstatus: u64,
}

/// スレッドごとのコンテキスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiscvContext {
    pub regs: [u64; 32],
    pub sepc: u64,
    pub sstatus: u64,
    /// ユーザーモードでページングを使うか
    translated: bool,
}

impl Default for RiscvContext {
    fn default() -> Self {
        Self {
            regs: [0; 32],
            sepc: 0,
            sstatus: sstatus::SPP | sstatus::SPIE,
            translated: false,
        }
    }
}

impl ProcessorContext for RiscvContext {
    type Scratch = RiscvScratch;

    const RESERVED_FRAME_SIZE: usize = 16;

    fn save_context(&mut self, scratch: &RiscvScratch) {
        self.regs = scratch.regs;
        self.sepc = scratch.sepc;
        self.sstatus = scratch.sstatus;
    }

    fn restore_context(&self, scratch: &mut RiscvScratch) {
        scratch.regs = self.regs;
        scratch.regs[0] = 0;
        scratch.sepc = self.sepc;
        scratch.sstatus = self.sstatus;
    }

    fn set_program_counter(&mut self, pc: VirtAddr) {
        self.sepc = pc.as_u64();
    }

    fn set_privilege(&mut self, privileged: bool) {
        if privileged {
            self.sstatus |= sstatus::SPP;
            self.translated = false;
        } else {
            self.sstatus &= !sstatus::SPP;
            self.translated = true;
        }
        self.sstatus |= sstatus::SPIE;
    }

    fn set_stack_pointer(&mut self, sp: VirtAddr) {
        self.regs[STACK_REGISTER] = sp.as_u64();
    }

    fn program_counter(&self) -> VirtAddr {
        VirtAddr::new(self.sepc as usize)
    }

    fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.regs[STACK_REGISTER] as usize)
    }

    fn is_privileged(&self) -> bool {
        self.sstatus & sstatus::SPP != 0
    }

    fn translation_enabled(&self) -> bool {
        self.translated
    }
}

/// RISC-V の CPU 制御
pub struct RiscvCpu;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod hw {
    use core::arch::asm;

    pub fn halt() {
        // SAFETY: 次の割り込みまで待機するだけ
        unsafe { asm!("wfi") };
    }

    pub fn set_sie(enable: bool) {
        // SAFETY: sstatus.SIE のみを変更する
        unsafe {
            if enable {
                asm!("csrsi sstatus, 2");
            } else {
                asm!("csrci sstatus, 2");
            }
        }
    }

    pub fn sfence() {
        // SAFETY: TLB の全エントリ破棄のみ
        unsafe { asm!("sfence.vma zero, zero") };
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod hw {
    pub fn halt() {
        core::hint::spin_loop();
    }
    pub fn set_sie(_enable: bool) {}
    pub fn sfence() {}
}

impl Cpu for RiscvCpu {
    fn halt() {
        hw::halt();
    }

    fn disable_interrupts() {
        hw::set_sie(false);
    }

    fn enable_interrupts() {
        hw::set_sie(true);
    }

    /// セグメント表形式は satp が要求する Sv39 と互換がないため、
    /// RISC-V では変換ルートをハードウェアにロードしない。
    fn load_translation_root(_root: u64) {}

    fn flush_tlb() {
        hw::sfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mode_clears_spp() {
        let mut ctx = RiscvContext::default();
        assert!(ctx.is_privileged());
        ctx.set_privilege(false);
        assert!(!ctx.is_privileged());
        assert!(ctx.translation_enabled());
        assert_ne!(ctx.sstatus & sstatus::SPIE, 0);
    }

    #[test]
    fn restore_keeps_x0_zero() {
        let mut ctx = RiscvContext::default();
        ctx.regs[0] = 7;
        ctx.set_stack_pointer(VirtAddr::new(0x9000));
        let mut scratch = RiscvScratch::default();
        ctx.restore_context(&mut scratch);
        assert_eq!(scratch.regs[0], 0);
        assert_eq!(scratch.regs[2], 0x9000);
    }
}
