// src/arch/s390x.rs

//! z/Architecture のプロセッサコンテキスト
//!
//! スレッドの状態は 16 本の汎用レジスタと 128 ビット PSW で表されます。
//! 割り込み時、旧 PSW はロウコアの old-PSW スロットに、レジスタは
//! トラップ入口の退避領域に格納されます（[`S390Scratch`]）。

use crate::arch::{Cpu, ProcessorContext};
use crate::kernel::mm::types::VirtAddr;

/// PSW マスクのビット
pub mod psw_bits {
    /// DAT（動的アドレス変換）
    pub const DAT: u64 = 1 << 58;
    /// I/O 割り込み許可
    pub const IO: u64 = 1 << 57;
    /// 外部割り込み許可
    pub const EXTERNAL: u64 = 1 << 56;
    /// マシンチェック許可
    pub const MACHINE_CHECK: u64 = 1 << 50;
    /// 待ち状態
    pub const WAIT: u64 = 1 << 49;
    /// 問題プログラム状態
    pub const PROBLEM: u64 = 1 << 48;
    /// 64 ビットアドレッシング（EA + BA）
    pub const ADDRESSING_64: u64 = (1 << 32) | (1 << 31);
    /// 新しいスレッドの既定マスク（スーパーバイザ状態、割り込み許可）
    pub const SUPERVISOR: u64 = IO | EXTERNAL | MACHINE_CHECK | ADDRESSING_64;
}

/// スタックポインタとして使う汎用レジスタ
const STACK_REGISTER: usize = 15;

/// プログラム状況語
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Psw {
    /// マスク（状態ビット）
    pub mask: u64,
    /// 命令アドレス
    pub address: u64,
}

/// トラップ入口の退避領域
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct S390Scratch {
    /// 割り込まれたレジスタ
    pub gprs: [u64; 16],
    /// 割り込みからの復帰に使われる旧 PSW
    pub old_psw: Psw,
}

/// スレッドごとのコンテキスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S390Context {
    /// 汎用レジスタ
    pub gprs: [u64; 16],
    /// PSW
    pub psw: Psw,
}

impl Default for S390Context {
    fn default() -> Self {
        Self {
            gprs: [0; 16],
            psw: Psw {
                mask: psw_bits::SUPERVISOR,
                address: 0,
            },
        }
    }
}

impl ProcessorContext for S390Context {
    type Scratch = S390Scratch;

    /// ABI が呼び出し側に要求するレジスタ退避域
    const RESERVED_FRAME_SIZE: usize = 160;

    fn save_context(&mut self, scratch: &S390Scratch) {
        self.gprs = scratch.gprs;
        self.psw = scratch.old_psw;
    }

    fn restore_context(&self, scratch: &mut S390Scratch) {
        scratch.gprs = self.gprs;
        scratch.old_psw = self.psw;
    }

    fn set_program_counter(&mut self, pc: VirtAddr) {
        self.psw.address = pc.as_u64();
    }

    fn set_privilege(&mut self, privileged: bool) {
        if privileged {
            self.psw.mask &= !(psw_bits::PROBLEM | psw_bits::DAT);
        } else {
            self.psw.mask |= psw_bits::PROBLEM | psw_bits::DAT;
        }
    }

    fn set_stack_pointer(&mut self, sp: VirtAddr) {
        self.gprs[STACK_REGISTER] = sp.as_u64();
    }

    fn program_counter(&self) -> VirtAddr {
        VirtAddr::new(self.psw.address as usize)
    }

    fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.gprs[STACK_REGISTER] as usize)
    }

    fn is_privileged(&self) -> bool {
        self.psw.mask & psw_bits::PROBLEM == 0
    }

    fn translation_enabled(&self) -> bool {
        self.psw.mask & psw_bits::DAT != 0
    }
}

/// z/Architecture の CPU 制御
pub struct S390Cpu;

#[cfg(all(target_arch = "s390x", target_os = "none"))]
mod hw {
    use core::arch::asm;

    use super::{Psw, psw_bits};

    static WAIT_PSW: Psw = Psw {
        mask: psw_bits::SUPERVISOR | psw_bits::WAIT,
        address: 0,
    };

    pub fn halt() {
        // SAFETY: 有効待ち PSW をロードし、次の割り込みまで停止する
        unsafe { asm!("lpswe 0({0})", in(reg_addr) core::ptr::addr_of!(WAIT_PSW)) };
    }

    pub fn set_system_mask(enable: bool) {
        let mut old: u8 = 0;
        // SAFETY: システムマスクの I/O・外部ビットのみを変更する
        unsafe {
            if enable {
                asm!("stosm 0({0}), 0x03", in(reg_addr) core::ptr::addr_of_mut!(old));
            } else {
                asm!("stnsm 0({0}), 0xfc", in(reg_addr) core::ptr::addr_of_mut!(old));
            }
        }
    }

    pub fn load_cr1(root: u64) {
        // SAFETY: root は AddressSpace が作成した有効な ASCE
        unsafe { asm!("lctlg 1, 1, 0({0})", in(reg_addr) core::ptr::addr_of!(root)) };
    }

    pub fn ptlb() {
        // SAFETY: TLB の全エントリ破棄のみ
        unsafe { asm!("ptlb") };
    }

    pub fn sigp_reset(address: u16) {
        let mut status: u64 = 0;
        // SAFETY: 補助プロセッサへの CPU リセット指令
        unsafe {
            asm!(
                "sigp {0}, {1}, 0x0c",
                inout(reg) status,
                in(reg) u64::from(address),
            )
        };
        let _ = status;
    }
}

#[cfg(not(all(target_arch = "s390x", target_os = "none")))]
mod hw {
    pub fn halt() {
        core::hint::spin_loop();
    }
    pub fn set_system_mask(_enable: bool) {}
    pub fn load_cr1(_root: u64) {}
    pub fn ptlb() {}
    pub fn sigp_reset(_address: u16) {}
}

impl Cpu for S390Cpu {
    fn halt() {
        hw::halt();
    }

    fn disable_interrupts() {
        hw::set_system_mask(false);
    }

    fn enable_interrupts() {
        hw::set_system_mask(true);
    }

    fn load_translation_root(root: u64) {
        hw::load_cr1(root);
    }

    fn flush_tlb() {
        hw::ptlb();
    }

    fn signal_reset(address: u16) {
        hw::sigp_reset(address);
    }
}
