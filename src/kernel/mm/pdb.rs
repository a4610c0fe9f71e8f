// src/kernel/mm/pdb.rs
//! プログラムデータブロック
//!
//! ユーザープログラムの起動時に渡す固定レイアウトのブロックです。
//! 実記憶の空き・使用バイト数とコマンドラインを含みます。

use core::mem::size_of;

use super::allocator::{MemoryStats, RealMemory};
use super::types::PhysAddr;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};

/// コマンドラインの最大長
pub const CMDLINE_MAX: usize = 256;

/// ブロック先頭の識別子
pub const PDB_MAGIC: [u8; 4] = *b"PDB1";

/// 文字エンコーディング
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// ASCII
    Ascii = 0,
    /// EBCDIC
    Ebcdic = 1,
}

/// プログラムデータブロック
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProgramDataBlock {
    /// [`PDB_MAGIC`]
    pub magic: [u8; 4],
    /// レイアウトのバージョン
    pub version: u16,
    /// コマンドラインの [`Encoding`]
    pub encoding: u16,
    /// 空きバイト数
    pub free_bytes: u64,
    /// 使用中バイト数
    pub used_bytes: u64,
    /// 登録済みリージョン数
    pub region_count: u32,
    /// `cmdline` の有効バイト数
    pub cmdline_len: u32,
    /// コマンドライン（残りは 0 埋め）
    pub cmdline: [u8; CMDLINE_MAX],
}

impl ProgramDataBlock {
    /// レイアウトのバージョン
    pub const VERSION: u16 = 1;

    /// バイト表現の長さ
    pub const SIZE: usize = size_of::<Self>();

    /// 統計とコマンドラインからブロックを作る
    ///
    /// # Errors
    ///
    /// コマンドラインが [`CMDLINE_MAX`] バイトを超える場合は [`ErrorKind::InvalidParam`]
    pub fn new(stats: &MemoryStats, cmdline: &[u8], encoding: Encoding) -> KernelResult<Self> {
        if cmdline.len() > CMDLINE_MAX {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "command line too long",
            ));
        }
        let mut buf = [0u8; CMDLINE_MAX];
        buf[..cmdline.len()].copy_from_slice(cmdline);
        Ok(Self {
            magic: PDB_MAGIC,
            version: Self::VERSION,
            encoding: encoding as u16,
            free_bytes: stats.free.as_usize() as u64,
            used_bytes: stats.used.as_usize() as u64,
            region_count: stats.regions as u32,
            cmdline_len: cmdline.len() as u32,
            cmdline: buf,
        })
    }

    /// 現在の実記憶の状態から作る
    ///
    /// # Errors
    ///
    /// [`ProgramDataBlock::new`] と同じ
    pub fn snapshot(mem: &RealMemory, cmdline: &[u8], encoding: Encoding) -> KernelResult<Self> {
        Self::new(&mem.get_stats(), cmdline, encoding)
    }

    /// コマンドライン部分
    pub fn cmdline(&self) -> &[u8] {
        &self.cmdline[..self.cmdline_len as usize]
    }

    /// 固定レイアウトのバイト列を `out` に書き出す
    ///
    /// # Errors
    ///
    /// `out` が [`ProgramDataBlock::SIZE`] より短い場合は [`ErrorKind::InvalidParam`]
    pub fn copy_out(&self, out: &mut [u8]) -> KernelResult<usize> {
        if out.len() < Self::SIZE {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "buffer shorter than program data block",
            ));
        }
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&self.magic);
        put(&self.version.to_ne_bytes());
        put(&self.encoding.to_ne_bytes());
        put(&self.free_bytes.to_ne_bytes());
        put(&self.used_bytes.to_ne_bytes());
        put(&self.region_count.to_ne_bytes());
        put(&self.cmdline_len.to_ne_bytes());
        put(&self.cmdline);
        Ok(at)
    }

    /// ユーザー空間の実記憶 `dst` へ書き込む
    ///
    /// # Errors
    ///
    /// `dst` から [`ProgramDataBlock::SIZE`] バイトが 1 つのリージョンに
    /// 収まらない場合は [`ErrorKind::InvalidParam`]
    pub fn write_to(&self, mem: &RealMemory, dst: PhysAddr) -> KernelResult<()> {
        let mut bytes = [0u8; Self::SIZE];
        self.copy_out(&mut bytes)?;
        mem.write_bytes(dst, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mm::types::LayoutSize;

    fn stats() -> MemoryStats {
        MemoryStats {
            free: LayoutSize::new(1000),
            used: LayoutSize::new(24),
            regions: 1,
        }
    }

    #[test]
    fn layout_is_fixed() {
        assert_eq!(ProgramDataBlock::SIZE, 288);
    }

    #[test]
    fn copy_out_writes_fields_in_order() {
        let pdb = ProgramDataBlock::new(&stats(), b"run x", Encoding::Ebcdic).unwrap();
        let mut out = [0u8; ProgramDataBlock::SIZE];
        assert_eq!(pdb.copy_out(&mut out).unwrap(), ProgramDataBlock::SIZE);
        assert_eq!(&out[..4], b"PDB1");
        assert_eq!(u16::from_ne_bytes([out[6], out[7]]), Encoding::Ebcdic as u16);
        assert_eq!(u64::from_ne_bytes(out[8..16].try_into().unwrap()), 1000);
        assert_eq!(&out[32..37], b"run x");
        assert_eq!(pdb.cmdline(), b"run x");
    }

    #[test]
    fn long_command_line_is_rejected() {
        let long = [b'a'; CMDLINE_MAX + 1];
        let err = ProgramDataBlock::new(&stats(), &long, Encoding::Ascii).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        let pdb = ProgramDataBlock::new(&stats(), b"", Encoding::Ascii).unwrap();
        assert!(pdb.copy_out(&mut [0u8; 16]).is_err());
    }
}
