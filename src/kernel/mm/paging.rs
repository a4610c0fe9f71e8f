// src/kernel/mm/paging.rs
//! アドレス空間（セグメント表 → ページ表の 2 段変換）
//!
//! 仮想アドレスの上位がセグメント番号（1 MiB 単位）、続く 8 ビットが
//! ページ番号、下位 12 ビットがページ内オフセットです。表の記憶は
//! すべて [`RealMemory`] から確保し、その窓を通して読み書きします。

use bitflags::bitflags;

use super::allocator::RealMemory;
use super::types::{LayoutSize, PhysAddr, VirtAddr};
use crate::config::{
    PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_BYTES, PAGES_PER_SEGMENT, SEGMENT_COUNT,
    SEGMENT_SHIFT, SEGMENT_TABLE_BYTES, TABLE_ENTRY_SIZE, VIRTUAL_LIMIT,
};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult, MemoryError};
use crate::sync::SpinLock;

bitflags! {
    /// ページ表エントリのフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// 書き込み禁止
        const PROTECT = 1 << 9;
        /// 無効（変換しない）
        const INVALID = 1 << 10;
    }
}

impl PageFlags {
    /// 読み書き可能な通常ページ
    pub const READ_WRITE: Self = Self::empty();
    /// 読み取り専用ページ
    pub const READ_ONLY: Self = Self::PROTECT;
}

/// セグメント表エントリの無効ビット
const SEGMENT_INVALID: u64 = 1 << 5;
/// セグメント表エントリのページ表起点（2 KiB 境界）
const SEGMENT_ORIGIN_MASK: u64 = !((PAGE_TABLE_BYTES as u64) - 1);
/// ページ表エントリのフレーム起点
const PAGE_ORIGIN_MASK: u64 = !(PAGE_OFFSET_MASK as u64);
/// 変換ルートの表長フィールド（4 KiB 単位の表数 - 1）
const TABLE_LENGTH: u64 = (SEGMENT_TABLE_BYTES / PAGE_SIZE) as u64 - 1;

#[inline]
const fn segment_index(v: VirtAddr) -> usize {
    v.as_usize() >> SEGMENT_SHIFT
}

#[inline]
const fn page_index(v: VirtAddr) -> usize {
    (v.as_usize() >> PAGE_SHIFT) & (PAGES_PER_SEGMENT - 1)
}

#[derive(Debug)]
struct Tables {
    segment_table: PhysAddr,
}

impl Tables {
    fn segment_entry(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.segment_table.as_usize() + index * TABLE_ENTRY_SIZE)
    }

    /// 有効なセグメントのページ表起点
    fn page_table(&self, mem: &RealMemory, index: usize) -> KernelResult<Option<PhysAddr>> {
        let ste = mem.read_u64(self.segment_entry(index))?;
        if ste & SEGMENT_INVALID != 0 {
            return Ok(None);
        }
        Ok(Some(PhysAddr::new((ste & SEGMENT_ORIGIN_MASK) as usize)))
    }

    fn page_entry(page_table: PhysAddr, index: usize) -> PhysAddr {
        PhysAddr::new(page_table.as_usize() + index * TABLE_ENTRY_SIZE)
    }
}

/// ジョブのアドレス空間
#[derive(Debug)]
pub struct AddressSpace {
    tables: SpinLock<Tables>,
    root: u64,
}

impl AddressSpace {
    /// セグメント表を確保し、全エントリを無効にする
    ///
    /// # Errors
    ///
    /// セグメント表を確保できない場合は [`ErrorKind::Allocation`]
    pub fn create(mem: &RealMemory) -> KernelResult<Self> {
        let segment_table = mem.alloc(SEGMENT_TABLE_BYTES, PAGE_SIZE)?;
        let tables = Tables { segment_table };
        for index in 0..SEGMENT_COUNT {
            if let Err(e) = mem.write_u64(tables.segment_entry(index), SEGMENT_INVALID) {
                mem.free(segment_table);
                return Err(e);
            }
        }

        let root = segment_table.as_u64() | TABLE_LENGTH;
        log::debug!("address space created: segment table at {}", segment_table);
        Ok(Self {
            tables: SpinLock::new(tables),
            root,
        })
    }

    /// 変換ルート（セグメント表起点 | 表長）
    #[inline]
    pub const fn translation_root(&self) -> u64 {
        self.root
    }

    /// セグメント表の実アドレス
    pub fn segment_table(&self) -> PhysAddr {
        self.tables.lock().segment_table
    }

    /// 1 ページをマップする
    ///
    /// ページ表が無ければ確保し、全エントリを無効で初期化する。
    ///
    /// # Errors
    ///
    /// - アドレスがページ境界でない・変換範囲外なら [`ErrorKind::InvalidParam`]
    /// - ページ表を確保できない場合は [`ErrorKind::Allocation`]
    pub fn map_page(
        &self,
        mem: &RealMemory,
        v: VirtAddr,
        p: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !v.is_page_aligned() || !p.is_page_aligned() {
            return Err(MemoryError::MisalignedAccess.into());
        }
        if v.as_usize() >= VIRTUAL_LIMIT {
            return Err(MemoryError::InvalidAddress.into());
        }

        let tables = self.tables.lock();
        let seg = segment_index(v);
        let page_table = match tables.page_table(mem, seg)? {
            Some(pt) => pt,
            None => {
                let pt = mem.alloc(PAGE_TABLE_BYTES, PAGE_TABLE_BYTES)?;
                for index in 0..PAGES_PER_SEGMENT {
                    mem.write_u64(Tables::page_entry(pt, index), PageFlags::INVALID.bits())?;
                }
                mem.write_u64(tables.segment_entry(seg), pt.as_u64())?;
                log::trace!("segment {} gets page table {}", seg, pt);
                pt
            }
        };

        let entry = p.as_u64() | flags.difference(PageFlags::INVALID).bits();
        mem.write_u64(Tables::page_entry(page_table, page_index(v)), entry)
    }

    /// `size` をページ単位に切り上げ、連続する範囲をマップする
    ///
    /// 途中で失敗しても、それまでにマップしたページは残る。
    ///
    /// # Errors
    ///
    /// [`AddressSpace::map_page`] と同じ
    pub fn map_range(
        &self,
        mem: &RealMemory,
        v: VirtAddr,
        p: PhysAddr,
        flags: PageFlags,
        size: usize,
    ) -> KernelResult<()> {
        let pages = LayoutSize::new(size)
            .pages()
            .ok_or(KernelError::from(MemoryError::InvalidAddress))?;
        for i in 0..pages {
            let offset = i * PAGE_SIZE;
            let (Some(va), Some(pa)) = (v.checked_add(offset), p.checked_add(offset)) else {
                return Err(MemoryError::InvalidAddress.into());
            };
            self.map_page(mem, va, pa, flags)?;
        }
        Ok(())
    }

    /// ページのマップを解除する
    ///
    /// # Errors
    ///
    /// マップされていなければ [`ErrorKind::ResourceExpected`]
    pub fn unmap_page(&self, mem: &RealMemory, v: VirtAddr) -> KernelResult<()> {
        if v.as_usize() >= VIRTUAL_LIMIT {
            return Err(MemoryError::InvalidAddress.into());
        }
        let tables = self.tables.lock();
        let not_mapped = || KernelError::with_context(ErrorKind::ResourceExpected, "page not mapped");
        let pt = tables.page_table(mem, segment_index(v))?.ok_or_else(not_mapped)?;
        let entry = Tables::page_entry(pt, page_index(v));
        if mem.read_u64(entry)? & PageFlags::INVALID.bits() != 0 {
            return Err(not_mapped());
        }
        mem.write_u64(entry, PageFlags::INVALID.bits())
    }

    /// 仮想アドレスを実アドレスに変換する
    ///
    /// どちらかの段が無効なら `None`。
    pub fn virtual_to_real(&self, mem: &RealMemory, v: VirtAddr) -> Option<PhysAddr> {
        if v.as_usize() >= VIRTUAL_LIMIT {
            return None;
        }
        let tables = self.tables.lock();
        let pt = tables.page_table(mem, segment_index(v)).ok()??;
        let pte = mem.read_u64(Tables::page_entry(pt, page_index(v))).ok()?;
        if pte & PageFlags::INVALID.bits() != 0 {
            return None;
        }
        Some(PhysAddr::new((pte & PAGE_ORIGIN_MASK) as usize | v.page_offset()))
    }

    /// 実アドレスをマップしている仮想アドレスを探す（診断用の全走査）
    pub fn phys2virt(&self, mem: &RealMemory, p: PhysAddr) -> Option<VirtAddr> {
        let frame = p.as_u64() & PAGE_ORIGIN_MASK;
        let offset = p.as_usize() & PAGE_OFFSET_MASK;
        let tables = self.tables.lock();
        for seg in 0..SEGMENT_COUNT {
            let Ok(Some(pt)) = tables.page_table(mem, seg) else {
                continue;
            };
            for page in 0..PAGES_PER_SEGMENT {
                let Ok(pte) = mem.read_u64(Tables::page_entry(pt, page)) else {
                    continue;
                };
                if pte & PageFlags::INVALID.bits() == 0 && pte & PAGE_ORIGIN_MASK == frame {
                    let v = (seg << SEGMENT_SHIFT) | (page << PAGE_SHIFT) | offset;
                    return Some(VirtAddr::new(v));
                }
            }
        }
        None
    }

    /// ページ表とセグメント表を解放する
    pub fn destroy(self, mem: &RealMemory) {
        let tables = self.tables.lock();
        for seg in 0..SEGMENT_COUNT {
            if let Ok(Some(pt)) = tables.page_table(mem, seg) {
                mem.free(pt);
            }
        }
        mem.free(tables.segment_table);
        log::debug!("address space at {} destroyed", tables.segment_table);
    }
}
