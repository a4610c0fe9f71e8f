// src/kernel/mm/allocator.rs
//! 実記憶アロケータ
//!
//! 登録順に並んだリージョン表を first-fit で走査します。各リージョンは
//! 自身のスピンロックを持ち、ロックは走査・変更の間だけ保持されます。
//! リージョン表そのものは起動時に一度だけ埋められ、伸びることはありません。

use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use super::region::{BlockInfo, Region};
use super::types::{LayoutSize, PhysAddr};
use crate::config::MAX_REGIONS;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult, MemoryError};
use crate::sync::SpinLock;

/// 実記憶の使用状況
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// 空きバイト数
    pub free: LayoutSize,
    /// 使用バイト数（管理ブロックを含む）
    pub used: LayoutSize,
    /// 登録済みリージョン数
    pub regions: usize,
}

impl MemoryStats {
    /// 総容量
    pub fn total(&self) -> usize {
        self.free.as_usize() + self.used.as_usize()
    }

    /// 使用率（0-100）
    pub fn usage_rate(&self) -> usize {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        (self.used.as_usize() * 100) / total
    }
}

/// リージョンの不変な範囲情報（ロックなしで参照できる）
#[derive(Debug, Clone, Copy)]
struct RegionBounds {
    base: PhysAddr,
    size: usize,
}

impl RegionBounds {
    fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr.as_usize() - self.base.as_usize() < self.size
    }

    fn overlaps(&self, base: PhysAddr, size: usize) -> bool {
        let end = self.base.as_usize() + self.size;
        base.as_usize() < end && self.base.as_usize() < base.as_usize() + size
    }
}

struct RegionSlot {
    bounds: RegionBounds,
    region: SpinLock<Region>,
}

/// 実記憶マネージャ
pub struct RealMemory {
    slots: [Once<RegionSlot>; MAX_REGIONS],
    count: AtomicUsize,
    registration: SpinLock<()>,
}

impl Default for RealMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RealMemory {
    /// リージョンを持たない空のマネージャ
    pub const fn new() -> Self {
        Self {
            slots: [const { Once::new() }; MAX_REGIONS],
            count: AtomicUsize::new(0),
            registration: SpinLock::new(()),
        }
    }

    /// リージョンを登録する
    ///
    /// `mapping` はカーネルから `[base, base + size)` を読み書きするための
    /// アドレス。戻り値はリージョン番号。
    ///
    /// # Safety
    ///
    /// - `mapping` から `size` バイトが書き込み可能であること
    /// - その範囲をこれ以降アロケータ以外が使わないこと
    ///
    /// # Errors
    ///
    /// - 小さすぎる・既存リージョンと重なる場合は [`ErrorKind::InvalidParam`]
    /// - リージョン表が満杯なら [`ErrorKind::ResourceUnavailable`]
    pub unsafe fn add_region(
        &self,
        base: PhysAddr,
        size: usize,
        mapping: *mut u8,
    ) -> KernelResult<usize> {
        let _guard = self.registration.lock();

        let index = self.count.load(Ordering::Acquire);
        if index >= MAX_REGIONS {
            return Err(KernelError::with_context(
                ErrorKind::ResourceUnavailable,
                "region table full",
            ));
        }
        if base.checked_add(size).is_none()
            || self.bounds().any(|b| b.overlaps(base, size))
        {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "region overlaps an existing region",
            ));
        }

        // SAFETY: 呼び出し側が mapping の有効性と排他性を保証している
        let region = unsafe { Region::format(base, size, mapping) }?;
        self.slots[index].call_once(|| RegionSlot {
            bounds: RegionBounds { base, size },
            region: SpinLock::new(region),
        });
        self.count.store(index + 1, Ordering::Release);

        log::debug!(
            "region {} registered: {} ({} bytes) mapped at {:#x}",
            index,
            base,
            size,
            mapping as usize
        );
        Ok(index)
    }

    /// 恒等マップされたリージョンを登録する
    ///
    /// # Safety
    ///
    /// [`RealMemory::add_region`] と同じ。さらに `base` がそのまま
    /// カーネルからアクセス可能なアドレスであること。
    ///
    /// # Errors
    ///
    /// [`RealMemory::add_region`] と同じ
    pub unsafe fn add_identity_region(&self, base: PhysAddr, size: usize) -> KernelResult<usize> {
        // SAFETY: 呼び出し側の保証をそのまま引き継ぐ
        unsafe { self.add_region(base, size, base.as_usize() as *mut u8) }
    }

    /// 登録済みリージョン数
    pub fn region_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn registered(&self) -> impl Iterator<Item = &RegionSlot> {
        self.slots[..self.region_count()]
            .iter()
            .filter_map(Once::get)
    }

    fn bounds(&self) -> impl Iterator<Item = RegionBounds> + '_ {
        self.registered().map(|slot| slot.bounds)
    }

    fn slot_of(&self, addr: PhysAddr) -> Option<&RegionSlot> {
        self.registered().find(|slot| slot.bounds.contains(addr))
    }

    fn check_request(size: usize, align: usize) -> KernelResult<()> {
        if size == 0 {
            return Err(MemoryError::ZeroSize.into());
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(MemoryError::MisalignedAccess.into());
        }
        Ok(())
    }

    /// `size` バイトを確保する（`align` = 0 は制約なし）
    ///
    /// # Errors
    ///
    /// - どのリージョンにも収まらない場合は [`ErrorKind::Allocation`]
    /// - `size` が 0、`align` が 2 のべき乗でない場合は [`ErrorKind::InvalidParam`]
    pub fn alloc(&self, size: usize, align: usize) -> KernelResult<PhysAddr> {
        Self::check_request(size, align)?;

        for slot in self.registered() {
            if let Some(addr) = slot.region.lock().alloc(size, align) {
                log::trace!("alloc({}, {}) = {}", size, align, addr);
                return Ok(addr);
            }
        }
        log::debug!("alloc({}, {}) failed: out of memory", size, align);
        Err(MemoryError::OutOfMemory.into())
    }

    /// ゼロクリア済みの領域を確保する
    ///
    /// # Errors
    ///
    /// [`RealMemory::alloc`] と同じ
    pub fn alloc_zeroed(&self, size: usize, align: usize) -> KernelResult<PhysAddr> {
        let addr = self.alloc(size, align)?;
        self.fill(addr, 0, size)?;
        Ok(addr)
    }

    /// ブロックを解放する
    ///
    /// どのリージョンにも属さないアドレスは無視する。ブロック先頭でない
    /// アドレスは警告のうえ無視し、二重解放は致命的エラーとなる。
    pub fn free(&self, addr: PhysAddr) {
        let Some(slot) = self.slot_of(addr) else {
            return;
        };
        match slot.region.lock().free(addr) {
            Some(size) => log::trace!("free({}) released {} bytes", addr, size),
            None => log::warn!("free({}): not the start of an allocated block", addr),
        }
    }

    /// ブロックのサイズを変更する
    ///
    /// - `size` が 0 なら解放して `None`
    /// - `addr` が `None` なら新規確保
    /// - サイズが同じなら同じアドレス
    /// - 拡張かつ `align` = 0 なら、その場での拡張を試みる
    /// - それ以外は確保・先頭 min(旧, 新) バイトのコピー・解放
    ///
    /// どのリージョンにも属さないアドレスには `None` を返す。
    ///
    /// # Errors
    ///
    /// - 新しい領域を確保できない場合は [`ErrorKind::Allocation`]。
    ///   このとき元のブロックはそのまま残る
    /// - 使用中ブロックの先頭でない場合は [`ErrorKind::InvalidParam`]
    pub fn realloc(
        &self,
        addr: Option<PhysAddr>,
        size: usize,
        align: usize,
    ) -> KernelResult<Option<PhysAddr>> {
        let Some(addr) = addr else {
            if size == 0 {
                return Ok(None);
            }
            return self.alloc(size, align).map(Some);
        };
        if size == 0 {
            self.free(addr);
            return Ok(None);
        }
        let Some(slot) = self.slot_of(addr) else {
            log::warn!("realloc({}): address outside every region", addr);
            return Ok(None);
        };

        let old_size = {
            let mut region = slot.region.lock();
            let old_size = region.used_block_size(addr).ok_or_else(|| {
                KernelError::from(MemoryError::InvalidAddress)
            })?;
            if old_size == size {
                return Ok(Some(addr));
            }
            if size > old_size && align == 0 {
                if let Some(grown) = region.grow_in_place(addr, size) {
                    return Ok(Some(grown));
                }
            }
            old_size
        };

        // ロックを手放してから確保する（同じリージョンを再度ロックするため）
        let new_addr = self.alloc(size, align)?;
        self.copy(addr, new_addr, old_size.min(size))?;
        self.free(addr);
        Ok(Some(new_addr))
    }

    /// 全リージョンの使用状況（副作用なし）
    pub fn get_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for slot in self.registered() {
            let (free, used) = slot.region.lock().usage();
            stats.free = LayoutSize::new(stats.free.as_usize() + free);
            stats.used = LayoutSize::new(stats.used.as_usize() + used);
            stats.regions += 1;
        }
        stats
    }

    /// リージョンのブロック一覧
    ///
    /// # Errors
    ///
    /// 未登録のリージョン番号なら [`ErrorKind::InvalidParam`]
    pub fn blocks(&self, region: usize) -> KernelResult<Vec<BlockInfo>> {
        self.slots
            .get(region)
            .and_then(Once::get)
            .map(|slot| slot.region.lock().snapshot())
            .ok_or_else(|| KernelError::with_context(ErrorKind::InvalidParam, "no such region"))
    }

    /// 全リージョンの不変条件を検査する
    pub fn verify(&self) {
        for slot in self.registered() {
            slot.region.lock().verify();
        }
    }

    /// 実記憶範囲をカーネルからアクセス可能なポインタに変換する
    ///
    /// # Errors
    ///
    /// 範囲が 1 つのリージョンに収まらない場合は [`ErrorKind::InvalidParam`]
    pub fn window(&self, addr: PhysAddr, len: usize) -> KernelResult<*mut u8> {
        self.slot_of(addr)
            .and_then(|slot| slot.region.lock().window(addr, len))
            .ok_or_else(|| MemoryError::InvalidAddress.into())
    }

    /// 8 バイト値を読む
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn read_u64(&self, addr: PhysAddr) -> KernelResult<u64> {
        let p = self.window(addr, 8)?;
        // SAFETY: window がリージョン内の 8 バイトであることを確認済み
        Ok(unsafe { ptr::read_unaligned(p.cast::<u64>()) })
    }

    /// 8 バイト値を書く
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn write_u64(&self, addr: PhysAddr, value: u64) -> KernelResult<()> {
        let p = self.window(addr, 8)?;
        // SAFETY: 同上
        unsafe { ptr::write_unaligned(p.cast::<u64>(), value) };
        Ok(())
    }

    /// 範囲を `byte` で埋める
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn fill(&self, addr: PhysAddr, byte: u8, len: usize) -> KernelResult<()> {
        let p = self.window(addr, len)?;
        // SAFETY: 範囲はリージョン内
        unsafe { ptr::write_bytes(p, byte, len) };
        Ok(())
    }

    /// 実記憶間のコピー（重なりを許す）
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize) -> KernelResult<()> {
        let from = self.window(src, len)?;
        let to = self.window(dst, len)?;
        // SAFETY: 両範囲ともリージョン内
        unsafe { ptr::copy(from, to, len) };
        Ok(())
    }

    /// 実記憶からバイト列を読み出す
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn read_bytes(&self, addr: PhysAddr, out: &mut [u8]) -> KernelResult<()> {
        let p = self.window(addr, out.len())?;
        // SAFETY: 範囲はリージョン内で、out とは重ならない
        unsafe { ptr::copy_nonoverlapping(p, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// 実記憶へバイト列を書き込む
    ///
    /// # Errors
    ///
    /// [`RealMemory::window`] と同じ
    pub fn write_bytes(&self, addr: PhysAddr, data: &[u8]) -> KernelResult<()> {
        let p = self.window(addr, data.len())?;
        // SAFETY: 同上
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) };
        Ok(())
    }
}

/// [`RealMemory`] を `alloc` クレートのヒープとして使うためのアダプタ
///
/// 恒等マップのリージョンを前提とし、返すポインタは実アドレスそのもの。
pub struct KernelHeap<'a> {
    memory: &'a RealMemory,
}

impl<'a> KernelHeap<'a> {
    /// アダプタを作成
    pub const fn new(memory: &'a RealMemory) -> Self {
        Self { memory }
    }
}

// SAFETY: RealMemory は各リージョンのロックで排他制御している
unsafe impl GlobalAlloc for KernelHeap<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.memory.alloc(layout.size(), layout.align()) {
            Ok(addr) => self.memory.window(addr, layout.size()).unwrap_or(ptr::null_mut()),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        self.memory.free(PhysAddr::new(p as usize));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REGION_ALIGN;
    use crate::kernel::mm::region::{BlockState, HEAD_BLOCK_SIZE};
    use crate::kernel::mm::types::align_up;
    use alloc::boxed::Box;
    use alloc::vec;

    fn memory_with(regions: &[(usize, usize)]) -> (RealMemory, Vec<Box<[u64]>>) {
        let memory = RealMemory::new();
        let mut backing = Vec::new();
        for &(base, size) in regions {
            let mut buf = vec![0u64; size / 8].into_boxed_slice();
            unsafe { memory.add_region(PhysAddr::new(base), size, buf.as_mut_ptr().cast()) }
                .unwrap();
            backing.push(buf);
        }
        (memory, backing)
    }

    #[test]
    fn add_region_rejects_overlap_and_full_table() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        let mut buf = vec![0u64; 512];
        let err = unsafe { memory.add_region(PhysAddr::new(0x10_0800), 4096, buf.as_mut_ptr().cast()) }
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);

        let mut bufs = Vec::new();
        for i in 1..MAX_REGIONS {
            let mut b = vec![0u64; 512].into_boxed_slice();
            unsafe { memory.add_region(PhysAddr::new(0x20_0000 * i), 4096, b.as_mut_ptr().cast()) }
                .unwrap();
            bufs.push(b);
        }
        let err = unsafe { memory.add_region(PhysAddr::new(0x100_0000), 4096, buf.as_mut_ptr().cast()) }
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert_eq!(memory.region_count(), MAX_REGIONS);
    }

    #[test]
    fn alloc_falls_through_to_next_region() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 1024), (0x20_0000, 8192)]);
        let big = memory.alloc(2048, 0).unwrap();
        assert!(big.as_usize() >= 0x20_0000);
        assert!(memory.alloc(1 << 20, 0).unwrap_err().is_allocation_error());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        assert_eq!(memory.alloc(0, 0).unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(memory.alloc(16, 3).unwrap_err().kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn free_outside_regions_is_noop() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        let before = memory.get_stats();
        memory.free(PhysAddr::new(0x9000_0000));
        assert_eq!(memory.get_stats(), before);
    }

    #[test]
    fn realloc_edge_cases() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        let a = memory.realloc(None, 64, 0).unwrap().unwrap();
        assert_eq!(memory.realloc(Some(a), 64, 0).unwrap(), Some(a));
        assert_eq!(memory.realloc(Some(PhysAddr::new(0x9000_0000)), 64, 0).unwrap(), None);
        assert_eq!(memory.realloc(Some(a), 0, 0).unwrap(), None);
        assert_eq!(memory.get_stats().used.as_usize(), HEAD_BLOCK_SIZE);
    }

    #[test]
    fn realloc_shrink_moves_and_keeps_prefix() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        let a = memory.alloc(256, 0).unwrap();
        let pattern: Vec<u8> = (0..=255).collect();
        memory.write_bytes(a, &pattern).unwrap();

        let b = memory.realloc(Some(a), 100, 0).unwrap().unwrap();
        assert_ne!(a, b);
        let mut out = [0u8; 100];
        memory.read_bytes(b, &mut out).unwrap();
        assert_eq!(&out[..], &pattern[..100]);
    }

    #[test]
    fn window_checks_bounds() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        assert!(memory.window(PhysAddr::new(0x10_0000), 4096).is_ok());
        assert!(memory.window(PhysAddr::new(0x10_0f00), 512).is_err());
        assert!(memory.window(PhysAddr::new(0x8_0000), 8).is_err());
    }

    #[test]
    fn kernel_heap_round_trips_through_identity_region() {
        const SIZE: usize = 8192;
        let mut buf = vec![0u8; SIZE + REGION_ALIGN].into_boxed_slice();
        let base = align_up(buf.as_mut_ptr() as usize, REGION_ALIGN).unwrap();
        let memory = RealMemory::new();
        unsafe { memory.add_identity_region(PhysAddr::new(base), SIZE) }.unwrap();
        let start = memory.get_stats();

        let heap = KernelHeap::new(&memory);
        let layout = Layout::from_size_align(256, 64).unwrap();
        let p = unsafe { GlobalAlloc::alloc(&heap, layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert!(p as usize >= base && p as usize + 256 <= base + SIZE);
        unsafe { ptr::write_bytes(p, 0xa5, 256) };
        assert!(memory.get_stats().used.as_usize() >= start.used.as_usize() + 256);

        unsafe { GlobalAlloc::dealloc(&heap, p, layout) };
        assert_eq!(memory.get_stats(), start);

        let too_big = Layout::from_size_align(SIZE, 8).unwrap();
        assert!(unsafe { GlobalAlloc::alloc(&heap, too_big) }.is_null());
        drop(buf);
    }

    #[test]
    fn blocks_reports_layout() {
        let (memory, _mem) = memory_with(&[(0x10_0000, 4096)]);
        let _a = memory.alloc(64, 0).unwrap();
        let blocks = memory.blocks(0).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].state, BlockState::Used);
        assert!(memory.blocks(5).is_err());
    }
}
