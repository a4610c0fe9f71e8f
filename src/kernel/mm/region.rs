// src/kernel/mm/region.rs
//! 実記憶リージョン
//!
//! 1 つのリージョンは連続した実記憶で、アドレス順に並んだブロックの
//! 単方向リストで管理されます。ブロック記述子はリージョン先頭の
//! 管理ブロック（ヘッドブロック）内のプールに置かれ、リスト上の位置は
//! 記述子番号で表します。ブロックのアドレスは記述子に持たず、
//! リージョン先頭からサイズを積算して求めます。
//!
//! プールが尽きるとヘッドブロック直後の空きブロックを取り込んで拡張します。
//! それができなければ任意の空きブロックから記述子セグメントを切り出し、
//! 連結リストでつなぎます。既存の記述子は移動しません。
//!
//! 不変条件:
//! - ブロックサイズの総和はリージョンサイズに等しい
//! - 操作後に空きブロックが隣接しない
//! - 先頭ブロックは常に使用中のヘッドブロック
//! - セグメントが 1 つでもある間はヘッドブロックは大きさを変えない

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr;

use super::types::PhysAddr;
use crate::config::{DESCRIPTOR_GROWTH, INITIAL_DESCRIPTORS, REGION_ALIGN};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::panic::fatal;

/// リスト終端
const NIL: u32 = u32::MAX;

/// ヘッドブロックの記述子番号
const HEAD: u32 = 0;

/// ブロックの状態
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// 未使用の記述子スロット
    Absent = 0,
    /// 空き
    Free = 1,
    /// 使用中
    Used = 2,
}

impl BlockState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Absent,
            1 => Self::Free,
            2 => Self::Used,
            _ => fatal("corrupt block descriptor state"),
        }
    }
}

/// プール内の記述子（実記憶上のレイアウト）
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockDesc {
    size: u64,
    next: u32,
    state: u8,
    _reserved: [u8; 3],
}

const DESC_SIZE: usize = size_of::<BlockDesc>();

impl BlockDesc {
    const ABSENT: Self = Self::new(0, NIL, BlockState::Absent);

    const fn new(size: usize, next: u32, state: BlockState) -> Self {
        Self {
            size: size as u64,
            next,
            state: state as u8,
            _reserved: [0; 3],
        }
    }
}

/// 走査中のブロック
#[derive(Debug, Clone, Copy)]
struct BlockRef {
    index: u32,
    addr: usize,
    size: usize,
    state: BlockState,
    next: u32,
}

/// 診断用のブロック情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// 先頭の実アドレス
    pub addr: PhysAddr,
    /// バイト数
    pub size: usize,
    /// 状態
    pub state: BlockState,
}

/// ブロックリストの走査
///
/// アドレスは先頭からサイズを積算して求める。リージョン境界を越える
/// ブロックや自己参照する記述子は致命的エラー。
struct BlockIter<'a> {
    region: &'a Region,
    cursor: u32,
    addr: usize,
    capacity: usize,
    steps: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        if self.cursor == NIL {
            return None;
        }
        if self.cursor as usize >= self.capacity {
            fatal("block descriptor outside pool");
        }
        self.steps += 1;
        if self.steps > self.capacity {
            fatal("block list does not terminate");
        }

        let desc = self.region.desc(self.cursor);
        if desc.next == self.cursor {
            fatal("block links to itself");
        }
        let size = desc.size as usize;
        let end = match self.addr.checked_add(size) {
            Some(end) if end <= self.region.end() => end,
            _ => fatal("block exceeds region bounds"),
        };

        let block = BlockRef {
            index: self.cursor,
            addr: self.addr,
            size,
            state: BlockState::from_raw(desc.state),
            next: desc.next,
        };
        self.addr = end;
        self.cursor = desc.next;
        Some(block)
    }
}

/// 探索結果（直前 2 ブロック付き）
struct Located {
    before_prev: Option<BlockRef>,
    prev: Option<BlockRef>,
    block: BlockRef,
}

/// 登録済みリージョン
///
/// 記述子はすべて `mapping` 経由で読み書きする。ハードウェア上では
/// `mapping` は `base` と同じ値（恒等マップ）になる。
pub struct Region {
    base: PhysAddr,
    size: usize,
    mapping: *mut u8,
    /// 最初の記述子セグメントの実アドレス
    first_segment: usize,
    /// 記述子セグメントの数
    segments: usize,
}

// SAFETY: mapping の指す記憶は登録時にリージョンへ排他的に譲渡され、
// 以後はリージョンのロック下でのみ触れられる
unsafe impl Send for Region {}

/// ヘッドブロックの初期サイズ
pub const HEAD_BLOCK_SIZE: usize = INITIAL_DESCRIPTORS * DESC_SIZE;

const GROWTH_BYTES: usize = DESCRIPTOR_GROWTH * DESC_SIZE;

/// 記述子セグメントの大きさ（先頭スロットは次セグメントへのリンク）
pub const SEGMENT_BYTES: usize = GROWTH_BYTES;

impl Region {
    /// リージョンを初期化する
    ///
    /// ヘッドブロック（使用中）と残り全体の空きブロックを作る。
    ///
    /// # Safety
    ///
    /// `mapping` から `size` バイトが書き込み可能で、他から使われていないこと。
    pub unsafe fn format(base: PhysAddr, size: usize, mapping: *mut u8) -> KernelResult<Self> {
        if mapping.is_null() {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "region mapping is null",
            ));
        }
        if !base.is_aligned(REGION_ALIGN) {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "region base is misaligned",
            ));
        }
        if size <= HEAD_BLOCK_SIZE || base.checked_add(size).is_none() {
            return Err(KernelError::with_context(
                ErrorKind::InvalidParam,
                "region too small",
            ));
        }

        let mut region = Self {
            base,
            size,
            mapping,
            first_segment: 0,
            segments: 0,
        };
        region.write_desc(HEAD, BlockDesc::new(HEAD_BLOCK_SIZE, 1, BlockState::Used));
        region.write_desc(1, BlockDesc::new(size - HEAD_BLOCK_SIZE, NIL, BlockState::Free));
        for slot in 2..INITIAL_DESCRIPTORS as u32 {
            region.write_desc(slot, BlockDesc::ABSENT);
        }
        Ok(region)
    }

    /// 先頭アドレス
    #[inline]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// バイト数
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn end(&self) -> usize {
        self.base.as_usize() + self.size
    }

    /// `addr` がリージョン内か
    #[inline]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr.as_usize() < self.end()
    }

    /// 実アドレスに対応するカーネルからアクセス可能なポインタ
    ///
    /// 呼び出し側は `addr` がリージョン内であることを確認済みであること。
    #[inline]
    fn ptr(&self, addr: usize) -> *mut u8 {
        self.mapping.wrapping_add(addr - self.base.as_usize())
    }

    /// [`Region::ptr`] の範囲検査付き版
    pub(super) fn window(&self, addr: PhysAddr, len: usize) -> Option<*mut u8> {
        let end = addr.as_usize().checked_add(len)?;
        if addr < self.base || end > self.end() {
            return None;
        }
        Some(self.ptr(addr.as_usize()))
    }

    /// 実アドレス `addr` にある記述子を読む
    fn read_raw(&self, addr: usize) -> BlockDesc {
        // SAFETY: 記述子はヘッドブロックかセグメント内にあり、リージョンの記憶は有効
        unsafe { ptr::read_unaligned(self.ptr(addr).cast::<BlockDesc>()) }
    }

    fn write_raw(&mut self, addr: usize, desc: BlockDesc) {
        // SAFETY: 同上。&mut self によりリージョンのロックを保持している
        unsafe { ptr::write_unaligned(self.ptr(addr).cast::<BlockDesc>(), desc) }
    }

    /// ヘッドブロック内のスロット数
    fn head_slots(&self) -> usize {
        self.read_raw(self.base.as_usize()).size as usize / DESC_SIZE
    }

    fn capacity(&self) -> usize {
        self.head_slots() + self.segments * DESCRIPTOR_GROWTH
    }

    /// セグメントの次のセグメント（なければ 0）
    fn link(&self, segment: usize) -> usize {
        self.read_raw(segment).size as usize
    }

    fn set_link(&mut self, segment: usize, next: usize) {
        self.write_raw(segment, BlockDesc::new(next, NIL, BlockState::Used));
    }

    /// 記述子セグメントを先頭から順に辿る
    fn segment_chain(&self) -> impl Iterator<Item = usize> + '_ {
        let first = (self.segments > 0).then_some(self.first_segment);
        core::iter::successors(first, |&s| Some(self.link(s)).filter(|&n| n != 0))
            .take(self.segments)
    }

    fn is_segment(&self, addr: PhysAddr) -> bool {
        self.segment_chain().any(|s| s == addr.as_usize())
    }

    /// 記述子番号から実アドレスを求める
    fn slot_addr(&self, index: u32) -> usize {
        let index = index as usize;
        let head_slots = self.head_slots();
        if index < head_slots {
            return self.base.as_usize() + index * DESC_SIZE;
        }
        let rel = index - head_slots;
        match self.segment_chain().nth(rel / DESCRIPTOR_GROWTH) {
            Some(segment) => segment + (rel % DESCRIPTOR_GROWTH) * DESC_SIZE,
            None => fatal("descriptor segment chain broken"),
        }
    }

    fn desc(&self, index: u32) -> BlockDesc {
        self.read_raw(self.slot_addr(index))
    }

    fn write_desc(&mut self, index: u32, desc: BlockDesc) {
        let addr = self.slot_addr(index);
        self.write_raw(addr, desc);
    }

    fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            region: self,
            cursor: HEAD,
            addr: self.base.as_usize(),
            capacity: self.capacity(),
            steps: 0,
        }
    }

    fn free_slots(&self) -> usize {
        (1..self.capacity() as u32)
            .filter(|&i| BlockState::from_raw(self.desc(i).state) == BlockState::Absent)
            .count()
    }

    fn take_slot(&mut self) -> Option<u32> {
        (1..self.capacity() as u32)
            .find(|&i| BlockState::from_raw(self.desc(i).state) == BlockState::Absent)
    }

    /// 記述子 `index` をリストから外し、スロットを空ける
    fn retire(&mut self, prev: u32, index: u32) {
        let removed = self.desc(index);
        let mut before = self.desc(prev);
        before.next = removed.next;
        self.write_desc(prev, before);
        self.write_desc(index, BlockDesc::ABSENT);
    }

    /// 記述子プールを拡張する
    ///
    /// ヘッドブロック直後の空きブロックから [`DESCRIPTOR_GROWTH`] 個分を奪う。
    /// セグメントがある間はスロット番号がずれるので拡張しない。
    fn grow_head(&mut self) -> bool {
        let head = self.desc(HEAD);
        if self.segments > 0 || head.next == NIL {
            return false;
        }
        let follower = self.desc(head.next);
        if BlockState::from_raw(follower.state) != BlockState::Free
            || (follower.size as usize) < GROWTH_BYTES
        {
            return false;
        }

        let old_capacity = self.capacity() as u32;
        self.write_desc(
            HEAD,
            BlockDesc::new(head.size as usize + GROWTH_BYTES, head.next, BlockState::Used),
        );
        for slot in old_capacity..self.capacity() as u32 {
            self.write_desc(slot, BlockDesc::ABSENT);
        }

        let remaining = follower.size as usize - GROWTH_BYTES;
        if remaining == 0 {
            self.retire(HEAD, head.next);
        } else {
            self.write_desc(head.next, BlockDesc::new(remaining, follower.next, BlockState::Free));
        }
        log::debug!(
            "region {}: descriptor pool grown to {} slots",
            self.base,
            self.capacity()
        );
        true
    }

    /// 空きブロックの先頭から記述子セグメントを切り出す
    ///
    /// セグメントは使用中ブロックとしてリストに残り、先頭スロットは
    /// 次のセグメントへのリンクになる。
    fn add_segment(&mut self) -> bool {
        let Some(block) = self
            .blocks()
            .find(|b| b.state == BlockState::Free && b.size >= SEGMENT_BYTES)
        else {
            return false;
        };

        let addr = block.addr;
        self.set_link(addr, 0);
        for slot in 1..DESCRIPTOR_GROWTH {
            self.write_raw(addr + slot * DESC_SIZE, BlockDesc::ABSENT);
        }
        let tail = self.segment_chain().last();
        match tail {
            Some(last) => self.set_link(last, addr),
            None => self.first_segment = addr,
        }
        self.segments += 1;

        let rest = block.size - SEGMENT_BYTES;
        if rest == 0 {
            self.write_desc(block.index, BlockDesc::new(SEGMENT_BYTES, block.next, BlockState::Used));
        } else {
            let Some(remainder) = self.take_slot() else {
                fatal("new descriptor segment has no free slot");
            };
            self.write_desc(remainder, BlockDesc::new(rest, block.next, BlockState::Free));
            self.write_desc(block.index, BlockDesc::new(SEGMENT_BYTES, remainder, BlockState::Used));
        }
        log::debug!(
            "region {}: descriptor segment {:#x} added ({} slots)",
            self.base,
            addr,
            self.capacity()
        );
        self.check();
        true
    }

    /// 末尾セグメントの記述子を手前の空きスロットへ移す
    ///
    /// 移し切れない場合は何も動かさずに `false`。
    fn drain_last_segment(&mut self) -> bool {
        let link_slot = (self.capacity() - DESCRIPTOR_GROWTH) as u32;
        let is_absent = |r: &Self, i: u32| BlockState::from_raw(r.desc(i).state) == BlockState::Absent;
        let live = (link_slot + 1..self.capacity() as u32)
            .filter(|&i| !is_absent(self, i))
            .count();
        let spare = (1..link_slot).filter(|&i| is_absent(self, i)).count();
        if live > spare {
            return false;
        }

        for index in link_slot + 1..self.capacity() as u32 {
            let desc = self.desc(index);
            if BlockState::from_raw(desc.state) == BlockState::Absent {
                continue;
            }
            let Some(target) = (1..link_slot).find(|&i| is_absent(self, i)) else {
                fatal("descriptor slot vanished while draining");
            };
            let Some(owner) = self.blocks().find(|b| b.next == index).map(|b| b.index) else {
                fatal("live descriptor not linked");
            };
            self.write_desc(target, desc);
            let mut before = self.desc(owner);
            before.next = target;
            self.write_desc(owner, before);
            self.write_desc(index, BlockDesc::ABSENT);
        }
        true
    }

    /// 末尾から、記述子を移し切れるセグメントを返却する
    fn release_idle_segments(&mut self) {
        while self.segments > 0 {
            if !self.drain_last_segment() {
                return;
            }

            let mut prev = None;
            let mut last = self.first_segment;
            for segment in self.segment_chain().skip(1) {
                prev = Some(last);
                last = segment;
            }
            match prev {
                Some(p) => self.set_link(p, 0),
                None => self.first_segment = 0,
            }
            self.segments -= 1;

            if self.free_block(PhysAddr::new(last)).is_none() {
                fatal("descriptor segment block missing");
            }
            log::debug!("region {}: descriptor segment {:#x} released", self.base, last);
        }
    }

    /// first-fit でブロックを探す
    fn find_fit(&self, size: usize, align: usize) -> Option<(BlockRef, usize)> {
        self.blocks()
            .filter(|b| b.state == BlockState::Free)
            .find_map(|b| {
                let start = if align == 0 {
                    b.addr
                } else {
                    super::types::align_up(b.addr, align)?
                };
                let needed = (start - b.addr).checked_add(size)?;
                (needed <= b.size).then_some((b, start))
            })
    }

    /// `size` バイトを `align` 境界で確保する
    ///
    /// 空きブロックは左パディング（空き）・確保部分（使用中）・右余り（空き）に
    /// 分割される。
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<PhysAddr> {
        debug_assert!(size > 0);

        // 記述子不足でプールを拡張した場合は配置が変わるので探し直す
        for _ in 0..2 {
            let (block, start) = self.find_fit(size, align)?;
            let pad = start - block.addr;
            let rest = block.size - pad - size;
            let needed = usize::from(pad > 0) + usize::from(rest > 0);
            if self.free_slots() < needed {
                if !self.grow_head() && !self.add_segment() {
                    log::warn!("region {}: descriptor pool exhausted", self.base);
                    return None;
                }
                continue;
            }

            let mut used = block.index;
            if pad > 0 {
                used = self.take_slot()?;
                self.write_desc(used, BlockDesc::new(size, block.next, BlockState::Used));
                self.write_desc(block.index, BlockDesc::new(pad, used, BlockState::Free));
            } else {
                self.write_desc(used, BlockDesc::new(size, block.next, BlockState::Used));
            }
            if rest > 0 {
                let remainder = self.take_slot()?;
                self.write_desc(remainder, BlockDesc::new(rest, block.next, BlockState::Free));
                self.write_desc(used, BlockDesc::new(size, remainder, BlockState::Used));
            }

            self.check();
            return Some(PhysAddr::new(start));
        }
        None
    }

    fn locate(&self, addr: PhysAddr) -> Option<Located> {
        let mut before_prev = None;
        let mut prev = None;
        for block in self.blocks() {
            if block.addr == addr.as_usize() {
                return Some(Located {
                    before_prev,
                    prev,
                    block,
                });
            }
            if block.addr > addr.as_usize() {
                break;
            }
            before_prev = prev;
            prev = Some(block);
        }
        None
    }

    /// 使用中ブロックの先頭なら、そのサイズ
    pub fn used_block_size(&self, addr: PhysAddr) -> Option<usize> {
        if self.is_segment(addr) {
            return None;
        }
        self.locate(addr)
            .filter(|l| l.block.index != HEAD && l.block.state == BlockState::Used)
            .map(|l| l.block.size)
    }

    /// ブロックを解放し、前後の空きブロックと結合する
    ///
    /// `addr` がブロック先頭でなければ何もせず `None`。二重解放は致命的エラー。
    /// 空になった末尾の記述子セグメントも返却する。
    pub fn free(&mut self, addr: PhysAddr) -> Option<usize> {
        if self.is_segment(addr) {
            return None;
        }
        let released = self.free_block(addr)?;
        self.release_idle_segments();
        Some(released)
    }

    fn free_block(&mut self, addr: PhysAddr) -> Option<usize> {
        let Located { prev, block, .. } = self.locate(addr)?;
        if block.index == HEAD {
            return None;
        }
        if block.state == BlockState::Free {
            fatal("double free");
        }
        let released = block.size;

        let mut size = block.size;
        let mut next = block.next;
        while next != NIL {
            let follower = self.desc(next);
            if BlockState::from_raw(follower.state) != BlockState::Free {
                break;
            }
            size += follower.size as usize;
            self.write_desc(next, BlockDesc::ABSENT);
            next = follower.next;
        }

        match prev {
            Some(p) if p.state == BlockState::Free => {
                self.write_desc(p.index, BlockDesc::new(p.size + size, next, BlockState::Free));
                self.write_desc(block.index, BlockDesc::ABSENT);
            }
            _ => {
                self.write_desc(block.index, BlockDesc::new(size, next, BlockState::Free));
            }
        }

        self.check();
        Some(released)
    }

    /// アラインメント制約なしでブロックをその場で拡張する
    ///
    /// 直後の空きブロックを吸収し、足りなければ直前の空きブロックの末尾を
    /// 奪ってデータを前方へ移動する。どちらもできなければ `None`。
    pub fn grow_in_place(&mut self, addr: PhysAddr, new_size: usize) -> Option<PhysAddr> {
        if self.is_segment(addr) {
            return None;
        }
        let Located {
            before_prev,
            prev,
            block,
        } = self.locate(addr)?;
        if block.index == HEAD || block.state != BlockState::Used || new_size <= block.size {
            return None;
        }
        let need = new_size - block.size;

        if block.next != NIL {
            let follower = self.desc(block.next);
            if BlockState::from_raw(follower.state) == BlockState::Free
                && follower.size as usize >= need
            {
                let remaining = follower.size as usize - need;
                if remaining == 0 {
                    self.retire(block.index, block.next);
                    let grown = self.desc(block.index);
                    self.write_desc(block.index, BlockDesc::new(new_size, grown.next, BlockState::Used));
                } else {
                    self.write_desc(
                        block.next,
                        BlockDesc::new(remaining, follower.next, BlockState::Free),
                    );
                    self.write_desc(block.index, BlockDesc::new(new_size, block.next, BlockState::Used));
                }
                self.check();
                return Some(addr);
            }
        }

        let p = prev.filter(|p| p.state == BlockState::Free && p.size >= need)?;
        let new_addr = block.addr - need;
        // SAFETY: 両範囲ともリージョン内。重なり得るので copy を使う
        unsafe { ptr::copy(self.ptr(block.addr), self.ptr(new_addr), block.size) };

        if p.size == need {
            // 空きブロックの直前は空きでないので、ヘッドか使用中ブロックが必ずある
            let owner = before_prev.map_or(HEAD, |b| b.index);
            self.retire(owner, p.index);
        } else {
            self.write_desc(p.index, BlockDesc::new(p.size - need, block.index, BlockState::Free));
        }
        self.write_desc(block.index, BlockDesc::new(new_size, block.next, BlockState::Used));

        self.check();
        Some(PhysAddr::new(new_addr))
    }

    /// (空きバイト数, 使用バイト数)。ヘッドブロックは使用中に数える
    pub fn usage(&self) -> (usize, usize) {
        self.blocks().fold((0, 0), |(free, used), b| match b.state {
            BlockState::Free => (free + b.size, used),
            _ => (free, used + b.size),
        })
    }

    /// ブロック一覧のスナップショット
    pub fn snapshot(&self) -> Vec<BlockInfo> {
        self.blocks()
            .map(|b| BlockInfo {
                addr: PhysAddr::new(b.addr),
                size: b.size,
                state: b.state,
            })
            .collect()
    }

    /// 不変条件を検査する（違反は致命的エラー）
    pub fn verify(&self) {
        let mut total = 0usize;
        let mut prev_free = false;
        for (n, block) in self.blocks().enumerate() {
            if n == 0 && (block.index != HEAD || block.state != BlockState::Used) {
                fatal("head block missing");
            }
            if block.state == BlockState::Absent {
                fatal("retired descriptor still linked");
            }
            let is_free = block.state == BlockState::Free;
            if is_free && prev_free {
                fatal("adjacent free blocks");
            }
            prev_free = is_free;
            total += block.size;
        }
        if total != self.size {
            fatal("block sizes do not sum to region size");
        }
        for segment in self.segment_chain() {
            let state = self.locate(PhysAddr::new(segment)).map(|l| l.block.state);
            if state != Some(BlockState::Used) {
                fatal("descriptor segment is not a used block");
            }
        }
        if self.segment_chain().count() != self.segments {
            fatal("descriptor segment chain broken");
        }
    }

    #[inline]
    fn check(&self) {
        #[cfg(any(debug_assertions, feature = "verify-regions"))]
        self.verify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    const BASE: usize = 0x10_0000;

    fn region(size: usize) -> (Region, Box<[u64]>) {
        let mut backing = vec![0u64; size / 8].into_boxed_slice();
        let region =
            unsafe { Region::format(PhysAddr::new(BASE), size, backing.as_mut_ptr().cast()) }
                .unwrap();
        (region, backing)
    }

    fn states(region: &Region) -> Vec<(usize, BlockState)> {
        region.snapshot().iter().map(|b| (b.size, b.state)).collect()
    }

    #[test]
    fn format_creates_head_and_one_free_block() {
        let (region, _mem) = region(4096);
        assert_eq!(
            states(&region),
            vec![
                (HEAD_BLOCK_SIZE, BlockState::Used),
                (4096 - HEAD_BLOCK_SIZE, BlockState::Free)
            ]
        );
        assert_eq!(region.usage(), (4096 - HEAD_BLOCK_SIZE, HEAD_BLOCK_SIZE));
    }

    #[test]
    fn format_rejects_tiny_region() {
        let mut backing = [0u64; 16];
        let result =
            unsafe { Region::format(PhysAddr::new(BASE), 128, backing.as_mut_ptr().cast()) };
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidParam));
    }

    #[test]
    fn aligned_alloc_leaves_free_padding() {
        let (mut region, _mem) = region(4096);
        let a = region.alloc(100, 0).unwrap();
        let b = region.alloc(50, 256).unwrap();
        assert_eq!(a.as_usize(), BASE + HEAD_BLOCK_SIZE);
        assert!(b.is_aligned(256));
        let blocks = states(&region);
        assert_eq!(blocks[1], (100, BlockState::Used));
        assert_eq!(blocks[2].1, BlockState::Free);
        assert_eq!(blocks[3], (50, BlockState::Used));
        region.verify();
    }

    #[test]
    fn free_coalesces_both_sides() {
        let (mut region, _mem) = region(4096);
        let a = region.alloc(64, 0).unwrap();
        let b = region.alloc(64, 0).unwrap();
        let c = region.alloc(64, 0).unwrap();
        region.free(a);
        region.free(c);
        region.free(b);
        assert_eq!(
            states(&region),
            vec![
                (HEAD_BLOCK_SIZE, BlockState::Used),
                (4096 - HEAD_BLOCK_SIZE, BlockState::Free)
            ]
        );
    }

    #[test]
    fn free_inside_block_is_ignored() {
        let (mut region, _mem) = region(4096);
        let a = region.alloc(64, 0).unwrap();
        assert_eq!(region.free(PhysAddr::new(a.as_usize() + 8)), None);
        assert_eq!(region.free(PhysAddr::new(BASE)), None);
        assert_eq!(region.used_block_size(a), Some(64));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let (mut region, _mem) = region(4096);
        let a = region.alloc(64, 0).unwrap();
        let _b = region.alloc(64, 0).unwrap();
        region.free(a);
        region.free(a);
    }

    #[test]
    fn pool_grows_from_following_free_block() {
        let (mut region, _mem) = region(64 * 1024);
        // ヘッド直後に拡張分ちょうどの空きブロックを作る
        let spacer = region.alloc(GROWTH_BYTES, 0).unwrap();
        let pin = region.alloc(16, 0).unwrap();
        region.free(spacer);

        let mut held = Vec::new();
        for _ in 0..INITIAL_DESCRIPTORS {
            held.push(region.alloc(600, 0).unwrap());
            let gap = region.alloc(600, 0).unwrap();
            region.free(gap);
        }
        let blocks = region.snapshot();
        assert_eq!(blocks[0].size, HEAD_BLOCK_SIZE + GROWTH_BYTES);
        assert_eq!(blocks[1].addr, pin);
        region.verify();

        for addr in held {
            region.free(addr);
        }
        region.free(pin);
        let (free, used) = region.usage();
        assert_eq!(free + used, 64 * 1024);
        assert_eq!(region.snapshot().len(), 2);
    }

    #[test]
    fn pool_adds_segment_when_head_is_boxed_in() {
        let (mut region, _mem) = region(32 * 1024);
        let held: Vec<_> = (0..INITIAL_DESCRIPTORS + 8)
            .map(|_| region.alloc(16, 0).unwrap())
            .collect();
        assert_eq!(region.segments, 1);
        assert_eq!(region.snapshot()[0].size, HEAD_BLOCK_SIZE);
        assert!(region.capacity() > INITIAL_DESCRIPTORS);
        region.verify();

        // セグメント自体は解放もその場での拡張もできない
        let segment = PhysAddr::new(region.first_segment);
        assert_eq!(region.free(segment), None);
        assert_eq!(region.used_block_size(segment), None);
        assert_eq!(region.grow_in_place(segment, SEGMENT_BYTES + 16), None);

        for addr in held {
            region.free(addr);
        }
        assert_eq!(region.segments, 0);
        assert_eq!(
            states(&region),
            vec![
                (HEAD_BLOCK_SIZE, BlockState::Used),
                (32 * 1024 - HEAD_BLOCK_SIZE, BlockState::Free)
            ]
        );
    }

    #[test]
    fn busy_segment_is_kept_until_its_descriptors_fit_below() {
        let (mut region, _mem) = region(32 * 1024);
        let held: Vec<_> = (0..2 * INITIAL_DESCRIPTORS)
            .map(|_| region.alloc(16, 0).unwrap())
            .collect();
        assert_eq!(region.segments, 2);

        // 末尾の数ブロックだけ解放しても手前のスロットは埋まったまま
        for addr in &held[held.len() - 4..] {
            region.free(*addr);
        }
        assert_eq!(region.segments, 2);
        region.verify();

        for addr in &held[..held.len() - 4] {
            region.free(*addr);
        }
        assert_eq!(region.segments, 0);
        assert_eq!(region.snapshot().len(), 2);
    }

    #[test]
    fn grow_in_place_uses_following_block() {
        let (mut region, _mem) = region(4096);
        let a = region.alloc(64, 0).unwrap();
        assert_eq!(region.grow_in_place(a, 128), Some(a));
        assert_eq!(region.used_block_size(a), Some(128));
    }

    #[test]
    fn grow_in_place_moves_into_preceding_block() {
        let (mut region, _mem) = region(1024);
        let a = region.alloc(64, 0).unwrap();
        let b = region.alloc(32, 0).unwrap();
        let rest = region.usage().0;
        let _c = region.alloc(rest, 0).unwrap();

        let data = region.window(b, 32).unwrap();
        unsafe { ptr::write_bytes(data, 0x5a, 32) };
        region.free(a);

        let moved = region.grow_in_place(b, 80).unwrap();
        assert_eq!(moved.as_usize(), b.as_usize() - 48);
        let out = region.window(moved, 32).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(out, 32) };
        assert!(bytes.iter().all(|&x| x == 0x5a));
        assert_eq!(states(&region)[1], (16, BlockState::Free));
    }
}
