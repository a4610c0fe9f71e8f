// src/kernel/mm/types.rs
//! 型安全なメモリ管理型定義
//!
//! 実記憶アドレス・仮想アドレス・サイズを別々の型で扱い、
//! 引数の取り違えをコンパイル時に検出します。

use core::fmt;

use crate::config::{PAGE_OFFSET_MASK, PAGE_SIZE};
use crate::kernel::core::MemoryError;

/// 実記憶（物理）アドレス
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// 物理アドレスを作成
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// アラインメント検証付きで物理アドレスを作成
    ///
    /// # Errors
    ///
    /// アラインメント要件を満たさない場合、[`MemoryError::MisalignedAccess`] を返します。
    #[inline]
    pub fn new_aligned(addr: usize, align: usize) -> Result<Self, MemoryError> {
        if align != 0 && addr % align != 0 {
            return Err(MemoryError::MisalignedAccess);
        }
        Ok(Self(addr))
    }

    /// ゼロアドレスを取得
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// アドレス値を取得
    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// アドレス値をu64として取得
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// ゼロアドレスか確認
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// 指定されたアラインメントに揃っているか確認（0 は制約なし）
    #[inline]
    pub const fn is_aligned(&self, align: usize) -> bool {
        align == 0 || self.0 % align == 0
    }

    /// ページ境界に揃っているか確認
    #[inline]
    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    /// 指定されたアラインメントに切り上げ
    #[inline]
    pub fn align_up(&self, align: usize) -> Option<Self> {
        align_up(self.0, align).map(Self)
    }

    /// 指定されたアラインメントに切り下げ
    #[inline]
    pub const fn align_down(&self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// オフセットを加算
    #[inline]
    pub fn checked_add(&self, offset: usize) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// オフセットを減算
    #[inline]
    pub fn checked_sub(&self, offset: usize) -> Option<Self> {
        self.0.checked_sub(offset).map(Self)
    }

    /// 2 つのアドレスの差（self >= other のときのみ）
    #[inline]
    pub fn offset_from(&self, other: Self) -> Option<usize> {
        self.0.checked_sub(other.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// 仮想アドレス
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// 仮想アドレスを作成
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// 物理アドレスと同じ値の仮想アドレス（恒等マップ用）
    #[inline]
    pub const fn identity(phys: PhysAddr) -> Self {
        Self(phys.as_usize())
    }

    /// アドレス値を取得
    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// アドレス値をu64として取得
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// ページ境界に揃っているか確認
    #[inline]
    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    /// ページ内オフセット
    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    /// オフセットを加算
    #[inline]
    pub fn checked_add(&self, offset: usize) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// メモリレイアウトサイズ
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LayoutSize(usize);

impl LayoutSize {
    /// サイズを作成
    #[inline]
    pub const fn new(size: usize) -> Self {
        Self(size)
    }

    /// ゼロサイズを取得
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// サイズ値を取得
    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// 指定されたアラインメントに切り上げ
    #[inline]
    pub fn align_up(&self, align: usize) -> Option<Self> {
        align_up(self.0, align).map(Self)
    }

    /// ページ数（端数切り上げ）
    #[inline]
    pub fn pages(&self) -> Option<usize> {
        align_up(self.0, PAGE_SIZE).map(|n| n / PAGE_SIZE)
    }

    /// サイズがゼロかチェック
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LayoutSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

/// `value` を `align` の倍数に切り上げ
///
/// `align` が 2 のべき乗でない場合やオーバーフロー時は `None`。
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 || !align.is_power_of_two() {
        return None;
    }
    let mask = align - 1;
    value.checked_add(mask).map(|n| n & !mask)
}
