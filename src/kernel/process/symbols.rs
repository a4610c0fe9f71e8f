// src/kernel/process/symbols.rs
//! ジョブごとのシンボルテーブル
//!
//! ローダーが登録した名前とアドレスの組を保持し、名前からの検索と
//! アドレスからの逆引き（最も近い手前のシンボル）を提供します。

use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::mm::VirtAddr;

/// シンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    name: String,
    addr: VirtAddr,
}

impl Symbol {
    /// シンボル名
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// アドレス
    #[must_use]
    pub const fn addr(&self) -> VirtAddr {
        self.addr
    }
}

/// シンボルテーブル（アドレス昇順）
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    /// 空のテーブル
    #[must_use]
    pub const fn new() -> Self {
        Self {
            symbols: Vec::new(),
        }
    }

    /// 登録数
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// 空か確認
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// シンボルを登録
    ///
    /// 同名のシンボルが既にある場合はアドレスを置き換えます。
    pub fn insert(&mut self, name: &str, addr: VirtAddr) {
        if let Some(pos) = self.symbols.iter().position(|s| s.name == name) {
            self.symbols.remove(pos);
        }
        let pos = self.symbols.partition_point(|s| s.addr <= addr);
        self.symbols.insert(
            pos,
            Symbol {
                name: String::from(name),
                addr,
            },
        );
    }

    /// 名前で検索
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<VirtAddr> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.addr)
    }

    /// `addr` 以下で最も近いシンボルとそのオフセット
    #[must_use]
    pub fn nearest(&self, addr: VirtAddr) -> Option<(&Symbol, usize)> {
        let pos = self.symbols.partition_point(|s| s.addr <= addr);
        let symbol = self.symbols.get(pos.checked_sub(1)?)?;
        Some((symbol, addr.as_usize() - symbol.addr.as_usize()))
    }

    /// 全シンボル（アドレス昇順）
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}
