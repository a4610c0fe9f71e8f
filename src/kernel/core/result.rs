// src/kernel/core/result.rs
//! カーネル共通エラーハンドリング
//!
//! コンテキスト情報付きエラーで、デバッグを容易にします。
//! システムコール境界では [`ErrorKind::as_code`] の負値コードに変換されます。

use core::fmt;

/// カーネル Result 型
pub type KernelResult<T> = Result<T, KernelError>;

/// カーネルエラー（コンテキスト情報付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError {
    kind: ErrorKind,
    context: Option<&'static str>,
}

impl KernelError {
    /// 新しいエラーを作成
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    /// コンテキスト情報付きエラーを作成
    #[inline]
    pub const fn with_context(kind: ErrorKind, ctx: &'static str) -> Self {
        Self { kind, context: Some(ctx) }
    }

    /// エラー種類を取得
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// コンテキストを取得
    #[inline]
    pub const fn context(&self) -> Option<&'static str> {
        self.context
    }

    /// メモリ不足エラーか確認
    #[inline]
    #[must_use]
    pub const fn is_allocation_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Allocation)
    }

    /// 再試行可能なエラーかどうかをチェック
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// 続行できないエラーかどうかをチェック
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// システムコール境界向けの負値コード
    #[inline]
    #[must_use]
    pub const fn as_code(&self) -> i32 {
        self.kind.as_code()
    }
}

/// エラー種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// メモリ不足
    Allocation,
    /// 構造が不正または未初期化（未マップのテーブルなど）
    InvalidSetup,
    /// 不正な引数
    InvalidParam,
    /// 期待したリソース（ジョブ・タスク・スレッド）が見つからない
    ResourceExpected,
    /// ロック競合（呼び出し側が再試行する）
    ResourceBusy,
    /// リソースが利用不可
    ResourceUnavailable,
    /// 明示的な失敗
    ExplicitFailure,
    /// タイムアウト
    Timeout,
    /// 権限不足
    Unprivileged,
}

impl ErrorKind {
    /// エラーの説明文字列を取得
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocation => "out of memory",
            Self::InvalidSetup => "invalid or missing structure",
            Self::InvalidParam => "invalid parameter",
            Self::ResourceExpected => "expected resource not found",
            Self::ResourceBusy => "resource busy",
            Self::ResourceUnavailable => "resource unavailable",
            Self::ExplicitFailure => "explicit failure",
            Self::Timeout => "operation timed out",
            Self::Unprivileged => "operation not permitted",
        }
    }

    /// 負値のエラーコード
    #[inline]
    #[must_use]
    pub const fn as_code(self) -> i32 {
        match self {
            Self::Allocation => -1,
            Self::InvalidSetup => -2,
            Self::InvalidParam => -3,
            Self::ResourceExpected => -4,
            Self::ResourceBusy => -5,
            Self::ResourceUnavailable => -6,
            Self::ExplicitFailure => -7,
            Self::Timeout => -8,
            Self::Unprivileged => -9,
        }
    }

    /// コードからエラー種類を復元
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Allocation),
            -2 => Some(Self::InvalidSetup),
            -3 => Some(Self::InvalidParam),
            -4 => Some(Self::ResourceExpected),
            -5 => Some(Self::ResourceBusy),
            -6 => Some(Self::ResourceUnavailable),
            -7 => Some(Self::ExplicitFailure),
            -8 => Some(Self::Timeout),
            -9 => Some(Self::Unprivileged),
            _ => None,
        }
    }

    /// 再試行可能なエラーかどうかをチェック
    #[inline]
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ResourceBusy | Self::Timeout)
    }

    /// 続行できないエラーかどうか（構造の破損や未初期化）
    #[inline]
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::InvalidSetup)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// メモリエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// メモリ不足
    OutOfMemory,
    /// ジョブのメモリ上限を超過
    QuotaExceeded,
    /// 不正なアドレス
    InvalidAddress,
    /// アライメント違反
    MisalignedAccess,
    /// サイズ 0 の要求
    ZeroSize,
}

impl MemoryError {
    /// エラーの説明文字列を取得
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::QuotaExceeded => "job memory quota exceeded",
            Self::InvalidAddress => "invalid memory address",
            Self::MisalignedAccess => "misaligned memory access",
            Self::ZeroSize => "zero-length request",
        }
    }

    /// 対応するエラー種類
    #[inline]
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::OutOfMemory | Self::QuotaExceeded => ErrorKind::Allocation,
            Self::InvalidAddress | Self::MisalignedAccess | Self::ZeroSize => {
                ErrorKind::InvalidParam
            }
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ジョブ・タスク・スレッド関連のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// ジョブが見つからない
    JobNotFound,
    /// タスクが見つからない
    TaskNotFound,
    /// スレッドが見つからない
    ThreadNotFound,
    /// 名前が 8 バイトを超えている
    NameTooLong,
}

impl TaskError {
    /// エラーの説明文字列を取得
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobNotFound => "job not found",
            Self::TaskNotFound => "task not found",
            Self::ThreadNotFound => "thread not found",
            Self::NameTooLong => "name longer than 8 bytes",
        }
    }

    /// 対応するエラー種類
    #[inline]
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::JobNotFound | Self::TaskNotFound | Self::ThreadNotFound => {
                ErrorKind::ResourceExpected
            }
            Self::NameTooLong => ErrorKind::InvalidParam,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        if let Some(ctx) = self.context {
            write!(f, " (context: {})", ctx)?;
        }

        Ok(())
    }
}

impl From<MemoryError> for KernelError {
    #[inline]
    fn from(e: MemoryError) -> Self {
        KernelError::with_context(e.kind(), e.as_str())
    }
}

impl From<TaskError> for KernelError {
    #[inline]
    fn from(e: TaskError) -> Self {
        KernelError::with_context(e.kind(), e.as_str())
    }
}

impl From<ErrorKind> for KernelError {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        KernelError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn codes_round_trip_through_kind() {
        for kind in [
            ErrorKind::Allocation,
            ErrorKind::InvalidSetup,
            ErrorKind::InvalidParam,
            ErrorKind::ResourceExpected,
            ErrorKind::ResourceBusy,
            ErrorKind::ResourceUnavailable,
            ErrorKind::ExplicitFailure,
            ErrorKind::Timeout,
            ErrorKind::Unprivileged,
        ] {
            assert!(kind.as_code() < 0);
            assert_eq!(ErrorKind::from_code(kind.as_code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn sub_errors_map_to_kinds() {
        let oom: KernelError = MemoryError::OutOfMemory.into();
        assert!(oom.is_allocation_error());
        assert_eq!(oom.context(), Some("out of memory"));

        let missing: KernelError = TaskError::ThreadNotFound.into();
        assert_eq!(missing.kind(), ErrorKind::ResourceExpected);

        let busy = KernelError::new(ErrorKind::ResourceBusy);
        assert!(busy.is_retryable());
        assert!(!oom.is_retryable());
        assert!(!oom.is_fatal());
        assert!(KernelError::new(ErrorKind::InvalidSetup).is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = KernelError::with_context(ErrorKind::InvalidSetup, "segment table missing");
        assert_eq!(
            format!("{}", err),
            "invalid or missing structure (context: segment table missing)"
        );
    }
}
