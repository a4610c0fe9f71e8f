//! カーネル共通型定義

use core::fmt;

use super::result::{KernelResult, TaskError};

/// ジョブハンドル
///
/// ジョブテーブルのスロット番号と世代番号の組。スロットが解放されると
/// 世代が進むため、古いハンドルは二度と有効なジョブを指しません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    index: u32,
    generation: u32,
}

impl JobId {
    /// 新しいジョブハンドルを作成
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// スロット番号（`get_current_job_id` が返す値）
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// 世代番号
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "J{}.{}", self.index, self.generation)
    }
}

/// タスク ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// ID を取得
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// スレッド ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// ID を取得
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// ユーザー ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UserId(pub u16);

impl UserId {
    /// スーパーユーザー
    pub const ROOT: Self = Self(0);
}

/// ジョブ・タスクの名前（最大 8 バイト）
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectName {
    bytes: [u8; Self::MAX_LEN],
    len: u8,
}

impl ObjectName {
    /// 名前の最大長
    pub const MAX_LEN: usize = 8;

    /// 文字列から名前を作成
    ///
    /// # Errors
    ///
    /// 8 バイトを超える場合は [`TaskError::NameTooLong`]
    pub fn new(name: &str) -> KernelResult<Self> {
        let raw = name.as_bytes();
        if raw.len() > Self::MAX_LEN {
            return Err(TaskError::NameTooLong.into());
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { bytes, len: raw.len() as u8 })
    }

    /// 名前を文字列として取得
    #[must_use]
    pub fn as_str(&self) -> &str {
        // new() は &str からしか作らないので常に UTF-8
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    /// 固定長のバイト列（未使用部分は 0）
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::MAX_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::core::result::ErrorKind;

    #[test]
    fn name_accepts_eight_bytes() {
        let name = ObjectName::new("SCHEDULE").unwrap();
        assert_eq!(name.as_str(), "SCHEDULE");
        assert_eq!(name.as_bytes(), b"SCHEDULE");
    }

    #[test]
    fn name_rejects_nine_bytes() {
        let err = ObjectName::new("TOOLONGXX").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn short_name_is_zero_padded() {
        let name = ObjectName::new("JOB1").unwrap();
        assert_eq!(name.as_bytes(), b"JOB1\0\0\0\0");
        assert_eq!(name.as_str(), "JOB1");
    }
}
