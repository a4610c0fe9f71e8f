//! カーネルコア prelude
//!
//! `use crate::kernel::core::prelude::*;` でよく使う型をインポート

pub use super::result::{ErrorKind, KernelError, KernelResult, MemoryError, TaskError};
pub use super::types::{JobId, ObjectName, TaskId, ThreadId, UserId};
