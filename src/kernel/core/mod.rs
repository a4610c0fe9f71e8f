//! カーネルコア
//!
//! エラー型と共通 ID 型。

pub mod prelude;
pub mod result;
pub mod types;

pub use result::{ErrorKind, KernelError, KernelResult, MemoryError, TaskError};
pub use types::{JobId, ObjectName, TaskId, ThreadId, UserId};
