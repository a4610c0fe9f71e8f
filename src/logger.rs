// src/logger.rs

//! `log` ファサードのカーネル実装
//!
//! レコードは外部のコンソールドライバが登録したシンクへ転送されます。
//! シンク登録前のレコードは捨てられます。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::kernel::core::{ErrorKind, KernelError, KernelResult};

/// ログの出力先（コンソールドライバが実装する）
pub trait ConsoleSink: Sync {
    /// 1 行分の出力
    fn write_line(&self, args: fmt::Arguments<'_>);
}

/// カーネルロガー
pub struct KernelLogger {
    sink: Once<&'static dyn ConsoleSink>,
}

impl KernelLogger {
    const fn new() -> Self {
        Self { sink: Once::new() }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            sink.write_line(format_args!("{}", Line(record)));
        }
    }

    fn flush(&self) {}
}

/// `[LEVEL] target: message` 形式の 1 行
struct Line<'a, 'r>(&'a Record<'r>);

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:5}] {}: {}",
            self.0.level(),
            self.0.target(),
            self.0.args()
        )
    }
}

static LOGGER: KernelLogger = KernelLogger::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// ロガーを登録し、最大レベルを設定する
///
/// 2 回目以降の呼び出しはレベルの更新のみ行います。
///
/// # Errors
///
/// 別のロガーが既に登録されている場合は [`ErrorKind::InvalidSetup`]
pub fn init(level: LevelFilter) -> KernelResult<()> {
    if !INSTALLED.swap(true, Ordering::AcqRel) {
        log::set_logger(&LOGGER).map_err(|_| {
            KernelError::with_context(ErrorKind::InvalidSetup, "another logger is installed")
        })?;
    }
    log::set_max_level(level);
    Ok(())
}

/// コンソールシンクを登録する（最初の登録のみ有効）
pub fn register_sink(sink: &'static dyn ConsoleSink) -> bool {
    let mut registered = false;
    LOGGER.sink.call_once(|| {
        registered = true;
        sink
    });
    registered
}
