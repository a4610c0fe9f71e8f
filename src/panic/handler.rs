// src/panic/handler.rs

//! Central panic handling for bare-metal builds.
//!
//! Interrupts are masked first, the nesting level is recorded in
//! [`crate::panic::state`], and the processor is parked. Output goes through
//! the `log` facade only on the first panic; a nested panic skips all output
//! because the logger itself may be what failed.

use core::panic::PanicInfo;

use crate::arch::{ArchCpu, Cpu};
use crate::panic::state::{PanicLevel, enter_from_handler};

/// Entry point invoked by the crate-level `#[panic_handler]`.
pub fn handle_panic(info: &PanicInfo) -> ! {
    ArchCpu::disable_interrupts();

    match enter_from_handler() {
        PanicLevel::Primary => {
            log::error!("[PANIC] {}", info);
            log::error!("[PANIC] init phase: {}", crate::init::status_string());
        }
        PanicLevel::Nested | PanicLevel::Critical => {}
    }

    crate::hlt_loop()
}
