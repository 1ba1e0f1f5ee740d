//! RISC-V Supervisor Software Events (SSE) and debug trigger driver.
//!
//! SSE lets supervisor software register handlers for firmware-originated
//! events that are delivered like Non-Maskable Interrupts: firmware
//! interrupts whatever the hart is running, switches to a per-event stack
//! and resumes supervisor code at a registered entry point. This is used
//! for RAS error reports, PMU overflow and software-injected NMIs that must
//! run even with interrupts disabled.
//!
//! # Architecture
//!
//! Everything goes through SBI calls (`ecall` into M-mode firmware such as
//! OpenSBI) issued via the [`Platform`] gateway:
//!
//! - [`Sse`] keeps the event registry, drives register/enable/disable and
//!   preferred-hart changes, and reacts to CPU hotplug, power transitions
//!   and reboot.
//! - [`Sse::handle_entry`] is the delivery path called by the low-level
//!   entry trampoline.
//! - [`TriggerManager`] owns hardware breakpoint and watchpoint slots
//!   through the SBI debug triggers (DBTR) extension.
//!
//! # Example
//!
//! ```no_run
//! use riscv_sse::{EventId, NmiContext, Platform, PtRegs, Sse, SseConfig};
//! use riscv_sse::sbi::sse_event;
//!
//! fn watchdog(_: &NmiContext<'_>, _: EventId, _: usize, _: &mut PtRegs) -> i32 {
//!     0
//! }
//!
//! fn setup<P: Platform>(platform: P) {
//!     let sse = Sse::new(platform, SseConfig::new());
//!     sse.init().expect("SSE init failed");
//!
//!     let event = sse
//!         .register(EventId(sse_event::LOCAL_SOFTWARE), 0, watchdog, 0)
//!         .expect("Event register failed");
//!     sse.enable(&event).expect("Event enable failed");
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod breakpoint;
pub mod config;
pub mod dbtr;
mod dispatch;
pub mod error;
pub mod event;
pub mod hotplug;
pub mod percpu;
pub mod platform;
pub mod regs;
pub mod sbi;
pub mod sse;

#[cfg(test)]
mod testing;

pub use breakpoint::{Access, BreakpointConfig, BreakpointKind, BreakpointRequest, TriggerFormat};
pub use config::{DbtrConfig, SseConfig};
pub use dbtr::{BreakpointHandler, HwBreakpoint, TrapNotify, TriggerCaps, TriggerManager};
pub use error::{Error, SseResult};
pub use event::{Event, EventHandle, EventHandler, EventId, NmiContext};
pub use hotplug::PmEvent;
pub use percpu::{CpuId, CpuMask, PerCpu};
pub use platform::Platform;
pub use regs::PtRegs;
pub use sbi::{SbiError, SbiRet};
pub use sse::Sse;
