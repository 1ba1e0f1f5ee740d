//! Event delivery path.
//!
//! Firmware resumes supervisor code at the trampoline registered for an
//! event instance; the trampoline switches to the instance's private stack,
//! saves the interrupted registers and calls [`Sse::handle_entry`] with the
//! entry argument it was given at registration.
//!
//! Everything here runs in an NMI-equivalent context: no locks, no
//! allocation, no blocking.

use core::sync::atomic::Ordering;

use crate::event::{NmiContext, RegisteredEvent};
use crate::platform::Platform;
use crate::regs::PtRegs;
use crate::sbi::{eid, sse_attr, sse_fid};
use crate::sse::Sse;

impl<P: Platform> Sse<P> {
    /// Entry from the low-level trampoline.
    ///
    /// Returns the handler's result.
    ///
    /// # Safety
    /// `arg` must be the entry argument firmware was handed when the event
    /// instance was registered, and that instance must still be alive
    /// (firmware only delivers registered instances).
    pub unsafe fn handle_entry(&self, arg: usize, regs: &mut PtRegs) -> i32 {
        // SAFETY: the entry argument is the address of a boxed
        // `RegisteredEvent` that outlives its firmware registration.
        let reg = unsafe { &*(arg as *const RegisteredEvent) };
        self.dispatch(reg, regs)
    }

    /// Run the handler of `reg` against the interrupted context.
    pub(crate) fn dispatch(&self, reg: &RegisteredEvent, regs: &mut PtRegs) -> i32 {
        let cpu = self.platform.current_cpu();
        let nmi = NmiContext::enter(cpu);
        let event = reg.core();

        // a6/a7 carried the SBI call that delivered us; firmware kept the
        // interrupted values.
        let ret = self.platform.ecall(
            cpu,
            eid::SSE,
            sse_fid::EVENT_ATTR_READ,
            [event.id.raw(), sse_attr::INTERRUPTED_A6, 2, reg.interrupted_phys(), 0, 0],
        );
        if ret.is_success() {
            let state = reg.interrupted();
            regs.a6 = state.a6.load(Ordering::Acquire);
            regs.a7 = state.a7.load(Ordering::Acquire);
        }

        let err = event.handler.handle(&nmi, event.id, event.arg, regs);
        if err != 0 {
            log::warn!("event {} handler failed with error {}", event.id, err);
        }

        // Deferred work queued by the handler is picked up on the normal
        // interrupt return path.
        self.platform.raise_soft_interrupt(cpu);

        err
    }
}
