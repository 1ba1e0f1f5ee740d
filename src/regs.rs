//! Interrupted register state handed to event and trigger handlers.

/// Register frame of the interrupted context.
///
/// Layout matches the frame the SSE entry trampoline builds: `a6` and
/// `a7` are clobbered by the SBI call that delivered the event, so the
/// dispatch path fetches them from firmware before the handler runs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtRegs {
    pub epc: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    /// Supervisor status
    pub status: usize,
    /// Trap value (`stval`): faulting data address for watchpoints
    pub badaddr: usize,
    pub cause: usize,
    pub orig_a0: usize,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<PtRegs>(),
    36 * core::mem::size_of::<usize>()
);

impl PtRegs {
    /// Create an empty frame
    pub const fn new() -> Self {
        Self {
            epc: 0,
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
            status: 0,
            badaddr: 0,
            cause: 0,
            orig_a0: 0,
        }
    }

    /// Interrupted program counter
    pub fn pc(&self) -> usize {
        self.epc
    }
}
