//! SBI (Supervisor Binary Interface) call ABI.
//!
//! This module holds the function identifiers, attribute identifiers and
//! error codes of the SBI extensions the crate talks to (Base, SSE and
//! DBTR), plus the raw `ecall` conduit used on real riscv64 hardware.

// =============================================================================
// Extension IDs
// =============================================================================

/// Extension identifiers (passed in `a7`).
pub mod eid {
    /// Base extension.
    pub const BASE: usize = 0x10;
    /// Supervisor Software Events extension ("SSE").
    pub const SSE: usize = 0x0053_5345;
    /// Debug triggers extension ("DBTR").
    pub const DBTR: usize = 0x4442_5452;
}

/// Base extension function IDs.
pub mod base_fid {
    /// Probe whether an extension is implemented.
    pub const PROBE_EXTENSION: usize = 3;
}

// =============================================================================
// SSE Function and Attribute IDs
// =============================================================================

/// SSE extension function IDs (passed in `a6`).
pub mod sse_fid {
    /// Read a range of event attributes into memory.
    pub const EVENT_ATTR_READ: usize = 0;
    /// Write a range of event attributes from memory.
    pub const EVENT_ATTR_WRITE: usize = 1;
    /// Register an entry point for an event.
    pub const EVENT_REGISTER: usize = 2;
    /// Unregister an event.
    pub const EVENT_UNREGISTER: usize = 3;
    /// Enable delivery of an event.
    pub const EVENT_ENABLE: usize = 4;
    /// Disable delivery of an event.
    pub const EVENT_DISABLE: usize = 5;
    /// Complete the event currently being handled.
    pub const EVENT_COMPLETE: usize = 6;
    /// Inject an event.
    pub const EVENT_INJECT: usize = 7;
    /// Unmask event delivery on the calling hart.
    pub const HART_UNMASK: usize = 8;
    /// Mask event delivery on the calling hart.
    pub const HART_MASK: usize = 9;
}

/// SSE event attribute IDs.
pub mod sse_attr {
    pub const STATUS: usize = 0;
    pub const PRIO: usize = 1;
    pub const CONFIG: usize = 2;
    pub const PREFERRED_HART: usize = 3;
    pub const ENTRY_PC: usize = 4;
    pub const ENTRY_ARG: usize = 5;
    pub const INTERRUPTED_SEPC: usize = 6;
    pub const INTERRUPTED_FLAGS: usize = 7;
    pub const INTERRUPTED_A6: usize = 8;
    pub const INTERRUPTED_A7: usize = 9;
}

/// Standard SSE event IDs.
///
/// Bit 15 selects a global (platform-wide) event; all other events are
/// local to each hart.
pub mod sse_event {
    pub const LOCAL_HIGH_PRIO_RAS: u32 = 0x0000_0000;
    pub const LOCAL_DOUBLE_TRAP: u32 = 0x0000_0001;
    pub const GLOBAL_HIGH_PRIO_RAS: u32 = 0x0000_8000;
    pub const LOCAL_PMU_OVERFLOW: u32 = 0x0001_0000;
    pub const LOCAL_LOW_PRIO_RAS: u32 = 0x0010_0000;
    pub const GLOBAL_LOW_PRIO_RAS: u32 = 0x0010_8000;
    pub const LOCAL_SOFTWARE: u32 = 0xffff_0000;
    pub const GLOBAL_SOFTWARE: u32 = 0xffff_8000;

    /// Global event marker bit.
    pub const GLOBAL_BIT: u32 = 1 << 15;
}

// =============================================================================
// DBTR Function IDs
// =============================================================================

/// Debug triggers extension function IDs.
pub mod dbtr_fid {
    /// Number of triggers matching a tdata1 type (0 = any).
    pub const NUM_TRIGGERS: usize = 0;
    /// Set (or clear, with all-ones) the per-hart shared memory.
    pub const SETUP_SHMEM: usize = 1;
    pub const TRIG_READ: usize = 2;
    pub const TRIG_INSTALL: usize = 3;
    pub const TRIG_UPDATE: usize = 4;
    pub const TRIG_UNINSTALL: usize = 5;
    pub const TRIG_ENABLE: usize = 6;
    pub const TRIG_DISABLE: usize = 7;
}

// =============================================================================
// SBI Error Codes
// =============================================================================

/// SBI error codes as returned in `a0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbiError {
    /// Generic failure.
    Failed,
    /// Extension or function not implemented.
    NotSupported,
    /// Invalid parameter.
    InvalidParam,
    /// Access denied.
    Denied,
    /// Invalid physical address.
    InvalidAddress,
    /// Resource already available.
    AlreadyAvailable,
    /// Already started.
    AlreadyStarted,
    /// Already stopped.
    AlreadyStopped,
    /// Shared memory not set up.
    NoShmem,
    /// Operation invalid in the current state.
    InvalidState,
    /// Range is invalid.
    BadRange,
    /// Operation timed out.
    Timeout,
    /// Input/output error.
    Io,
    /// Unknown error code.
    Unknown(isize),
}

impl SbiError {
    /// Decode a negative `a0` value.
    pub fn from_raw(code: isize) -> Self {
        match code {
            -1 => SbiError::Failed,
            -2 => SbiError::NotSupported,
            -3 => SbiError::InvalidParam,
            -4 => SbiError::Denied,
            -5 => SbiError::InvalidAddress,
            -6 => SbiError::AlreadyAvailable,
            -7 => SbiError::AlreadyStarted,
            -8 => SbiError::AlreadyStopped,
            -9 => SbiError::NoShmem,
            -10 => SbiError::InvalidState,
            -11 => SbiError::BadRange,
            -12 => SbiError::Timeout,
            -13 => SbiError::Io,
            _ => SbiError::Unknown(code),
        }
    }

    /// Encode back to the `a0` value.
    pub fn to_raw(self) -> isize {
        match self {
            SbiError::Failed => -1,
            SbiError::NotSupported => -2,
            SbiError::InvalidParam => -3,
            SbiError::Denied => -4,
            SbiError::InvalidAddress => -5,
            SbiError::AlreadyAvailable => -6,
            SbiError::AlreadyStarted => -7,
            SbiError::AlreadyStopped => -8,
            SbiError::NoShmem => -9,
            SbiError::InvalidState => -10,
            SbiError::BadRange => -11,
            SbiError::Timeout => -12,
            SbiError::Io => -13,
            SbiError::Unknown(code) => code,
        }
    }
}

impl core::fmt::Display for SbiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SbiError::Failed => write!(f, "Failed"),
            SbiError::NotSupported => write!(f, "Not supported"),
            SbiError::InvalidParam => write!(f, "Invalid parameter"),
            SbiError::Denied => write!(f, "Denied"),
            SbiError::InvalidAddress => write!(f, "Invalid address"),
            SbiError::AlreadyAvailable => write!(f, "Already available"),
            SbiError::AlreadyStarted => write!(f, "Already started"),
            SbiError::AlreadyStopped => write!(f, "Already stopped"),
            SbiError::NoShmem => write!(f, "Shared memory not available"),
            SbiError::InvalidState => write!(f, "Invalid state"),
            SbiError::BadRange => write!(f, "Bad range"),
            SbiError::Timeout => write!(f, "Timeout"),
            SbiError::Io => write!(f, "I/O error"),
            SbiError::Unknown(code) => write!(f, "Unknown error: {}", code),
        }
    }
}

// =============================================================================
// SBI Return Value
// =============================================================================

/// Raw `(a0, a1)` pair returned by an SBI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbiRet {
    /// Error code (0 = success).
    pub error: isize,
    /// Return value.
    pub value: usize,
}

impl SbiRet {
    /// Successful return carrying `value`.
    pub const fn success(value: usize) -> Self {
        Self { error: 0, value }
    }

    /// Failed return carrying `err`.
    pub fn failure(err: SbiError) -> Self {
        Self {
            error: err.to_raw(),
            value: 0,
        }
    }

    /// Check if the call succeeded.
    pub fn is_success(&self) -> bool {
        self.error == 0
    }

    /// Split into value or decoded error.
    pub fn into_result(self) -> Result<usize, SbiError> {
        if self.is_success() {
            Ok(self.value)
        } else {
            Err(SbiError::from_raw(self.error))
        }
    }
}

// =============================================================================
// ECALL Conduit
// =============================================================================

/// Raw SBI call with six arguments.
///
/// # Safety
/// The caller must ensure that:
/// - The extension/function pair is valid for the running firmware
/// - Any physical address passed in the arguments stays valid for as long
///   as firmware may access it
/// - Preemption/migration is disabled if the call targets hart-local state
#[cfg(target_arch = "riscv64")]
#[inline(always)]
pub unsafe fn sbi_ecall(eid: usize, fid: usize, args: [usize; 6]) -> SbiRet {
    let error: usize;
    let value: usize;

    unsafe {
        core::arch::asm!(
            "ecall",
            inlateout("a0") args[0] => error,
            inlateout("a1") args[1] => value,
            in("a2") args[2],
            in("a3") args[3],
            in("a4") args[4],
            in("a5") args[5],
            in("a6") fid,
            in("a7") eid,
            options(nostack)
        );
    }

    SbiRet {
        error: error as isize,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_roundtrip_through_a0() {
        for code in -13..=-1 {
            assert_eq!(SbiError::from_raw(code).to_raw(), code);
        }
        assert_eq!(SbiError::from_raw(-99), SbiError::Unknown(-99));
    }

    #[test]
    fn test_sbiret_into_result() {
        assert_eq!(SbiRet::success(7).into_result(), Ok(7));
        assert_eq!(
            SbiRet::failure(SbiError::InvalidState).into_result(),
            Err(SbiError::InvalidState)
        );
    }

    #[test]
    fn test_global_bit_matches_standard_events() {
        assert_ne!(sse_event::GLOBAL_HIGH_PRIO_RAS & sse_event::GLOBAL_BIT, 0);
        assert_ne!(sse_event::GLOBAL_SOFTWARE & sse_event::GLOBAL_BIT, 0);
        assert_eq!(sse_event::LOCAL_PMU_OVERFLOW & sse_event::GLOBAL_BIT, 0);
        assert_eq!(sse_event::LOCAL_SOFTWARE & sse_event::GLOBAL_BIT, 0);
    }
}
