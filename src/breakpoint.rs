//! Hardware breakpoint requests and their trigger control-word encoding.
//!
//! Two `tdata1` formats are supported: the legacy address/data match
//! trigger (`mcontrol`, type 2) and its successor (`mcontrol6`, type 6).
//! Both place the access and privilege bits at the same positions; they
//! differ in how the access size is encoded.

use bitflags::bitflags;

use crate::error::{Error, SseResult};

bitflags! {
    /// Access kinds a breakpoint request can match.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Single-bit fields of an `mcontrol`/`mcontrol6` `tdata1` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchControl: usize {
        const LOAD = 1 << 0;
        const STORE = 1 << 1;
        const EXEC = 1 << 2;
        /// Match in U-mode
        const U = 1 << 3;
        /// Match in S-mode
        const S = 1 << 4;
        /// Match in M-mode
        const M = 1 << 6;
        const CHAIN = 1 << 11;
        /// Match in VU-mode (mcontrol6 only)
        const VU = 1 << 23;
        /// Match in VS-mode (mcontrol6 only)
        const VS = 1 << 24;
        const DMODE = 1 << 59;
    }
}

/// Bit position of the `tdata1` type field.
pub const TDATA1_TYPE_SHIFT: u32 = 60;
const TDATA1_TYPE_MASK: usize = 0xf;

const MC_SIZELO_SHIFT: u32 = 16;
const MC_SIZELO_MASK: usize = 0x3;
const MC_SIZEHI_SHIFT: u32 = 21;
const MC_SIZEHI_MASK: usize = 0x3;

const MC6_SIZE_SHIFT: u32 = 16;
const MC6_SIZE_MASK: usize = 0xf;

/// Trigger `tdata1` layout in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFormat {
    /// Legacy match control trigger (type 2)
    Mcontrol,
    /// Match control type 6 trigger
    Mcontrol6,
}

impl TriggerFormat {
    /// Value of the `tdata1` type field.
    pub const fn type_code(self) -> usize {
        match self {
            TriggerFormat::Mcontrol => 2,
            TriggerFormat::Mcontrol6 => 6,
        }
    }

    /// A `tdata1` word with only the type field set.
    pub const fn tdata1_type(self) -> usize {
        (self.type_code() & TDATA1_TYPE_MASK) << TDATA1_TYPE_SHIFT
    }

    /// Decode the type field of `tdata1`.
    pub fn from_tdata1(tdata1: usize) -> Option<Self> {
        match (tdata1 >> TDATA1_TYPE_SHIFT) & TDATA1_TYPE_MASK {
            2 => Some(TriggerFormat::Mcontrol),
            6 => Some(TriggerFormat::Mcontrol6),
            _ => None,
        }
    }

    /// Size field bits for an access of `len` bytes.
    fn size_bits(self, len: usize) -> Option<usize> {
        let bits = match self {
            TriggerFormat::Mcontrol => {
                let (lo, hi) = match len {
                    1 => (1, 0),
                    2 => (2, 0),
                    4 => (3, 0),
                    8 => (1, 1),
                    _ => return None,
                };
                ((lo & MC_SIZELO_MASK) << MC_SIZELO_SHIFT) | ((hi & MC_SIZEHI_MASK) << MC_SIZEHI_SHIFT)
            }
            TriggerFormat::Mcontrol6 => {
                let size = match len {
                    1 => 1,
                    2 => 2,
                    4 => 3,
                    8 => 5,
                    _ => return None,
                };
                (size & MC6_SIZE_MASK) << MC6_SIZE_SHIFT
            }
        };
        Some(bits)
    }
}

/// What a trigger matches against when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Instruction address, compared with the trapping `epc`.
    Breakpoint,
    /// Data address, compared with the faulting address in `stval`.
    Watchpoint,
}

/// A breakpoint or watchpoint as requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub access: Access,
    pub address: usize,
    pub len: usize,
}

/// Encoded trigger ready to hand to firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointConfig {
    pub address: usize,
    pub len: usize,
    pub kind: BreakpointKind,
    pub tdata1: usize,
    pub tdata2: usize,
    pub tdata3: usize,
}

impl BreakpointConfig {
    /// Check if the whole watched range lies at or above `task_size`.
    pub fn in_kernelspace(&self, task_size: usize) -> bool {
        let last = self.address.saturating_add(self.len.saturating_sub(1));
        self.address >= task_size && last >= task_size
    }
}

/// Encode `req` for `format`.
///
/// Execute breakpoints cannot be combined with data access, and only
/// 1, 2, 4 and 8 byte lengths are encodable. The trigger matches in S and
/// U mode only.
pub fn parse(format: TriggerFormat, req: &BreakpointRequest) -> SseResult<BreakpointConfig> {
    let (kind, access) = if req.access == Access::EXECUTE {
        (BreakpointKind::Breakpoint, MatchControl::EXEC)
    } else if req.access == Access::READ {
        (BreakpointKind::Watchpoint, MatchControl::LOAD)
    } else if req.access == Access::WRITE {
        (BreakpointKind::Watchpoint, MatchControl::STORE)
    } else if req.access == Access::READ | Access::WRITE {
        (BreakpointKind::Watchpoint, MatchControl::LOAD | MatchControl::STORE)
    } else {
        return Err(Error::InvalidParameter);
    };

    let size = format.size_bits(req.len).ok_or(Error::InvalidParameter)?;
    let mode = MatchControl::S | MatchControl::U;

    Ok(BreakpointConfig {
        address: req.address,
        len: req.len,
        kind,
        tdata1: (access | mode).bits() | size | format.tdata1_type(),
        tdata2: req.address,
        tdata3: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(access: Access, len: usize) -> BreakpointRequest {
        BreakpointRequest {
            access,
            address: 0xffff_ffff_8000_1000,
            len,
        }
    }

    #[test]
    fn test_mcontrol6_execute() {
        let cfg = parse(TriggerFormat::Mcontrol6, &req(Access::EXECUTE, 4)).unwrap();
        assert_eq!(cfg.kind, BreakpointKind::Breakpoint);
        assert_eq!(cfg.tdata2, cfg.address);
        assert_eq!(cfg.tdata3, 0);
        assert_eq!(TriggerFormat::from_tdata1(cfg.tdata1), Some(TriggerFormat::Mcontrol6));

        let bits = MatchControl::from_bits_truncate(cfg.tdata1);
        assert_eq!(bits, MatchControl::EXEC | MatchControl::S | MatchControl::U);
        assert_eq!((cfg.tdata1 >> MC6_SIZE_SHIFT) & MC6_SIZE_MASK, 3);
    }

    #[test]
    fn test_mcontrol_eight_byte_uses_sizehi() {
        let cfg = parse(TriggerFormat::Mcontrol, &req(Access::READ | Access::WRITE, 8)).unwrap();
        assert_eq!(cfg.kind, BreakpointKind::Watchpoint);
        assert_eq!((cfg.tdata1 >> MC_SIZELO_SHIFT) & MC_SIZELO_MASK, 1);
        assert_eq!((cfg.tdata1 >> MC_SIZEHI_SHIFT) & MC_SIZEHI_MASK, 1);
        assert_eq!(TriggerFormat::from_tdata1(cfg.tdata1), Some(TriggerFormat::Mcontrol));

        let bits = MatchControl::from_bits_truncate(cfg.tdata1);
        assert!(bits.contains(MatchControl::LOAD | MatchControl::STORE));
        assert!(!bits.intersects(MatchControl::M | MatchControl::VS | MatchControl::VU));
    }

    #[test]
    fn test_mcontrol6_size_encoding() {
        for (len, size) in [(1, 1), (2, 2), (4, 3), (8, 5)] {
            let cfg = parse(TriggerFormat::Mcontrol6, &req(Access::WRITE, len)).unwrap();
            assert_eq!((cfg.tdata1 >> MC6_SIZE_SHIFT) & MC6_SIZE_MASK, size);
        }
    }

    #[test]
    fn test_rejects_unencodable_requests() {
        for format in [TriggerFormat::Mcontrol, TriggerFormat::Mcontrol6] {
            assert_eq!(parse(format, &req(Access::READ, 3)), Err(Error::InvalidParameter));
            assert_eq!(parse(format, &req(Access::READ, 16)), Err(Error::InvalidParameter));
            assert_eq!(
                parse(format, &req(Access::EXECUTE | Access::WRITE, 4)),
                Err(Error::InvalidParameter)
            );
            assert_eq!(parse(format, &req(Access::empty(), 4)), Err(Error::InvalidParameter));
        }
    }

    #[test]
    fn test_kernelspace_check() {
        let task_size = 0x40_0000_0000;
        let mut cfg = parse(TriggerFormat::Mcontrol6, &req(Access::READ, 8)).unwrap();
        assert!(cfg.in_kernelspace(task_size));

        cfg.address = 0x1000;
        assert!(!cfg.in_kernelspace(task_size));

        cfg.address = task_size - 4;
        assert!(!cfg.in_kernelspace(task_size));
    }
}
