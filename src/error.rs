//! Error taxonomy shared by the SSE core and the trigger manager.

use crate::sbi::SbiError;

/// Errors reported to clients of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Firmware refused access to a resource.
    PermissionDenied,
    /// Bad argument, bad address or unsupported combination.
    InvalidParameter,
    /// The event is already registered.
    AlreadyExists,
    /// The resource (shared memory, trigger slot) is already in use.
    AlreadyInUse,
    /// Extension or feature absent.
    NotSupported,
    /// Resource temporarily unavailable; retrying may help.
    Busy,
    /// Firmware-reported internal or hardware fault.
    Firmware,
    /// Operation timed out.
    Timeout,
    /// Communication with firmware failed.
    Communication,
    /// Memory allocation failed.
    OutOfMemory,
}

impl From<SbiError> for Error {
    fn from(err: SbiError) -> Self {
        match err {
            SbiError::Denied => Error::PermissionDenied,
            SbiError::InvalidParam | SbiError::InvalidAddress | SbiError::BadRange => {
                Error::InvalidParameter
            }
            SbiError::AlreadyAvailable | SbiError::AlreadyStarted | SbiError::AlreadyStopped => {
                Error::AlreadyInUse
            }
            SbiError::NotSupported => Error::NotSupported,
            SbiError::InvalidState => Error::Busy,
            SbiError::Timeout => Error::Timeout,
            SbiError::Io => Error::Communication,
            SbiError::NoShmem => Error::OutOfMemory,
            SbiError::Failed | SbiError::Unknown(_) => Error::Firmware,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::PermissionDenied => write!(f, "Permission denied"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::AlreadyExists => write!(f, "Already exists"),
            Error::AlreadyInUse => write!(f, "Already in use"),
            Error::NotSupported => write!(f, "Operation not supported"),
            Error::Busy => write!(f, "Resource busy"),
            Error::Firmware => write!(f, "Internal firmware fault"),
            Error::Timeout => write!(f, "Timed out"),
            Error::Communication => write!(f, "Communication error"),
            Error::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}

/// Result type for SSE and trigger operations.
pub type SseResult<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_codes_map_to_taxonomy() {
        assert_eq!(Error::from(SbiError::Denied), Error::PermissionDenied);
        assert_eq!(Error::from(SbiError::InvalidAddress), Error::InvalidParameter);
        assert_eq!(Error::from(SbiError::AlreadyAvailable), Error::AlreadyInUse);
        assert_eq!(Error::from(SbiError::InvalidState), Error::Busy);
        assert_eq!(Error::from(SbiError::NoShmem), Error::OutOfMemory);
        assert_eq!(Error::from(SbiError::Io), Error::Communication);
        assert_eq!(Error::from(SbiError::Unknown(-42)), Error::Firmware);
    }
}
