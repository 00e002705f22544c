//! Framework status codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// A framework or service status code
///
/// Zero is success. The framework reserves a block of negative values;
/// services may return any other value to their clients unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PsaStatus(i32);

impl PsaStatus {
    pub const SUCCESS: PsaStatus = PsaStatus(0);
    pub const PROGRAMMER_ERROR: PsaStatus = PsaStatus(-129);
    pub const CONNECTION_REFUSED: PsaStatus = PsaStatus(-130);
    pub const CONNECTION_BUSY: PsaStatus = PsaStatus(-131);
    pub const GENERIC_ERROR: PsaStatus = PsaStatus(-132);
    pub const NOT_PERMITTED: PsaStatus = PsaStatus(-133);
    pub const NOT_SUPPORTED: PsaStatus = PsaStatus(-134);
    pub const INVALID_ARGUMENT: PsaStatus = PsaStatus(-135);
    pub const INVALID_HANDLE: PsaStatus = PsaStatus(-136);
    pub const BAD_STATE: PsaStatus = PsaStatus(-137);
    pub const BUFFER_TOO_SMALL: PsaStatus = PsaStatus(-138);
    pub const ALREADY_EXISTS: PsaStatus = PsaStatus(-139);
    pub const DOES_NOT_EXIST: PsaStatus = PsaStatus(-140);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> i32 {
        self.0
    }

    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Returns true for negative values
    pub const fn is_error(&self) -> bool {
        self.0 < 0
    }

    /// Framework name of the code, if it is one of the reserved values
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::PROGRAMMER_ERROR => "PROGRAMMER_ERROR",
            Self::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            Self::CONNECTION_BUSY => "CONNECTION_BUSY",
            Self::GENERIC_ERROR => "GENERIC_ERROR",
            Self::NOT_PERMITTED => "NOT_PERMITTED",
            Self::NOT_SUPPORTED => "NOT_SUPPORTED",
            Self::INVALID_ARGUMENT => "INVALID_ARGUMENT",
            Self::INVALID_HANDLE => "INVALID_HANDLE",
            Self::BAD_STATE => "BAD_STATE",
            Self::BUFFER_TOO_SMALL => "BUFFER_TOO_SMALL",
            Self::ALREADY_EXISTS => "ALREADY_EXISTS",
            Self::DOES_NOT_EXIST => "DOES_NOT_EXIST",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for PsaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl std::error::Error for PsaStatus {}

impl From<PsaStatus> for i32 {
    fn from(status: PsaStatus) -> i32 {
        status.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_codes() {
        assert_eq!(PsaStatus::PROGRAMMER_ERROR.as_raw(), -129);
        assert_eq!(PsaStatus::DOES_NOT_EXIST.as_raw(), -140);
        assert!(PsaStatus::CONNECTION_BUSY.is_error());
        assert!(PsaStatus::SUCCESS.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            PsaStatus::CONNECTION_REFUSED.to_string(),
            "CONNECTION_REFUSED (-130)"
        );
        assert_eq!(PsaStatus::from_raw(42).to_string(), "status 42");
    }
}
