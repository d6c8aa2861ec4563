//! Final status of a call.

use std::fmt;

/// Status codes carried by FINISHED_WITH_STATUS.
///
/// The numbering follows the gRPC wire values so that codes supplied by
/// an application round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Invalid argument was provided.
    InvalidArgument = 3,
    /// Deadline expired before the call could finish.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// Resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// Operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Method is not implemented or supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Service is currently unavailable, e.g. the server is shutting down.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Request does not have valid authentication credentials.
    Unauthenticated = 16,
}

const CODES: [(Code, &str); 17] = [
    (Code::Ok, "OK"),
    (Code::Cancelled, "CANCELLED"),
    (Code::Unknown, "UNKNOWN"),
    (Code::InvalidArgument, "INVALID_ARGUMENT"),
    (Code::DeadlineExceeded, "DEADLINE_EXCEEDED"),
    (Code::NotFound, "NOT_FOUND"),
    (Code::AlreadyExists, "ALREADY_EXISTS"),
    (Code::PermissionDenied, "PERMISSION_DENIED"),
    (Code::ResourceExhausted, "RESOURCE_EXHAUSTED"),
    (Code::FailedPrecondition, "FAILED_PRECONDITION"),
    (Code::Aborted, "ABORTED"),
    (Code::OutOfRange, "OUT_OF_RANGE"),
    (Code::Unimplemented, "UNIMPLEMENTED"),
    (Code::Internal, "INTERNAL"),
    (Code::Unavailable, "UNAVAILABLE"),
    (Code::DataLoss, "DATA_LOSS"),
    (Code::Unauthenticated, "UNAUTHENTICATED"),
];

impl Code {
    /// Map a numeric value to a code. Unrecognized values become `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        CODES
            .get(value as usize)
            .map(|(code, _)| *code)
            .unwrap_or(Code::Unknown)
    }

    /// Numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Canonical upper-case name, e.g. `DEADLINE_EXCEEDED`.
    pub fn as_str(self) -> &'static str {
        CODES[self as usize].1
    }

    /// Check if this is the `Ok` code.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code paired with a human readable message.
///
/// The message is always present, possibly empty, since the terminal
/// client event carries both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Create a status with a code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an OK status with an empty message.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the status message, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if the status is OK.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(Code::Cancelled, "call cancelled")
    }

    pub(crate) fn deadline_exceeded() -> Self {
        Self::new(Code::DeadlineExceeded, "deadline exceeded")
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_table_matches_discriminants() {
        for (i, (code, _)) in CODES.iter().enumerate() {
            assert_eq!(code.as_u32() as usize, i);
            assert_eq!(Code::from_u32(i as u32), *code);
        }
    }

    #[test]
    fn test_code_from_u32_out_of_range() {
        assert_eq!(Code::from_u32(17), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::Unimplemented.to_string(), "UNIMPLEMENTED");
        assert_eq!(Code::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn test_code_deserialize() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            code: Code,
        }
        let w: Wrapper = toml::from_str("code = \"UNIMPLEMENTED\"").unwrap();
        assert_eq!(w.code, Code::Unimplemented);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::ok().to_string(), "OK");
        assert_eq!(
            Status::new(Code::Unimplemented, "xyz").to_string(),
            "UNIMPLEMENTED: xyz"
        );
    }

    #[test]
    fn test_internal_constructors() {
        assert_eq!(Status::cancelled().code(), Code::Cancelled);
        assert_eq!(Status::deadline_exceeded().code(), Code::DeadlineExceeded);
        let s = Status::unavailable("server shutting down");
        assert_eq!(s.code(), Code::Unavailable);
        assert_eq!(s.message(), "server shutting down");
        assert!(!s.is_ok());
    }
}
