use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// A list, line, bin or index file is already present where a new structure was requested.
    FileExists(PathBuf),
    Open(PathBuf, io::Error),
    InvalidHeader(String),
    VersionMismatch {
        found: String,
        supported: String,
    },
    GeometryMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },
    BinRead {
        row: u32,
        col: u32,
        source: io::Error,
    },
    BinWrite {
        row: u32,
        col: u32,
        source: io::Error,
    },
    DepthRead {
        slot: u64,
        source: io::Error,
    },
    DepthWrite {
        slot: u64,
        source: io::Error,
    },
    PointerRead {
        slot: u64,
        source: io::Error,
    },
    PointerWrite {
        slot: u64,
        source: io::Error,
    },
    /// A value does not fit the bit width configured for its field.
    Overflow {
        field: &'static str,
        value: i128,
        bits: u8,
    },
    ChainCycle {
        row: u32,
        col: u32,
        slot: u64,
    },
    ChainMismatch(String),
    OutOfBounds {
        row: u32,
        col: u32,
    },
    OutsideMbr {
        x: f64,
        y: f64,
    },
    InvalidHandle(usize),
    TooManyHandles,
    CheckpointRecoveryRequired(PathBuf),
    CheckpointUnrecoverable(String),
    LockError(io::Error),
    InvalidOperation(String),
    ChecksumMismatch,
    InvalidConfig(String),
}

impl Error {
    /// Stable negative code for this failure, suitable for [`describe`].
    pub fn code(&self) -> i32 {
        match self {
            Error::IoError(_) => -1,
            Error::FileExists(_) => -2,
            Error::Open(..) => -3,
            Error::InvalidHeader(_) => -4,
            Error::VersionMismatch { .. } => -5,
            Error::GeometryMismatch { .. } => -6,
            Error::BinRead { .. } => -7,
            Error::BinWrite { .. } => -8,
            Error::DepthRead { .. } => -9,
            Error::DepthWrite { .. } => -10,
            Error::PointerRead { .. } => -11,
            Error::PointerWrite { .. } => -12,
            Error::Overflow { .. } => -13,
            Error::ChainCycle { .. } => -14,
            Error::ChainMismatch(_) => -15,
            Error::OutOfBounds { .. } => -16,
            Error::OutsideMbr { .. } => -17,
            Error::InvalidHandle(_) => -18,
            Error::TooManyHandles => -19,
            Error::CheckpointRecoveryRequired(_) => -20,
            Error::CheckpointUnrecoverable(_) => -21,
            Error::LockError(_) => -22,
            Error::InvalidOperation(_) => -23,
            Error::ChecksumMismatch => -24,
            Error::InvalidConfig(_) => -25,
        }
    }
}

/// Translates an error code returned by [`Error::code`] into a user-facing message.
pub fn describe(code: i32) -> &'static str {
    match code {
        0 => "Success",
        -1 => "I/O error",
        -2 => "File already exists, refusing to overwrite",
        -3 => "Unable to open file",
        -4 => "Corrupted or unreadable header",
        -5 => "File was written by a newer library version",
        -6 => "Row/column counts disagree between files",
        -7 => "Error reading bin record",
        -8 => "Error writing bin record",
        -9 => "Error reading depth record",
        -10 => "Error writing depth record",
        -11 => "Error reading continuation pointer",
        -12 => "Error writing continuation pointer",
        -13 => "Value exceeds the configured field width",
        -14 => "Cycle detected in depth chain",
        -15 => "Depth record does not belong to the bin it is chained from",
        -16 => "Bin index out of range",
        -17 => "Coordinate outside the minimum bounding rectangle",
        -18 => "Invalid handle",
        -19 => "Too many open structures",
        -20 => "Checkpoint journal found, recovery required",
        -21 => "Checkpoint journal is unrecoverable",
        -22 => "Structure is locked by another writer",
        -23 => "Invalid operation",
        -24 => "Checksum mismatch",
        -25 => "Invalid configuration",
        _ => "Unknown error",
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::FileExists(path) => write!(f, "File already exists: {}", path.display()),
            Error::Open(path, err) => write!(f, "Unable to open {}: {}", path.display(), err),
            Error::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            Error::VersionMismatch { found, supported } => write!(
                f,
                "File version {} is newer than supported version {}",
                found, supported
            ),
            Error::GeometryMismatch { expected, found } => write!(
                f,
                "Geometry mismatch: expected {}x{} bins, found {}x{}",
                expected.0, expected.1, found.0, found.1
            ),
            Error::BinRead { row, col, source } => {
                write!(f, "Failed to read bin ({}, {}): {}", row, col, source)
            }
            Error::BinWrite { row, col, source } => {
                write!(f, "Failed to write bin ({}, {}): {}", row, col, source)
            }
            Error::DepthRead { slot, source } => {
                write!(f, "Failed to read depth record {}: {}", slot, source)
            }
            Error::DepthWrite { slot, source } => {
                write!(f, "Failed to write depth record {}: {}", slot, source)
            }
            Error::PointerRead { slot, source } => {
                write!(f, "Failed to read continuation pointer {}: {}", slot, source)
            }
            Error::PointerWrite { slot, source } => {
                write!(f, "Failed to write continuation pointer {}: {}", slot, source)
            }
            Error::Overflow { field, value, bits } => write!(
                f,
                "Value {} for {} does not fit in {} bits",
                value, field, bits
            ),
            Error::ChainCycle { row, col, slot } => write!(
                f,
                "Cycle in depth chain of bin ({}, {}) at slot {}",
                row, col, slot
            ),
            Error::ChainMismatch(msg) => write!(f, "Chain mismatch: {}", msg),
            Error::OutOfBounds { row, col } => write!(f, "Bin ({}, {}) out of range", row, col),
            Error::OutsideMbr { x, y } => write!(f, "Point ({}, {}) outside MBR", x, y),
            Error::InvalidHandle(h) => write!(f, "Invalid handle: {}", h),
            Error::TooManyHandles => write!(f, "Too many open handles"),
            Error::CheckpointRecoveryRequired(path) => {
                write!(f, "Checkpoint journal present: {}", path.display())
            }
            Error::CheckpointUnrecoverable(msg) => write!(f, "Unrecoverable checkpoint: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::Open(_, err) | Error::LockError(err) => Some(err),
            Error::BinRead { source, .. }
            | Error::BinWrite { source, .. }
            | Error::DepthRead { source, .. }
            | Error::DepthWrite { source, .. }
            | Error::PointerRead { source, .. }
            | Error::PointerWrite { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_described() {
        let errors = vec![
            Error::IoError(io::Error::new(io::ErrorKind::Other, "x")),
            Error::VersionMismatch {
                found: "7.00".into(),
                supported: "6.00".into(),
            },
            Error::ChainCycle {
                row: 1,
                col: 2,
                slot: 3,
            },
            Error::InvalidConfig("bad".into()),
        ];
        for err in errors {
            assert!(err.code() < 0);
            assert_ne!(describe(err.code()), "Unknown error");
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(describe(-999), "Unknown error");
        assert_eq!(describe(0), "Success");
    }
}
