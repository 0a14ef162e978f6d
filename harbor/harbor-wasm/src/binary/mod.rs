//! Binary decoding for the WebAssembly module format: a byte cursor, LEB128
//! integers, vector/name helpers and the section-level module parser.
//!
//! Everything here reports [`BinaryReadError`] with offsets relative to the
//! slice being decoded; [`sections::parse_module`] rebases offsets onto the
//! whole module and attributes failures to a section before handing them to
//! callers as [`crate::error::MalformedModule`].

pub mod cursor;
pub mod leb128;
pub mod reader;
pub mod sections;

use thiserror::Error;

/// Result alias for binary reading operations.
pub type Result<T> = core::result::Result<T, BinaryReadError>;

/// Low-level decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinaryReadError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("LEB128 value does not fit in {target_bits} bits at offset {offset}")]
    Leb128Overflow { target_bits: u8, offset: usize },

    #[error("LEB128 value longer than {limit} bytes at offset {offset}")]
    Leb128TooManyBytes { limit: u8, offset: usize },

    #[error("invalid UTF-8 name at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("{msg} at offset {offset}")]
    Malformed { offset: usize, msg: &'static str },
}

impl BinaryReadError {
    /// Offset (relative to the decoded slice) the error was detected at.
    pub fn offset(&self) -> usize {
        match *self {
            BinaryReadError::UnexpectedEof { offset }
            | BinaryReadError::Leb128Overflow { offset, .. }
            | BinaryReadError::Leb128TooManyBytes { offset, .. }
            | BinaryReadError::InvalidUtf8 { offset }
            | BinaryReadError::Malformed { offset, .. } => offset,
        }
    }

    /// Same error with its offset shifted by `base` bytes.
    pub fn rebased(self, base: usize) -> Self {
        match self {
            BinaryReadError::UnexpectedEof { offset } => {
                BinaryReadError::UnexpectedEof { offset: offset + base }
            }
            BinaryReadError::Leb128Overflow { target_bits, offset } => {
                BinaryReadError::Leb128Overflow { target_bits, offset: offset + base }
            }
            BinaryReadError::Leb128TooManyBytes { limit, offset } => {
                BinaryReadError::Leb128TooManyBytes { limit, offset: offset + base }
            }
            BinaryReadError::InvalidUtf8 { offset } => {
                BinaryReadError::InvalidUtf8 { offset: offset + base }
            }
            BinaryReadError::Malformed { offset, msg } => {
                BinaryReadError::Malformed { offset: offset + base, msg }
            }
        }
    }

    /// Human-readable reason without the offset suffix.
    pub fn reason(&self) -> String {
        match self {
            BinaryReadError::UnexpectedEof { .. } => "unexpected end of input".to_string(),
            BinaryReadError::Leb128Overflow { target_bits, .. } => {
                format!("LEB128 value does not fit in {target_bits} bits")
            }
            BinaryReadError::Leb128TooManyBytes { limit, .. } => {
                format!("LEB128 value longer than {limit} bytes")
            }
            BinaryReadError::InvalidUtf8 { .. } => "invalid UTF-8 name".to_string(),
            BinaryReadError::Malformed { msg, .. } => (*msg).to_string(),
        }
    }
}
