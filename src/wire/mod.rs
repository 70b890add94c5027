//! Byte-level encoding primitives and file handling shared by the log,
//! metadata, and digest formats.

pub mod codec;
pub mod file;

pub use file::{ScopedFile, with_suffix};
