//! Patch Mach-O binaries so device builds load in a simulator runtime and
//! back: retag the platform in `LC_BUILD_VERSION`, or flip an executable to
//! a dylib and back.
//!
//! The pipeline for each file is [`locate()`] -> [`macho::read`] ->
//! [`patch::apply_all`] -> [`writer::write`]; [`convert::Converter`] runs it
//! over a whole bundle.

pub mod command;
pub mod convert;
pub mod endian;
pub mod error;
pub mod ffi;
pub mod locate;
pub mod macho;
pub mod patch;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use convert::{
    apply, CancelToken, ConversionRequest, Converter, Operation, OutputMode, PatchResult,
    PatchStatus, Summary,
};
pub use error::{Error, ErrorKind, FormatError, InputError, PatchError, Result};
pub use locate::locate;
pub use macho::{Arch, FatImage, MachOImage};
