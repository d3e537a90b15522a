use std::{io, path::PathBuf};

use thiserror::Error;

use crate::macho::Arch;

/// Problems with the path handed to the locator or orchestrator.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a regular file or directory")]
    NotRegularFile,
    #[error("missing read/write permission")]
    NotAccessible,
    #[error("cannot be read: {0}")]
    Unreadable(#[source] io::Error),
}

/// The bytes are not a Mach-O this crate can walk.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("not a Mach-O binary (magic {magic:#010x})")]
    NotMachO { magic: u32 },
    #[error("truncated {what}: {len} bytes at {offset:#x} exceed file length {file_len:#x}")]
    TruncatedFile {
        what: &'static str,
        offset: u64,
        len: u64,
        file_len: u64,
    },
    #[error("fat header lists no architectures")]
    NoArchitectures,
    #[error("unsupported architecture {arch}")]
    UnsupportedArchitecture { arch: Arch },
    #[error("{arch}: malformed load command #{index} ({cmd}): {reason}")]
    MalformedLoadCommand {
        arch: Arch,
        index: usize,
        cmd: &'static str,
        reason: String,
    },
    #[error("{arch}: inconsistent layout: {reason}")]
    InconsistentLayout { arch: Arch, reason: String },
}

/// A transform that cannot be carried out without corrupting the slice.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(
        "{arch}: not enough header room for {command}: need {needed} bytes, {available} available"
    )]
    InsufficientHeaderRoom {
        arch: Arch,
        command: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("{arch}: cannot convert Mach-O file type {filetype:#x}")]
    UnsupportedFileType { arch: Arch, filetype: u32 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: InputError,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("{}: {op} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("cancelled")]
    Cancelled,
}

/// Coarse classification of [`Error`], one per reporting class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Format,
    Patch,
    Io,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Input { .. } => ErrorKind::Input,
            Error::Format(_) => ErrorKind::Format,
            Error::Patch(_) => ErrorKind::Patch,
            Error::Io { .. } => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn input(path: impl Into<PathBuf>, source: InputError) -> Error {
        Error::Input {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Error {
        Error::Io {
            path: path.into(),
            op,
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
