//! Finding the Mach-O files under a root path.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    endian::Endian,
    error::{Error, InputError, Result},
    ffi::{is_fat_magic, is_thin_magic},
};

/// Files to convert, plus files that would have been candidates but cannot
/// be touched.
#[derive(Debug, Default)]
pub struct Located {
    pub candidates: Vec<PathBuf>,
    pub excluded: Vec<(PathBuf, InputError)>,
}

impl Located {
    fn admit(&mut self, path: PathBuf) {
        if is_read_write(&path) {
            self.candidates.push(path);
        } else {
            debug!("{}: excluded, not read/write", path.display());
            self.excluded.push((path, InputError::NotAccessible));
        }
    }
}

/// A regular file yields itself (if accessible); a directory yields every
/// regular file beneath it that starts with a Mach-O or fat magic, in path
/// order. Symlinks inside a directory are not followed.
pub fn locate(root: &Path) -> Result<Located> {
    let meta = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::input(root, InputError::NotFound),
        _ => Error::input(root, InputError::Unreadable(e)),
    })?;
    let mut located = Located::default();
    if meta.is_file() {
        located.admit(root.to_path_buf());
        return Ok(located);
    }
    if !meta.is_dir() {
        return Err(Error::input(root, InputError::NotRegularFile));
    }

    let mut files = Vec::new();
    walk(root, &mut files, &mut located.excluded);
    files.sort();
    for path in files {
        match sniff(&path) {
            Ok(true) => located.admit(path),
            Ok(false) => {}
            Err(e) => located.excluded.push((path, InputError::Unreadable(e))),
        }
    }
    Ok(located)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>, excluded: &mut Vec<(PathBuf, InputError)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            excluded.push((dir.to_path_buf(), InputError::Unreadable(e)));
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                excluded.push((dir.to_path_buf(), InputError::Unreadable(e)));
                continue;
            }
        };
        let path = entry.path();
        match entry.file_type() {
            Ok(ty) if ty.is_dir() => walk(&path, files, excluded),
            Ok(ty) if ty.is_file() => files.push(path),
            Ok(_) => debug!("{}: skipped, not a regular file", path.display()),
            Err(e) => excluded.push((path, InputError::Unreadable(e))),
        }
    }
}

/// True when the first four bytes are a thin or fat Mach-O magic in either
/// byte order.
pub fn sniff(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let magic = Endian::Big.read_u32(&magic);
    Ok(is_thin_magic(magic) || is_fat_magic(magic))
}

#[cfg(unix)]
fn is_read_write(path: &Path) -> bool {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    match CString::new(path.as_os_str().as_bytes()) {
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 },
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_read_write(path: &Path) -> bool {
    fs::metadata(path).map_or(false, |m| !m.permissions().readonly())
}
