//! Committing patched images to disk.
//!
//! Bytes go to a temporary file next to the destination, which is renamed
//! over it only once fully written and synced. The destination itself is
//! never opened for writing.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use log::debug;

use crate::{
    error::{Error, Result},
    macho::FatImage,
};

static NEXT_TEMP: AtomicU64 = AtomicU64::new(0);

/// A fully written temporary file waiting to replace its destination.
/// Dropping it without [`commit`](StagedWrite::commit) deletes the temporary.
#[derive(Debug)]
pub struct StagedWrite {
    dest: PathBuf,
    temp: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Renames the temporary over the destination.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp, &self.dest).map_err(|e| Error::io(&self.dest, "rename", e))?;
        self.committed = true;
        debug!("{}: committed", self.dest.display());
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            debug!("{}: discarding {}", self.dest.display(), self.temp.display());
            let _ = fs::remove_file(&self.temp);
        }
    }
}

fn temp_path_for(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| Error::io(dest, "stage", std::io::ErrorKind::InvalidInput.into()))?;
    let temp = format!(
        ".{}.simforge-{}-{}",
        name.to_string_lossy(),
        std::process::id(),
        NEXT_TEMP.fetch_add(1, Ordering::Relaxed)
    );
    Ok(dest.with_file_name(temp))
}

/// Writes `bytes` to a temporary beside `dest`, carrying over the
/// permission bits of `template`.
pub fn stage_bytes(dest: &Path, bytes: &[u8], template: &Path) -> Result<StagedWrite> {
    let permissions = fs::metadata(template)
        .map_err(|e| Error::io(template, "stat", e))?
        .permissions();
    let temp = temp_path_for(dest)?;
    let mut file: File = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .map_err(|e| Error::io(&temp, "create", e))?;
    let staged = StagedWrite {
        dest: dest.to_path_buf(),
        temp,
        committed: false,
    };
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::io(&staged.temp, "write", e))?;
    drop(file);
    fs::set_permissions(&staged.temp, permissions)
        .map_err(|e| Error::io(&staged.temp, "chmod", e))?;
    debug!(
        "{}: staged {} bytes in {}",
        staged.dest.display(),
        bytes.len(),
        staged.temp.display()
    );
    Ok(staged)
}

/// Re-encodes `image` and stages it for `dest`.
pub fn stage(dest: &Path, image: &FatImage, template: &Path) -> Result<StagedWrite> {
    let bytes = image.to_bytes()?;
    stage_bytes(dest, &bytes, template)
}

/// Replaces `path` with the patched `image`.
pub fn write(path: &Path, image: &FatImage) -> Result<()> {
    stage(path, image, path)?.commit()
}
