//! In-place load command transforms.
//!
//! Commands are only ever inserted into, or removed from, the command region
//! itself. A growing region eats into the zero padding between the last
//! command and the first section; nothing after the region moves, so segment
//! and section file offsets stay valid without being rewritten.

use std::fmt;

use log::{debug, warn};

use crate::{
    command::{pack_version, BuildVersion, DylibId, LoadCommand},
    error::{FormatError, PatchError, Result},
    ffi::*,
    macho::{Arch, FatImage, MachOImage},
};

/// Used for `minos`/`sdk` when a build-version command has to be made up
/// from nothing.
const DEFAULT_VERSION: u32 = pack_version(14, 0, 0);

/// A `PLATFORM_*` value from `mach-o/loader.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform(pub u32);

impl Platform {
    pub const MACOS: Platform = Platform(PLATFORM_MACOS);
    pub const IOS: Platform = Platform(PLATFORM_IOS);
    pub const TVOS: Platform = Platform(PLATFORM_TVOS);
    pub const WATCHOS: Platform = Platform(PLATFORM_WATCHOS);
    pub const MACCATALYST: Platform = Platform(PLATFORM_MACCATALYST);
    pub const IOS_SIMULATOR: Platform = Platform(PLATFORM_IOSSIMULATOR);
    pub const TVOS_SIMULATOR: Platform = Platform(PLATFORM_TVOSSIMULATOR);
    pub const WATCHOS_SIMULATOR: Platform = Platform(PLATFORM_WATCHOSSIMULATOR);
    pub const VISIONOS: Platform = Platform(PLATFORM_VISIONOS);
    pub const VISIONOS_SIMULATOR: Platform = Platform(PLATFORM_VISIONOSSIMULATOR);
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            PLATFORM_MACOS => "macOS",
            PLATFORM_IOS => "iOS",
            PLATFORM_TVOS => "tvOS",
            PLATFORM_WATCHOS => "watchOS",
            PLATFORM_MACCATALYST => "macCatalyst",
            PLATFORM_IOSSIMULATOR => "iOS Simulator",
            PLATFORM_TVOSSIMULATOR => "tvOS Simulator",
            PLATFORM_WATCHOSSIMULATOR => "watchOS Simulator",
            PLATFORM_VISIONOS => "visionOS",
            PLATFORM_VISIONOSSIMULATOR => "visionOS Simulator",
            n => return write!(f, "platform {n}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Point the build-version command at `Platform`, creating one if needed.
    Platform(Platform),
    /// `MH_EXECUTE` -> `MH_DYLIB`, adding `LC_ID_DYLIB` if missing.
    ToDylib { install_name: String },
    /// `MH_DYLIB` -> `MH_EXECUTE`; drops `LC_ID_DYLIB` when `remove_dylib_id`.
    ToExecutable { remove_dylib_id: bool },
    StripCodeSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    AlreadyApplied,
}

impl Change {
    pub fn merge(self, other: Change) -> Change {
        if self == Change::Applied || other == Change::Applied {
            Change::Applied
        } else {
            Change::AlreadyApplied
        }
    }
}

/// Applies `transform` to one slice. Either the whole transform lands or
/// `image` is left exactly as it was.
pub fn apply(image: &mut MachOImage, transform: &Transform) -> Result<Change> {
    if !image.arch.is_patchable() {
        return Err(FormatError::UnsupportedArchitecture { arch: image.arch }.into());
    }
    let mut work = image.clone();
    match transform {
        Transform::Platform(platform) => set_platform(&mut work, *platform)?,
        Transform::ToDylib { install_name } => to_dylib(&mut work, install_name)?,
        Transform::ToExecutable { remove_dylib_id } => to_executable(&mut work, *remove_dylib_id)?,
        Transform::StripCodeSignature => strip_code_signature(&mut work),
    }
    if work.encode() == image.encode() {
        debug!("{}: {transform:?} already applied", image.arch);
        return Ok(Change::AlreadyApplied);
    }
    *image = work;
    Ok(Change::Applied)
}

/// Applies every transform to every slice. A single unsupported slice fails
/// the whole file before anything is touched.
pub fn apply_all(fat: &mut FatImage, transforms: &[Transform]) -> Result<Change> {
    if let Some(slice) = fat.slices.iter().find(|s| !s.image.arch.is_patchable()) {
        return Err(FormatError::UnsupportedArchitecture {
            arch: slice.image.arch,
        }
        .into());
    }
    let changes = fat
        .slices
        .iter_mut()
        .map(|slice| apply_slice(&mut slice.image, transforms))
        .collect::<Result<Vec<_>>>()?;
    for arch in stale_signatures(fat, &changes) {
        warn!("{arch}: code signature no longer matches and must be stripped or re-signed");
    }
    Ok(changes
        .into_iter()
        .fold(Change::AlreadyApplied, Change::merge))
}

fn apply_slice(image: &mut MachOImage, transforms: &[Transform]) -> Result<Change> {
    let mut change = Change::AlreadyApplied;
    for transform in transforms {
        change = change.merge(apply(image, transform)?);
    }
    Ok(change)
}

/// Slices that were changed but still carry `LC_CODE_SIGNATURE`.
fn stale_signatures(fat: &FatImage, changes: &[Change]) -> Vec<Arch> {
    fat.slices
        .iter()
        .zip(changes)
        .filter(|(slice, &change)| {
            change == Change::Applied && slice.image.find(LC_CODE_SIGNATURE).is_some()
        })
        .map(|(slice, _)| slice.image.arch)
        .collect()
}

fn ensure_room(image: &MachOImage, needed: u64, command: &'static str) -> Result<(), PatchError> {
    let available = image.spare_room();
    if needed > available {
        return Err(PatchError::InsufficientHeaderRoom {
            arch: image.arch,
            command,
            needed,
            available,
        });
    }
    Ok(())
}

/// New commands go in front of `LC_CODE_SIGNATURE`, which tools expect last.
fn insertion_index(image: &MachOImage) -> usize {
    image
        .find(LC_CODE_SIGNATURE)
        .unwrap_or(image.commands.len())
}

fn insert_command(image: &mut MachOImage, command: LoadCommand) -> Result<(), PatchError> {
    ensure_room(image, command.size() as u64, command.name())?;
    let index = insertion_index(image);
    debug!(
        "{}: inserting {} ({} bytes) at #{index}",
        image.arch,
        command.name(),
        command.size()
    );
    image.commands.insert(index, command);
    Ok(())
}

fn replace_command(
    image: &mut MachOImage,
    index: usize,
    command: LoadCommand,
) -> Result<(), PatchError> {
    let old = image.commands[index].size();
    if command.size() > old {
        ensure_room(image, (command.size() - old) as u64, command.name())?;
    }
    debug!(
        "{}: replacing {} with {} at #{index}",
        image.arch,
        image.commands[index].name(),
        command.name()
    );
    image.commands[index] = command;
    Ok(())
}

fn remove_commands(image: &mut MachOImage, cmd: u32) {
    let before = image.commands.len();
    image.commands.retain(|c| c.cmd() != cmd);
    let removed = before - image.commands.len();
    if removed != 0 {
        debug!("{}: removed {removed} {}", image.arch, command_name(cmd));
    }
}

fn set_platform(image: &mut MachOImage, platform: Platform) -> Result<(), PatchError> {
    let arch = image.arch;
    let mut builds = image.commands.iter_mut().filter_map(|c| match c {
        LoadCommand::BuildVersion(b) => Some(b),
        _ => None,
    });
    if let Some(build) = builds.next() {
        let others = builds.count();
        if others != 0 {
            warn!("{arch}: {} build-version commands, only the first is retagged", others + 1);
        }
        debug!("{arch}: platform {} -> {platform}", Platform(build.platform));
        build.platform = platform.0;
        return Ok(());
    }

    let version_min = image.commands.iter().enumerate().find_map(|(i, c)| match c {
        LoadCommand::VersionMin(v) => Some((i, *v)),
        _ => None,
    });
    match version_min {
        Some((index, v)) => {
            debug!(
                "{arch}: upgrading {} ({}) to LC_BUILD_VERSION",
                command_name(v.cmd),
                Platform(v.platform())
            );
            let build = BuildVersion::new(platform.0, v.version, v.sdk);
            replace_command(image, index, LoadCommand::BuildVersion(build))
        }
        None => {
            let build = BuildVersion::new(platform.0, DEFAULT_VERSION, DEFAULT_VERSION);
            insert_command(image, LoadCommand::BuildVersion(build))
        }
    }
}

fn check_convertible(image: &MachOImage) -> Result<(), PatchError> {
    match image.filetype {
        MH_EXECUTE | MH_DYLIB | MH_BUNDLE => Ok(()),
        filetype => Err(PatchError::UnsupportedFileType {
            arch: image.arch,
            filetype,
        }),
    }
}

fn to_dylib(image: &mut MachOImage, install_name: &str) -> Result<(), PatchError> {
    check_convertible(image)?;
    if image.find(LC_ID_DYLIB).is_none() {
        let id = DylibId::new(install_name, image.layout);
        insert_command(image, LoadCommand::IdDylib(id))?;
    }
    image.filetype = MH_DYLIB;
    // dyld only honours MH_PIE on executables.
    image.flags &= !MH_PIE;
    Ok(())
}

fn to_executable(image: &mut MachOImage, remove_dylib_id: bool) -> Result<(), PatchError> {
    check_convertible(image)?;
    image.filetype = MH_EXECUTE;
    if image.find(LC_MAIN).is_some() {
        image.flags |= MH_PIE;
    }
    if remove_dylib_id {
        remove_commands(image, LC_ID_DYLIB);
    }
    Ok(())
}

fn strip_code_signature(image: &mut MachOImage) {
    remove_commands(image, LC_CODE_SIGNATURE);
}
