//! Reading thin and fat Mach-O files into [`FatImage`].

use std::{fmt, path::Path};

use log::debug;

use crate::{
    command::{Layout, LoadCommand},
    endian::Endian,
    error::{Error, FormatError, Result},
    ffi::*,
};

/// Java class files share `FAT_MAGIC`; their second word is a class file
/// version (45 and up), never a plausible arch count.
const MAX_FAT_ARCHS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    pub cputype: u32,
    pub cpusubtype: u32,
}

impl Arch {
    pub fn name(&self) -> Option<&'static str> {
        Some(match self.cputype {
            CPU_TYPE_ARM64 if self.cpusubtype & !CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E => {
                "arm64e"
            }
            CPU_TYPE_ARM64 => "arm64",
            CPU_TYPE_ARM64_32 => "arm64_32",
            CPU_TYPE_X86_64 => "x86_64",
            CPU_TYPE_X86 => "i386",
            CPU_TYPE_ARM => "arm",
            CPU_TYPE_POWERPC => "ppc",
            _ => return None,
        })
    }

    /// Architectures a simulator runtime can host.
    pub fn is_patchable(&self) -> bool {
        matches!(
            self.cputype,
            CPU_TYPE_ARM64 | CPU_TYPE_ARM64_32 | CPU_TYPE_X86_64
        )
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "cpu {:#x}/{:#x}", self.cputype, self.cpusubtype),
        }
    }
}

/// One architecture slice: its header fields and parsed command list.
///
/// `ncmds` and `sizeofcmds` are not stored; they are derived from
/// `commands` whenever the header is encoded, so they cannot drift.
#[derive(Debug, Clone)]
pub struct MachOImage {
    pub arch: Arch,
    pub layout: Layout,
    pub magic: u32,
    pub filetype: u32,
    pub flags: u32,
    pub reserved: u32,
    pub commands: Vec<LoadCommand>,
    /// Slice-relative offset of the first file-backed section or segment.
    content_start: u64,
    /// How far the command region may grow: `content_start`, or the first
    /// non-zero byte after the region if that comes sooner.
    room_end: u64,
    /// End of the command region as it was read.
    original_end: u64,
}

impl MachOImage {
    /// Parses one slice. `data` starts at the Mach-O header and spans the slice.
    pub fn parse(data: &[u8]) -> Result<MachOImage, FormatError> {
        if data.len() < 4 {
            return Err(FormatError::NotMachO { magic: 0 });
        }
        let magic = Endian::Little.read_u32(data);
        let layout = match magic {
            MH_MAGIC_64 => Layout { endian: Endian::Little, is_64: true },
            MH_CIGAM_64 => Layout { endian: Endian::Big, is_64: true },
            MH_MAGIC => Layout { endian: Endian::Little, is_64: false },
            MH_CIGAM => Layout { endian: Endian::Big, is_64: false },
            magic => return Err(FormatError::NotMachO { magic }),
        };
        let header_size = layout.header_size();
        if data.len() < header_size {
            return Err(FormatError::TruncatedFile {
                what: "mach header",
                offset: 0,
                len: header_size as u64,
                file_len: data.len() as u64,
            });
        }
        let header = MachHeader::decode(data, layout.endian, layout.is_64);
        let arch = Arch {
            cputype: header.cpu_type,
            cpusubtype: header.cpu_sub_type,
        };

        let end = header_size as u64 + header.sizeofcmds as u64;
        if end > data.len() as u64 {
            return Err(FormatError::TruncatedFile {
                what: "load commands",
                offset: header_size as u64,
                len: header.sizeofcmds as u64,
                file_len: data.len() as u64,
            });
        }
        let end = end as usize;
        if header.ncmds as u64 * LOAD_COMMAND_SIZE as u64 > header.sizeofcmds as u64 {
            return Err(FormatError::InconsistentLayout {
                arch,
                reason: format!(
                    "{} commands cannot fit in sizeofcmds {}",
                    header.ncmds, header.sizeofcmds
                ),
            });
        }

        let mut commands = Vec::with_capacity(header.ncmds as usize);
        let mut off = header_size;
        for index in 0..header.ncmds as usize {
            let malformed = |cmd: u32, reason: String| FormatError::MalformedLoadCommand {
                arch,
                index,
                cmd: command_name(cmd),
                reason,
            };
            if off + LOAD_COMMAND_SIZE > end {
                return Err(malformed(0, format!("starts at {off:#x}, past sizeofcmds")));
            }
            let cmd = layout.endian.read_u32(&data[off..]);
            let cmdsize = layout.endian.read_u32(&data[off + 4..]) as usize;
            if cmdsize < LOAD_COMMAND_SIZE || off + cmdsize > end {
                return Err(malformed(cmd, format!("cmdsize {cmdsize} at {off:#x} out of bounds")));
            }
            let command = LoadCommand::parse(&data[off..off + cmdsize], layout.endian)
                .map_err(|reason| malformed(cmd, reason))?;
            debug!("{arch}: {} at {off:#x}, {cmdsize} bytes", command.name());
            commands.push(command);
            off += cmdsize;
        }
        if off != end {
            return Err(FormatError::InconsistentLayout {
                arch,
                reason: format!(
                    "sizeofcmds is {} but {} commands span {}",
                    header.sizeofcmds,
                    header.ncmds,
                    off - header_size
                ),
            });
        }

        let len = data.len() as u64;
        let content_start = first_content_offset(&commands).map_or(len, |o| o.min(len));
        let room_end = match data.get(end..content_start as usize) {
            Some(gap) => gap
                .iter()
                .position(|&b| b != 0)
                .map_or(content_start, |i| (end + i) as u64),
            None => content_start,
        };

        Ok(MachOImage {
            arch,
            layout,
            magic: header.magic,
            filetype: header.filetype,
            flags: header.flags,
            reserved: header.reserved,
            commands,
            content_start,
            room_end,
            original_end: end as u64,
        })
    }

    pub fn ncmds(&self) -> u32 {
        self.commands.len() as u32
    }

    pub fn sizeofcmds(&self) -> u64 {
        self.commands.iter().map(|c| c.size() as u64).sum()
    }

    /// Slice-relative end of the command region.
    pub fn commands_end(&self) -> u64 {
        self.layout.header_size() as u64 + self.sizeofcmds()
    }

    pub fn room_end(&self) -> u64 {
        self.room_end
    }

    /// Bytes the command region can still grow by.
    pub fn spare_room(&self) -> u64 {
        self.room_end.saturating_sub(self.commands_end())
    }

    pub fn header(&self) -> MachHeader {
        MachHeader {
            magic: self.magic,
            cpu_type: self.arch.cputype,
            cpu_sub_type: self.arch.cpusubtype,
            filetype: self.filetype,
            ncmds: self.ncmds(),
            sizeofcmds: self.sizeofcmds() as u32,
            flags: self.flags,
            reserved: self.reserved,
        }
    }

    /// Header followed by every load command.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.commands_end() as usize);
        self.header()
            .encode(&mut out, self.layout.endian, self.layout.is_64);
        for command in &self.commands {
            command.encode(&mut out, self.layout.endian);
        }
        out
    }

    pub fn find(&self, cmd: u32) -> Option<usize> {
        self.commands.iter().position(|c| c.cmd() == cmd)
    }

    /// Checks the invariants a loadable slice needs: every command's
    /// `cmdsize` matches its encoding, the region ends before any file
    /// content, and no two segments claim the same file bytes.
    pub fn verify(&self) -> Result<(), FormatError> {
        let inconsistent = |reason: String| FormatError::InconsistentLayout {
            arch: self.arch,
            reason,
        };
        for (index, command) in self.commands.iter().enumerate() {
            let mut bytes = Vec::with_capacity(command.size());
            command.encode(&mut bytes, self.layout.endian);
            let recorded = self.layout.endian.read_u32(&bytes[4..]) as usize;
            if recorded != bytes.len() || bytes.len() != command.size() {
                return Err(inconsistent(format!(
                    "{} #{index} records cmdsize {recorded} but encodes to {}",
                    command.name(),
                    bytes.len()
                )));
            }
        }
        if self.sizeofcmds() > u32::MAX as u64 {
            return Err(inconsistent(format!("sizeofcmds {} overflows", self.sizeofcmds())));
        }
        if self.commands_end() > self.content_start {
            return Err(inconsistent(format!(
                "load commands end at {:#x}, past file content at {:#x}",
                self.commands_end(),
                self.content_start
            )));
        }
        let mut ranges: Vec<(u64, u64, &str)> = self
            .commands
            .iter()
            .filter_map(|c| match c {
                LoadCommand::Segment(s) if s.filesize != 0 => {
                    Some((s.fileoff, s.fileoff.saturating_add(s.filesize), s.name.as_str()))
                }
                _ => None,
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(inconsistent(format!(
                    "segment {} overlaps {}",
                    pair[0].2, pair[1].2
                )));
            }
        }
        Ok(())
    }
}

fn first_content_offset(commands: &[LoadCommand]) -> Option<u64> {
    commands
        .iter()
        .filter_map(|c| match c {
            LoadCommand::Segment(s) => Some(s),
            _ => None,
        })
        .flat_map(|s| {
            let segment = (s.fileoff != 0 && s.filesize != 0).then_some(s.fileoff);
            let sections = s
                .sections
                .iter()
                .filter(|sect| sect.is_file_backed())
                .map(|sect| sect.offset as u64);
            segment.into_iter().chain(sections)
        })
        .min()
}

#[derive(Debug, Clone)]
pub struct Slice {
    pub offset: u64,
    pub size: u64,
    pub image: MachOImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Thin,
    Fat { is_64: bool },
}

/// Every slice of one file, plus the file bytes they were read from.
#[derive(Debug, Clone)]
pub struct FatImage {
    pub container: Container,
    pub slices: Vec<Slice>,
    data: Vec<u8>,
}

impl FatImage {
    pub fn parse(data: Vec<u8>) -> Result<FatImage, FormatError> {
        let magic = match data.get(0..4) {
            Some(bytes) => Endian::Big.read_u32(bytes),
            None => return Err(FormatError::NotMachO { magic: 0 }),
        };
        let (endian, is_64) = match magic {
            FAT_MAGIC => (Endian::Big, false),
            FAT_MAGIC_64 => (Endian::Big, true),
            FAT_CIGAM => (Endian::Little, false),
            FAT_CIGAM_64 => (Endian::Little, true),
            _ => {
                let image = MachOImage::parse(&data)?;
                let size = data.len() as u64;
                return Ok(FatImage {
                    container: Container::Thin,
                    slices: vec![Slice {
                        offset: 0,
                        size,
                        image,
                    }],
                    data,
                });
            }
        };

        let file_len = data.len() as u64;
        if data.len() < FAT_HEADER_SIZE {
            return Err(FormatError::TruncatedFile {
                what: "fat header",
                offset: 0,
                len: FAT_HEADER_SIZE as u64,
                file_len,
            });
        }
        let header = FatHeader::decode(&data, endian);
        if header.nfat_arch > MAX_FAT_ARCHS {
            return Err(FormatError::NotMachO { magic });
        }
        if header.nfat_arch == 0 {
            return Err(FormatError::NoArchitectures);
        }
        let entry_size = if is_64 { FAT_ARCH_64_SIZE } else { FAT_ARCH_SIZE };
        let table_end = FAT_HEADER_SIZE + header.nfat_arch as usize * entry_size;
        if table_end > data.len() {
            return Err(FormatError::TruncatedFile {
                what: "fat arch table",
                offset: FAT_HEADER_SIZE as u64,
                len: (table_end - FAT_HEADER_SIZE) as u64,
                file_len,
            });
        }

        let mut slices = Vec::with_capacity(header.nfat_arch as usize);
        for entry in data[FAT_HEADER_SIZE..table_end].chunks_exact(entry_size) {
            let fat_arch = FatArch::decode(entry, endian, is_64);
            let arch = Arch {
                cputype: fat_arch.cputype,
                cpusubtype: fat_arch.cpusubtype,
            };
            match fat_arch.offset.checked_add(fat_arch.size) {
                Some(end) if end <= file_len => {}
                _ => {
                    return Err(FormatError::TruncatedFile {
                        what: "fat slice",
                        offset: fat_arch.offset,
                        len: fat_arch.size,
                        file_len,
                    })
                }
            }
            if fat_arch.offset < table_end as u64 {
                return Err(FormatError::InconsistentLayout {
                    arch,
                    reason: format!("slice at {:#x} overlaps the fat header", fat_arch.offset),
                });
            }
            let start = fat_arch.offset as usize;
            let image = MachOImage::parse(&data[start..start + fat_arch.size as usize])?;
            if image.arch.cputype != arch.cputype {
                return Err(FormatError::InconsistentLayout {
                    arch,
                    reason: format!("slice header says {}", image.arch),
                });
            }
            debug!("fat slice {arch} at {:#x}, {} bytes", fat_arch.offset, fat_arch.size);
            slices.push(Slice {
                offset: fat_arch.offset,
                size: fat_arch.size,
                image,
            });
        }

        let mut order: Vec<&Slice> = slices.iter().collect();
        order.sort_unstable_by_key(|s| s.offset);
        for pair in order.windows(2) {
            if pair[0].offset + pair[0].size > pair[1].offset {
                return Err(FormatError::InconsistentLayout {
                    arch: pair[1].image.arch,
                    reason: format!("slice overlaps {}", pair[0].image.arch),
                });
            }
        }

        Ok(FatImage {
            container: Container::Fat { is_64 },
            slices,
            data,
        })
    }

    /// The file bytes as they were read.
    pub fn original(&self) -> &[u8] {
        &self.data
    }

    /// The file with every slice's header and command region re-encoded.
    /// Bytes outside those regions are copied unchanged; a region that
    /// shrank is zero filled up to its old end.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = self.data.clone();
        for slice in &self.slices {
            let image = &slice.image;
            image.verify()?;
            let region = image.encode();
            if region.len() as u64 > image.room_end {
                return Err(FormatError::InconsistentLayout {
                    arch: image.arch,
                    reason: format!(
                        "load commands end at {:#x}, past header room at {:#x}",
                        region.len(),
                        image.room_end
                    ),
                });
            }
            let start = slice.offset as usize;
            let end = start + region.len();
            let old_end = start + image.original_end as usize;
            out[start..end].copy_from_slice(&region);
            if old_end > end {
                out[end..old_end].fill(0);
            }
        }
        Ok(out)
    }
}

/// Reads `path` and parses it.
pub fn read(path: &Path) -> Result<FatImage> {
    let data = std::fs::read(path).map_err(|e| Error::io(path, "read", e))?;
    Ok(FatImage::parse(data)?)
}
