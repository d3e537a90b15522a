//! The load commands the patcher understands, plus an opaque variant that
//! carries every other command through untouched.

use crate::{endian::Endian, ffi::*};

/// Byte order and word size shared by every command in one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub endian: Endian,
    pub is_64: bool,
}

impl Layout {
    /// `cmdsize` must be a multiple of this.
    pub fn alignment(self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    pub fn header_size(self) -> usize {
        MachHeader::size(self.is_64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCommand {
    Segment(SegmentCommand),
    BuildVersion(BuildVersion),
    VersionMin(VersionMin),
    IdDylib(DylibId),
    Opaque(RawCommand),
}

/// A command kept as raw bytes, `cmd`/`cmdsize` prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub cmd: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommand {
    pub name: String,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
    raw: RawCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub offset: u32,
    pub size: u64,
    pub flags: u32,
}

impl Section {
    /// Zero-fill sections occupy no file bytes even when `offset` is set.
    pub fn is_file_backed(&self) -> bool {
        let ty = self.flags & SECTION_TYPE;
        self.offset != 0
            && self.size != 0
            && !matches!(ty, S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    pub platform: u32,
    pub minos: u32,
    pub sdk: u32,
    pub tools: Vec<ToolVersion>,
    /// Bytes past the tool entries; empty in anything a linker produced.
    pub trailing: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolVersion {
    pub tool: u32,
    pub version: u32,
}

/// One of the `LC_VERSION_MIN_*` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMin {
    pub cmd: u32,
    pub version: u32,
    pub sdk: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibId {
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
    /// Everything from the end of the fixed part to `cmdsize`.
    pub payload: Vec<u8>,
}

/// Packs `major.minor.patch` the way `ld64` does (`xxxx.yy.zz`).
pub const fn pack_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

impl BuildVersion {
    pub fn new(platform: u32, minos: u32, sdk: u32) -> BuildVersion {
        BuildVersion {
            platform,
            minos,
            sdk,
            tools: Vec::new(),
            trailing: Vec::new(),
        }
    }

    fn parse(bytes: &[u8], endian: Endian) -> Result<BuildVersion, String> {
        if bytes.len() < BUILD_VERSION_COMMAND_SIZE {
            return Err(format!("cmdsize {} below {}", bytes.len(), BUILD_VERSION_COMMAND_SIZE));
        }
        let ntools = endian.read_u32(&bytes[20..]) as usize;
        let tools_end = ntools
            .checked_mul(BUILD_TOOL_VERSION_SIZE)
            .and_then(|n| n.checked_add(BUILD_VERSION_COMMAND_SIZE))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| format!("{ntools} tool entries overrun cmdsize {}", bytes.len()))?;
        let tools = bytes[BUILD_VERSION_COMMAND_SIZE..tools_end]
            .chunks_exact(BUILD_TOOL_VERSION_SIZE)
            .map(|t| ToolVersion {
                tool: endian.read_u32(&t[0..]),
                version: endian.read_u32(&t[4..]),
            })
            .collect();
        Ok(BuildVersion {
            platform: endian.read_u32(&bytes[8..]),
            minos: endian.read_u32(&bytes[12..]),
            sdk: endian.read_u32(&bytes[16..]),
            tools,
            trailing: bytes[tools_end..].to_vec(),
        })
    }

    fn size(&self) -> usize {
        BUILD_VERSION_COMMAND_SIZE + self.tools.len() * BUILD_TOOL_VERSION_SIZE + self.trailing.len()
    }

    fn encode(&self, out: &mut Vec<u8>, endian: Endian) {
        endian.put_u32(out, LC_BUILD_VERSION);
        endian.put_u32(out, self.size() as u32);
        endian.put_u32(out, self.platform);
        endian.put_u32(out, self.minos);
        endian.put_u32(out, self.sdk);
        endian.put_u32(out, self.tools.len() as u32);
        for t in &self.tools {
            endian.put_u32(out, t.tool);
            endian.put_u32(out, t.version);
        }
        out.extend_from_slice(&self.trailing);
    }
}

impl VersionMin {
    fn parse(cmd: u32, bytes: &[u8], endian: Endian) -> Result<VersionMin, String> {
        if bytes.len() != VERSION_MIN_COMMAND_SIZE {
            return Err(format!("cmdsize {} is not {}", bytes.len(), VERSION_MIN_COMMAND_SIZE));
        }
        Ok(VersionMin {
            cmd,
            version: endian.read_u32(&bytes[8..]),
            sdk: endian.read_u32(&bytes[12..]),
        })
    }

    /// The `PLATFORM_*` value the command stands for.
    pub fn platform(&self) -> u32 {
        match self.cmd {
            LC_VERSION_MIN_MACOSX => PLATFORM_MACOS,
            LC_VERSION_MIN_TVOS => PLATFORM_TVOS,
            LC_VERSION_MIN_WATCHOS => PLATFORM_WATCHOS,
            _ => PLATFORM_IOS,
        }
    }

    fn encode(&self, out: &mut Vec<u8>, endian: Endian) {
        endian.put_u32(out, self.cmd);
        endian.put_u32(out, VERSION_MIN_COMMAND_SIZE as u32);
        endian.put_u32(out, self.version);
        endian.put_u32(out, self.sdk);
    }
}

impl DylibId {
    /// An `LC_ID_DYLIB` for `install_name`, NUL terminated and zero padded
    /// to the slice's command alignment.
    pub fn new(install_name: &str, layout: Layout) -> DylibId {
        let align = layout.alignment();
        let mut payload = install_name.as_bytes().to_vec();
        payload.push(0);
        let total = DYLIB_COMMAND_SIZE + payload.len();
        payload.resize(payload.len() + (align - total % align) % align, 0);
        DylibId {
            name_offset: DYLIB_COMMAND_SIZE as u32,
            timestamp: 1,
            current_version: pack_version(1, 0, 0),
            compatibility_version: pack_version(1, 0, 0),
            payload,
        }
    }

    fn parse(bytes: &[u8], endian: Endian) -> Result<DylibId, String> {
        if bytes.len() < DYLIB_COMMAND_SIZE {
            return Err(format!("cmdsize {} below {}", bytes.len(), DYLIB_COMMAND_SIZE));
        }
        let name_offset = endian.read_u32(&bytes[8..]);
        if (name_offset as usize) < DYLIB_COMMAND_SIZE || name_offset as usize >= bytes.len() {
            return Err(format!("install name offset {name_offset} outside command"));
        }
        Ok(DylibId {
            name_offset,
            timestamp: endian.read_u32(&bytes[12..]),
            current_version: endian.read_u32(&bytes[16..]),
            compatibility_version: endian.read_u32(&bytes[20..]),
            payload: bytes[DYLIB_COMMAND_SIZE..].to_vec(),
        })
    }

    pub fn install_name(&self) -> String {
        let start = (self.name_offset as usize).saturating_sub(DYLIB_COMMAND_SIZE);
        let name = self.payload.get(start..).unwrap_or_default();
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        String::from_utf8_lossy(&name[..end]).into_owned()
    }

    fn size(&self) -> usize {
        DYLIB_COMMAND_SIZE + self.payload.len()
    }

    fn encode(&self, out: &mut Vec<u8>, endian: Endian) {
        endian.put_u32(out, LC_ID_DYLIB);
        endian.put_u32(out, self.size() as u32);
        endian.put_u32(out, self.name_offset);
        endian.put_u32(out, self.timestamp);
        endian.put_u32(out, self.current_version);
        endian.put_u32(out, self.compatibility_version);
        out.extend_from_slice(&self.payload);
    }
}

fn fixed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl SegmentCommand {
    fn parse(cmd: u32, bytes: &[u8], endian: Endian) -> Result<SegmentCommand, String> {
        let is_64 = cmd == LC_SEGMENT_64;
        let (fixed, section_size) = if is_64 {
            (SEGMENT_COMMAND_64_SIZE, SECTION_64_SIZE)
        } else {
            (SEGMENT_COMMAND_SIZE, SECTION_SIZE)
        };
        if bytes.len() < fixed {
            return Err(format!("cmdsize {} below {fixed}", bytes.len()));
        }
        let (fileoff, filesize, nsects) = if is_64 {
            (
                endian.read_u64(&bytes[40..]),
                endian.read_u64(&bytes[48..]),
                endian.read_u32(&bytes[64..]) as usize,
            )
        } else {
            (
                endian.read_u32(&bytes[32..]) as u64,
                endian.read_u32(&bytes[36..]) as u64,
                endian.read_u32(&bytes[48..]) as usize,
            )
        };
        let sections_end = nsects
            .checked_mul(section_size)
            .and_then(|n| n.checked_add(fixed))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| format!("{nsects} sections overrun cmdsize {}", bytes.len()))?;
        let sections = bytes[fixed..sections_end]
            .chunks_exact(section_size)
            .map(|s| {
                if is_64 {
                    Section {
                        name: fixed_name(&s[0..16]),
                        size: endian.read_u64(&s[40..]),
                        offset: endian.read_u32(&s[48..]),
                        flags: endian.read_u32(&s[64..]),
                    }
                } else {
                    Section {
                        name: fixed_name(&s[0..16]),
                        size: endian.read_u32(&s[36..]) as u64,
                        offset: endian.read_u32(&s[40..]),
                        flags: endian.read_u32(&s[56..]),
                    }
                }
            })
            .collect();
        Ok(SegmentCommand {
            name: fixed_name(&bytes[8..24]),
            fileoff,
            filesize,
            sections,
            raw: RawCommand {
                cmd,
                bytes: bytes.to_vec(),
            },
        })
    }
}

impl LoadCommand {
    /// Decodes one command. `bytes` is exactly `cmdsize` long and starts at
    /// the `cmd` field. Kinds this crate does not interpret come back as
    /// [`LoadCommand::Opaque`].
    pub fn parse(bytes: &[u8], endian: Endian) -> Result<LoadCommand, String> {
        let cmd = endian.read_u32(bytes);
        Ok(match cmd {
            LC_SEGMENT | LC_SEGMENT_64 => {
                LoadCommand::Segment(SegmentCommand::parse(cmd, bytes, endian)?)
            }
            LC_BUILD_VERSION => LoadCommand::BuildVersion(BuildVersion::parse(bytes, endian)?),
            LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                LoadCommand::VersionMin(VersionMin::parse(cmd, bytes, endian)?)
            }
            LC_ID_DYLIB => LoadCommand::IdDylib(DylibId::parse(bytes, endian)?),
            _ => LoadCommand::Opaque(RawCommand {
                cmd,
                bytes: bytes.to_vec(),
            }),
        })
    }

    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommand::Segment(s) => s.raw.cmd,
            LoadCommand::BuildVersion(_) => LC_BUILD_VERSION,
            LoadCommand::VersionMin(v) => v.cmd,
            LoadCommand::IdDylib(_) => LC_ID_DYLIB,
            LoadCommand::Opaque(raw) => raw.cmd,
        }
    }

    pub fn name(&self) -> &'static str {
        command_name(self.cmd())
    }

    /// Serialized length; always equal to the `cmdsize` written by `encode`.
    pub fn size(&self) -> usize {
        match self {
            LoadCommand::Segment(s) => s.raw.bytes.len(),
            LoadCommand::BuildVersion(b) => b.size(),
            LoadCommand::VersionMin(_) => VERSION_MIN_COMMAND_SIZE,
            LoadCommand::IdDylib(d) => d.size(),
            LoadCommand::Opaque(raw) => raw.bytes.len(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>, endian: Endian) {
        match self {
            LoadCommand::Segment(s) => out.extend_from_slice(&s.raw.bytes),
            LoadCommand::BuildVersion(b) => b.encode(out, endian),
            LoadCommand::VersionMin(v) => v.encode(out, endian),
            LoadCommand::IdDylib(d) => d.encode(out, endian),
            LoadCommand::Opaque(raw) => out.extend_from_slice(&raw.bytes),
        }
    }
}
