//! Synthetic Mach-O files for unit tests.

use crate::{endian::Endian, ffi::*};

pub const TEXT_SIZE: usize = 0x40;
pub const LINKEDIT_SIZE: usize = 0x40;

#[derive(Debug, Clone, Copy)]
pub enum Version {
    Build(u32),
    Min,
    Absent,
}

/// An executable: `__PAGEZERO`, `__TEXT` with one `__text` section,
/// `__LINKEDIT`, a version command, `LC_MAIN`, optionally `LC_CODE_SIGNATURE`,
/// then `padding` zero bytes before the first section.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub cputype: u32,
    pub filetype: u32,
    pub flags: u32,
    pub version: Version,
    pub code_signature: bool,
    pub padding: usize,
    pub big_endian: bool,
    pub is_64: bool,
}

impl Default for Fixture {
    fn default() -> Fixture {
        Fixture {
            cputype: CPU_TYPE_ARM64,
            filetype: MH_EXECUTE,
            flags: MH_PIE | 0x85,
            version: Version::Build(PLATFORM_IOS),
            code_signature: false,
            padding: 256,
            big_endian: false,
            is_64: true,
        }
    }
}

struct Writer {
    endian: Endian,
    is_64: bool,
    out: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, n: u32) {
        self.endian.put_u32(&mut self.out, n);
    }

    fn u64(&mut self, n: u64) {
        let (hi, lo) = ((n >> 32) as u32, n as u32);
        match self.endian {
            Endian::Little => {
                self.u32(lo);
                self.u32(hi);
            }
            Endian::Big => {
                self.u32(hi);
                self.u32(lo);
            }
        }
    }

    /// A pointer-sized field.
    fn word(&mut self, n: u64) {
        if self.is_64 {
            self.u64(n);
        } else {
            self.u32(n as u32);
        }
    }

    fn name(&mut self, name: &str) {
        let mut buf = [0u8; 16];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        self.out.extend_from_slice(&buf);
    }

    fn segment(&mut self, name: &str, vmsize: u64, fileoff: u64, filesize: u64, nsects: u32) {
        let (cmd, fixed, section) = if self.is_64 {
            (LC_SEGMENT_64, SEGMENT_COMMAND_64_SIZE, SECTION_64_SIZE)
        } else {
            (LC_SEGMENT, SEGMENT_COMMAND_SIZE, SECTION_SIZE)
        };
        self.u32(cmd);
        self.u32((fixed + nsects as usize * section) as u32);
        self.name(name);
        let base = if self.is_64 { 0x1_0000_0000 } else { 0x4000 };
        self.word(if fileoff == 0 && filesize == 0 { 0 } else { base + fileoff });
        self.word(vmsize);
        self.word(fileoff);
        self.word(filesize);
        self.u32(5);
        self.u32(5);
        self.u32(nsects);
        self.u32(0);
    }
}

impl Fixture {
    fn commands_size(&self) -> usize {
        let version = match self.version {
            Version::Build(_) => BUILD_VERSION_COMMAND_SIZE + BUILD_TOOL_VERSION_SIZE,
            Version::Min => VERSION_MIN_COMMAND_SIZE,
            Version::Absent => 0,
        };
        let signature = if self.code_signature { 16 } else { 0 };
        let (segment, section) = if self.is_64 {
            (SEGMENT_COMMAND_64_SIZE, SECTION_64_SIZE)
        } else {
            (SEGMENT_COMMAND_SIZE, SECTION_SIZE)
        };
        segment * 3 + section + version + 24 + signature
    }

    pub fn ncmds(&self) -> u32 {
        let mut n = 4;
        if !matches!(self.version, Version::Absent) {
            n += 1;
        }
        if self.code_signature {
            n += 1;
        }
        n
    }

    pub fn text_offset(&self) -> usize {
        MachHeader::size(self.is_64) + self.commands_size() + self.padding
    }

    pub fn build(&self) -> Vec<u8> {
        let endian = if self.big_endian { Endian::Big } else { Endian::Little };
        let mut w = Writer {
            endian,
            is_64: self.is_64,
            out: Vec::new(),
        };
        let text_off = self.text_offset();
        let linkedit_off = text_off + TEXT_SIZE;

        w.u32(if self.is_64 { MH_MAGIC_64 } else { MH_MAGIC });
        w.u32(self.cputype);
        w.u32(0);
        w.u32(self.filetype);
        w.u32(self.ncmds());
        w.u32(self.commands_size() as u32);
        w.u32(self.flags);
        if self.is_64 {
            w.u32(0);
        }

        let zero_page = if self.is_64 { 0x1_0000_0000 } else { 0x4000 };
        w.segment("__PAGEZERO", zero_page, 0, 0, 0);
        w.segment("__TEXT", 0x4000, 0, linkedit_off as u64, 1);
        w.name("__text");
        w.name("__TEXT");
        let base = if self.is_64 { 0x1_0000_0000 } else { 0x4000 };
        w.word(base + text_off as u64);
        w.word(TEXT_SIZE as u64);
        w.u32(text_off as u32);
        w.u32(2);
        w.u32(0);
        w.u32(0);
        w.u32(0x8000_0400);
        w.u32(0);
        w.u32(0);
        if self.is_64 {
            w.u32(0);
        }
        w.segment(
            "__LINKEDIT",
            0x4000,
            linkedit_off as u64,
            LINKEDIT_SIZE as u64,
            0,
        );
        match self.version {
            Version::Build(platform) => {
                w.u32(LC_BUILD_VERSION);
                w.u32((BUILD_VERSION_COMMAND_SIZE + BUILD_TOOL_VERSION_SIZE) as u32);
                w.u32(platform);
                w.u32(0x000f_0000);
                w.u32(0x0011_0200);
                w.u32(1);
                w.u32(3);
                w.u32(0x03fe_0100);
            }
            Version::Min => {
                w.u32(LC_VERSION_MIN_IPHONEOS);
                w.u32(VERSION_MIN_COMMAND_SIZE as u32);
                w.u32(0x000c_0000);
                w.u32(0x000e_0000);
            }
            Version::Absent => {}
        }
        w.u32(LC_MAIN);
        w.u32(24);
        w.u64(text_off as u64);
        w.u64(0);
        if self.code_signature {
            w.u32(LC_CODE_SIGNATURE);
            w.u32(16);
            w.u32((linkedit_off + 0x20) as u32);
            w.u32(0x20);
        }

        let mut out = w.out;
        out.resize(text_off, 0);
        out.extend((0..TEXT_SIZE).map(|i| 0xa0 | (i as u8 & 0x0f)));
        out.extend((0..LINKEDIT_SIZE).map(|i| 0xb0 | (i as u8 & 0x0f)));
        out
    }
}

/// Wraps thin slices in a 32-bit fat header, each slice page aligned.
pub fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    let be = Endian::Big;
    let mut out = Vec::new();
    be.put_u32(&mut out, FAT_MAGIC);
    be.put_u32(&mut out, slices.len() as u32);
    let mut offset = 0x1000usize;
    let mut offsets = Vec::new();
    for slice in slices {
        let cputype = Endian::Little.read_u32(&slice[4..]);
        be.put_u32(&mut out, cputype);
        be.put_u32(&mut out, 0);
        be.put_u32(&mut out, offset as u32);
        be.put_u32(&mut out, slice.len() as u32);
        be.put_u32(&mut out, 12);
        offsets.push(offset);
        offset = (offset + slice.len() + 0xfff) & !0xfff;
    }
    for (slice, offset) in slices.iter().zip(offsets) {
        out.resize(offset, 0);
        out.extend_from_slice(slice);
    }
    out
}

/// A fresh empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "simforge-{name}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
