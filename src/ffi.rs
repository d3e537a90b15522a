//! On-disk layouts from `mach-o/loader.h` and `mach-o/fat.h`.
//!
//! The structs mirror the C declarations field for field. They are never
//! transmuted from file bytes; `decode`/`encode` go through [`Endian`] so a
//! byte-swapped slice reads the same as a native one.

use crate::endian::Endian;

pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;
pub const FAT_CIGAM_64: u32 = 0xbfbafeca;

pub const MH_OBJECT: u32 = 0x1;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

pub const MH_PIE: u32 = 0x0020_0000;

pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT: u32 = 0x01;
pub const LC_SYMTAB: u32 = 0x02;
pub const LC_DYSYMTAB: u32 = 0x0b;
pub const LC_LOAD_DYLIB: u32 = 0x0c;
pub const LC_ID_DYLIB: u32 = 0x0d;
pub const LC_LOAD_DYLINKER: u32 = 0x0e;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;

pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;
pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
pub const CPU_TYPE_POWERPC: u32 = 18;
pub const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

pub const PLATFORM_MACOS: u32 = 1;
pub const PLATFORM_IOS: u32 = 2;
pub const PLATFORM_TVOS: u32 = 3;
pub const PLATFORM_WATCHOS: u32 = 4;
pub const PLATFORM_MACCATALYST: u32 = 6;
pub const PLATFORM_IOSSIMULATOR: u32 = 7;
pub const PLATFORM_TVOSSIMULATOR: u32 = 8;
pub const PLATFORM_WATCHOSSIMULATOR: u32 = 9;
pub const PLATFORM_VISIONOS: u32 = 11;
pub const PLATFORM_VISIONOSSIMULATOR: u32 = 12;

pub const SECTION_TYPE: u32 = 0x0000_00ff;
pub const S_ZEROFILL: u32 = 0x1;
pub const S_GB_ZEROFILL: u32 = 0xc;
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

/// Every load command starts with `cmd` and `cmdsize`.
pub const LOAD_COMMAND_SIZE: usize = 8;
pub const DYLIB_COMMAND_SIZE: usize = 24;
pub const VERSION_MIN_COMMAND_SIZE: usize = 16;
pub const BUILD_VERSION_COMMAND_SIZE: usize = 24;
pub const BUILD_TOOL_VERSION_SIZE: usize = 8;
pub const SEGMENT_COMMAND_SIZE: usize = 56;
pub const SEGMENT_COMMAND_64_SIZE: usize = 72;
pub const SECTION_SIZE: usize = 68;
pub const SECTION_64_SIZE: usize = 80;
pub const FAT_HEADER_SIZE: usize = 8;
pub const FAT_ARCH_SIZE: usize = 20;
pub const FAT_ARCH_64_SIZE: usize = 32;

/// `mach_header` / `mach_header_64`. `reserved` only exists on disk for 64-bit.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader {
    pub magic: u32,
    pub cpu_type: u32,
    pub cpu_sub_type: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader {
    pub const SIZE_32: usize = 28;
    pub const SIZE_64: usize = 32;

    pub fn size(is_64: bool) -> usize {
        if is_64 {
            Self::SIZE_64
        } else {
            Self::SIZE_32
        }
    }

    /// `buf` must hold at least `size(is_64)` bytes.
    pub fn decode(buf: &[u8], endian: Endian, is_64: bool) -> MachHeader {
        MachHeader {
            magic: endian.read_u32(&buf[0..]),
            cpu_type: endian.read_u32(&buf[4..]),
            cpu_sub_type: endian.read_u32(&buf[8..]),
            filetype: endian.read_u32(&buf[12..]),
            ncmds: endian.read_u32(&buf[16..]),
            sizeofcmds: endian.read_u32(&buf[20..]),
            flags: endian.read_u32(&buf[24..]),
            reserved: if is_64 { endian.read_u32(&buf[28..]) } else { 0 },
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>, endian: Endian, is_64: bool) {
        endian.put_u32(out, self.magic);
        endian.put_u32(out, self.cpu_type);
        endian.put_u32(out, self.cpu_sub_type);
        endian.put_u32(out, self.filetype);
        endian.put_u32(out, self.ncmds);
        endian.put_u32(out, self.sizeofcmds);
        endian.put_u32(out, self.flags);
        if is_64 {
            endian.put_u32(out, self.reserved);
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FatHeader {
    pub magic: u32,
    pub nfat_arch: u32,
}

impl FatHeader {
    /// Fat headers are big-endian on disk; `endian` is only `Little` for the
    /// swapped `FAT_CIGAM` layouts some tools emit.
    pub fn decode(buf: &[u8], endian: Endian) -> FatHeader {
        FatHeader {
            magic: endian.read_u32(&buf[0..]),
            nfat_arch: endian.read_u32(&buf[4..]),
        }
    }
}

/// `fat_arch` and `fat_arch_64` widened to one shape.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    pub align: u32,
}

impl FatArch {
    pub fn decode(buf: &[u8], e: Endian, is_64: bool) -> FatArch {
        if is_64 {
            FatArch {
                cputype: e.read_u32(&buf[0..]),
                cpusubtype: e.read_u32(&buf[4..]),
                offset: e.read_u64(&buf[8..]),
                size: e.read_u64(&buf[16..]),
                align: e.read_u32(&buf[24..]),
            }
        } else {
            FatArch {
                cputype: e.read_u32(&buf[0..]),
                cpusubtype: e.read_u32(&buf[4..]),
                offset: e.read_u32(&buf[8..]) as u64,
                size: e.read_u32(&buf[12..]) as u64,
                align: e.read_u32(&buf[16..]),
            }
        }
    }
}

/// Returns true for the four magics a thin Mach-O slice may start with.
pub fn is_thin_magic(magic: u32) -> bool {
    matches!(magic, MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64)
}

/// Returns true for the fat magics. `FAT_MAGIC` collides with Java class
/// files, so a match here is only a hint.
pub fn is_fat_magic(magic: u32) -> bool {
    matches!(magic, FAT_MAGIC | FAT_CIGAM | FAT_MAGIC_64 | FAT_CIGAM_64)
}

/// Human readable name for a load command id, for error messages.
pub fn command_name(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_UUID => "LC_UUID",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_MAIN => "LC_MAIN",
        LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
        LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        _ => "LC_UNKNOWN",
    }
}
