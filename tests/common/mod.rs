#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_MAIN: u32 = 0x8000_0028;
pub const LC_ID_DYLIB: u32 = 0x0d;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM: u32 = 12;
pub const MH_EXECUTE: u32 = 2;
pub const MH_DYLIB: u32 = 6;
pub const MH_PIE: u32 = 0x0020_0000;

/// Builds a little-endian 64-bit executable:
/// `__PAGEZERO`, `__TEXT` (one `__text` section), `__LINKEDIT`,
/// an optional `LC_BUILD_VERSION`, `LC_MAIN`, then `padding` zero bytes.
pub struct Binary {
    pub cputype: u32,
    pub platform: Option<u32>,
    pub padding: usize,
}

impl Default for Binary {
    fn default() -> Self {
        Binary {
            cputype: CPU_TYPE_ARM64,
            platform: Some(2),
            padding: 512,
        }
    }
}

fn put32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn put64(out: &mut Vec<u8>, n: u64) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    let mut buf = [0u8; 16];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&buf);
}

fn segment(out: &mut Vec<u8>, name: &str, fileoff: u64, filesize: u64, nsects: u32) {
    put32(out, LC_SEGMENT_64);
    put32(out, 72 + 80 * nsects);
    put_name(out, name);
    put64(out, 0x1_0000_0000 + fileoff);
    put64(out, filesize.max(0x4000));
    put64(out, fileoff);
    put64(out, filesize);
    put32(out, 5);
    put32(out, 5);
    put32(out, nsects);
    put32(out, 0);
}

impl Binary {
    pub fn commands_size(&self) -> usize {
        72 * 3 + 80 + 24 + if self.platform.is_some() { 24 } else { 0 }
    }

    /// Offset of `__text`; everything from here on must never change.
    pub fn content_offset(&self) -> usize {
        32 + self.commands_size() + self.padding
    }

    pub fn build(&self) -> Vec<u8> {
        let text = self.content_offset();
        let linkedit = text + 0x100;
        let ncmds = if self.platform.is_some() { 5 } else { 4 };

        let mut out = Vec::new();
        put32(&mut out, 0xfeedfacf);
        put32(&mut out, self.cputype);
        put32(&mut out, 0);
        put32(&mut out, MH_EXECUTE);
        put32(&mut out, ncmds);
        put32(&mut out, self.commands_size() as u32);
        put32(&mut out, MH_PIE | 0x85);
        put32(&mut out, 0);

        // __PAGEZERO maps nothing from the file.
        put32(&mut out, LC_SEGMENT_64);
        put32(&mut out, 72);
        put_name(&mut out, "__PAGEZERO");
        put64(&mut out, 0);
        put64(&mut out, 0x1_0000_0000);
        put64(&mut out, 0);
        put64(&mut out, 0);
        out.extend_from_slice(&[0u8; 16]);

        segment(&mut out, "__TEXT", 0, linkedit as u64, 1);
        put_name(&mut out, "__text");
        put_name(&mut out, "__TEXT");
        put64(&mut out, 0x1_0000_0000 + text as u64);
        put64(&mut out, 0x100);
        put32(&mut out, text as u32);
        out.extend_from_slice(&[0u8; 12]);
        put32(&mut out, 0x8000_0400);
        out.extend_from_slice(&[0u8; 12]);
        segment(&mut out, "__LINKEDIT", linkedit as u64, 0x80, 0);

        if let Some(platform) = self.platform {
            put32(&mut out, LC_BUILD_VERSION);
            put32(&mut out, 24);
            put32(&mut out, platform);
            put32(&mut out, 0x000f_0000);
            put32(&mut out, 0x0011_0000);
            put32(&mut out, 0);
        }
        put32(&mut out, LC_MAIN);
        put32(&mut out, 24);
        put64(&mut out, text as u64);
        put64(&mut out, 0);

        assert_eq!(out.len(), 32 + self.commands_size());
        out.resize(text, 0);
        out.extend((0..0x180u32).map(|i| (i * 7 + 3) as u8 | 1));
        out
    }
}

/// A big-endian `FAT_MAGIC` wrapper with 16 KiB aligned slices.
pub fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xcafebabeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    let mut offset = 0x4000usize;
    let mut placed = Vec::new();
    for slice in slices {
        let cputype = u32::from_le_bytes(slice[4..8].try_into().unwrap());
        for n in [cputype, 0, offset as u32, slice.len() as u32, 14] {
            out.extend_from_slice(&n.to_be_bytes());
        }
        placed.push(offset);
        offset = (offset + slice.len() + 0x3fff) & !0x3fff;
    }
    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend_from_slice(slice);
    }
    out
}

pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Walks the load commands of a thin little-endian 64-bit slice and returns
/// `(cmd, offset, cmdsize)` for each.
pub fn walk_commands(slice: &[u8]) -> Vec<(u32, usize, usize)> {
    let ncmds = read_u32(slice, 16) as usize;
    let mut at = 32;
    let mut commands = Vec::new();
    for _ in 0..ncmds {
        let cmdsize = read_u32(slice, at + 4) as usize;
        commands.push((read_u32(slice, at), at, cmdsize));
        at += cmdsize;
    }
    commands
}

pub fn scratch_dir(name: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "simforge-it-{name}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
