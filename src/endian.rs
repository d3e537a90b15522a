use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte order of one Mach-O slice, decided by its magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], n: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, n),
            Endian::Big => BigEndian::write_u32(buf, n),
        }
    }

    /// Appends `n` to `out`.
    pub fn put_u32(self, out: &mut Vec<u8>, n: u32) {
        let mut buf = [0u8; 4];
        self.write_u32(&mut buf, n);
        out.extend_from_slice(&buf);
    }
}
