//! Structures from `DW_PACK` archives.
//!
//! An archive is a fixed-size header, followed by a table of fixed-size entry records (one for
//! each packed file), followed by the payload data. Entry data offsets are relative to the end
//! of the entry table.

use std::{
    ffi::CStr,
    io::{self, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// The size of the archive header in bytes.
pub const HEADER_SIZE: usize = 0x14;

/// The size of a single entry record in bytes.
pub const ENTRY_SIZE: usize = 0x120;

/// The number of bytes reserved for the path inside an entry record.
pub const PATH_SIZE: usize = 0x104;

/// `"DW_PACK\0"` read as a little-endian integer.
pub const SIGNATURE: u64 = u64::from_le_bytes(*b"DW_PACK\0");

/// The header at the very start of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub signature: u64,
    pub field_08: u32,

    /// The number of entry records following the header.
    pub file_count: u32,

    /// The archive's index within the game's set of archives.
    pub index: u32,
}

impl PackHeader {
    pub fn read(reader: &mut impl Read) -> io::Result<PackHeader> {
        Ok(PackHeader {
            signature: reader.read_u64::<LittleEndian>()?,
            field_08: reader.read_u32::<LittleEndian>()?,
            file_count: reader.read_u32::<LittleEndian>()?,
            index: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.signature)?;
        writer.write_u32::<LittleEndian>(self.field_08)?;
        writer.write_u32::<LittleEndian>(self.file_count)?;
        writer.write_u32::<LittleEndian>(self.index)
    }

    /// Parses a header from the first `HEADER_SIZE` bytes of `bytes`.
    pub fn from_bytes(mut bytes: &[u8]) -> io::Result<PackHeader> {
        PackHeader::read(&mut bytes)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        // Writing into a slice of exactly the right size cannot fail.
        let _ = self.write(&mut &mut bytes[..]);

        bytes
    }

    pub fn has_signature(&self) -> bool {
        self.signature == SIGNATURE
    }

    /// Returns the absolute offset at which the payload data region begins.
    pub fn data_start(&self) -> u64 {
        HEADER_SIZE as u64 + ENTRY_SIZE as u64 * u64::from(self.file_count)
    }
}

/// One record from an archive's entry table.
///
/// Fields the engine has no use for are kept so that a record can be written back out exactly
/// as it was read.
#[derive(Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub field_00: u32,

    /// The raw path bytes. Anything after the first NUL is preserved but meaningless.
    pub path_bytes: [u8; PATH_SIZE],

    pub id: u16,
    pub field_10a: u16,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub flags: u32,

    /// Offset of the entry's data relative to the end of the entry table.
    pub data_offset: u32,

    pub field_11c: u32,
}

impl PackEntry {
    pub fn read(reader: &mut impl Read) -> io::Result<PackEntry> {
        let field_00 = reader.read_u32::<LittleEndian>()?;

        let mut path_bytes = [0u8; PATH_SIZE];
        reader.read_exact(&mut path_bytes)?;

        Ok(PackEntry {
            field_00,
            path_bytes,
            id: reader.read_u16::<LittleEndian>()?,
            field_10a: reader.read_u16::<LittleEndian>()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
            flags: reader.read_u32::<LittleEndian>()?,
            data_offset: reader.read_u32::<LittleEndian>()?,
            field_11c: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.field_00)?;
        writer.write_all(&self.path_bytes)?;
        writer.write_u16::<LittleEndian>(self.id)?;
        writer.write_u16::<LittleEndian>(self.field_10a)?;
        writer.write_u32::<LittleEndian>(self.compressed_size)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_size)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.data_offset)?;
        writer.write_u32::<LittleEndian>(self.field_11c)
    }

    /// Parses an entry from the first `ENTRY_SIZE` bytes of `bytes`.
    pub fn from_bytes(mut bytes: &[u8]) -> io::Result<PackEntry> {
        PackEntry::read(&mut bytes)
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut bytes = [0u8; ENTRY_SIZE];
        let _ = self.write(&mut &mut bytes[..]);
        bytes
    }

    /// Returns the entry's path, or `None` if it isn't valid UTF-8.
    pub fn path(&self) -> Option<&str> {
        // Paths that fill the whole field have no terminator, in which case every byte is part
        // of the path.
        match CStr::from_bytes_until_nul(&self.path_bytes) {
            Ok(c_string) => c_string.to_str().ok(),
            Err(_) => std::str::from_utf8(&self.path_bytes).ok(),
        }
    }

    /// Replaces the path bytes with `path`, NUL-padded. Paths that don't fit are truncated.
    pub fn set_path(&mut self, path: &str) {
        let len = path.len().min(PATH_SIZE);

        self.path_bytes = [0u8; PATH_SIZE];
        self.path_bytes[..len].copy_from_slice(&path.as_bytes()[..len]);
    }

    /// Returns the absolute range of archive offsets occupied by this entry's data, given where
    /// the data region starts.
    pub fn data_range(&self, data_start: u64) -> std::ops::Range<u64> {
        let start = data_start + u64::from(self.data_offset);
        start..start + u64::from(self.compressed_size)
    }
}

impl std::fmt::Debug for PackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackEntry")
            .field("path", &self.path().unwrap_or("<unrepresentable>"))
            .field("field_00", &self.field_00)
            .field("id", &self.id)
            .field("field_10a", &self.field_10a)
            .field("compressed_size", &format_args!("{:#010x}", self.compressed_size))
            .field("uncompressed_size", &format_args!("{:#010x}", self.uncompressed_size))
            .field("flags", &self.flags)
            .field("data_offset", &format_args!("{:#010x}", self.data_offset))
            .field("field_11c", &self.field_11c)
            .finish()
    }
}

impl Default for PackEntry {
    fn default() -> Self {
        PackEntry {
            field_00: 0,
            path_bytes: [0u8; PATH_SIZE],
            id: 0,
            field_10a: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            flags: 0,
            data_offset: 0,
            field_11c: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = PackHeader {
            signature: SIGNATURE,
            field_08: 0,
            file_count: 3,
            index: 4,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], b"DW_PACK\0");
        assert_eq!(&bytes[0x0c..0x10], &3u32.to_le_bytes());
        assert_eq!(&bytes[0x10..0x14], &4u32.to_le_bytes());

        let parsed = PackHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.has_signature());
        assert_eq!(parsed.data_start(), (HEADER_SIZE + 3 * ENTRY_SIZE) as u64);
    }

    #[test]
    fn entry_bytes_survive_parsing() {
        // Fill every byte with a distinct-ish value so that any field written back to the wrong
        // place shows up.
        let mut raw = [0u8; ENTRY_SIZE];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = (i * 7 % 251) as u8;
        }

        // A terminated path followed by junk that must be preserved.
        raw[4..4 + 9].copy_from_slice(b"model.g1m");
        raw[4 + 9] = 0;

        let entry = PackEntry::from_bytes(&raw).unwrap();
        assert_eq!(entry.path(), Some("model.g1m"));
        assert_eq!(entry.to_bytes(), raw);
    }

    #[test]
    fn path_using_every_byte() {
        let mut entry = PackEntry::default();
        entry.path_bytes = [b'a'; PATH_SIZE];

        assert_eq!(entry.path().map(str::len), Some(PATH_SIZE));
    }

    #[test]
    fn field_offsets() {
        let mut entry = PackEntry::default();
        entry.set_path("a\\b.bin");
        entry.compressed_size = 0x11;
        entry.uncompressed_size = 0x22;
        entry.flags = 0x33;
        entry.data_offset = 0x44;

        let bytes = entry.to_bytes();
        assert_eq!(&bytes[0x10c..0x110], &0x11u32.to_le_bytes());
        assert_eq!(&bytes[0x110..0x114], &0x22u32.to_le_bytes());
        assert_eq!(&bytes[0x114..0x118], &0x33u32.to_le_bytes());
        assert_eq!(&bytes[0x118..0x11c], &0x44u32.to_le_bytes());
        assert_eq!(entry.data_range(0x1000), 0x1044..0x1055);
    }
}
