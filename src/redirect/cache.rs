//! Keeps the most recently used replacement file open between reads.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use eyre::{Context, Result};

/// Identifies an entry across all archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub archive: usize,
    pub index: usize,
}

/// Holds at most one open replacement file.
#[derive(Default)]
pub struct StreamCache {
    slot: Option<(EntryKey, File)>,
}

impl StreamCache {
    pub fn new() -> StreamCache {
        StreamCache::default()
    }

    /// Returns the open stream for `key`, opening `path` (and closing whatever was open before)
    /// if the cached stream belongs to another entry.
    pub fn get(&mut self, key: EntryKey, path: &Path) -> Result<&mut File> {
        let cached = matches!(&self.slot, Some((cached_key, _)) if *cached_key == key);

        if !cached {
            if let Some(old_key) = self.cached_key() {
                log::debug!("Closing replacement stream for {:?}", old_key);
            }

            // Close the old stream before opening the new one.
            self.slot = None;

            let file = open_shared(path)
                .wrap_err_with(|| format!("Unable to open replacement file {:?}", path))?;

            log::debug!("Opened replacement stream {:?} for {:?}", path, key);
            self.slot = Some((key, file));
        }

        match &mut self.slot {
            Some((_, file)) => Ok(file),
            None => Err(eyre::format_err!("Replacement stream slot is empty")),
        }
    }

    /// Returns the key of the entry whose stream is open, if any.
    pub fn cached_key(&self) -> Option<EntryKey> {
        self.slot.as_ref().map(|(key, _)| *key)
    }

    /// Reads from `offset` in the replacement for `key` until `buffer` is full or the file ends,
    /// returning the number of bytes read.
    pub fn read_at(
        &mut self,
        key: EntryKey,
        path: &Path,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let file = self.get(key, path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;

        while filled < buffer.len() {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(filled)
    }
}

/// Opens `path` for reading only, without stopping anybody else from reading, writing or
/// deleting it.
#[cfg(windows)]
fn open_shared(path: &Path) -> std::io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    const FILE_SHARE_READ: u32 = 0x1;
    const FILE_SHARE_WRITE: u32 = 0x2;
    const FILE_SHARE_DELETE: u32 = 0x4;
    const FILE_FLAG_RANDOM_ACCESS: u32 = 0x1000_0000;

    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE)
        .custom_flags(FILE_FLAG_RANDOM_ACCESS)
        .open(path)
}

/// Opens `path` for reading only. Other platforms don't lock files on open.
#[cfg(not(windows))]
fn open_shared(path: &Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new().read(true).open(path)
}
