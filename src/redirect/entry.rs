//! Decides which archive entries are replaced by loose files, and rewrites their records to
//! describe the replacement data.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};

use crate::{error::Fault, pack::PackEntry};

/// The range of offsets handed out to replacements that no longer fit in the space the archive
/// originally gave their entry. Allocation starts at the archive's real end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSpace {
    /// The end of the highest allocation so far. Never decreases.
    current: u64,

    /// The size reported to the host for the archive. Allocations past this are unreliable.
    ceiling: u64,
}

impl OffsetSpace {
    pub fn new(original_size: u64, ceiling: u64) -> OffsetSpace {
        OffsetSpace {
            current: original_size,
            ceiling,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Reserves `len` bytes, returning the offset of the reservation. Returns `None` if the
    /// offset can't be described by an entry record, in which case nothing is reserved.
    fn allocate(&mut self, len: u64) -> Option<u32> {
        let offset = u32::try_from(self.current).ok()?;
        self.current += len;

        if self.current > self.ceiling {
            log::error!(
                "{}",
                Fault::CapacityExceeded {
                    size: self.current,
                    ceiling: self.ceiling,
                }
            );
        }

        Some(offset)
    }
}

/// A loose file whose bytes stand in for an entry's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub path: PathBuf,

    /// The length of the file when the entry was first read.
    pub size: u64,
}

/// An entry from an archive's table, along with whatever the engine has done to it.
#[derive(Debug, Clone)]
pub struct VirtualEntry {
    /// The record exactly as it appears in the archive.
    pub original: PackEntry,

    /// The record that the host sees. Identical to `original` unless the entry is redirected.
    pub patched: PackEntry,

    /// The file supplying this entry's data, if it isn't coming from the archive.
    pub replacement: Option<Replacement>,
}

impl VirtualEntry {
    /// Creates an entry that is served from the archive unchanged.
    pub fn unchanged(original: PackEntry) -> VirtualEntry {
        VirtualEntry {
            patched: original.clone(),
            original,
            replacement: None,
        }
    }

    /// Builds the entry for `original`, redirecting it if a replacement exists under
    /// `archive_dir`. Failures to redirect are logged and leave the entry unchanged.
    pub fn materialize(
        original: PackEntry,
        archive_dir: &Path,
        space: &mut OffsetSpace,
    ) -> VirtualEntry {
        let Some(entry_path) = original.path() else {
            log::warn!("Entry path is not valid UTF-8: {:?}", original);
            return VirtualEntry::unchanged(original);
        };

        let candidate = replacement_path(archive_dir, entry_path);

        if !candidate.is_file() {
            log::debug!(
                "No redirection for {} because {:?} does not exist",
                entry_path,
                candidate
            );

            return VirtualEntry::unchanged(original);
        }

        match VirtualEntry::redirect(original.clone(), candidate, space) {
            Ok(entry) => entry,
            Err(err) => {
                log::error!("Unable to redirect {}: {:?}", entry_path, err);
                VirtualEntry::unchanged(original)
            }
        }
    }

    /// Redirects `original` to the file at `path`, patching the sizes, flags and (if the file
    /// doesn't fit in the original allocation) the data offset.
    pub fn redirect(
        original: PackEntry,
        path: PathBuf,
        space: &mut OffsetSpace,
    ) -> Result<VirtualEntry> {
        let size = path
            .metadata()
            .wrap_err_with(|| format!("Unable to get size of replacement file {:?}", path))?
            .len();

        let size_field = u32::try_from(size).map_err(|_| {
            eyre::format_err!(
                "Replacement {:?} is {:#x} bytes, which is too large for an archive entry",
                path,
                size
            )
        })?;

        let mut patched = original.clone();

        // Replacements are always stored verbatim.
        patched.compressed_size = size_field;
        patched.uncompressed_size = size_field;
        patched.flags = 0;

        if size_field > original.compressed_size {
            // Doesn't fit where the original data was, so move it past everything else.
            match space.allocate(size) {
                Some(offset) => patched.data_offset = offset,
                None => log::error!(
                    "{}; {:?} keeps its original offset",
                    Fault::CapacityExceeded {
                        size: space.current(),
                        ceiling: u64::from(u32::MAX),
                    },
                    path
                ),
            }
        }

        log::info!(
            "{} redirected to {:?} ({:#x} -> {:#x} bytes)",
            original.path().unwrap_or("<unrepresentable>"),
            path,
            original.compressed_size,
            size
        );

        Ok(VirtualEntry {
            original,
            patched,
            replacement: Some(Replacement { path, size }),
        })
    }

    pub fn is_redirected(&self) -> bool {
        self.replacement.is_some()
    }
}

/// Returns the path that a replacement for the entry at `entry_path` would have.
///
/// Entry paths may use either kind of slash. Components that would step outside `archive_dir`
/// are dropped.
pub fn replacement_path(archive_dir: &Path, entry_path: &str) -> PathBuf {
    let mut path = archive_dir.to_path_buf();

    for component in entry_path.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }

        path.push(component);
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, compressed_size: u32, data_offset: u32) -> PackEntry {
        let mut entry = PackEntry {
            field_00: 0xdead,
            id: 12,
            field_10a: 7,
            compressed_size,
            uncompressed_size: compressed_size * 2,
            flags: 1,
            data_offset,
            field_11c: 0xbeef,
            ..PackEntry::default()
        };

        entry.set_path(path);
        entry
    }

    #[test]
    fn smaller_replacement_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, [1u8; 0x10]).unwrap();

        let mut space = OffsetSpace::new(0x1000, 0xffff_ffff);
        let original = entry("small.bin", 0x40, 0x80);
        let redirected = VirtualEntry::redirect(original.clone(), path, &mut space).unwrap();

        assert!(redirected.is_redirected());
        assert_eq!(redirected.original, original);
        assert_eq!(redirected.patched.compressed_size, 0x10);
        assert_eq!(redirected.patched.uncompressed_size, 0x10);
        assert_eq!(redirected.patched.flags, 0);
        assert_eq!(redirected.patched.data_offset, 0x80);
        assert_eq!(redirected.patched.field_00, 0xdead);
        assert_eq!(redirected.patched.field_11c, 0xbeef);
        assert_eq!(space.current(), 0x1000);
    }

    #[test]
    fn larger_replacement_moves_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.bin");
        let second = dir.path().join("second.bin");
        std::fs::write(&first, [1u8; 0x100]).unwrap();
        std::fs::write(&second, [2u8; 0x30]).unwrap();

        let mut space = OffsetSpace::new(0x1000, 0xffff_ffff);

        let a = VirtualEntry::redirect(entry("first.bin", 0x10, 0), first, &mut space).unwrap();
        let b = VirtualEntry::redirect(entry("second.bin", 0x20, 0x10), second, &mut space)
            .unwrap();

        assert_eq!(a.patched.data_offset, 0x1000);
        assert_eq!(b.patched.data_offset, 0x1100);
        assert_eq!(space.current(), 0x1130);
    }

    #[test]
    fn exhausted_space_still_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, [0u8; 0x40]).unwrap();

        let mut space = OffsetSpace::new(0xf0, 0x100);
        let redirected = VirtualEntry::redirect(entry("big.bin", 0x10, 0), path, &mut space)
            .unwrap();

        assert_eq!(redirected.patched.data_offset, 0xf0);
        assert_eq!(space.current(), 0x130);
    }

    #[test]
    fn unrepresentable_offset_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, [0u8; 0x40]).unwrap();

        let mut space = OffsetSpace::new(0x1_0000_0000, u64::MAX);
        let redirected = VirtualEntry::redirect(entry("big.bin", 0x10, 0x30), path, &mut space)
            .unwrap();

        assert!(redirected.is_redirected());
        assert_eq!(redirected.patched.compressed_size, 0x40);
        assert_eq!(redirected.patched.data_offset, 0x30);
        assert_eq!(space.current(), 0x1_0000_0000);
    }

    #[test]
    fn missing_replacement_leaves_entry_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = OffsetSpace::new(0x1000, 0xffff_ffff);
        let original = entry("nothing/here.bin", 0x40, 0x80);

        let materialized = VirtualEntry::materialize(original.clone(), dir.path(), &mut space);

        assert!(!materialized.is_redirected());
        assert_eq!(materialized.patched.to_bytes(), original.to_bytes());
    }

    #[test]
    fn entry_paths_are_confined() {
        let root = Path::new("mods").join("data00004");

        assert_eq!(
            replacement_path(&root, "chara\\pc01/../model.g1m"),
            root.join("chara").join("pc01").join("model.g1m")
        );
        assert_eq!(replacement_path(&root, "/abs.bin"), root.join("abs.bin"));
    }
}
