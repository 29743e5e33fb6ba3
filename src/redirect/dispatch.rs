//! Works out what each read from an archive is for, and answers it.
//!
//! The host reads an archive in a fixed pattern: the header, then (some of) the entry records,
//! then the data for the entries it wants. We only learn about entries when the host reads their
//! records, so redirection decisions are made one entry at a time as the records go past.

use std::path::Path;

use parking_lot::Mutex;

use super::{
    cache::{EntryKey, StreamCache},
    entry::{Replacement, VirtualEntry},
    registry::ArchiveState,
};
use crate::{
    error::Fault,
    native::{Handle, NativeIo, ReadOutcome, Status},
    pack::{PackEntry, PackHeader, ENTRY_SIZE, HEADER_SIZE},
};

/// The part of an archive that a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Region {
    Header,

    /// The record for the entry with the given index.
    Entry(usize),

    Payload,

    /// Something that isn't a whole header or a whole record.
    Unknown,
}

/// Where the bytes in a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The real file.
    Native,

    /// Metadata we had already read.
    Cached,

    /// A replacement file.
    Replacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub outcome: ReadOutcome,
    pub source: Source,
}

impl Reply {
    fn cached(transferred: usize) -> Reply {
        Reply {
            outcome: ReadOutcome::success(transferred),
            source: Source::Cached,
        }
    }
}

/// What a read needs from outside the archive's own state.
pub struct ReadContext<'a, N> {
    pub native: &'a N,
    pub cache: &'a Mutex<StreamCache>,
    pub replacement_root: &'a Path,
    pub handle: Handle,
}

/// Classifies a read of `length` bytes at `offset`.
pub fn classify(archive: &ArchiveState, offset: u64, length: usize) -> Region {
    let header_size = HEADER_SIZE as u64;
    let entry_size = ENTRY_SIZE as u64;

    if offset == 0 && length == HEADER_SIZE {
        return Region::Header;
    }

    if offset >= header_size && offset < archive.data_start && length == ENTRY_SIZE {
        let relative = offset - header_size;

        return if relative % entry_size == 0 {
            Region::Entry((relative / entry_size) as usize)
        } else {
            Region::Unknown
        };
    }

    // Before the header has been read, `data_start` is zero, so everything else ends up here and
    // gets passed through.
    if offset >= archive.data_start {
        return Region::Payload;
    }

    Region::Unknown
}

/// Answers a read of `buffer.len()` bytes at `offset`.
///
/// The archive stays locked while metadata is read, so each header and record is only ever
/// materialized once. Payload reads only need the lock to find their entry.
pub fn read<N: NativeIo>(
    ctx: &ReadContext<'_, N>,
    archive: &Mutex<ArchiveState>,
    offset: u64,
    buffer: &mut [u8],
) -> Reply {
    let mut state = archive.lock();
    let region = classify(&state, offset, buffer.len());

    log::trace!(
        "{} hnd {:#x}: {} read at {:#010x}, length {:#x}",
        state.name,
        ctx.handle,
        region,
        offset,
        buffer.len()
    );

    match region {
        Region::Header => read_header(ctx, &mut state, buffer),
        Region::Entry(index) => read_entry(ctx, &mut state, index, offset, buffer),
        Region::Payload => {
            let target = payload_target(ctx, &state, offset, buffer.len());
            drop(state);

            match target {
                Some(target) => read_replacement(ctx, &target, buffer),
                None => forward(ctx, offset, buffer),
            }
        }
        Region::Unknown => {
            log::error!(
                "{} hnd {:#x}: {}",
                state.name,
                ctx.handle,
                Fault::ClassificationFailure {
                    offset,
                    length: buffer.len(),
                }
            );

            drop(state);
            forward(ctx, offset, buffer)
        }
    }
}

fn forward<N: NativeIo>(ctx: &ReadContext<'_, N>, offset: u64, buffer: &mut [u8]) -> Reply {
    Reply {
        outcome: ctx.native.read(ctx.handle, Some(offset), buffer),
        source: Source::Native,
    }
}

/// Returns `true` if `reply` filled all `length` bytes.
fn filled(reply: &Reply, length: usize) -> bool {
    reply.outcome.is_success() && reply.outcome.transferred >= length
}

fn read_header<N: NativeIo>(
    ctx: &ReadContext<'_, N>,
    archive: &mut ArchiveState,
    buffer: &mut [u8],
) -> Reply {
    if let Some(header) = archive.header {
        buffer.copy_from_slice(&header.to_bytes());
        return Reply::cached(buffer.len());
    }

    let reply = forward(ctx, 0, buffer);

    if !filled(&reply, HEADER_SIZE) {
        return reply;
    }

    let header = match PackHeader::from_bytes(buffer) {
        Ok(header) => header,
        Err(err) => {
            log::error!("{} hnd {:#x}: bad header: {}", archive.name, ctx.handle, err);
            return reply;
        }
    };

    if !header.has_signature() {
        log::warn!(
            "{} hnd {:#x}: unexpected signature {:#018x}",
            archive.name,
            ctx.handle,
            header.signature
        );
    }

    // A table that runs past the end of the file means this isn't really an archive. Don't size
    // the entry table from it.
    if header.data_start() > archive.original_size {
        log::error!(
            "{} hnd {:#x}: {}",
            archive.name,
            ctx.handle,
            Fault::HeaderRejected {
                data_start: header.data_start(),
                size: archive.original_size,
            }
        );

        return reply;
    }

    archive.adopt_header(header);

    log::info!(
        "{} hnd {:#x}: DW_PACK header in {}: index {} file count {}",
        archive.name,
        ctx.handle,
        archive.path,
        header.index,
        header.file_count
    );

    reply
}

fn read_entry<N: NativeIo>(
    ctx: &ReadContext<'_, N>,
    archive: &mut ArchiveState,
    index: usize,
    offset: u64,
    buffer: &mut [u8],
) -> Reply {
    let count = archive.entries.len();

    if index >= count {
        log::error!(
            "{} hnd {:#x}: {}",
            archive.name,
            ctx.handle,
            Fault::IndexOutOfRange { index, count }
        );

        return Reply::cached(0);
    }

    if let Some(entry) = &archive.entries[index] {
        buffer.copy_from_slice(&entry.patched.to_bytes());

        log::trace!(
            "{} hnd {:#x}: repeat entry access {:?}",
            archive.name,
            ctx.handle,
            entry.patched
        );

        return Reply::cached(buffer.len());
    }

    let reply = forward(ctx, offset, buffer);

    if !filled(&reply, ENTRY_SIZE) {
        return reply;
    }

    let original = match PackEntry::from_bytes(buffer) {
        Ok(entry) => entry,
        Err(err) => {
            log::error!("{} hnd {:#x}: bad entry {}: {}", archive.name, ctx.handle, index, err);
            return reply;
        }
    };

    log::debug!(
        "{} hnd {:#x}: entry access {:?} at {:#010x}",
        archive.name,
        ctx.handle,
        original,
        archive.data_start + u64::from(original.data_offset)
    );

    let dir = archive.replacement_dir(ctx.replacement_root);
    let entry = VirtualEntry::materialize(original, &dir, &mut archive.space);

    if entry.is_redirected() {
        buffer.copy_from_slice(&entry.patched.to_bytes());

        log::debug!(
            "{} hnd {:#x}: patched entry {:?}",
            archive.name,
            ctx.handle,
            entry.patched
        );
    }

    archive.entries[index] = Some(entry);
    reply
}

/// A payload read that a replacement file answers.
struct ReplacementRead {
    archive: String,
    key: EntryKey,
    replacement: Replacement,
    local: u64,
}

/// Finds the replacement that should answer a payload read. `None` means the read goes to the
/// real file.
fn payload_target<N: NativeIo>(
    ctx: &ReadContext<'_, N>,
    archive: &ArchiveState,
    offset: u64,
    length: usize,
) -> Option<ReplacementRead> {
    let end = offset + length as u64;

    // Entries we haven't seen the records for can't own anything yet.
    let materialized = archive
        .entries
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index, entry)));

    for (index, entry) in materialized {
        let range = entry.patched.data_range(archive.data_start);

        if offset < range.start || offset >= range.end || end > range.end {
            continue;
        }

        let Some(replacement) = &entry.replacement else {
            log::trace!(
                "{} hnd {:#x}: {} data access at {:#010x}, length {:#x}",
                archive.name,
                ctx.handle,
                entry.patched.path().unwrap_or("<unrepresentable>"),
                offset,
                length
            );

            return None;
        };

        let local = offset - range.start;

        if local > replacement.size {
            log::error!(
                "{} hnd {:#x}: {}",
                archive.name,
                ctx.handle,
                Fault::OffsetOutOfBounds {
                    local,
                    size: replacement.size,
                    path: replacement.path.clone(),
                }
            );

            continue;
        }

        return Some(ReplacementRead {
            archive: archive.name.clone(),
            key: EntryKey {
                archive: archive.id,
                index,
            },
            replacement: replacement.clone(),
            local,
        });
    }

    // Padding between entries isn't covered by any entry's size, so this isn't always a problem.
    log::warn!(
        "{} hnd {:#x}: {}",
        archive.name,
        ctx.handle,
        Fault::UnattributedRead { offset, length }
    );

    None
}

fn read_replacement<N: NativeIo>(
    ctx: &ReadContext<'_, N>,
    target: &ReplacementRead,
    buffer: &mut [u8],
) -> Reply {
    let replacement = &target.replacement;

    log::trace!(
        "{} hnd {:#x}: reading {:#x} bytes from {:?} at {:#x}",
        target.archive,
        ctx.handle,
        buffer.len(),
        replacement.path,
        target.local
    );

    let result = ctx
        .cache
        .lock()
        .read_at(target.key, &replacement.path, target.local, buffer);

    let outcome = match result {
        Ok(read) => {
            if read != buffer.len() {
                log::error!(
                    "{} hnd {:#x}: {}",
                    target.archive,
                    ctx.handle,
                    Fault::ShortRead {
                        expected: buffer.len(),
                        actual: read,
                        path: replacement.path.clone(),
                    }
                );
            }

            ReadOutcome::success(read)
        }

        Err(err) => {
            log::error!(
                "{} hnd {:#x}: {}",
                target.archive,
                ctx.handle,
                Fault::ReplacementUnavailable {
                    path: replacement.path.clone(),
                    reason: format!("{:?}", err),
                }
            );

            ReadOutcome::failure(Status::UNSUCCESSFUL)
        }
    };

    Reply {
        outcome,
        source: Source::Replacement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::SIGNATURE;

    fn archive_with_header(file_count: u32) -> ArchiveState {
        let mut archive = ArchiveState::new("data00000.pac", 0x10_0000, 0xffff_ffff);

        archive.adopt_header(PackHeader {
            signature: SIGNATURE,
            field_08: 0,
            file_count,
            index: 0,
        });

        archive
    }

    #[test]
    fn classifies_by_offset_and_length() {
        let archive = archive_with_header(3);
        let data_start = (HEADER_SIZE + 3 * ENTRY_SIZE) as u64;

        assert_eq!(classify(&archive, 0, HEADER_SIZE), Region::Header);
        assert_eq!(
            classify(&archive, HEADER_SIZE as u64, ENTRY_SIZE),
            Region::Entry(0)
        );
        assert_eq!(
            classify(&archive, (HEADER_SIZE + 2 * ENTRY_SIZE) as u64, ENTRY_SIZE),
            Region::Entry(2)
        );
        assert_eq!(classify(&archive, data_start, 0x800), Region::Payload);
        assert_eq!(classify(&archive, data_start + 0x10, 1), Region::Payload);
    }

    #[test]
    fn unexpected_reads_are_unknown() {
        let archive = archive_with_header(3);

        // Misaligned record read.
        assert_eq!(
            classify(&archive, HEADER_SIZE as u64 + 4, ENTRY_SIZE),
            Region::Unknown
        );

        // Whole table in one go.
        assert_eq!(
            classify(&archive, HEADER_SIZE as u64, 3 * ENTRY_SIZE),
            Region::Unknown
        );

        assert_eq!(classify(&archive, 0, 0x1000), Region::Unknown);
    }

    #[test]
    fn everything_is_payload_before_header() {
        let archive = ArchiveState::new("data00000.pac", 0x1000, 0xffff_ffff);

        assert_eq!(classify(&archive, 0, HEADER_SIZE), Region::Header);
        assert_eq!(
            classify(&archive, HEADER_SIZE as u64, ENTRY_SIZE),
            Region::Payload
        );
    }
}
