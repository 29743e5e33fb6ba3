//! Presents archives to the host as though replacement files had been packed into them.
//!
//! Nothing is ever written to an archive. Instead, the records that the host reads from an
//! archive's entry table are patched on their way into the host's buffer, and reads of the data
//! for patched entries are answered from the replacement files. Replacements that are larger than
//! the data they replace are given offsets past the real end of the archive, which is why the
//! host is told that every archive is as large as it can be.

mod cache;
mod dispatch;
mod entry;
mod registry;

use std::path::PathBuf;

use eyre::{Context, Result};
use parking_lot::Mutex;
use regex::Regex;

pub use cache::EntryKey;
pub use dispatch::{Region, Source};
pub use entry::{OffsetSpace, Replacement, VirtualEntry};
pub use registry::ArchiveState;

use crate::{
    native::{Handle, NativeIo, ReadOutcome, Status},
    settings::Options,
};
use cache::StreamCache;
use dispatch::ReadContext;
use registry::Registry;

/// The interception engine. One of these handles every archive in the process.
pub struct Redirector<N> {
    native: N,
    archive_pattern: Regex,
    replacement_root: PathBuf,
    virtual_ceiling: u64,
    registry: Mutex<Registry>,
    cache: Mutex<StreamCache>,
}

impl<N: NativeIo> Redirector<N> {
    /// Creates a redirector that uses `native` to access the real files.
    pub fn new(native: N, options: &Options) -> Result<Redirector<N>> {
        let archive_pattern = Regex::new(&options.archive_pattern).wrap_err_with(|| {
            format!("Invalid archive name pattern '{}'", options.archive_pattern)
        })?;

        Ok(Redirector {
            native,
            archive_pattern,
            replacement_root: options.replacement_root.clone(),
            virtual_ceiling: options.virtual_ceiling,
            registry: Mutex::new(Registry::new()),
            cache: Mutex::new(StreamCache::new()),
        })
    }

    pub fn native(&self) -> &N {
        &self.native
    }

    /// Returns `true` if files at `path` should be handled by the redirector.
    pub fn accepts_path(&self, path: &str) -> bool {
        self.archive_pattern.is_match(path)
    }

    /// Returns `true` if `handle` is bound to an archive.
    pub fn owns(&self, handle: Handle) -> bool {
        self.registry.lock().lookup(handle).is_ok()
    }

    /// Returns the shared state for the archive at `path`, if it has been opened.
    pub fn archive(&self, path: &str) -> Option<std::sync::Arc<Mutex<ArchiveState>>> {
        self.registry.lock().archive(path)
    }

    /// Called after the host has opened `path` as `handle`. Returns `true` if the redirector
    /// has taken responsibility for the handle.
    pub fn on_open(&self, path: &str, handle: Handle) -> bool {
        if !self.accepts_path(path) {
            return false;
        }

        // Query the size without holding the registry lock. If another handle registers the same
        // path in the meantime, its state wins and this size goes unused.
        let existing = self.registry.lock().archive(path);

        let size = match existing {
            Some(_) => Ok(0),
            None => self.native.query_size(handle).map_err(|status| {
                eyre::format_err!("Size query for '{}' failed with {}", path, status)
            }),
        };

        let create_state = || -> Result<ArchiveState> {
            Ok(ArchiveState::new(path, size?, self.virtual_ceiling))
        };

        match self.registry.lock().on_open(path, handle, create_state) {
            Ok(_) => true,
            Err(err) => {
                log::error!("Not redirecting '{}': {:?}", path, err);
                false
            }
        }
    }

    /// Called when the host closes `handle`.
    pub fn on_close(&self, handle: Handle) {
        if self.registry.lock().on_close(handle) {
            log::debug!("Handle {:#x} closed", handle);
        }
    }

    /// Answers a read request. `offset` is `None` when the host wants to read from the handle's
    /// current position.
    pub fn on_read(&self, handle: Handle, offset: Option<u64>, buffer: &mut [u8]) -> ReadOutcome {
        // Don't hold the registry lock during I/O.
        let binding = self.registry.lock().lookup(handle);

        let binding = match binding {
            Ok(binding) => binding,
            Err(_) => return self.native.read(handle, offset, buffer),
        };

        let offset = offset.unwrap_or_else(|| binding.position());

        let ctx = ReadContext {
            native: &self.native,
            cache: &self.cache,
            replacement_root: &self.replacement_root,
            handle,
        };

        let reply = dispatch::read(&ctx, &binding.archive, offset, buffer);

        if !reply.outcome.is_success() {
            log::error!(
                "{} hnd {:#x}: read failed with {}",
                binding.archive.lock().name,
                handle,
                reply.outcome.status
            );

            return reply.outcome;
        }

        let position = offset + reply.outcome.transferred as u64;
        binding.set_position(position);

        if reply.source == Source::Replacement {
            // The real file hasn't moved, but anything else looking at its position should see
            // the same thing as we do. This will often be past the real end of the file, so the
            // result is ignored.
            let _ = self.native.set_position(handle, position);
        }

        reply.outcome
    }

    /// Answers a request to move the position of `handle`.
    pub fn on_set_position(&self, handle: Handle, position: u64) -> Status {
        let status = self.native.set_position(handle, position);

        let binding = match self.registry.lock().lookup(handle) {
            Ok(binding) => binding,
            Err(_) => return status,
        };

        binding.set_position(position);
        log::trace!("Hnd {:#x}: position -> {:#010x}", handle, position);

        // Positions past the real end of the archive are expected, so the real result is
        // irrelevant.
        Status::SUCCESS
    }

    /// Answers a size query for `handle`. Owned handles always report the virtual ceiling so the
    /// host never stops short of a relocated entry.
    pub fn on_query_size(&self, handle: Handle) -> Result<u64, Status> {
        let result = self.native.query_size(handle);

        if !self.owns(handle) {
            return result;
        }

        if let Err(status) = result {
            log::warn!("Hnd {:#x}: real size query failed with {}", handle, status);
        }

        Ok(self.virtual_ceiling)
    }
}
