//! Tracks which archives are open, and under which handles.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use case_insensitive_hashmap::CaseInsensitiveHashMap;
use parking_lot::Mutex;

use super::entry::{OffsetSpace, VirtualEntry};
use crate::{native::Handle, pack::PackHeader};

/// Everything known about one archive file. Shared between every handle opened on the same path,
/// and kept after they have all been closed.
#[derive(Debug)]
pub struct ArchiveState {
    /// Unique for the lifetime of the process.
    pub id: usize,

    /// The path the archive was first opened with.
    pub path: String,

    /// The archive's file name without its extension. Replacements for its entries live in a
    /// directory with this name.
    pub name: String,

    /// The real size of the archive file.
    pub original_size: u64,

    pub space: OffsetSpace,

    /// The archive's header, once it has been read.
    pub header: Option<PackHeader>,

    /// Where the payload data begins. Zero until the header is known.
    pub data_start: u64,

    /// One slot for each entry in the archive's table, filled as the host reads them.
    pub entries: Vec<Option<VirtualEntry>>,
}

impl ArchiveState {
    pub fn new(path: &str, original_size: u64, ceiling: u64) -> ArchiveState {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

        // Host paths are Windows paths, so don't rely on the platform's separator.
        let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);

        let name = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("unknown")
            .to_string();

        ArchiveState {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_string(),
            name,
            original_size,
            space: OffsetSpace::new(original_size, ceiling),
            header: None,
            data_start: 0,
            entries: Vec::new(),
        }
    }

    /// Records the header and allocates empty entry slots. Only the first call has any effect.
    pub fn adopt_header(&mut self, header: PackHeader) {
        if self.header.is_some() {
            return;
        }

        self.header = Some(header);
        self.data_start = header.data_start();
        self.entries = vec![None; header.file_count as usize];
    }

    /// Returns the directory containing the replacements for this archive's entries.
    pub fn replacement_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.name)
    }
}

/// Connects an open handle to its archive.
#[derive(Debug)]
pub struct Binding {
    pub archive: Arc<Mutex<ArchiveState>>,

    /// Where the next read without an explicit offset starts.
    position: AtomicU64,
}

impl Binding {
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::SeqCst);
    }
}

/// Maps handles and paths to archive state.
pub struct Registry {
    by_path: CaseInsensitiveHashMap<Arc<Mutex<ArchiveState>>>,
    by_handle: HashMap<Handle, Arc<Binding>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            by_path: CaseInsensitiveHashMap::new(),
            by_handle: HashMap::new(),
        }
    }

    /// Returns the state for the archive at `path`, if it has been opened before.
    pub fn archive(&self, path: &str) -> Option<Arc<Mutex<ArchiveState>>> {
        self.by_path.get(path).cloned()
    }

    /// Binds `handle` to the archive at `path`, creating state for the archive with
    /// `create_state` if it hasn't been seen before. Nothing is bound if `create_state` fails.
    pub fn on_open<E>(
        &mut self,
        path: &str,
        handle: Handle,
        create_state: impl FnOnce() -> Result<ArchiveState, E>,
    ) -> Result<Arc<Mutex<ArchiveState>>, E> {
        let archive = match self.archive(path) {
            Some(archive) => archive,
            None => {
                let archive = Arc::new(Mutex::new(create_state()?));
                self.by_path.insert(path, archive.clone());

                log::info!("Registered {}", path);
                archive
            }
        };

        let binding = Arc::new(Binding {
            archive: archive.clone(),
            position: AtomicU64::new(0),
        });

        if self.by_handle.insert(handle, binding).is_some() {
            log::debug!("Handle {:#x} for {} was still bound to an archive", handle, path);
        }

        log::debug!("Handle {:#x} for {} registered", handle, path);
        Ok(archive)
    }

    /// Removes the binding for `handle`. The archive's state is kept.
    pub fn on_close(&mut self, handle: Handle) -> bool {
        self.by_handle.remove(&handle).is_some()
    }

    pub fn lookup(&self, handle: Handle) -> Result<Arc<Binding>, std::io::Error> {
        self.by_handle.get(&handle).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("handle {:#x} is not bound to an archive", handle),
            )
        })
    }
}
