//! Test doubles shared between test modules.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex};

use crate::{
    native::{Handle, NativeIo, ReadOutcome, Status},
    pack::{PackEntry, PackHeader, ENTRY_SIZE, HEADER_SIZE, SIGNATURE},
};

struct MemoryFile {
    bytes: Vec<u8>,
    position: u64,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    open: bool,
}

/// Holds up calls on one handle until the test lets them through.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock();
        state.entered = true;
        self.changed.notify_all();

        while !state.open {
            self.changed.wait(&mut state);
        }
    }

    /// Blocks until a call is waiting at the gate.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock();

        while !state.entered {
            self.changed.wait(&mut state);
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }
}

/// In-memory files standing in for the host's real ones. Counts real reads so tests can tell
/// when a read was answered without touching the file.
pub struct MemoryIo {
    files: Mutex<HashMap<Handle, MemoryFile>>,
    reads: AtomicUsize,
    gate: Mutex<Option<(Handle, Arc<Gate>)>>,
}

impl MemoryIo {
    pub fn new() -> MemoryIo {
        MemoryIo {
            files: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn insert(&self, handle: Handle, bytes: Vec<u8>) {
        self.files
            .lock()
            .insert(handle, MemoryFile { bytes, position: 0 });
    }

    /// Makes every later call on `handle` fail as though the handle were invalid.
    pub fn remove(&self, handle: Handle) {
        self.files.lock().remove(&handle);
    }

    /// Makes reads and size queries on `handle` wait at the returned gate.
    pub fn gate(&self, handle: Handle) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock() = Some((handle, gate.clone()));
        gate
    }

    fn pass_gate(&self, handle: Handle) {
        let gate = match &*self.gate.lock() {
            Some((gated, gate)) if *gated == handle => gate.clone(),
            _ => return,
        };

        gate.pass();
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn position(&self, handle: Handle) -> u64 {
        self.files.lock()[&handle].position
    }
}

impl NativeIo for MemoryIo {
    fn read(&self, handle: Handle, offset: Option<u64>, buffer: &mut [u8]) -> ReadOutcome {
        self.pass_gate(handle);
        self.reads.fetch_add(1, Ordering::SeqCst);

        let mut files = self.files.lock();
        let Some(file) = files.get_mut(&handle) else {
            return ReadOutcome::failure(Status::INVALID_HANDLE);
        };

        let start = offset.unwrap_or(file.position) as usize;
        if start >= file.bytes.len() {
            return ReadOutcome::failure(Status::END_OF_FILE);
        }

        let count = buffer.len().min(file.bytes.len() - start);
        buffer[..count].copy_from_slice(&file.bytes[start..start + count]);
        file.position = (start + count) as u64;

        ReadOutcome::success(count)
    }

    fn set_position(&self, handle: Handle, position: u64) -> Status {
        match self.files.lock().get_mut(&handle) {
            Some(file) => {
                file.position = position;
                Status::SUCCESS
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn query_size(&self, handle: Handle) -> Result<u64, Status> {
        self.pass_gate(handle);

        self.files
            .lock()
            .get(&handle)
            .map(|file| file.bytes.len() as u64)
            .ok_or(Status::INVALID_HANDLE)
    }
}

/// Builds archive images with the entries' data packed back to back.
pub struct PackBuilder {
    index: u32,
    entries: Vec<(String, Vec<u8>, u32)>,
}

impl PackBuilder {
    pub fn new(index: u32) -> PackBuilder {
        PackBuilder {
            index,
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, path: &str, data: &[u8], flags: u32) -> PackBuilder {
        self.entries.push((path.to_string(), data.to_vec(), flags));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let header = PackHeader {
            signature: SIGNATURE,
            field_08: 0,
            file_count: self.entries.len() as u32,
            index: self.index,
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE);
        bytes.extend_from_slice(&header.to_bytes());

        let mut data_offset = 0u32;

        for (id, (path, data, flags)) in self.entries.iter().enumerate() {
            let mut entry = PackEntry {
                field_00: 1,
                id: id as u16,
                compressed_size: data.len() as u32,
                // Pretend compressed entries would inflate to twice their size.
                uncompressed_size: data.len() as u32 * if *flags != 0 { 2 } else { 1 },
                flags: *flags,
                data_offset,
                field_11c: 0x5151,
                ..PackEntry::default()
            };

            entry.set_path(path);
            bytes.extend_from_slice(&entry.to_bytes());

            data_offset += data.len() as u32;
        }

        for (_, data, _) in &self.entries {
            bytes.extend_from_slice(data);
        }

        bytes
    }
}
