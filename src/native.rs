//! The real file primitives that the engine either forwards to or answers in place of.

/// The host's value for an open file handle.
pub type Handle = usize;

/// An NTSTATUS-style result code. Non-negative values indicate success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const UNSUCCESSFUL: Status = Status(0xc000_0001_u32 as i32);
    pub const INVALID_HANDLE: Status = Status(0xc000_0008_u32 as i32);
    pub const END_OF_FILE: Status = Status(0xc000_0011_u32 as i32);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// The result of a read: a status, and the number of bytes placed in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub status: Status,
    pub transferred: usize,
}

impl ReadOutcome {
    pub fn success(transferred: usize) -> ReadOutcome {
        ReadOutcome {
            status: Status::SUCCESS,
            transferred,
        }
    }

    pub fn failure(status: Status) -> ReadOutcome {
        ReadOutcome {
            status,
            transferred: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Access to the host's original (unhooked) file functions.
pub trait NativeIo {
    /// Reads into `buffer` from `offset`, or from the handle's current position if `offset` is
    /// `None`.
    fn read(&self, handle: Handle, offset: Option<u64>, buffer: &mut [u8]) -> ReadOutcome;

    /// Moves the handle's position.
    fn set_position(&self, handle: Handle, position: u64) -> Status;

    /// Returns the real end-of-file offset for the handle.
    fn query_size(&self, handle: Handle) -> Result<u64, Status>;
}
