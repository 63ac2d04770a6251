use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use super::error::PauseError;

/// Default location of the run-control pause/resume flag
pub const DEFAULT_PAUSE_SHM_PATH: &str = "/dev/shm/cpr_pause_resume";

/// Run-control view consulted by the transport and the relay loop.
///
/// Both queries are pure reads; the run state itself is driven by an external controller.
/// The acknowledge hooks let an in-process controller observe that the relay reached
/// stand-by or left it. They do nothing by default.
pub trait PauseSignal {
    fn is_pause_requested(&self) -> bool;
    fn is_recovering(&self) -> bool;

    /// Whether an operator drives this signal. After a socket failure the relay waits for
    /// that operator to pause and resume it; without one it resumes at once.
    fn is_controlled(&self) -> bool {
        true
    }

    fn acknowledge_pause(&self) {}
    fn acknowledge_resume(&self) {}
}

/// Signal for running without run control. Never pauses, and always allows an immediate resume.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRunControl;

impl PauseSignal for NoRunControl {
    fn is_pause_requested(&self) -> bool {
        false
    }

    fn is_recovering(&self) -> bool {
        true
    }

    fn is_controlled(&self) -> bool {
        false
    }
}

/// Pause flag shared with slow control through a memory-mapped file.
///
/// The first 32-bit word of the file is the flag: non-zero requests a pause, zero means the
/// run may (re)start.
#[derive(Debug)]
pub struct ShmPauseSignal {
    path: PathBuf,
    mmap: Mmap,
}

impl ShmPauseSignal {
    pub fn open(path: &Path) -> Result<Self, PauseError> {
        if !path.exists() {
            return Err(PauseError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        if file.metadata()?.len() < std::mem::size_of::<i32>() as u64 {
            return Err(PauseError::TooSmall(path.to_path_buf()));
        }
        // SAFETY: the file holds at least one word and is only ever read through this mapping
        let mmap = unsafe {
            MmapOptions::new()
                .len(std::mem::size_of::<i32>())
                .map(&file)?
        };
        spdlog::info!("Mapped run-control flag {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flag(&self) -> i32 {
        // SAFETY: the mapping is page aligned and at least one i32 long. Volatile because
        // another process updates the word behind our back.
        unsafe { std::ptr::read_volatile(self.mmap.as_ptr() as *const i32) }
    }
}

impl PauseSignal for ShmPauseSignal {
    fn is_pause_requested(&self) -> bool {
        self.flag() != 0
    }

    fn is_recovering(&self) -> bool {
        self.flag() == 0
    }
}

/// The run control a relay process actually uses: the shared-memory flag when one is
/// configured, otherwise none.
#[derive(Debug)]
pub enum RunControl {
    Shm(ShmPauseSignal),
    Absent(NoRunControl),
}

impl RunControl {
    pub fn open(path: Option<&Path>) -> Result<Self, PauseError> {
        match path {
            Some(path) => Ok(Self::Shm(ShmPauseSignal::open(path)?)),
            None => {
                spdlog::warn!("No run-control flag configured; pause requests will be ignored");
                Ok(Self::Absent(NoRunControl))
            }
        }
    }
}

impl PauseSignal for RunControl {
    fn is_pause_requested(&self) -> bool {
        match self {
            Self::Shm(signal) => signal.is_pause_requested(),
            Self::Absent(signal) => signal.is_pause_requested(),
        }
    }

    fn is_recovering(&self) -> bool {
        match self {
            Self::Shm(signal) => signal.is_recovering(),
            Self::Absent(signal) => signal.is_recovering(),
        }
    }

    fn is_controlled(&self) -> bool {
        match self {
            Self::Shm(signal) => signal.is_controlled(),
            Self::Absent(signal) => signal.is_controlled(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    PauseRequested = 1,
    Paused = 2,
    Resuming = 3,
}

impl From<u8> for RunState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::PauseRequested,
            2 => Self::Paused,
            3 => Self::Resuming,
            _ => Self::Running,
        }
    }
}

/// In-process run state, shared between a controller and the relay.
///
/// Running -> PauseRequested -> Paused -> Resuming -> Running. Transitions out of order are
/// ignored and reported as false.
#[derive(Debug, Clone)]
pub struct SharedRunState {
    state: Arc<AtomicU8>,
}

impl Default for SharedRunState {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RunState::Running as u8)),
        }
    }
}

impl SharedRunState {
    pub fn state(&self) -> RunState {
        RunState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn request_pause(&self) -> bool {
        self.transition(RunState::Running, RunState::PauseRequested)
    }

    pub fn request_resume(&self) -> bool {
        self.transition(RunState::Paused, RunState::Resuming)
    }
}

impl PauseSignal for SharedRunState {
    fn is_pause_requested(&self) -> bool {
        matches!(self.state(), RunState::PauseRequested | RunState::Paused)
    }

    fn is_recovering(&self) -> bool {
        self.state() == RunState::Resuming
    }

    fn acknowledge_pause(&self) {
        self.transition(RunState::PauseRequested, RunState::Paused);
    }

    fn acknowledge_resume(&self) {
        self.transition(RunState::Resuming, RunState::Running);
    }
}

/// Cooperative cancellation flag, checked on every retry of a blocking operation
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
