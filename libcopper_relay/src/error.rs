use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::status::RelayStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("RawCopper access at word {offset} is out of range for a record of {length} words")]
    OutOfRange { offset: usize, length: usize },
    #[error("RawCopper was given a length of {0} words but the buffer only holds {1}")]
    LengthExceedsBuffer(usize, usize),
    #[error("Invalid block number {0} requested from RawCopper with {1} entries")]
    BadBlockIndex(usize, usize),
    #[error("Invalid FINESSE slot {0}; expected 0 to {max}", max = MAX_FINESSE_SLOTS - 1)]
    BadFinesseSlot(usize),
    #[error("CORRUPTED DATA: block {block} declares {declared} words which runs past the end of the record ({length} words)")]
    CorruptLength {
        block: usize,
        declared: usize,
        length: usize,
    },
    #[error("CORRUPTED DATA: COPPER block {block} declares {declared} words but its data length field implies {computed}")]
    LengthMismatch {
        block: usize,
        declared: usize,
        computed: usize,
    },
    #[error("CORRUPTED DATA: block lengths sum to {walked} words but the record holds {length}")]
    WalkMismatch { walked: usize, length: usize },
    #[error("CORRUPTED DATA: Different event number over HSLBs in block {block} -- A: {a:x?} B: {b:x?} C: {c:x?} D: {d:x?}", a=.values[0], b=.values[1], c=.values[2], d=.values[3])]
    EventNumberMismatch {
        block: usize,
        values: [Option<u32>; MAX_FINESSE_SLOTS],
    },
    #[error("No FINESSE data in COPPER block {0}")]
    NoFinesseData(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("No pre-allocated buffers are left ({capacity} in use). Not enough buffers are allocated or reset_cycle was not called this event loop")]
    Exhausted { capacity: usize },
    #[error("BufferHandle from cycle {handle} was used after the pool moved on to cycle {current}")]
    StaleHandle { handle: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("CORRUPTED DATA: No COPPER blocks in a record of {entries} entries ({words} words)")]
    NoCopperBlock { entries: usize, words: usize },
    #[error("Record of {events} events and {nodes} nodes does not fit the 16-bit SendHeader fields")]
    TooManyEntries { events: usize, nodes: usize },
    #[error("Length error. Total send length {total} does not match the embedded block length {embedded} + 8")]
    LengthMismatch { total: usize, embedded: usize },
    #[error("FrameBuilder failed due to RawCopper error: {0}")]
    RecordError(#[from] RecordError),
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("Hostname {host} cannot be resolved: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
    #[error("Hostname {0} did not resolve to any address")]
    NoAddress(String),
    #[error("Failed to create listen socket: {0}")]
    Socket(std::io::Error),
    #[error("Failed to bind port {port}; maybe another program already occupies it: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("Failed in listen: {0}")]
    Listen(std::io::Error),
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
    #[error("Failed to set socket option on accepted connection: {0}")]
    SocketOption(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Hostname {host} cannot be resolved: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
    #[error("Hostname {0} did not resolve to any address")]
    NoAddress(String),
    #[error("Connecting to {0} was cancelled")]
    Cancelled(String),
    #[error("Failed to set socket option on upstream connection: {0}")]
    SocketOption(std::io::Error),
}

/// Outcome of a failed send. `Paused`, `Cancelled` and `Recoverable` leave the process
/// running so the caller can wait for run control; `Fatal` should end the run.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Send interrupted by a run-pause request")]
    Paused,
    #[error("Send cancelled")]
    Cancelled,
    #[error("Send failed with a recoverable socket error: {0}")]
    Recoverable(std::io::Error),
    #[error("Send failed with a fatal socket error: {0}")]
    Fatal(std::io::Error),
}

impl SendError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("Receive interrupted by a run-pause request")]
    Paused,
    #[error("Receive cancelled")]
    Cancelled,
    #[error("Receive failed with a recoverable socket error: {0}")]
    Recoverable(std::io::Error),
    #[error("Receive failed with a fatal socket error: {0}")]
    Fatal(std::io::Error),
    #[error("CORRUPTED DATA: SendHeader declares {total} words which leaves a body of {body} words (allowed 1 to {max})")]
    BadBodySize { total: u32, body: i64, max: usize },
    #[error("CORRUPTED DATA: Inconsistent SendHeader value. {nodes} nodes times {events} events differs from {entries} entries")]
    EntryCountMismatch {
        entries: usize,
        events: usize,
        nodes: usize,
    },
    #[error("CORRUPTED DATA: SendTrailer terminator is {0:#010x}; expected {exp:#010x}", exp=MAGIC_WORD_SEND_TRAILER)]
    BadTrailer(u32),
    #[error("CORRUPTED DATA: SendTrailer checksum {found:#010x} differs from the body checksum {expected:#010x}")]
    BadChecksum { expected: u32, found: u32 },
    #[error("Receiver failed due to RawCopper error: {0}")]
    RecordError(#[from] RecordError),
    #[error("Receiver failed due to BufferPool error: {0}")]
    PoolError(#[from] PoolError),
}

impl RecvError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Cancelled | Self::Recoverable(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataCheckError {
    #[error("CORRUPTED DATA: Invalid magic words in entry {entry} -- driver header {w0:#010x} FPGA header {w1:#010x} FPGA trailer {w2:#010x} driver trailer {w3:#010x}", w0=.words[0], w1=.words[1], w2=.words[2], w3=.words[3])]
    BadMagic { entry: usize, words: [u32; 4] },
    #[error("CORRUPTED DATA: Event # in raw header and FEE header differ in entry {entry} -- header {header:#x} FEE {fee:#x}")]
    FeeEventMismatch { entry: usize, header: u32, fee: u32 },
    #[error("CORRUPTED DATA: Event # jump in entry {entry} -- prev {prev:#x} cur {cur:#x}")]
    EventJump { entry: usize, prev: u32, cur: u32 },
    #[error("COPPER counter jump in entry {entry} -- prev {prev:#x} cur {cur:#x}")]
    CopperCounterJump { entry: usize, prev: u32, cur: u32 },
    #[error("CORRUPTED DATA: Invalid event # at the beginning of a run in entry {entry} (it should be zero) -- prev run {prev_run:#010x} cur run {cur_run:#010x} event {cur:#x}")]
    RunStartEvent {
        entry: usize,
        prev_run: u32,
        cur_run: u32,
        cur: u32,
    },
    #[error("CORRUPTED DATA: utime or ctime differ over FINESSE slots in entry {entry} -- utime {utimes:x?} ctime {ctimes:x?}")]
    FinesseTimeMismatch {
        entry: usize,
        utimes: [Option<u32>; MAX_FINESSE_SLOTS],
        ctimes: [Option<u32>; MAX_FINESSE_SLOTS],
    },
    #[error("CORRUPTED DATA: Driver checksum mismatch in entry {entry} -- calculated {calculated:#010x} recorded {recorded:#010x}")]
    DriverChecksum {
        entry: usize,
        calculated: u32,
        recorded: u32,
    },
    #[error("CORRUPTED DATA: Event or time record mismatch over nodes in event {event}: {records:x?}")]
    NodeMismatch {
        event: usize,
        records: Vec<(u32, u32, u32)>,
    },
    #[error("DataCheck failed due to RawCopper error: {0}")]
    RecordError(#[from] RecordError),
}

#[derive(Debug, Error)]
pub enum PauseError {
    #[error("Could not open run-control flag as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Run-control flag file {0:?} is smaller than one word")]
    TooSmall(PathBuf),
    #[error("Run-control flag failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Relay failed due to Accept error: {0}")]
    AcceptError(#[from] AcceptError),
    #[error("Relay failed due to Connect error: {0}")]
    ConnectError(#[from] ConnectError),
    #[error("Relay failed due to Send error: {0}")]
    SendError(#[from] SendError),
    #[error("Relay failed due to Receive error: {0}")]
    RecvError(#[from] RecvError),
    #[error("Relay failed due to FrameBuilder error: {0}")]
    BuildError(#[from] BuildError),
    #[error("Relay failed due to DataCheck error: {0}")]
    DataCheckError(#[from] DataCheckError),
    #[error("Relay failed due to BufferPool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Relay failed due to RawCopper error: {0}")]
    RecordError(#[from] RecordError),
    #[error("Relay failed due to PauseSignal error: {0}")]
    PauseError(#[from] PauseError),
    #[error("Relay has no {0} connection")]
    NotConnected(&'static str),
    #[error("Relay failed due to status send error: {0}")]
    StatusError(#[from] std::sync::mpsc::SendError<RelayStatus>),
}
