use serde::{Deserialize, Serialize};
use std::io::{self, IoSlice, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use super::error::{AcceptError, ConnectError, RecvError, SendError};
use super::pause::{CancelToken, PauseSignal};
use super::send_frame::Frame;

/// Default send and receive timeout applied to every connection
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// How socket errors other than EINTR/EAGAIN are reported.
///
/// In `Nonstop` mode they are returned as recoverable so the relay can wait for run control to
/// resume it; in `Normal` mode they are fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultMode {
    #[default]
    Normal,
    Nonstop,
}

/// Outgoing side of a connection. Implemented by [`Connection`] and by scripted sinks in tests.
pub trait WireSink {
    /// One gather write of all of `bufs`; may write fewer bytes than requested
    fn write_vectored_raw(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    /// One write of `buf`; may write fewer bytes than requested
    fn send_raw(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Incoming side of a connection
pub trait WireSource {
    /// One read into `buf`. Ok(0) means the peer closed the connection.
    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// An established TCP connection with the relay's socket options applied
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    recvd: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, tcp_nodelay: bool, timeout: Duration) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(tcp_nodelay)?;
        Ok(Self {
            stream,
            peer,
            recvd: 0,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Bytes read from this connection so far
    pub fn bytes_received(&self) -> u64 {
        self.recvd
    }

    /// Check whether the peer is still there, leaving anything it sent in the socket.
    ///
    /// Data still pending counts as alive even if the peer closed after sending it.
    pub fn is_open(&mut self) -> io::Result<bool> {
        self.stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let open = loop {
            match self.stream.peek(&mut byte) {
                Ok(0) => break false,
                Ok(_) => break true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break true,
                Err(e) => {
                    spdlog::warn!("Check of connection to {} failed: {}", self.peer, e);
                    break false;
                }
            }
        };
        self.stream.set_nonblocking(false)?;
        Ok(open)
    }

    /// Check whether the peer is still there, discarding anything it sent us.
    ///
    /// Returns false once the peer has closed the connection or the socket reports an error.
    pub fn probe(&mut self) -> io::Result<bool> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 4096];
        let mut drained = 0;
        let alive = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break false,
                Ok(n) => drained += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break true,
                Err(e) => {
                    spdlog::warn!("Probe of connection to {} failed: {}", self.peer, e);
                    break false;
                }
            }
        };
        self.stream.set_nonblocking(false)?;
        if drained > 0 {
            spdlog::warn!(
                "Discarded {} of unexpected data from {}",
                human_bytes::human_bytes(drained as f64),
                self.peer
            );
        }
        Ok(alive)
    }
}

impl WireSink for Connection {
    fn write_vectored_raw(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // SAFETY: msghdr is plain data; IoSlice is guaranteed ABI compatible with iovec
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;
        let ret = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, SEND_FLAGS) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn send_raw(&mut self, buf: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::send(
                self.stream.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl WireSource for Connection {
    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        self.recvd += n as u64;
        Ok(n)
    }
}

/// Write a `SocketAddr` into a `sockaddr_storage`, return the address length.
fn fill_sockaddr_storage(
    storage: &mut libc::sockaddr_storage,
    addr: &SocketAddr,
) -> libc::socklen_t {
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<Option<SocketAddr>> {
    Ok((host, port).to_socket_addrs()?.next())
}

/// A listen socket with SO_REUSEADDR and a backlog of one
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub fn bind(host: &str, port: u16) -> Result<Self, AcceptError> {
        let addr = resolve(host, port)
            .map_err(|source| AcceptError::Resolve {
                host: host.to_string(),
                source,
            })?
            .ok_or_else(|| AcceptError::NoAddress(host.to_string()))?;

        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let raw_fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw_fd < 0 {
            return Err(AcceptError::Socket(io::Error::last_os_error()));
        }
        // SAFETY: raw_fd is a freshly created socket that nothing else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let optval: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(AcceptError::Socket(io::Error::last_os_error()));
        }

        // SAFETY: sockaddr_storage is plain data and is fully initialized by fill_sockaddr_storage
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addrlen = fill_sockaddr_storage(&mut storage, &addr);
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                addrlen,
            )
        };
        if ret < 0 {
            return Err(AcceptError::Bind {
                port,
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::listen(fd.as_raw_fd(), 1) } < 0 {
            return Err(AcceptError::Listen(io::Error::last_os_error()));
        }

        spdlog::info!("Listening on {}", addr);
        Ok(Self {
            listener: TcpListener::from(fd),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until exactly one peer connects
    pub fn accept(&self, tcp_nodelay: bool, timeout: Duration) -> Result<Connection, AcceptError> {
        let (stream, peer) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(AcceptError::Accept(e)),
            }
        };
        let connection =
            Connection::new(stream, tcp_nodelay, timeout).map_err(AcceptError::SocketOption)?;
        spdlog::info!("Accepted connection from {}", peer);
        Ok(connection)
    }
}

/// Exponential wait between EAGAIN retries. A zero initial delay retries immediately.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn wait(&mut self) {
        if self.current.is_zero() {
            return;
        }
        std::thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max.max(self.initial));
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

/// Tunables of the transport, usually taken from the [`Config`](crate::config::Config)
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub fault_mode: FaultMode,
    pub tcp_nodelay: bool,
    pub socket_timeout: Duration,
    pub eagain_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_retry: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            fault_mode: FaultMode::Normal,
            tcp_nodelay: true,
            socket_timeout: SOCKET_TIMEOUT,
            eagain_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            connect_retry: Duration::from_secs(1),
        }
    }
}

/// What to do after a failed socket call
enum Disposition {
    Retry,
    Paused,
    Cancelled,
    Failed(io::Error),
}

/// Retry policy shared by the send and receive paths.
///
/// EINTR is retried at once. EAGAIN (including a timeout) returns Paused if run control asked
/// for a pause, otherwise it is retried after the backoff. Anything else is a failure, whose
/// severity depends on the [`FaultMode`].
#[derive(Debug)]
pub struct NetworkTransport<P: PauseSignal> {
    pause: P,
    cancel: CancelToken,
    options: TransportOptions,
    backoff: Backoff,
}

impl<P: PauseSignal> NetworkTransport<P> {
    pub fn new(pause: P, cancel: CancelToken, options: TransportOptions) -> Self {
        let backoff = Backoff::new(options.eagain_backoff, options.max_backoff);
        Self {
            pause,
            cancel,
            options,
            backoff,
        }
    }

    pub fn pause_signal(&self) -> &P {
        &self.pause
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn dispose(&mut self, error: io::Error) -> Disposition {
        match error.kind() {
            io::ErrorKind::Interrupted => Disposition::Retry,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                if self.pause.is_pause_requested() {
                    spdlog::info!("Pause requested while waiting on the socket");
                    return Disposition::Paused;
                }
                if self.cancel.is_cancelled() {
                    return Disposition::Cancelled;
                }
                self.backoff.wait();
                Disposition::Retry
            }
            _ => Disposition::Failed(error),
        }
    }

    fn send_disposition(&mut self, error: io::Error) -> Result<(), SendError> {
        match self.dispose(error) {
            Disposition::Retry => Ok(()),
            Disposition::Paused => Err(SendError::Paused),
            Disposition::Cancelled => Err(SendError::Cancelled),
            Disposition::Failed(e) => match self.options.fault_mode {
                FaultMode::Normal => {
                    spdlog::error!("Send failed: {}", e);
                    Err(SendError::Fatal(e))
                }
                FaultMode::Nonstop => {
                    spdlog::warn!("Send failed, waiting for run control to resume: {}", e);
                    Err(SendError::Recoverable(e))
                }
            },
        }
    }

    fn recv_disposition(&mut self, error: io::Error) -> Result<(), RecvError> {
        match self.dispose(error) {
            Disposition::Retry => Ok(()),
            Disposition::Paused => Err(RecvError::Paused),
            Disposition::Cancelled => Err(RecvError::Cancelled),
            Disposition::Failed(e) => match self.options.fault_mode {
                FaultMode::Normal => {
                    spdlog::error!("Receive failed: {}", e);
                    Err(RecvError::Fatal(e))
                }
                FaultMode::Nonstop => {
                    spdlog::warn!("Receive failed, waiting for run control to resume: {}", e);
                    Err(RecvError::Recoverable(e))
                }
            },
        }
    }

    /// Bind, listen and block for exactly one peer.
    ///
    /// The listener is handed back unless `close_listen_after` is set, so a dropped peer can
    /// later be replaced with [`Listener::accept`].
    pub fn accept(
        &self,
        host: &str,
        port: u16,
        close_listen_after: bool,
    ) -> Result<(Connection, Option<Listener>), AcceptError> {
        let listener = Listener::bind(host, port)?;
        let connection = listener.accept(self.options.tcp_nodelay, self.options.socket_timeout)?;
        if close_listen_after {
            Ok((connection, None))
        } else {
            Ok((connection, Some(listener)))
        }
    }

    /// Connect upstream, retrying every `connect_retry` until it succeeds or is cancelled
    pub fn connect(&self, host: &str, port: u16) -> Result<Connection, ConnectError> {
        let addr = resolve(host, port)
            .map_err(|source| ConnectError::Resolve {
                host: host.to_string(),
                source,
            })?
            .ok_or_else(|| ConnectError::NoAddress(host.to_string()))?;

        let mut attempts: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ConnectError::Cancelled(addr.to_string()));
            }
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let connection = Connection::new(
                        stream,
                        self.options.tcp_nodelay,
                        self.options.socket_timeout,
                    )
                    .map_err(ConnectError::SocketOption)?;
                    spdlog::info!("Connected to {} after {} retries", addr, attempts);
                    return Ok(connection);
                }
                Err(e) => {
                    if attempts == 0 {
                        spdlog::warn!("Failed to connect to {}: {}. Retrying...", addr, e);
                    }
                    attempts += 1;
                    std::thread::sleep(self.options.connect_retry);
                }
            }
        }
    }

    /// Write one frame as a gather write of header, body and trailer.
    ///
    /// A short write is finished segment by segment. Returns the number of bytes written,
    /// which is always the full frame on success.
    pub fn send<W: WireSink>(&mut self, conn: &mut W, frame: &Frame) -> Result<usize, SendError> {
        let mut progress = 0;
        self.send_resume(conn, frame, &mut progress)?;
        Ok(progress)
    }

    /// Write the part of `frame` past `progress` bytes, advancing `progress` as bytes go out.
    ///
    /// On error `progress` holds exactly what reached the peer, so calling again on the same
    /// connection after a pause finishes the frame without duplicating bytes. Starting from 0
    /// uses one gather write before falling back to per-segment sends.
    pub fn send_resume<W: WireSink>(
        &mut self,
        conn: &mut W,
        frame: &Frame,
        progress: &mut usize,
    ) -> Result<(), SendError> {
        let segments = frame.segments();
        let total: usize = segments.iter().map(|segment| segment.len()).sum();

        if *progress == 0 {
            *progress = loop {
                let slices = [
                    IoSlice::new(segments[0]),
                    IoSlice::new(segments[1]),
                    IoSlice::new(segments[2]),
                ];
                match conn.write_vectored_raw(&slices) {
                    Ok(0) if total > 0 => {
                        self.send_disposition(io::Error::from(io::ErrorKind::WriteZero))?
                    }
                    Ok(n) => break n,
                    Err(e) => self.send_disposition(e)?,
                }
            };
        } else if *progress < total {
            spdlog::info!(
                "Resuming frame of {} after {} already sent",
                human_bytes::human_bytes(total as f64),
                human_bytes::human_bytes(*progress as f64)
            );
        }

        if *progress < total {
            spdlog::debug!("Short write of {} / {} bytes; sending the rest", *progress, total);
            let mut skip = *progress;
            for segment in segments {
                if skip >= segment.len() {
                    skip -= segment.len();
                    continue;
                }
                self.write_all_tracked(conn, &segment[skip..], progress)?;
                skip = 0;
            }
        }

        self.backoff.reset();
        Ok(())
    }

    /// Write all of `buf`, one send call at a time
    pub fn send_bytes<W: WireSink>(&mut self, conn: &mut W, buf: &[u8]) -> Result<usize, SendError> {
        let mut sent = 0;
        self.write_all_tracked(conn, buf, &mut sent)?;
        self.backoff.reset();
        Ok(sent)
    }

    fn write_all_tracked<W: WireSink>(
        &mut self,
        conn: &mut W,
        buf: &[u8],
        progress: &mut usize,
    ) -> Result<(), SendError> {
        let mut sent = 0;
        while sent < buf.len() {
            match conn.send_raw(&buf[sent..]) {
                Ok(0) => self.send_disposition(io::Error::from(io::ErrorKind::WriteZero))?,
                Ok(n) => {
                    sent += n;
                    *progress += n;
                }
                Err(e) => self.send_disposition(e)?,
            }
        }
        Ok(())
    }

    /// Fill all of `buf` from the source. A closed peer is a failure like any other socket error.
    pub fn recv_exact<R: WireSource>(
        &mut self,
        conn: &mut R,
        buf: &mut [u8],
    ) -> Result<usize, RecvError> {
        let mut recvd = 0;
        while recvd < buf.len() {
            match conn.recv_raw(&mut buf[recvd..]) {
                Ok(0) => self.recv_disposition(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ))?,
                Ok(n) => recvd += n,
                Err(e) => self.recv_disposition(e)?,
            }
        }
        self.backoff.reset();
        Ok(recvd)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dummy::CopperBlockBuilder;
    use crate::pause::{NoRunControl, SharedRunState};
    use crate::raw_copper::RawCopper;
    use crate::send_frame::FrameBuilder;
    use std::collections::VecDeque;
    use std::io::Write;

    /// One scripted outcome of a sink or source call
    #[derive(Debug, Clone, Copy)]
    pub enum Step {
        Accept(usize),
        Fail(io::ErrorKind),
    }

    /// Records what was written; each call consumes one step (accepting everything once the
    /// script runs out)
    #[derive(Debug, Default)]
    pub struct ScriptedSink {
        pub steps: VecDeque<Step>,
        pub output: Vec<u8>,
        pub calls: usize,
    }

    impl ScriptedSink {
        pub fn new(steps: &[Step]) -> Self {
            Self {
                steps: steps.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn take(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
            self.calls += 1;
            let available: usize = bufs.iter().map(|buf| buf.len()).sum();
            let limit = match self.steps.pop_front() {
                Some(Step::Fail(kind)) => return Err(io::Error::from(kind)),
                Some(Step::Accept(n)) => n.min(available),
                None => available,
            };
            let mut remaining = limit;
            for buf in bufs {
                let n = remaining.min(buf.len());
                self.output.extend_from_slice(&buf[..n]);
                remaining -= n;
            }
            Ok(limit)
        }
    }

    impl WireSink for ScriptedSink {
        fn write_vectored_raw(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let slices: Vec<&[u8]> = bufs.iter().map(|buf| &buf[..]).collect();
            self.take(&slices)
        }

        fn send_raw(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.take(&[buf])
        }
    }

    fn test_record() -> Vec<u32> {
        CopperBlockBuilder::new(42, 0x0301_0001)
            .finesse(0, (0..64).collect())
            .finesse(1, (0..32).collect())
            .build()
    }

    fn transport<P: PauseSignal>(pause: P, fault_mode: FaultMode) -> NetworkTransport<P> {
        NetworkTransport::new(
            pause,
            CancelToken::default(),
            TransportOptions {
                fault_mode,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_send_whole_frame() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let mut sink = ScriptedSink::new(&[]);
        let mut net = transport(NoRunControl, FaultMode::Normal);
        assert_eq!(net.send(&mut sink, &frame).unwrap(), frame.total_bytes());
        assert_eq!(sink.output, frame.to_bytes());
        assert_eq!(sink.calls, 1);
    }

    #[test]
    fn test_short_write_recovery() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let total = frame.total_bytes();
        let first = total * 6 / 10;
        let mut sink = ScriptedSink::new(&[Step::Accept(first), Step::Accept(total - first)]);
        let mut net = transport(NoRunControl, FaultMode::Normal);
        assert_eq!(net.send(&mut sink, &frame).unwrap(), total);
        assert_eq!(sink.output, frame.to_bytes());
    }

    #[test]
    fn test_short_write_inside_header() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let mut sink = ScriptedSink::new(&[Step::Accept(5), Step::Accept(3), Step::Accept(100)]);
        let mut net = transport(NoRunControl, FaultMode::Normal);
        assert_eq!(net.send(&mut sink, &frame).unwrap(), frame.total_bytes());
        assert_eq!(sink.output, frame.to_bytes());
    }

    #[test]
    fn test_interrupted_and_would_block_are_retried() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let mut sink = ScriptedSink::new(&[
            Step::Fail(io::ErrorKind::Interrupted),
            Step::Fail(io::ErrorKind::WouldBlock),
            Step::Fail(io::ErrorKind::WouldBlock),
        ]);
        let mut net = transport(SharedRunState::default(), FaultMode::Normal);
        assert_eq!(net.send(&mut sink, &frame).unwrap(), frame.total_bytes());
        assert_eq!(sink.output, frame.to_bytes());
        assert_eq!(sink.calls, 4);
    }

    #[test]
    fn test_pause_gating() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let state = SharedRunState::default();
        state.request_pause();
        let mut sink = ScriptedSink::new(&[Step::Fail(io::ErrorKind::WouldBlock)]);
        let mut net = transport(state, FaultMode::Normal);
        assert!(matches!(
            net.send(&mut sink, &frame),
            Err(SendError::Paused)
        ));
        assert!(sink.output.is_empty());
    }

    #[test]
    fn test_pause_during_short_write_then_resume() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let expected = frame.to_bytes();
        let first = expected.len() / 3;

        let state = SharedRunState::default();
        let mut sink = ScriptedSink::new(&[Step::Accept(first), Step::Fail(io::ErrorKind::WouldBlock)]);
        let mut net = transport(state.clone(), FaultMode::Normal);
        assert!(state.request_pause());

        let mut progress = 0;
        assert!(matches!(
            net.send_resume(&mut sink, &frame, &mut progress),
            Err(SendError::Paused)
        ));
        assert_eq!(progress, first);
        assert_eq!(&sink.output[..], &expected[..first]);

        // Run control resumes; the rest of the frame follows on the same sink
        net.pause_signal().acknowledge_pause();
        assert!(state.request_resume());
        net.pause_signal().acknowledge_resume();
        net.send_resume(&mut sink, &frame, &mut progress).unwrap();
        assert_eq!(progress, expected.len());
        assert_eq!(sink.output, expected);
    }

    #[test]
    fn test_cancel_stops_retry() {
        let mut sink = ScriptedSink::new(&[Step::Fail(io::ErrorKind::WouldBlock)]);
        let mut net = transport(NoRunControl, FaultMode::Normal);
        net.cancel_token().cancel();
        assert!(matches!(
            net.send_bytes(&mut sink, &[1, 2, 3]),
            Err(SendError::Cancelled)
        ));
    }

    #[test]
    fn test_fault_modes() {
        let mut sink = ScriptedSink::new(&[Step::Fail(io::ErrorKind::ConnectionReset)]);
        let mut net = transport(NoRunControl, FaultMode::Normal);
        let err = net.send_bytes(&mut sink, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SendError::Fatal(_)));
        assert!(!err.is_recoverable());

        let mut sink = ScriptedSink::new(&[Step::Fail(io::ErrorKind::BrokenPipe)]);
        let mut net = transport(NoRunControl, FaultMode::Nonstop);
        let err = net.send_bytes(&mut sink, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SendError::Recoverable(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_loopback_send_and_probe() {
        let record = test_record();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        let expected = frame.to_bytes();

        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let nbytes = expected.len();
        let reader = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut received = vec![0u8; nbytes];
            stream.read_exact(&mut received).unwrap();
            stream.write_all(b"stray").unwrap();
            received
        });

        let mut conn = listener.accept(true, SOCKET_TIMEOUT).unwrap();
        let mut net = transport(NoRunControl, FaultMode::Normal);
        assert_eq!(net.send(&mut conn, &frame).unwrap(), nbytes);
        let received = reader.join().unwrap();
        assert_eq!(received, expected);

        // The client has closed its end once the thread is joined
        assert!(!conn.probe().unwrap());
    }

    #[test]
    fn test_probe_alive() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut conn = listener.accept(false, SOCKET_TIMEOUT).unwrap();
        assert!(conn.probe().unwrap());
        drop(client);
    }

    #[test]
    fn test_is_open_leaves_pending_data() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let mut conn = listener.accept(false, SOCKET_TIMEOUT).unwrap();
        assert!(conn.is_open().unwrap());

        client.write_all(b"next record").unwrap();
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        assert!(conn.is_open().unwrap());

        let mut net = transport(NoRunControl, FaultMode::Normal);
        let mut received = [0u8; 11];
        assert_eq!(net.recv_exact(&mut conn, &mut received).unwrap(), 11);
        assert_eq!(&received, b"next record");
        assert_eq!(conn.bytes_received(), 11);
        assert!(!conn.is_open().unwrap());
    }

    #[test]
    fn test_accept_keeps_listener() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = std::thread::spawn(move || loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        });

        let net = transport(NoRunControl, FaultMode::Normal);
        let (first, listener) = net.accept("127.0.0.1", port, false).unwrap();
        let first_client = client.join().unwrap();
        assert_eq!(first.peer_addr(), first_client.local_addr().unwrap());

        // A replacement peer is accepted on the same socket
        let listener = listener.unwrap();
        drop(first_client);
        let second_client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let second = listener.accept(true, SOCKET_TIMEOUT).unwrap();
        assert_eq!(second.peer_addr(), second_client.local_addr().unwrap());
    }

    #[test]
    fn test_bind_port_in_use() {
        let first = Listener::bind("127.0.0.1", 0).unwrap();
        let port = first.local_addr().unwrap().port();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _conn = first.accept(true, SOCKET_TIMEOUT).unwrap();
        assert!(matches!(
            Listener::bind("127.0.0.1", port),
            Err(AcceptError::Bind { .. })
        ));
    }
}
