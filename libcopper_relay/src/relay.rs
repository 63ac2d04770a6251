use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::time::Duration;

use super::buffer_pool::BufferPool;
use super::config::Config;
use super::error::{ConnectError, RecvError, RelayError, SendError};
use super::event_check::EventChecker;
use super::pause::{CancelToken, PauseSignal, RunControl};
use super::receiver::{ReceivedRecord, Receiver};
use super::send_frame::FrameBuilder;
use super::status::{RelayState, RelayStatus, RunStatistics};
use super::transport::{Connection, Listener, NetworkTransport};

/// How often the rate line is logged and a status is pushed to the monitor
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that leave the relay waiting for run control instead of ending the run
fn needs_stand_by(error: &RelayError) -> bool {
    match error {
        RelayError::RecvError(e) => e.is_recoverable() && !matches!(e, RecvError::Cancelled),
        RelayError::SendError(e) => e.is_recoverable() && !matches!(e, SendError::Cancelled),
        _ => false,
    }
}

/// Socket failures, as opposed to a pause requested by run control
fn is_failure(error: &RelayError) -> bool {
    matches!(
        error,
        RelayError::RecvError(RecvError::Recoverable(_))
            | RelayError::SendError(SendError::Recoverable(_))
    )
}

fn is_cancellation(error: &RelayError) -> bool {
    matches!(
        error,
        RelayError::RecvError(RecvError::Cancelled)
            | RelayError::SendError(SendError::Cancelled)
            | RelayError::ConnectError(ConnectError::Cancelled(_))
    )
}

/// Records of the current cycle that have not fully reached downstream yet.
///
/// Survives stand-by, so a pause or a reconnect picks the cycle up where it stopped.
#[derive(Debug, Default)]
struct Backlog {
    records: VecDeque<ReceivedRecord>,
    received: usize,
    /// Bytes of the front record's frame already written to the current downstream peer
    front_sent: usize,
}

impl Backlog {
    fn is_idle(&self) -> bool {
        self.records.is_empty() && self.received == 0
    }

    /// The peer holding a partial frame is gone; the next one gets the frame whole
    fn restart_front(&mut self) {
        if self.front_sent > 0 {
            spdlog::warn!(
                "Downstream dropped after {} bytes of a frame; resending it from the start",
                self.front_sent
            );
        }
        self.front_sent = 0;
    }
}

/// Receives records from upstream, checks them and forwards them downstream.
///
/// The relay owns both connections, the buffer pool and the event checker. Progress is
/// reported as [`RelayStatus`] over the channel given at construction.
#[derive(Debug)]
pub struct Relay<P: PauseSignal> {
    config: Config,
    net: NetworkTransport<P>,
    receiver: Receiver,
    pool: BufferPool,
    checker: EventChecker,
    stats: RunStatistics,
    backlog: Backlog,
    /// The last receive stopped partway through a record
    upstream_split: bool,
    listener: Option<Listener>,
    upstream: Option<Connection>,
    downstream: Option<Connection>,
    tx: Sender<RelayStatus>,
}

impl<P: PauseSignal> Relay<P> {
    pub fn new(
        config: Config,
        pause: P,
        cancel: CancelToken,
        tx: Sender<RelayStatus>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let net = NetworkTransport::new(pause, cancel, config.transport_options());
        let receiver = Receiver::new(config.max_event_words, config.verify_send_checksum);
        let pool = BufferPool::new(config.num_buffers, config.buffer_words);
        let checker = EventChecker::new(config.event_number_check);
        spdlog::info!(
            "Allocated {} buffers of {} for {} events per cycle",
            config.num_buffers,
            human_bytes::human_bytes((config.buffer_words * super::constants::WORD_SIZE) as f64),
            config.events_per_cycle
        );
        Ok(Self {
            config,
            net,
            receiver,
            pool,
            checker,
            stats: RunStatistics::default(),
            backlog: Backlog::default(),
            upstream_split: false,
            listener: None,
            upstream: None,
            downstream: None,
            tx,
        })
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    /// Bind the downstream listen socket ahead of [`Self::run`] and return its address.
    /// Useful when the configured port is 0.
    pub fn listen(&mut self) -> Result<SocketAddr, RelayError> {
        if self.listener.is_none() {
            self.listener = Some(Listener::bind(
                &self.config.listen_host,
                self.config.listen_port,
            )?);
        }
        match &self.listener {
            Some(listener) => Ok(listener
                .local_addr()
                .map_err(super::error::AcceptError::Socket)?),
            None => Err(RelayError::NotConnected("listen")),
        }
    }

    fn send_status(&self, state: RelayState) -> Result<(), RelayError> {
        let mut status = self.stats.snapshot(state);
        status.input_port = self
            .upstream
            .as_ref()
            .map(|conn| conn.peer_addr().port())
            .unwrap_or(self.config.upstream_port);
        status.output_port = self
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(self.config.listen_port);
        self.tx.send(status)?;
        Ok(())
    }

    /// Connect upstream first, then wait for the downstream peer. Connections that are
    /// already up are left alone.
    fn connect_all(&mut self) -> Result<(), RelayError> {
        if self.upstream.is_none() {
            spdlog::info!(
                "Connecting upstream to {}:{}",
                self.config.upstream_host,
                self.config.upstream_port
            );
            let conn = self
                .net
                .connect(&self.config.upstream_host, self.config.upstream_port)?;
            self.upstream = Some(conn);
        }
        if self.downstream.is_none() {
            let options = self.net.options();
            let conn = match &self.listener {
                Some(listener) => listener.accept(options.tcp_nodelay, options.socket_timeout)?,
                None => {
                    spdlog::info!(
                        "Waiting for downstream on {}:{}",
                        self.config.listen_host,
                        self.config.listen_port
                    );
                    let (conn, listener) = self.net.accept(
                        &self.config.listen_host,
                        self.config.listen_port,
                        false,
                    )?;
                    self.listener = listener;
                    conn
                }
            };
            spdlog::info!("Accepted downstream connection from {}", conn.peer_addr());
            self.downstream = Some(conn);
        }
        Ok(())
    }

    /// One pass of the loop: receive `events_per_cycle` records and check them, then wrap and
    /// send each. A cycle cut short by stand-by is finished before a new one starts.
    fn process_cycle(&mut self) -> Result<(), RelayError> {
        if self.backlog.is_idle() {
            self.pool.reset_cycle();
        } else {
            spdlog::info!(
                "Resuming cycle with {} of {} records received, {} not yet sent",
                self.backlog.received,
                self.config.events_per_cycle,
                self.backlog.records.len()
            );
        }

        while self.backlog.received < self.config.events_per_cycle {
            let upstream = self
                .upstream
                .as_mut()
                .ok_or(RelayError::NotConnected("upstream"))?;
            let mark = self.pool.num_used();
            let start = upstream.bytes_received();
            let record = match self
                .receiver
                .recv_block(&mut self.net, upstream, &mut self.pool)
            {
                Ok(record) => record,
                Err(e) => {
                    self.pool.unwind_to(mark);
                    self.upstream_split = upstream.bytes_received() != start;
                    return Err(e.into());
                }
            };
            self.stats.recvd_bytes += record.total_bytes() as u64;
            {
                let view = record.view(&self.pool, self.config.event_number_check)?;
                self.checker.check(&view)?;
            }
            self.backlog.records.push_back(record);
            self.backlog.received += 1;
        }

        while let Some(record) = self.backlog.records.front() {
            let view = record.view(&self.pool, self.config.event_number_check)?;
            let frame = FrameBuilder::wrap(&view)?;
            let downstream = self
                .downstream
                .as_mut()
                .ok_or(RelayError::NotConnected("downstream"))?;
            self.net
                .send_resume(downstream, &frame, &mut self.backlog.front_sent)?;
            self.stats.sent_bytes += frame.total_bytes() as u64;
            self.stats.event_count += record.header.num_events() as u64;
            self.backlog.front_sent = 0;
            if let Some(record) = self.backlog.records.pop_front() {
                self.pool.release(record.handle);
            }
        }
        self.backlog.received = 0;
        Ok(())
    }

    /// Wait for run control, then bring back whatever connections did not survive.
    ///
    /// After a socket failure a controlled relay first waits for the operator to pause the
    /// run, then for the resume.
    fn stand_by(&mut self, after_failure: bool) -> Result<(), RelayError> {
        spdlog::info!("Entering stand-by, waiting for run control to resume");
        self.send_status(RelayState::Paused)?;

        let poll = self.config.get_resume_poll();
        if after_failure && self.net.pause_signal().is_controlled() {
            spdlog::info!("Waiting for run control to pause the run");
            while !self.net.pause_signal().is_pause_requested() {
                if self.net.cancel_token().is_cancelled() {
                    return Ok(());
                }
                std::thread::sleep(poll);
            }
        }
        loop {
            if self.net.cancel_token().is_cancelled() {
                return Ok(());
            }
            self.net.pause_signal().acknowledge_pause();
            if self.net.pause_signal().is_recovering() {
                break;
            }
            std::thread::sleep(poll);
        }
        spdlog::info!("Resume requested, checking connections");

        if let Some(mut conn) = self.upstream.take() {
            if std::mem::take(&mut self.upstream_split) {
                spdlog::warn!(
                    "Upstream {} stopped partway through a record; reconnecting",
                    conn.peer_addr()
                );
            } else if conn.is_open().unwrap_or(false) {
                self.upstream = Some(conn);
            } else {
                spdlog::warn!("Upstream {} is gone; reconnecting", conn.peer_addr());
            }
        }
        if let Some(mut conn) = self.downstream.take() {
            if conn.probe().unwrap_or(false) {
                self.downstream = Some(conn);
            } else {
                spdlog::warn!("Downstream {} is gone; waiting for a new peer", conn.peer_addr());
                self.backlog.restart_front();
            }
        }
        self.connect_all()?;

        self.checker.reset();
        self.net.pause_signal().acknowledge_resume();
        spdlog::info!("Resumed after stand-by");
        self.send_status(RelayState::Running)?;
        Ok(())
    }

    fn relay_loop(&mut self) -> Result<(), RelayError> {
        match self.connect_all() {
            Err(e) if is_cancellation(&e) => return Ok(()),
            result => result?,
        }
        self.send_status(RelayState::Running)?;

        loop {
            if self.net.cancel_token().is_cancelled() {
                return Ok(());
            }
            let outcome = match self.process_cycle() {
                Err(e) if needs_stand_by(&e) => {
                    spdlog::warn!("{}", e);
                    self.stand_by(is_failure(&e))
                }
                outcome => outcome,
            };
            match outcome {
                Err(e) if is_cancellation(&e) => return Ok(()),
                result => result?,
            }

            if self.stats.since_last_log() >= REPORT_INTERVAL {
                self.stats.log_rates();
                self.send_status(RelayState::Running)?;
            }
        }
    }

    /// Run until cancelled or until an error run control cannot recover from.
    pub fn run(&mut self) -> Result<(), RelayError> {
        match self.relay_loop() {
            Ok(()) => {
                self.stats.log_rates();
                spdlog::info!(
                    "Relay stopped after {} events, {} sent",
                    self.stats.event_count,
                    human_bytes::human_bytes(self.stats.sent_bytes as f64)
                );
                self.send_status(RelayState::Stopped)
            }
            Err(e) => {
                spdlog::error!("Relay failed: {}", e);
                // The monitor may already be gone; the relay error is what matters
                let _ = self.send_status(RelayState::Errored);
                Err(e)
            }
        }
    }
}

/// The main entry point of copper_relay.
///
/// Opens run control named by the config and relays until `cancel` fires or a fatal error.
pub fn relay(
    config: Config,
    cancel: CancelToken,
    tx: Sender<RelayStatus>,
) -> Result<(), RelayError> {
    let pause = RunControl::open(config.get_pause_shm_path().as_deref())?;
    let mut relay = Relay::new(config, pause, cancel, tx)?;
    relay.run()
}
