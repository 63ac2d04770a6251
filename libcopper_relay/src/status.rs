/// Coarse state of a relay, as reported to run control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayState {
    #[default]
    Ready,
    Running,
    Paused,
    Errored,
    Stopped,
}

/// Snapshot of relay counters sent to a monitor thread.
#[derive(Debug, Clone, Default)]
pub struct RelayStatus {
    pub state: RelayState,
    pub sent_bytes: u64,
    pub recvd_bytes: u64,
    pub event_count: u64,
    pub input_port: u16,
    pub output_port: u16,
}

impl RelayStatus {
    pub fn new(state: RelayState, sent_bytes: u64, recvd_bytes: u64, event_count: u64) -> Self {
        Self {
            state,
            sent_bytes,
            recvd_bytes,
            event_count,
            ..Default::default()
        }
    }
}

/// Running totals kept by the relay loop, used for the periodic rate log.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    pub sent_bytes: u64,
    pub recvd_bytes: u64,
    pub event_count: u64,
    prev_sent_bytes: u64,
    prev_recvd_bytes: u64,
    prev_event_count: u64,
    start: std::time::Instant,
    prev_time: std::time::Instant,
}

impl Default for RunStatistics {
    fn default() -> Self {
        let now = std::time::Instant::now();
        Self {
            sent_bytes: 0,
            recvd_bytes: 0,
            event_count: 0,
            prev_sent_bytes: 0,
            prev_recvd_bytes: 0,
            prev_event_count: 0,
            start: now,
            prev_time: now,
        }
    }
}

impl RunStatistics {
    /// Log event rate and throughput since the previous call, then roll the interval.
    pub fn log_rates(&mut self) {
        let now = std::time::Instant::now();
        let interval = now.duration_since(self.prev_time).as_secs_f64();
        if interval <= 0.0 {
            return;
        }
        let events = self.event_count - self.prev_event_count;
        let recvd = self.recvd_bytes - self.prev_recvd_bytes;
        let sent = self.sent_bytes - self.prev_sent_bytes;
        spdlog::info!(
            "Event {:>12} Rate {:6.2}[kHz] Recvd {}/s Sent {}/s RunTime {:8.2}[s]",
            self.event_count,
            events as f64 / interval / 1.0e3,
            human_bytes::human_bytes(recvd as f64 / interval),
            human_bytes::human_bytes(sent as f64 / interval),
            now.duration_since(self.start).as_secs_f64(),
        );
        self.prev_time = now;
        self.prev_sent_bytes = self.sent_bytes;
        self.prev_recvd_bytes = self.recvd_bytes;
        self.prev_event_count = self.event_count;
    }

    /// Time since the last rate log
    pub fn since_last_log(&self) -> std::time::Duration {
        self.prev_time.elapsed()
    }

    pub fn snapshot(&self, state: RelayState) -> RelayStatus {
        RelayStatus::new(state, self.sent_bytes, self.recvd_bytes, self.event_count)
    }
}
