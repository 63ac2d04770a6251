//! # copper_relay
//!
//! copper_relay is the COPPER readout-PC event transport, written in Rust. It receives
//! framed event records from an upstream sender, checks each record (magic words, event
//! numbers, driver checksum), wraps it in a fresh send header and trailer, and forwards it
//! to a single downstream consumer over TCP. Run control can pause and resume the relay
//! through a shared-memory flag.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, you will
//! most likely need to install the Rust tool chain. See the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! copper_relay targets Linux readout PCs. The socket layer relies on `MSG_NOSIGNAL` and
//! the run-control flag lives in `/dev/shm`.
//!
//! ## Usage
//!
//! The library exposes a single entry point, [`relay::relay`], which takes a [`config::Config`],
//! a [`pause::CancelToken`] and the sending half of a channel on which
//! [`status::RelayStatus`] updates are published. The embedding binary is responsible for
//! installing a logger (spdlog) and for deciding what to do with a returned error.
//!
//! ## Configuration
//!
//! Configurations are YAML files. The format is as follows:
//!
//! ```yml
//! upstream_host: localhost
//! upstream_port: 30000
//! listen_host: 0.0.0.0
//! listen_port: 33000
//! tcp_nodelay: true
//! fault_mode: Normal
//! event_number_check: Strict
//! num_buffers: 1000
//! buffer_words: 10000
//! max_event_words: 2500000
//! events_per_cycle: 1
//! send_timeout_ms: 1000
//! connect_retry_ms: 1000
//! resume_poll_ms: 100
//! eagain_backoff_us: 0
//! max_backoff_us: 10000
//! pause_shm_path: null
//! verify_send_checksum: true
//! ```
//!
//! - `fault_mode`: `Normal` ends the run on a socket failure; `Nonstop` waits for run
//! control to resume and then reconnects.
//! - `event_number_check`: `Strict` rejects records that fail the data check; `WarnOnly`
//! logs the failure and forwards the record anyway.
//! - `pause_shm_path`: if `null`, `/dev/shm/cpr_pause_resume` is used when it exists and
//! run control is disabled otherwise.
//!
//! ## Wire Format
//!
//! All sizes are in 32-bit words in host byte order.
//!
//! ```text
//! SendHeader (6)   total words, header words, events << 16 | nodes, exp/run/subrun, event, node id
//! |---- block (events x nodes times)
//! |    |---- raw header (8)
//! |    |---- COPPER section, FINESSE slots A-D
//! |    |---- raw trailer (4)
//! SendTrailer (2)  XOR checksum of the body, 0x7FFF0007
//! ```
pub mod buffer_pool;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod dummy;
pub mod error;
pub mod event_check;
pub mod pause;
pub mod raw_copper;
pub mod receiver;
pub mod relay;
pub mod send_frame;
pub mod status;
pub mod transport;
