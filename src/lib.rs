//! # tunrelay
//!
//! User-space session multiplexing engine for tun-style transparent
//! relaying. Client packets arriving from a tun-like source are mapped
//! onto real upstream sockets, one per session, and upstream bytes are
//! synthesized back into client-bound IP packets that replay the
//! session's own header templates.
//!
//! ## Architecture
//!
//! ```text
//!   client packets          +--------------+        upstream sockets
//!  ----------------->       |  FlowManager |  ---->  TcpStream/UdpSocket
//!   (parsed headers)        +------+-------+              |
//!                                  |                      v
//!                           +------+-------+        +-----------+
//!                           |  FlowArena   | <----> | EventLoop |
//!                           +------+-------+        +-----+-----+
//!                                  |                      |
//!                                  v                reader / writer
//!                           +--------------+              |
//!   <-----------------      |  PacketSink  | <------------+
//!   synthesized packets     +--------------+
//! ```
//!
//! A single dedicated thread runs the [`EventLoop`] over a readiness
//! poller. All per-flow I/O is non-blocking; other threads feed flows
//! through [`FlowManager`] and coordinate with the poller through a
//! waker-based lock handoff.

pub mod checksum;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod flow;
pub mod icmp;
pub mod manager;
pub mod packet;
pub mod reader;
pub mod sink;
pub mod stats;
pub mod writer;

pub use config::{ConfigBuilder, RelayConfig};
pub use error::{RelayError, Result};
pub use event_loop::{EventLoop, WAKE_TOKEN};
pub use flow::{Flow, FlowArena, FlowChannel, FlowKey, FlowKind, FlowState, InterestSet};
pub use manager::FlowManager;
pub use packet::{Ipv4Header, TcpHeader, TransportHeader, UdpHeader};
pub use sink::{BufferSink, PacketSink};
pub use stats::{RelayStats, StatsSnapshot};

/// Common imports for embedding the engine
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{RelayError, Result};
    pub use crate::event_loop::EventLoop;
    pub use crate::flow::{FlowArena, FlowKey, FlowKind, FlowState};
    pub use crate::manager::FlowManager;
    pub use crate::packet::{Ipv4Header, TcpHeader, TransportHeader, UdpHeader};
    pub use crate::sink::PacketSink;
    pub use crate::stats::RelayStats;
}
