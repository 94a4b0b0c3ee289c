//! A multipath connection is a single logical, reliable, ordered byte stream that is carried
//!  over several underlying network connections ('subflows') at the same time, e.g. over
//!  different interfaces or through different proxies.
//!
//! The connection splits outbound data into numbered frames and puts each frame on the subflow
//!  with the lowest round trip time that has room for it. Frames that are not acknowledged in
//!  time are retransmitted, possibly on a different subflow, and the receiving side restores the
//!  original order. Subflows can be added and removed at any time; losing a subflow does not
//!  lose data as long as there is another subflow left.
//!
//! [MultipathConn] is the entry point. Bootstrapping the underlying connections (dialing,
//!  accepting, agreeing on a [ConnectionId]) happens outside this crate: the resulting streams
//!  are handed to [MultipathConn::add].

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod connection_id;
pub mod error;
pub mod frame;
pub mod pending_ack;
pub mod receive_queue;
pub mod subflow;
pub mod test_util;
pub mod wire;

pub use config::MultipathConfig;
pub use connection::{MultipathAddr, MultipathConn};
pub use connection_id::ConnectionId;
pub use error::MultipathError;
pub use subflow::{NullStatsTracker, StatsTracker, Subflow, SubflowId, SubflowRole};
