//! Timing constants shared by servers, clients and connections.

use std::time::Duration;

/// Time allowed to establish a client connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the accept loop waits for in-flight connections on stop
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often idle serve loops check whether they should stop
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest single wait of a caller blocked on its reply
pub const REPLY_POLL_SLICE: Duration = Duration::from_millis(50);
