//! Ambient configuration surface: tunables for client/server runtimes.
//! Grounded on the teacher's `BenchmarkConfig`/CLI-args shape in
//! `src/cli.rs` (a flat struct of named fields with a `Default` impl), not
//! on anything in the original C, which hardcoded these as macros in
//! `internal.h`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a client runtime (component G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bound on `bootstrap_look_up` plus the connect handshake round trip.
    pub connect_timeout: Duration,
    /// Bound on a single `mach_msg` send call.
    pub send_timeout: Duration,
    /// How long the receiver thread blocks per `mach_msg` receive call
    /// before re-checking its running flag.
    pub receive_poll_timeout: Duration,
    /// Number of concurrently outstanding `send_with_reply` calls this
    /// client can have in flight.
    pub ack_pool_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(5_000),
            send_timeout: Duration::from_millis(100),
            receive_poll_timeout: Duration::from_millis(1_000),
            ack_pool_capacity: 64,
        }
    }
}

/// Tunables for a server runtime (component H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
    pub send_timeout: Duration,
    pub receive_poll_timeout: Duration,
    pub ack_pool_capacity: usize,
    /// A reply handler declines to touch a sender's OOL user payload once
    /// fewer than this much time remains before its stamped deadline.
    pub reply_safety_margin: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_clients: 32,
            send_timeout: Duration::from_millis(100),
            receive_poll_timeout: Duration::from_millis(1_000),
            ack_pool_capacity: 128,
            reply_safety_margin: Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_match_documented_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.ack_pool_capacity, 64);
    }

    #[test]
    fn server_defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_clients, 32);
        assert_eq!(cfg.reply_safety_margin, Duration::from_millis(10));
    }
}
