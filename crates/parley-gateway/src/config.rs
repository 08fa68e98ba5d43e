use std::time::Duration;

/// Gateway tunables. The server fills these from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a connection may take to present a valid credential.
    pub handshake_timeout: Duration,
    /// Bounded outbound queue per connection. Overflow disconnects.
    pub outbound_capacity: usize,
    /// Server sends a Ping on this interval.
    pub heartbeat_interval: Duration,
    /// Consecutive missed Pongs before the connection is dropped.
    pub max_missed_heartbeats: u8,
    /// Upper bound on one history page.
    pub history_page_max: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 2,
            history_page_max: 200,
        }
    }
}
