//! Hub configuration

use hzn_mux::MuxConfig;
use hzn_proto::{HubId, ALPN_RPC, ALPN_TUNNEL, MAX_FRAME_SIZE};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identity written into every service registration
    pub hub_id: HubId,

    /// Session settings for agent and RPC connections
    pub mux: MuxConfig,

    /// Largest handshake frame accepted from an agent
    pub max_frame_size: u32,

    /// ALPN protocol agents negotiate on the TLS listener
    pub alpn_protocol: &'static [u8],

    /// Longest a single service registration or removal may take
    pub control_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_id: HubId::new(),
            mux: MuxConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
            alpn_protocol: ALPN_TUNNEL,
            control_timeout: Duration::from_secs(30),
        }
    }
}

impl HubConfig {
    pub fn new(hub_id: HubId) -> Self {
        Self {
            hub_id,
            ..Default::default()
        }
    }

    pub fn with_mux_config(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.mux = self.mux.with_keep_alive(interval);
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.mux = self.mux.without_keep_alive();
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Protocols to advertise on the TLS listener, agents first
    pub fn alpn_protocols(&self) -> [&'static [u8]; 2] {
        [self.alpn_protocol, ALPN_RPC]
    }
}
