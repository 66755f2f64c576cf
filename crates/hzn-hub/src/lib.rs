//! Hub: the edge process agents connect to
//!
//! An agent opens a connection, sends a preamble carrying its token and the
//! services it offers, and after a successful confirmation the connection
//! turns into a multiplexed session. Registered services stay routable to
//! that session until the agent goes away.

pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod inbound;
pub mod recent;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use handler::{LogHandler, StreamContext, StreamHandler};
pub use hub::{Hub, SessionState};
pub use inbound::InboundServer;
pub use recent::RecentCatalog;
