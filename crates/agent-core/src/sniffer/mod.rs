//! Sniffer relay.
//!
//! Port agents expose a passive copy of instrument traffic on a "sniff" TCP
//! port. The [`SniffBroker`] keeps one lazily opened connection per
//! `(designator, client_key)` pair and buffers what it receives; the
//! [`SnifferGateway`] lets local clients pull that buffer over a Unix socket,
//! one request per connection.

mod broker;
mod buffer;
mod gateway;
mod session;

pub use broker::SniffBroker;
pub use buffer::SniffBuffer;
pub use gateway::{GatewayHandle, SnifferGateway};
pub use session::{CloseReason, SniffSession};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker cache key.
///
/// Two clients watching the same instrument get separate connections and
/// separate buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SniffKey {
    pub designator: String,
    pub client_key: String,
}

impl SniffKey {
    pub fn new(designator: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            designator: designator.into(),
            client_key: client_key.into(),
        }
    }
}

impl fmt::Display for SniffKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.designator, self.client_key)
    }
}
