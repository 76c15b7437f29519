//! TCP liveness probing.
//!
//! The same probe answers "is this instance serving" for status reports and
//! "is this port taken" before a restart, so both paths share one host and
//! one timeout.

use optiflux_common::PortState;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use crate::config::ProbeSettings;

/// Returns true when something accepts TCP connections on `host:port`.
/// Every failure, including name resolution, counts as closed.
pub fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(err) => {
            debug!(host, port, error = %err, "Failed to resolve probe address.");
            return false;
        }
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// TCP connect check against one host with a fixed timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProber {
    host: String,
    timeout: Duration,
}

impl PortProber {
    /// Checks ports of `host`.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    /// Built from configuration.
    pub fn from_settings(settings: &ProbeSettings) -> Self {
        Self::new(settings.host.clone(), settings.timeout)
    }

    /// Blocking check of `port`.
    pub fn is_open(&self, port: u16) -> bool {
        is_port_open(&self.host, port, self.timeout)
    }

    /// [`Self::is_open`] as a [`PortState`].
    pub fn state(&self, port: u16) -> PortState {
        PortState::from_open(self.is_open(port))
    }

    /// Async form of [`Self::is_open`] with identical semantics.
    pub async fn probe(&self, port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect((self.host.as_str(), port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn prober() -> PortProber {
        PortProber::new("127.0.0.1", Duration::from_millis(500))
    }

    #[test]
    fn listening_port_is_running() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(prober().state(port), PortState::Running);
    }

    #[test]
    fn released_port_is_stopped() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!prober().is_open(port));
    }

    #[test]
    fn unresolvable_host_is_closed() {
        assert!(!is_port_open(
            "host.invalid",
            80,
            Duration::from_millis(200)
        ));
    }

    #[tokio::test]
    async fn async_probe_agrees_with_sync_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = prober();
        assert!(prober.probe(port).await);
        drop(listener);
        assert_eq!(prober.probe(port).await, prober.is_open(port));
    }
}
