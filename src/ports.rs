//! Port allocation from a fixed range.
//!
//! A port is "available" when nothing accepts a connection on it. The scan
//! loop and the reservation run under one async lock, so two allocators on
//! the same range never hand out the same port.

use crate::config::PortRange;
use crate::error::{GatewayError, Result};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve the first free port in the range.
    pub async fn reserve(&self) -> Result<u16> {
        let mut reserved = self.reserved.lock().await;
        for port in self.range.iter() {
            if reserved.contains(&port) {
                continue;
            }
            if is_listening(port).await {
                debug!(port, "Port in use by another process");
                continue;
            }
            reserved.insert(port);
            return Ok(port);
        }
        Err(GatewayError::ResourceExhausted(format!(
            "no free port in range {}",
            self.range
        )))
    }

    /// Release a reservation. Returns false if the port was not held.
    pub async fn release(&self, port: u16) -> bool {
        self.reserved.lock().await.remove(&port)
    }

    pub async fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().await.contains(&port)
    }

    pub async fn reserved_count(&self) -> usize {
        self.reserved.lock().await.len()
    }
}

/// True when something on localhost accepts connections on `port`.
pub async fn is_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Outcome of waiting for a freshly spawned backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Listening,
    /// `alive` reported the owner gone before the port opened.
    Exited,
    TimedOut,
}

/// Poll every 100 ms until `port` accepts connections, `alive` turns false,
/// or `timeout` elapses.
pub async fn wait_until_listening(
    port: u16,
    timeout: Duration,
    alive: impl Fn() -> bool,
) -> Readiness {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_listening(port).await {
            return Readiness::Listening;
        }
        if !alive() {
            return Readiness::Exited;
        }
        if tokio::time::Instant::now() >= deadline {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
