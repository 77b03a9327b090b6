//! SSH readiness probe.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use crate::error::{DriverError, Result};
use crate::traits::ReadinessProbe;

/// Waits for an SSH server banner on the guest.
pub struct TcpSshProbe {
    attempts: u32,
    interval: Duration,
    dial_timeout: Duration,
}

impl Default for TcpSshProbe {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpSshProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the attempt budget.
    pub fn with_attempts(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }

    async fn probe_once(&self, addr: &str) -> std::result::Result<(), String> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| "dial timed out".to_string())?
            .map_err(|e| e.to_string())?;

        let mut banner = String::new();
        let mut reader = BufReader::new(stream);
        tokio::time::timeout(self.dial_timeout, reader.read_line(&mut banner))
            .await
            .map_err(|_| "no banner".to_string())?
            .map_err(|e| e.to_string())?;

        if banner.starts_with("SSH-") {
            Ok(())
        } else {
            Err(format!("unexpected banner {:?}", banner.trim_end()))
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpSshProbe {
    #[instrument(skip(self))]
    async fn wait_for_ssh(&self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let mut last_error = String::from("never attempted");

        for attempt in 1..=self.attempts {
            match self.probe_once(&addr).await {
                Ok(()) => {
                    info!(addr = %addr, "SSH is available");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, max_attempts = self.attempts, error = %e, "SSH not ready");
                    last_error = e;
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(DriverError::SshUnavailable(format!(
            "{} after {} attempts: {}",
            addr, self.attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_accepts_ssh_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let probe = TcpSshProbe::new().with_attempts(3, Duration::from_millis(10));
        probe.wait_for_ssh("127.0.0.1", port).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_rejects_other_services() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n").await;
            }
        });

        let probe = TcpSshProbe::new().with_attempts(2, Duration::from_millis(10));
        let err = probe.wait_for_ssh("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, DriverError::SshUnavailable(_)));
    }

    #[tokio::test]
    async fn test_probe_gives_up_on_closed_port() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = TcpSshProbe::new().with_attempts(2, Duration::from_millis(10));
        assert!(probe.wait_for_ssh("127.0.0.1", port).await.is_err());
    }
}
