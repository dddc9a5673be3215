//! TCP client channel
//!
//! The socket is driven by a private current-thread tokio runtime so that
//! every call stays blocking with an explicit bound.

use super::{config_timeout, Channel, ChannelError, LineBuffer, READ_CHUNK};
use crate::core::runtime::event::Event;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

/// TCP channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpChannelConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    2.0
}

impl TcpChannelConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: default_timeout(),
        }
    }

    /// Get address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Blocking TCP client channel
pub struct TcpChannel {
    config: TcpChannelConfig,
    runtime: Runtime,
    stream: Option<TcpStream>,
    lines: LineBuffer,
}

/// Quiet period that ends a drain of stale input
const DRAIN_QUIET: Duration = Duration::from_millis(5);

impl TcpChannel {
    /// Connect to `host:port` within the configured timeout
    pub fn connect(config: &TcpChannelConfig) -> Result<Self, ChannelError> {
        let addr = config.address();
        let connect_timeout = config_timeout(&addr, config.timeout)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let stream = runtime
            .block_on(tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)))
            .map_err(|_| ChannelError::Open {
                target: addr.clone(),
                message: format!("connect timed out after {connect_timeout:?}"),
            })?
            .map_err(|e| ChannelError::Open {
                target: addr.clone(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        tracing::info!(address = %addr, "tcp channel connected");
        Ok(Self {
            config: config.clone(),
            runtime,
            stream: Some(stream),
            lines: LineBuffer::default(),
        })
    }
}

impl Channel for TcpChannel {
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        self.runtime.block_on(async {
            stream.write_all(data).await?;
            stream.flush().await
        })?;
        Ok(())
    }

    fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(size.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let want = (size - buf.len()).min(READ_CHUNK);
            match self
                .runtime
                .block_on(tokio::time::timeout(remaining, stream.read(&mut chunk[..want])))
            {
                Err(_elapsed) => break,
                Ok(Ok(0)) if buf.is_empty() => return Err(ChannelError::Closed),
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn read_event(&mut self, timeout: Duration) -> Result<Option<Event>, ChannelError> {
        let mut lines = std::mem::take(&mut self.lines);
        let line = lines.next_line(timeout, |slice| self.read(1, slice));
        self.lines = lines;
        Ok(line?.map(Event::from_channel_bytes))
    }

    fn clear_input(&mut self) -> Result<(), ChannelError> {
        self.lines.clear();
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        let mut scratch = [0u8; READ_CHUNK];
        // read through the reactor so bytes already queued in the socket are seen
        self.runtime.block_on(async {
            loop {
                match tokio::time::timeout(DRAIN_QUIET, stream.read(&mut scratch)).await {
                    Err(_) | Ok(Ok(0)) => return Ok(()),
                    Ok(Ok(n)) => tracing::trace!(bytes = n, "discarded stale input"),
                    Ok(Err(e)) => return Err(ChannelError::from(e)),
                }
            }
        })
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut stream) = self.stream.take() {
            // peer may already be gone
            let _ = self.runtime.block_on(stream.shutdown());
            tracing::debug!(address = %self.config.address(), "tcp channel closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.config.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let mut channel = TcpChannel::connect(&TcpChannelConfig::new("127.0.0.1", port)).unwrap();
        channel.write(b"ping").unwrap();
        let echoed = channel.read(4, Duration::from_secs(2)).unwrap();
        assert_eq!(echoed, b"ping");
        server.join().unwrap();
        channel.close().unwrap();
        assert!(matches!(channel.write(b"x"), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_short_read_on_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"ab").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        let mut channel = TcpChannel::connect(&TcpChannelConfig::new("127.0.0.1", port)).unwrap();
        let data = channel.read(8, Duration::from_millis(150)).unwrap();
        assert_eq!(data, b"ab");
        server.join().unwrap();
    }

    #[test]
    fn test_clear_input_drains_every_queued_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // more than one drain buffer of stale bytes
            sock.write_all(&[b'x'; 3 * READ_CHUNK]).unwrap();
            let mut go = [0u8; 2];
            sock.read_exact(&mut go).unwrap();
            sock.write_all(b"fresh").unwrap();
        });

        let mut channel = TcpChannel::connect(&TcpChannelConfig::new("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        channel.clear_input().unwrap();
        channel.write(b"go").unwrap();
        assert_eq!(channel.read(5, Duration::from_secs(2)).unwrap(), b"fresh");
        server.join().unwrap();
    }

    #[test]
    fn test_event_line_split_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"RING ").unwrap();
            std::thread::sleep(Duration::from_millis(150));
            sock.write_all(b"42\r\n").unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });

        let mut channel = TcpChannel::connect(&TcpChannelConfig::new("127.0.0.1", port)).unwrap();
        assert!(channel.read_event(Duration::from_millis(50)).unwrap().is_none());
        let event = channel.read_event(Duration::from_secs(2)).unwrap().expect("complete line");
        assert_eq!(event.name, "RING 42");
        assert_eq!(event.raw.as_deref(), Some(&b"RING 42\r\n"[..]));
        server.join().unwrap();
    }

    #[test]
    fn test_non_finite_connect_timeout_is_an_open_error() {
        let mut cfg = TcpChannelConfig::new("127.0.0.1", 9);
        for bad in [f64::INFINITY, f64::NAN] {
            cfg.timeout = bad;
            assert!(matches!(TcpChannel::connect(&cfg), Err(ChannelError::Open { .. })));
        }
    }
}
