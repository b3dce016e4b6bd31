//! Byte-stream transport to a receiver.
//!
//! Both control channels (binary frames on 1256, line text on 23) run over
//! a plain TCP stream. Protocol code talks to the [`Transport`] trait so that
//! the exchange engine can be driven by a scripted mock in tests.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::{CalError, Result};

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Asynchronous byte-level link to a receiver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write all bytes.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever arrives within `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived, `ConnectionClosed` if the peer hung up.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Shut the link down. Later calls fail with `ConnectionClosed`.
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// TCP
// ============================================================================

/// TCP link to one receiver port.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    addr: String,
}

impl TcpTransport {
    /// Connect to `addr` (`host:port`), giving up after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        debug!("connecting to {addr} (timeout {timeout:?})");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CalError::Timeout {
                command: format!("connect {addr}"),
                waited: timeout,
            })?
            .map_err(|e| map_connect_error(e, addr))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("{addr}: failed to set TCP_NODELAY: {e}");
        }
        info!("connected to {addr}");
        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
        })
    }

    /// Connect to `host` on `port`.
    pub async fn connect_port(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Self::connect(&format!("{host}:{port}"), timeout).await
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        Self {
            stream: Some(stream),
            addr,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(CalError::ConnectionClosed)?;
        trace!("{} TX {} bytes", self.addr, data.len());
        stream.write_all(data).await.map_err(map_io_error)?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(CalError::ConnectionClosed)?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                warn!("{}: peer closed connection", self.addr);
                self.stream = None;
                Err(CalError::ConnectionClosed)
            }
            Ok(Ok(n)) => {
                trace!("{} RX {} bytes", self.addr, n);
                Ok(n)
            }
            Ok(Err(e)) => Err(map_io_error(e)),
            Err(_) => Err(CalError::Timeout {
                command: "receive".into(),
                waited: timeout,
            }),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("{}: shutdown failed: {e}", self.addr);
            }
            info!("closed connection to {}", self.addr);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn map_connect_error(e: std::io::Error, addr: &str) -> CalError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            CalError::Transport(format!("connection refused: {addr}"))
        }
        _ => CalError::Io(e),
    }
}

fn map_io_error(e: std::io::Error) -> CalError {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => CalError::ConnectionClosed,
        _ => CalError::Io(e),
    }
}
