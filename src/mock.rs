//! Scripted in-memory transport for protocol tests.
//!
//! Each `send()` consumes the next scripted [`Reply`]; the reply's chunks
//! are then handed out one per `receive()`. When the chunks run out,
//! `receive()` reports a timeout straight away, so tests never sleep.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{CalError, Result};
use crate::transport::Transport;

/// What the fake receiver does after one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Deliver these chunks, one per receive call.
    Chunks(Vec<Vec<u8>>),
    /// Say nothing.
    Silence,
    /// Deliver these chunks, then drop the connection.
    Hangup(Vec<Vec<u8>>),
}

/// Shared record of every buffer written to a [`MockTransport`].
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl SentLog {
    pub fn all(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Sent buffers decoded as text with the trailing CR removed.
    pub fn lines(&self) -> Vec<String> {
        self.all()
            .iter()
            .map(|b| String::from_utf8_lossy(b).trim_end_matches('\r').to_string())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MockTransport {
    replies: VecDeque<Reply>,
    pending: VecDeque<Vec<u8>>,
    hangup_after_pending: bool,
    connected: bool,
    sent: SentLog,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }

    /// Queue a reply made of one chunk.
    pub fn reply(&mut self, bytes: &[u8]) -> &mut Self {
        self.replies.push_back(Reply::Chunks(vec![bytes.to_vec()]));
        self
    }

    /// Queue a reply delivered as several chunks.
    pub fn reply_chunks(&mut self, chunks: Vec<Vec<u8>>) -> &mut Self {
        self.replies.push_back(Reply::Chunks(chunks));
        self
    }

    pub fn silence(&mut self) -> &mut Self {
        self.replies.push_back(Reply::Silence);
        self
    }

    pub fn hangup(&mut self, chunks: Vec<Vec<u8>>) -> &mut Self {
        self.replies.push_back(Reply::Hangup(chunks));
        self
    }

    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(CalError::ConnectionClosed);
        }
        self.sent.0.lock().unwrap().push(data.to_vec());
        match self.replies.pop_front().unwrap_or(Reply::Silence) {
            Reply::Chunks(chunks) => self.pending.extend(chunks),
            Reply::Silence => {}
            Reply::Hangup(chunks) => {
                self.pending.extend(chunks);
                self.hangup_after_pending = true;
            }
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(CalError::ConnectionClosed);
        }
        match self.pending.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.pending.push_front(chunk.split_off(n));
                }
                Ok(n)
            }
            None if self.hangup_after_pending => {
                self.connected = false;
                Err(CalError::ConnectionClosed)
            }
            None => Err(CalError::Timeout {
                command: "receive".into(),
                waited: timeout,
            }),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_follow_sends() {
        let mut mock = MockTransport::new();
        mock.reply(b"ACK").reply_chunks(vec![b"AB".to_vec(), b"CD".to_vec()]);
        let log = mock.sent_log();

        let mut buf = [0u8; 8];
        mock.send(b"one").await.unwrap();
        let n = mock.receive(&mut buf, Duration::ZERO).await.unwrap();
        assert_eq!(&buf[..n], b"ACK");
        assert!(mock.receive(&mut buf, Duration::ZERO).await.unwrap_err().is_timeout());

        mock.send(b"two").await.unwrap();
        let n = mock.receive(&mut buf, Duration::ZERO).await.unwrap();
        assert_eq!(&buf[..n], b"AB");
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn hangup_closes_after_chunks() {
        let mut mock = MockTransport::new();
        mock.hangup(vec![b"x".to_vec()]);
        mock.send(b"q").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mock.receive(&mut buf, Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            mock.receive(&mut buf, Duration::ZERO).await,
            Err(CalError::ConnectionClosed)
        ));
        assert!(!mock.is_connected());
    }
}
