//! Newline-delimited JSON over TCP.
//!
//! The backend wire protocols are treated as opaque request/reply channels;
//! this client frames one JSON object per line in each direction.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::BackendError;

/// One JSON object per line, request/reply or fire-and-forget.
#[derive(Debug)]
pub struct JsonLineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl JsonLineClient {
    /// Connect with a bounded timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Timeout`] or an I/O error.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, BackendError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| BackendError::Timeout)??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Send one message without waiting for a reply (streaming writes).
    ///
    /// # Errors
    ///
    /// Returns an I/O error on a broken socket.
    pub async fn send(&mut self, msg: &Value) -> Result<(), BackendError> {
        let mut line = msg.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// One round-trip: send a message, read one reply line.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Timeout`], an I/O error, or
    /// [`BackendError::Protocol`] for non-JSON replies.
    pub async fn request(&mut self, msg: &Value, timeout: Duration) -> Result<Value, BackendError> {
        self.send(msg).await?;
        let mut line = String::new();
        let n = tokio::time::timeout(timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| BackendError::Timeout)??;
        if n == 0 {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed the connection",
            )));
        }
        serde_json::from_str(&line).map_err(|e| BackendError::Protocol(e.to_string()))
    }
}
