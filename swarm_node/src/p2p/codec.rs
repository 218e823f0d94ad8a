// Length-prefixed message framing
//
// Every message is written as `u32 big-endian length ‖ bincode(message)`.
// Reads and writes are bounded by the configured deadlines.

use crate::config::P2pConfig;
use crate::error::{NodeError, Result};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame reader and writer with deadlines
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    /// Largest accepted frame body
    pub max_frame_size: usize,
    /// Deadline for reading one frame
    pub read_timeout: Duration,
    /// Deadline for writing one frame
    pub write_deadline: Duration,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::from_config(&P2pConfig::default())
    }
}

impl MessageCodec {
    /// Build a codec from the stream layer configuration
    pub fn from_config(config: &P2pConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            read_timeout: config.read_timeout(),
            write_deadline: config.write_deadline(),
        }
    }

    /// Same codec with another read deadline
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Write one message within the write deadline
    pub async fn write<W, M>(&self, writer: &mut W, message: &M) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
        M: Serialize + Sync,
    {
        let body = bincode::serialize(message)?;
        if body.len() > self.max_frame_size {
            return Err(NodeError::Protocol(format!(
                "frame of {} bytes exceeds limit {}",
                body.len(),
                self.max_frame_size
            )));
        }

        let write = async {
            writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
            writer.write_all(&body).await?;
            writer.flush().await?;
            Ok::<(), NodeError>(())
        };

        timeout(self.write_deadline, write)
            .await
            .map_err(|_| NodeError::Timeout("write deadline exceeded".into()))?
    }

    /// Read one message within the read deadline
    pub async fn read<R, M>(&self, reader: &mut R) -> Result<M>
    where
        R: AsyncRead + Unpin + ?Sized,
        M: DeserializeOwned,
    {
        let read = async {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            reader.read_exact(&mut prefix).await?;
            let len = u32::from_be_bytes(prefix) as usize;
            if len > self.max_frame_size {
                return Err(NodeError::Protocol(format!(
                    "frame of {} bytes exceeds limit {}",
                    len, self.max_frame_size
                )));
            }

            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(bincode::deserialize(&body)?)
        };

        timeout(self.read_timeout, read)
            .await
            .map_err(|_| NodeError::Timeout("read deadline exceeded".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[tokio::test]
    async fn test_frames_cross_a_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let codec = MessageCodec::default();

        let ping = Ping { seq: 7, note: "hi".into() };
        codec.write(&mut a, &ping).await.unwrap();
        let got: Ping = codec.read(&mut b).await.unwrap();
        assert_eq!(got, ping);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let codec = MessageCodec {
            max_frame_size: 16,
            ..MessageCodec::default()
        };

        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let result: Result<Ping> = codec.read(&mut b).await;
        assert!(matches!(result, Err(NodeError::Protocol(_))));

        let big = Ping { seq: 1, note: "x".repeat(64) };
        assert!(matches!(codec.write(&mut a, &big).await, Err(NodeError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (_a, mut b) = tokio::io::duplex(1024);
        let codec = MessageCodec::default().with_read_timeout(Duration::from_millis(50));

        let result: Result<Ping> = codec.read(&mut b).await;
        assert!(matches!(result, Err(NodeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_peer_is_stream_reset() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let result: Result<Ping> = MessageCodec::default().read(&mut b).await;
        assert!(matches!(result, Err(NodeError::StreamReset(_))));
    }
}
