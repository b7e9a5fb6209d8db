use std::{path::Path, time::Duration};

use devopin_proto::msg::{Frame, Request};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unable to reach the agent at {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },
    #[error("connection to the agent failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent sent an unreadable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
}

/// One connection to the agent's control socket.
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.display().to_string(),
                source,
            })?;
        let (read, write) = stream.into_split();
        Ok(ControlClient {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let mut line = serde_json::to_vec(request)?;
        trace!("-> {}", String::from_utf8_lossy(&line));
        line.push(b'\n');
        self.write.write_all(&line).await?;
        Ok(())
    }

    /// Next frame, or `None` once the agent closed the connection.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        let Some(line) = self.lines.next_line().await? else {
            return Ok(None);
        };
        trace!("<- {line}");
        Ok(Some(serde_json::from_str(&line)?))
    }

    pub async fn next_frame_within(
        &mut self,
        limit: Duration,
    ) -> Result<Option<Frame>, ClientError> {
        timeout(limit, self.next_frame())
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }
}
