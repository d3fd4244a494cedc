//! Newline-delimited JSON framing over async byte streams

use crate::error::ClusterError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Encode one message as a single JSON line
pub fn encode<M: Serialize>(message: &M) -> Result<String, ClusterError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line
pub fn decode<M: DeserializeOwned>(line: &str) -> Result<M, ClusterError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Drain `rx` into `writer`, one line per message, in channel order.
///
/// Stops when the channel closes or the stream errors.
pub fn spawn_writer<W, M>(mut writer: W, mut rx: mpsc::UnboundedReceiver<M>, label: String) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
    M: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = match encode(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(stream = %label, error = %e, "Dropping unencodable message");
                    continue;
                }
            };

            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!(stream = %label, error = %e, "Write failed, closing stream");
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!(stream = %label, error = %e, "Flush failed, closing stream");
                break;
            }
        }
        debug!(stream = %label, "Writer stopped");
    })
}

/// Read lines from `reader` until EOF, handing each decoded message to
/// `forward`. Returning `false` from `forward` stops reading.
///
/// Undecodable lines are logged and skipped.
pub async fn read_messages<R, M, F>(reader: R, label: &str, mut forward: F)
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
    F: FnMut(M) -> bool,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(stream = %label, error = %e, "Read failed, closing stream");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match decode::<M>(&line) {
            Ok(message) => {
                if !forward(message) {
                    break;
                }
            }
            Err(e) => warn!(stream = %label, error = %e, "Skipping undecodable line"),
        }
    }

    debug!(stream = %label, "Reader reached end of stream");
}
