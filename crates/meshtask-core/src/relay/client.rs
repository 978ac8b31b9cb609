//! Peer side of the TCP relay connection

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::mesh::tcp::MAX_FRAME_LEN;
use crate::relay::{RelayFrame, SignalingChannel};

pub struct RelayClient;

impl RelayClient {
    /// Connect to a relay server
    ///
    /// The returned channel's `inbound` ends when the relay closes the
    /// connection; dropping the channel closes it from our side.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Signaling` if the relay cannot be reached.
    pub async fn connect(addr: impl ToSocketAddrs) -> MeshResult<SignalingChannel> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Signaling(format!("cannot reach relay: {}", e)))?;
        info!(relay = ?stream.peer_addr().ok(), "Connected to relay");

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        let (mut sink, mut lines) = framed.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayFrame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let line = match frame.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode relay frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "Relay write failed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Relay read failed");
                        break;
                    }
                };
                match RelayFrame::decode(&line) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring bad relay frame"),
                }
            }
            debug!("Relay connection ended");
        });

        Ok(SignalingChannel::new(out_tx, in_rx).with_tasks(vec![writer, reader]))
    }
}
