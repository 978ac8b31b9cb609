//! TCP front end for the relay: one JSON frame per line

use std::future::Future;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::error::MeshResult;
use crate::mesh::tcp::MAX_FRAME_LEN;
use crate::relay::hub::RelayHub;
use crate::relay::RelayFrame;

pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
}

impl RelayServer {
    /// Bind the relay's listening socket
    pub async fn bind(addr: impl ToSocketAddrs) -> MeshResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub: RelayHub::new(),
        })
    }

    pub fn local_addr(&self) -> MeshResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_until<F>(self, shutdown: F) -> MeshResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = ?self.listener.local_addr().ok(), "Relay listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Relay shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = self.hub.clone();
                        tokio::spawn(serve_connection(hub, stream, addr));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    /// Accept connections forever
    pub async fn run(self) -> MeshResult<()> {
        self.serve_until(std::future::pending()).await
    }
}

async fn serve_connection(hub: RelayHub, stream: TcpStream, addr: SocketAddr) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();
    let session = hub.register(tx);
    debug!(%addr, session, "Relay connection");

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (mut sink, mut lines) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match frame.encode() {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode relay frame");
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => match RelayFrame::decode(&line) {
                Ok(frame) => hub.handle(session, frame),
                Err(e) => debug!(%addr, error = %e, "Ignoring bad relay frame"),
            },
            Err(e) => {
                warn!(%addr, error = %e, "Relay read failed");
                break;
            }
        }
    }

    hub.disconnect(session);
    writer.abort();
    debug!(%addr, session, "Relay connection closed");
}
