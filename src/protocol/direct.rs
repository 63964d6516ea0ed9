//! Direct outbound - dial the target and splice

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::common::address::{Address, Network};
use crate::common::buffer::{MultiBuffer, BUFFER_SIZE};
use crate::common::pipe::{Link, PipeError};
use crate::common::session::Session;
use crate::features::OutboundHandler;

/// Connects straight to the session target over TCP and relays the link
/// against the socket.
pub struct DirectHandler {
    tag: String,
}

impl DirectHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    async fn connect(&self, address: &Address) -> std::io::Result<TcpStream> {
        match address {
            Address::Socket(addr) => TcpStream::connect(addr).await,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    }
}

#[async_trait]
impl OutboundHandler for DirectHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: Arc<Session>, link: Link) {
        let Some(target) = session.target() else {
            warn!("[{}] dispatch without a target", self.tag);
            link.shutdown();
            return;
        };

        if target.network != Network::Tcp {
            warn!("[{}] only tcp targets are supported, got {}", self.tag, target);
            link.shutdown();
            return;
        }

        let stream = match self.connect(&target.address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[{}] failed to connect to {}: {}", self.tag, target, e);
                link.shutdown();
                return;
            }
        };
        debug!("[{}] connected to {}", self.tag, target);

        let (mut read_half, mut write_half) = stream.into_split();
        let reader = &link.reader;
        let writer = &link.writer;

        let uplink = async move {
            let mut total: u64 = 0;
            loop {
                match reader.read_multi().await {
                    Ok(mb) => {
                        let bytes = mb.to_bytes();
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                        total += bytes.len() as u64;
                    }
                    Err(PipeError::Closed) => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                    Err(_) => break,
                }
            }
            total
        };

        let downlink = async move {
            let mut total: u64 = 0;
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        writer.close();
                        break;
                    }
                    Ok(n) => {
                        if writer
                            .write_multi(MultiBuffer::from_bytes(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        total += n as u64;
                    }
                    Err(_) => break,
                }
            }
            total
        };

        let (up, down) = tokio::join!(uplink, downlink);
        link.shutdown();

        info!(
            "[{}] closed {} (up {}B down {}B)",
            self.tag, target, up, down
        );
    }
}
