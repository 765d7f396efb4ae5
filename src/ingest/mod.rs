//! UDP metric ingestion.

pub mod event;
pub mod parse;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::window::Observation;

use self::event::Event;

/// Largest datagram the protocol accepts; longer packets truncate at this
/// boundary.
pub const MAX_UDP_PACKET_SIZE: usize = 512;

/// Reads datagrams, parses them and feeds the aggregator and observation
/// channels. Both sends block when their channel is full; backing up into
/// the kernel UDP buffer (and eventually dropping there) is the intended
/// overload behavior.
pub struct UdpIngester {
    socket: UdpSocket,
    events: mpsc::Sender<Event>,
    observations: mpsc::Sender<Observation>,
}

impl UdpIngester {
    /// Binds the ingest socket. A bind failure is fatal at startup.
    pub async fn bind(
        addr: &str,
        events: mpsc::Sender<Event>,
        observations: mpsc::Sender<Observation>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket on {addr}"))?;

        Ok(Self {
            socket,
            events,
            observations,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("getting local address")
    }

    /// Runs the read loop until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "listening for metrics");
        }

        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return;
                }

                received = self.socket.recv_from(&mut buf) => {
                    let n = match received {
                        Ok((n, _peer)) => n,
                        Err(e) => {
                            error!(error = %e, "reading UDP packet");
                            continue;
                        }
                    };

                    for event in parse::parse_datagram(&buf[..n]) {
                        let observation = Observation {
                            bucket: event.bucket.clone(),
                            sampling: event.sampling,
                        };

                        // Receivers only vanish at shutdown.
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                        if self.observations.send(observation).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
