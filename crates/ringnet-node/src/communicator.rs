//! Outbound peer-to-peer client
//!
//! One TCP connection per request: connect, send one frame, read one frame,
//! hang up. Every exchange is bounded by the configured request timeout.

use crate::config::PeerConfig;
use ringnet_core::proto::{PeerRequest, PeerResponse};
use ringnet_core::transport::{read_frame, write_frame};
use ringnet_core::{Error, NodeId, PeerLink, Result, RoutingTableEntry};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP client for talking to other overlay members
#[derive(Debug)]
pub struct Communicator {
    timeout: Duration,
    running: AtomicBool,
}

impl Communicator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(config.request_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send one request to `peer` and wait for its reply
    pub async fn request(&self, peer: SocketAddr, request: &PeerRequest) -> Result<PeerResponse> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }

        let payload = request.encode()?;
        tokio::time::timeout(self.timeout, self.exchange(peer, &payload))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn exchange(&self, peer: SocketAddr, payload: &str) -> Result<PeerResponse> {
        let mut stream = TcpStream::connect(peer).await?;
        write_frame(&mut stream, payload).await?;

        let reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| Error::Malformed(format!("{} closed without replying", peer)))?;
        tracing::trace!("{} replied {:?}", peer, reply);

        PeerResponse::decode(&reply)
    }

    /// Send a request whose only useful answer is `OK`
    async fn acknowledged(&self, peer: SocketAddr, request: PeerRequest) -> bool {
        match self.request(peer, &request).await {
            Ok(PeerResponse::Ok) => true,
            Ok(other) => {
                tracing::debug!("{} answered {:?} with {:?}", peer, request, other);
                false
            }
            Err(e) => {
                tracing::warn!("Request to {} failed: {}", peer, e);
                false
            }
        }
    }
}

impl PeerLink for Communicator {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn connect(&self, peer: SocketAddr) -> HashSet<RoutingTableEntry> {
        match self.request(peer, &PeerRequest::GetRoutingTable).await {
            Ok(PeerResponse::Table(entries)) => entries.into_iter().collect(),
            Ok(other) => {
                tracing::warn!("{} refused its routing table: {:?}", peer, other);
                HashSet::new()
            }
            Err(e) => {
                tracing::warn!("Could not fetch routing table from {}: {}", peer, e);
                HashSet::new()
            }
        }
    }

    async fn disconnect(&self, peer: SocketAddr, departing: SocketAddr) -> bool {
        self.acknowledged(peer, PeerRequest::Leave { address: departing })
            .await
    }

    async fn announce(&self, peer: SocketAddr, joined: RoutingTableEntry) -> bool {
        self.acknowledged(peer, PeerRequest::NewNode(joined)).await
    }

    async fn ping(
        &self,
        peer: SocketAddr,
        node_id: NodeId,
        entries: Vec<RoutingTableEntry>,
    ) -> Result<HashSet<RoutingTableEntry>> {
        match self.request(peer, &PeerRequest::Ping { node_id, entries }).await? {
            PeerResponse::Table(entries) => Ok(entries.into_iter().collect()),
            PeerResponse::Failed => Err(Error::Protocol(format!("{} refused PING", peer))),
            PeerResponse::Ok => Err(Error::Protocol(format!("{} answered PING without a table", peer))),
        }
    }
}
