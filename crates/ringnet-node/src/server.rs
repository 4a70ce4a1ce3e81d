//! Inbound peer server
//!
//! Answers requests from other overlay members. The server is a pure
//! responder: it reads one frame per connection, applies it to the shared
//! routing table and writes one frame back. Only a connected node touches
//! its table; everything else is answered with `FAILED`.

use crate::error::Result;
use crate::state::{NodeState, StateMachine};
use parking_lot::{Mutex, RwLock};
use ringnet_core::proto::{PeerRequest, PeerResponse, SyncKind};
use ringnet_core::transport::{read_frame, write_frame};
use ringnet_core::{NodeIdentity, RoutingTableEntry};
use ringnet_dht::{MergeOutcome, RoutingTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Shared node state the request handler works on
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub table: Arc<RoutingTable>,
    pub state: Arc<StateMachine>,
    pub identity: Arc<RwLock<NodeIdentity>>,
}

impl ServerContext {
    fn is_local(&self, address: &SocketAddr) -> bool {
        self.identity.read().address() == *address
    }

    /// Merge entries received from a peer, never overwriting our own
    fn merge_remote(&self, entries: Vec<RoutingTableEntry>) -> usize {
        let local = self.identity.read().address();
        self.table
            .merge(entries.into_iter().filter(|entry| entry.address != local))
    }

    fn snapshot(&self) -> PeerResponse {
        PeerResponse::Table(self.table.sorted_entries())
    }

    /// Apply one decoded request and build the reply
    pub fn handle_request(&self, request: PeerRequest) -> PeerResponse {
        let connected = self.state.is(NodeState::Connected);

        match request {
            PeerRequest::GetRoutingTable if connected => self.snapshot(),
            PeerRequest::NewNode(entry) if connected => {
                if self.is_local(&entry.address) {
                    return PeerResponse::Failed;
                }
                match self.table.add_entry(entry) {
                    MergeOutcome::Inserted => tracing::info!("New member {}", entry),
                    MergeOutcome::Corrected { previous } => {
                        tracing::info!("Member {} changed id from {}", entry, previous)
                    }
                    MergeOutcome::Unchanged => {}
                }
                PeerResponse::Ok
            }
            PeerRequest::Sync {
                kind: SyncKind::RoutingTable,
                entries,
            } if connected => {
                let changed = self.merge_remote(entries);
                tracing::debug!("Routing table sync changed {} entries", changed);
                PeerResponse::Ok
            }
            PeerRequest::Ping { node_id, entries } if connected => {
                let changed = self.merge_remote(entries);
                tracing::debug!("Ping from node {} changed {} entries", node_id, changed);
                self.snapshot()
            }
            PeerRequest::Leave { address } if connected => {
                if !self.is_local(&address) && self.table.remove_address(&address) {
                    tracing::info!("Member {} left", address);
                    PeerResponse::Ok
                } else {
                    PeerResponse::Failed
                }
            }
            request => {
                tracing::debug!("Refusing {:?} while {}", request, self.state.current());
                PeerResponse::Failed
            }
        }
    }

    /// Decode a raw payload and handle it; undecodable input gets `FAILED`
    pub fn handle_payload(&self, payload: &str) -> PeerResponse {
        match PeerRequest::decode(payload) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                tracing::warn!("Undecodable peer request {:?}: {}", payload, e);
                PeerResponse::Failed
            }
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// TCP listener serving [`ServerContext`] to peers
pub struct NodeServer {
    request_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl NodeServer {
    /// A peer gets `request_timeout` to deliver its frame and read the reply
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            running: Mutex::new(None),
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bind `bind` and start accepting; returns the bound address
    pub async fn start(&self, bind: SocketAddr, ctx: ServerContext) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(bind)
            .await
            .map_err(ringnet_core::Error::from)?;
        let local_addr = listener.local_addr().map_err(ringnet_core::Error::from)?;
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, ctx, self.request_timeout, signal));

        tracing::info!("Peer server listening on {}", local_addr);
        *self.running.lock() = Some(Running {
            local_addr,
            shutdown,
            handle,
        });
        Ok(local_addr)
    }

    /// Stop accepting and drop every open connection; a no-op when not running
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            tracing::warn!("Peer server task ended abnormally: {}", e);
        }
        tracing::info!("Peer server on {} stopped", running.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ServerContext,
    request_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        match tokio::time::timeout(request_timeout, serve(stream, &ctx)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::debug!("Connection from {} failed: {}", peer, e),
                            Err(_) => tracing::debug!("Connection from {} timed out", peer),
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
        }
    }

    if !connections.is_empty() {
        tracing::debug!("Dropping {} open peer connections", connections.len());
    }
    connections.shutdown().await;
}

async fn serve(mut stream: TcpStream, ctx: &ServerContext) -> ringnet_core::Result<()> {
    let Some(payload) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    let reply = ctx.handle_payload(&payload).encode()?;
    write_frame(&mut stream, &reply).await
}
