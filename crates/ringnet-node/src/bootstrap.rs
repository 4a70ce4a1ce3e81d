//! Bootstrap server client
//!
//! Registers and unregisters this node with the rendezvous service over UDP.
//! Each attempt opens a fresh socket, sends one framed request and waits for
//! one framed reply from the server's address; transport failures are retried under the configured
//! [`RetryPolicy`].

use crate::config::BootstrapConfig;
use ringnet_core::proto::{self, BootstrapRequest, BootstrapResponse};
use ringnet_core::{Error, NodeIdentity, Rendezvous, Result, RetryPolicy};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest reply we expect from the bootstrap server
const MAX_DATAGRAM: usize = 65_507;

/// UDP client for the bootstrap server
#[derive(Debug, Clone)]
pub struct BootstrapConnector {
    server: SocketAddr,
    retry: RetryPolicy,
    timeout: Duration,
}

impl BootstrapConnector {
    pub fn new(server: SocketAddr, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            server,
            retry,
            timeout,
        }
    }

    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self::new(config.address, config.retry_policy(), config.timeout())
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn exchange(&self, request: &BootstrapRequest) -> Result<BootstrapResponse> {
        let framed = proto::frame(&request.encode())?;
        let framed = framed.as_str();
        let this = self;
        self.retry
            .run(request.command(), move || this.attempt(framed))
            .await
    }

    async fn attempt(&self, framed: &str) -> Result<BootstrapResponse> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(framed.as_bytes(), self.server).await?;
        tracing::debug!("Sent {:?} to bootstrap server {}", framed, self.server);

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = loop {
            let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::Timeout(self.timeout))??;
            if from == self.server {
                break len;
            }
            tracing::warn!("Ignoring datagram from {}, expected {}", from, self.server);
        };

        let raw = std::str::from_utf8(&buf[..len])
            .map_err(|e| Error::Malformed(format!("reply is not UTF-8: {}", e)))?;
        tracing::debug!("Bootstrap server replied {:?}", raw);

        BootstrapResponse::decode(proto::unframe(raw)?)
    }
}

impl Rendezvous for BootstrapConnector {
    async fn register(&self, identity: &NodeIdentity) -> Result<Vec<SocketAddr>> {
        let request = BootstrapRequest::Register {
            ip: identity.ip,
            port: identity.port,
            username: identity.username.clone(),
        };

        match self.exchange(&request).await? {
            BootstrapResponse::Registered { peers } => Ok(peers),
            BootstrapResponse::RegisterFailed { code } => {
                tracing::warn!(
                    "Bootstrap server refused registration: {} ({})",
                    proto::status::describe(code),
                    code
                );
                Err(Error::Rejected { code })
            }
            other => Err(Error::Protocol(format!("unexpected reply to REG: {:?}", other))),
        }
    }

    async fn unregister(&self, identity: &NodeIdentity) -> Result<bool> {
        let request = BootstrapRequest::Unregister {
            ip: identity.ip,
            port: identity.port,
            username: identity.username.clone(),
        };

        match self.exchange(&request).await? {
            BootstrapResponse::Unregistered { code } => Ok(code == proto::status::OK),
            other => Err(Error::Protocol(format!("unexpected reply to UNREG: {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A scripted bootstrap server: `reply(n, request)` answers the n-th
    /// datagram, `None` stays silent.
    async fn fake_server<F>(reply: F) -> (SocketAddr, Arc<AtomicU32>)
    where
        F: Fn(u32, &str) -> Option<String> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&received);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let request = String::from_utf8_lossy(&buf[..len]).to_string();
                if let Some(response) = reply(n, &request) {
                    let _ = socket.send_to(response.as_bytes(), from).await;
                }
            }
        });

        (addr, received)
    }

    fn connector(server: SocketAddr) -> BootstrapConnector {
        BootstrapConnector::new(server, RetryPolicy::default(), Duration::from_millis(100))
    }

    fn identity() -> NodeIdentity {
        NodeIdentity::new("127.0.0.1".parse().unwrap(), 4000, "tester")
    }

    #[tokio::test]
    async fn test_register_returns_peers() {
        let (server, received) = fake_server(|_, request| {
            assert_eq!(request, "0030 REG~127.0.0.1~4000~tester");
            Some(proto::frame("REGOK~2~127.0.0.1~4100~127.0.0.1~4101").unwrap())
        })
        .await;

        let peers = connector(server).register(&identity()).await.unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:4100".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:4101".parse().unwrap()
            ]
        );
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_retries_exhausted() {
        let (server, received) = fake_server(|_, _| None).await;

        let result = connector(server).register(&identity()).await;
        match result {
            Err(Error::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::Timeout(_)));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried() {
        let (server, received) = fake_server(|n, _| {
            if n == 1 {
                Some("garbage".to_string())
            } else {
                Some(proto::frame("REGOK~0").unwrap())
            }
        })
        .await;

        let peers = connector(server).register(&identity()).await.unwrap();
        assert!(peers.is_empty());
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_final() {
        let (server, received) =
            fake_server(|_, _| Some(proto::frame("REGOK~9998").unwrap())).await;

        let result = connector(server).register(&identity()).await;
        assert!(matches!(result, Err(Error::Rejected { code: 9998 })));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (server, _) = fake_server(|n, request| {
            assert!(request.ends_with("UNREG~127.0.0.1~4000~tester"));
            let code = if n == 1 { 0 } else { 9999 };
            Some(proto::frame(&format!("UNREGOK~{}", code)).unwrap())
        })
        .await;

        let connector = connector(server);
        assert!(connector.unregister(&identity()).await.unwrap());
        assert!(!connector.unregister(&identity()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_from_another_address_is_ignored() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let Ok((_, from)) = server.recv_from(&mut buf).await else {
                return;
            };
            let forged = proto::frame("REGOK~1~10.0.0.1~9999").unwrap();
            let _ = impostor.send_to(forged.as_bytes(), from).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let genuine = proto::frame("REGOK~1~127.0.0.1~4100").unwrap();
            let _ = server.send_to(genuine.as_bytes(), from).await;
        });

        let connector =
            BootstrapConnector::new(addr, RetryPolicy::new(1, Duration::ZERO), Duration::from_secs(1));
        let peers = connector.register(&identity()).await.unwrap();
        assert_eq!(peers, vec!["127.0.0.1:4100".parse::<SocketAddr>().unwrap()]);
    }
}
