//! Pooled outbound RPC connections
//!
//! One connection per target address, shared by every caller. Each target
//! has its own slot in the cache; a dial locks only that slot while it
//! connects, so concurrent first use of a target dials it exactly once and
//! a slow target never holds up callers of another one.

use crate::compression;
use crate::error::{Result, RpcError};
use crate::methods;
use crate::rpc::{RpcChannel, DEFAULT_CALL_TIMEOUT};
use crate::tls;
use crate::HubServicesClient;
use async_trait::async_trait;
use hzn_auth::AUTHORIZATION;
use hzn_mux::MuxConfig;
use hzn_proto::{AccountServices, Compression, LabelLinks, Metadata, Noop, ALPN_RPC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long establishing a connection may take, TCP through RPC hello
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a new RPC connection to a target
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &str) -> std::result::Result<RpcChannel, RpcError>;
}

/// Connects over TCP + TLS with ALPN `hzn-rpc`
pub struct TlsConnector {
    tls: tokio_rustls::TlsConnector,
    mux: MuxConfig,
    compression: Vec<Compression>,
    call_timeout: Duration,
}

impl TlsConnector {
    /// With `pinned_cert_pem`, peers must present a chain issued by exactly
    /// that certificate; otherwise the webpki roots are trusted.
    pub fn new(pinned_cert_pem: Option<&[u8]>) -> Result<Self> {
        let config = tls::client_config(pinned_cert_pem, &[ALPN_RPC])?;

        Ok(Self {
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
            mux: MuxConfig::default(),
            compression: compression::SUPPORTED.to_vec(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_mux_config(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    /// Compression offered to the server, most preferred first
    pub fn with_compression(mut self, offer: Vec<Compression>) -> Self {
        self.compression = offer;
        self
    }

    /// Deadline applied to every call on connections this connector opens
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, target: &str) -> std::result::Result<RpcChannel, RpcError> {
        let server_name = tls::server_name(target).map_err(|e| RpcError::Tls(e.to_string()))?;

        let tcp = TcpStream::connect(target).await?;
        tcp.set_nodelay(true)?;

        let stream = self.tls.connect(server_name, tcp).await?;
        if stream.get_ref().1.alpn_protocol() != Some(ALPN_RPC) {
            return Err(RpcError::Protocol(format!(
                "{} did not negotiate {}",
                target,
                String::from_utf8_lossy(ALPN_RPC)
            )));
        }

        let channel =
            RpcChannel::handshake(stream, target, self.mux.clone(), &self.compression).await?;
        Ok(channel.with_call_timeout(self.call_timeout))
    }
}

/// A client stub over a pooled connection
///
/// Every call carries the pool's bearer token, if one was configured.
#[derive(Clone)]
pub struct PooledClient {
    channel: Arc<RpcChannel>,
    token: Option<Arc<str>>,
}

impl PooledClient {
    pub fn new(channel: Arc<RpcChannel>, token: Option<Arc<str>>) -> Self {
        Self { channel, token }
    }

    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> std::result::Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut metadata = Metadata::new();
        if let Some(token) = &self.token {
            metadata.insert(AUTHORIZATION, token.as_ref());
        }

        self.channel.call(method, metadata, request).await
    }

    pub fn target(&self) -> &str {
        self.channel.target()
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("channel", &self.channel)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl HubServicesClient for PooledClient {
    async fn add_services(&self, update: &AccountServices) -> Result<Noop> {
        Ok(self.call(methods::ADD_SERVICES, update).await?)
    }

    async fn add_label_links(&self, links: &LabelLinks) -> Result<Noop> {
        Ok(self.call(methods::ADD_LABEL_LINKS, links).await?)
    }
}

/// Opens hub clients for the broadcaster
#[async_trait]
pub trait HubDialer: Send + Sync {
    async fn dial_hub(&self, target: &str) -> Result<Box<dyn HubServicesClient>>;
}

/// Cached connection of one target; locked while it is being (re)dialed
type Slot = Arc<Mutex<Option<Arc<RpcChannel>>>>;

/// Cache of outbound connections keyed by target address
pub struct ConnectionPool {
    token: Option<Arc<str>>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    slots: RwLock<HashMap<String, Slot>>,
}

impl ConnectionPool {
    /// Pool dialing over TLS
    ///
    /// `token` is sent as the bearer token on every call; `cert_pem`, when
    /// given, becomes the only trusted root.
    pub fn new(token: Option<String>, cert_pem: Option<&[u8]>) -> Result<Self> {
        let connector = TlsConnector::new(cert_pem)?;
        Ok(Self::with_connector(token, Arc::new(connector)))
    }

    pub fn with_connector(token: Option<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get a client for `target`, connecting on first use
    ///
    /// A cached connection whose session has shut down is replaced. Failed
    /// attempts are not cached. Connecting gives up after the pool's
    /// connect timeout.
    pub async fn dial(&self, target: &str) -> std::result::Result<PooledClient, RpcError> {
        let slot = self.slot(target).await;
        let mut cached = slot.lock().await;

        // Another caller may have connected while we waited for the slot.
        if let Some(channel) = cached.as_ref() {
            if !channel.is_closed() {
                return Ok(self.client(channel.clone()));
            }
            debug!(peer = %target, "Evicting closed pooled connection");
            *cached = None;
        }

        info!(peer = %target, "Opening pooled connection");
        let channel =
            match tokio::time::timeout(self.connect_timeout, self.connector.connect(target)).await {
                Ok(channel) => Arc::new(channel?),
                Err(_) => {
                    warn!(peer = %target, "Timed out opening pooled connection");
                    return Err(RpcError::Timeout(format!(
                        "connecting to {} after {:?}",
                        target, self.connect_timeout
                    )));
                }
            };
        *cached = Some(channel.clone());

        Ok(self.client(channel))
    }

    /// Slot of `target`, created on first use
    async fn slot(&self, target: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(target) {
            return slot.clone();
        }

        self.slots
            .write()
            .await
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    /// Number of cached connections
    ///
    /// Waits for dials in progress to settle.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();

        let mut connected = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                connected += 1;
            }
        }
        connected
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn client(&self, channel: Arc<RpcChannel>) -> PooledClient {
        PooledClient::new(channel, self.token.clone())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HubDialer for ConnectionPool {
    async fn dial_hub(&self, target: &str) -> Result<Box<dyn HubServicesClient>> {
        Ok(Box::new(self.dial(target).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{reply, serve_connection, RpcCall, RpcHandler, Status};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Whoami;

    #[async_trait]
    impl RpcHandler for Whoami {
        async fn handle(&self, call: RpcCall) -> std::result::Result<Vec<u8>, Status> {
            reply(&call.metadata.get(AUTHORIZATION).map(str::to_string))
        }
    }

    /// Connects to an in-memory RPC server and counts attempts
    #[derive(Default)]
    struct MemoryConnector {
        connects: AtomicUsize,
        refuse: AtomicBool,
        /// Targets that take this long to answer
        slow: Option<(&'static str, Duration)>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, target: &str) -> std::result::Result<RpcChannel, RpcError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Widen the window in which concurrent dials overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some((slow, delay)) = self.slow {
                if slow == target {
                    tokio::time::sleep(delay).await;
                }
            }

            if self.refuse.load(Ordering::SeqCst) {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }

            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_connection(
                server_io,
                Arc::new(Whoami),
                MuxConfig::default(),
            ));
            RpcChannel::handshake(client_io, target, MuxConfig::default(), compression::SUPPORTED)
                .await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_dial_connects_once() {
        let connector = Arc::new(MemoryConnector::default());
        let pool = Arc::new(ConnectionPool::with_connector(
            Some("hub-token".to_string()),
            connector.clone(),
        ));

        let mut callers = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            callers.push(tokio::spawn(async move {
                let client = pool.dial("addr:1234").await.unwrap();
                let seen: Option<String> = client.call("Whoami", &()).await.unwrap();
                assert_eq!(seen.as_deref(), Some("hub-token"));
                client
            }));
        }

        let mut clients = Vec::new();
        for caller in callers {
            clients.push(caller.await.unwrap());
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 1);
        assert!(clients
            .windows(2)
            .all(|pair| Arc::ptr_eq(pair[0].channel(), pair[1].channel())));
    }

    #[tokio::test]
    async fn test_targets_get_separate_connections() {
        let connector = Arc::new(MemoryConnector::default());
        let pool = ConnectionPool::with_connector(None, connector.clone());

        let a = pool.dial("hub-a:443").await.unwrap();
        let b = pool.dial("hub-b:443").await.unwrap();
        let a_again = pool.dial("hub-a:443").await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(a.channel(), a_again.channel()));
        assert!(!Arc::ptr_eq(a.channel(), b.channel()));

        let seen: Option<String> = b.call("Whoami", &()).await.unwrap();
        assert_eq!(seen, None);
    }

    #[tokio::test]
    async fn test_failed_dial_is_not_cached() {
        let connector = Arc::new(MemoryConnector::default());
        connector.refuse.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::with_connector(None, connector.clone());

        assert!(pool.dial("hub-a:443").await.is_err());
        assert!(pool.is_empty().await);

        connector.refuse.store(false, Ordering::SeqCst);
        pool.dial("hub-a:443").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let connector = Arc::new(MemoryConnector::default());
        let pool = ConnectionPool::with_connector(None, connector.clone());

        let first = pool.dial("hub-a:443").await.unwrap();
        first.channel().close();

        let second = pool.dial("hub-a:443").await.unwrap();
        assert!(!Arc::ptr_eq(first.channel(), second.channel()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 1);

        let seen: Option<String> = second.call("Whoami", &()).await.unwrap();
        assert_eq!(seen, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_target_does_not_block_cached_dial() {
        let connector = Arc::new(MemoryConnector {
            slow: Some(("slow:1", Duration::from_secs(3))),
            ..Default::default()
        });
        let pool = Arc::new(ConnectionPool::with_connector(None, connector.clone()));

        pool.dial("fast:1").await.unwrap();

        let slow = tokio::spawn({
            let pool = pool.clone();
            async move { pool.dial("slow:1").await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let fast = pool.dial("fast:1").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let seen: Option<String> = fast.call("Whoami", &()).await.unwrap();
        assert_eq!(seen, None);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        slow.abort();
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = Arc::new(MemoryConnector {
            slow: Some(("slow:1", Duration::from_secs(30))),
            ..Default::default()
        });
        let pool = ConnectionPool::with_connector(None, connector.clone())
            .with_connect_timeout(Duration::from_millis(100));

        let err = pool.dial("slow:1").await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert!(pool.is_empty().await);

        pool.dial("fast:1").await.unwrap();
        assert_eq!(pool.len().await, 1);
    }
}
