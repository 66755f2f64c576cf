//! Agent session handling
//!
//! Each inbound connection goes through the preamble handshake:
//!
//! ```text
//! Connected ──► Authenticated ──► Registering ──► Active ──► Closed
//!     │               │                │
//!     └─ bad tag      └─ bad token /   └─ registration error
//!        (no reply)      capability       (rolled back)
//! ```
//!
//! Once active, the connection belongs to a mux [`Session`] and every
//! service from the preamble maps to that session in the active-session map
//! until the agent disconnects.

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::handler::{StreamContext, StreamHandler};
use crate::inbound::InboundServer;
use crate::recent::RecentCatalog;
use hzn_auth::{TokenValidator, ValidToken};
use hzn_control::rpc::serve_connection;
use hzn_control::{ControlError, ControlPlane, RpcError};
use hzn_mux::{Mode, Session};
use hzn_proto::{
    Confirmation, FramingReader, FramingWriter, Preamble, ServiceId, ServiceRequest,
    ALPN_RPC, CONFIRMATION_TAG, PREAMBLE_TAG, SERVE_CAPABILITY,
};
use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Where a connection is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Registering,
    Active,
    Rejected,
    Closed,
}

impl SessionState {
    /// Whether a connection in this state may move to `next`
    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Connected, Authenticated | Rejected)
                | (Authenticated, Registering | Rejected)
                | (Registering, Active)
                | (Active, Closed)
        )
    }
}

pub struct Hub {
    config: HubConfig,
    control: Arc<dyn ControlPlane>,
    validator: TokenValidator,
    handler: Arc<dyn StreamHandler>,
    inbound: Arc<InboundServer>,
    /// service id -> session serving it
    active: RwLock<HashMap<String, Arc<Session>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Hub {
    /// `validator` checks agent tokens and the control plane's inbound calls.
    pub fn new(
        config: HubConfig,
        control: Arc<dyn ControlPlane>,
        validator: TokenValidator,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let inbound = Arc::new(InboundServer::new(
            validator.clone(),
            Arc::new(RecentCatalog::new()),
        ));

        Self {
            config,
            control,
            validator,
            handler,
            inbound,
            active: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Services and label links pushed by the control plane
    pub fn recent(&self) -> &Arc<RecentCatalog> {
        self.inbound.catalog()
    }

    pub fn inbound(&self) -> Arc<InboundServer> {
        self.inbound.clone()
    }

    /// Session currently serving `service_id`
    pub async fn session_for(&self, service_id: &ServiceId) -> Option<Arc<Session>> {
        self.active
            .read()
            .await
            .get(&service_id.map_key())
            .cloned()
    }

    /// Keys of every service with a live session
    pub async fn active_services(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Accept TLS connections until [`shutdown`](Self::shutdown)
    ///
    /// Connections negotiating ALPN `hzn-rpc` are served as control-plane
    /// RPC; everything else goes through the agent handshake.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Hub listening for agents");

        while let Some((tcp, peer)) = self.next_connection(&listener).await {
            let hub = self.clone();
            let acceptor = acceptor.clone();

            self.tracker.spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(%peer, "TLS handshake failed: {}", e);
                        return;
                    }
                };

                let is_rpc = stream.get_ref().1.alpn_protocol() == Some(ALPN_RPC);
                if is_rpc {
                    debug!(%peer, "Control plane connection");
                    // RPC connections carry no agent state; drop them on shutdown.
                    tokio::select! {
                        _ = hub.shutdown.cancelled() => {}
                        result = serve_connection(stream, hub.inbound.clone(), hub.config.mux.clone()) => {
                            if let Err(e) = result {
                                debug!(%peer, "RPC connection ended: {}", e);
                            }
                        }
                    }
                } else if let Err(e) = hub.handle_conn(stream).await {
                    debug!(%peer, "Agent connection ended: {}", e);
                }
            });
        }

        Ok(())
    }

    /// Accept plain TCP agent connections until [`shutdown`](Self::shutdown)
    pub async fn serve_plain(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        while let Some((tcp, peer)) = self.next_connection(&listener).await {
            let hub = self.clone();
            self.tracker.spawn(async move {
                if let Err(e) = hub.handle_conn(tcp).await {
                    debug!(%peer, "Agent connection ended: {}", e);
                }
            });
        }

        Ok(())
    }

    async fn next_connection(
        &self,
        listener: &TcpListener,
    ) -> Option<(tokio::net::TcpStream, SocketAddr)> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Hub stopped accepting connections");
                    return None;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer)) => {
                    let _ = tcp.set_nodelay(true);
                    return Some((tcp, peer));
                }
                Err(e) => {
                    error!("error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Stop accepting connections and new streams
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every connection and stream task to finish
    pub async fn wait_to_drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Run one agent connection from preamble to teardown
    pub async fn handle_conn<S>(self: &Arc<Self>, conn: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let mut reader =
            FramingReader::new(read_half).with_max_frame_size(self.config.max_frame_size);
        let mut writer = FramingWriter::new(write_half);
        let mut state = SessionState::Connected;

        let read = tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("Hub shutting down before preamble arrived");
                return Ok(());
            }
            read = reader.read_marshal::<Preamble>() => read,
        };
        let (tag, _, preamble) = match read {
            Ok(frame) => frame,
            Err(e) => {
                error!("error decoding preamble: {}", e);
                return Err(e.into());
            }
        };
        reader.recycle();

        if tag != PREAMBLE_TAG {
            error!(tag, "protocol error detected in preamble");
            return Err(HubError::Protocol(format!("unexpected preamble tag {}", tag)));
        }

        let session_id = hex(&preamble.session_id);

        let token = match self.validator.validate(&preamble.token) {
            Ok(token) => token,
            Err(e) => {
                warn!(session_id = %session_id, "invalid token: {}", e);
                transition(&mut state, SessionState::Rejected, &session_id);
                reject(&mut writer, Confirmation::BAD_TOKEN).await;
                return Err(e.into());
            }
        };
        transition(&mut state, SessionState::Authenticated, &session_id);

        if !preamble.services.is_empty() && !token.has_capability(SERVE_CAPABILITY) {
            warn!(
                session_id = %session_id,
                account_id = token.account_id(),
                "token missing {} capability", SERVE_CAPABILITY
            );
            transition(&mut state, SessionState::Rejected, &session_id);
            reject(&mut writer, Confirmation::BAD_TOKEN_CAPABILITY).await;
            return Err(HubError::MissingCapability(SERVE_CAPABILITY));
        }

        transition(&mut state, SessionState::Registering, &session_id);
        let requests: Vec<ServiceRequest> = preamble
            .services
            .iter()
            .map(|service| ServiceRequest::new(token.account().clone(), self.config.hub_id, service))
            .collect();
        self.register(&requests).await?;

        if let Err(e) = writer
            .write_marshal(CONFIRMATION_TAG, &Confirmation::new(Confirmation::CONNECTED))
            .await
        {
            error!(session_id = %session_id, "error writing confirmation: {}", e);
            self.deregister(&requests).await;
            return Err(e.into());
        }
        reader.recycle();
        writer.recycle();

        let session = Arc::new(Session::from_parts(
            reader.into_inner(),
            writer.into_inner(),
            self.config.mux.clone(),
            Mode::Server,
        ));

        let keys: Vec<String> = requests.iter().map(|req| req.id.map_key()).collect();
        {
            let mut active = self.active.write().await;
            for key in &keys {
                active.insert(key.clone(), session.clone());
            }
        }
        transition(&mut state, SessionState::Active, &session_id);
        info!(
            session_id = %session_id,
            account_id = token.account_id(),
            services = keys.len(),
            "agent connected"
        );

        let result = self.accept_streams(&session, &token, &session_id).await;

        {
            let mut active = self.active.write().await;
            for key in &keys {
                if active
                    .get(key)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    active.remove(key);
                }
            }
        }
        session.close();
        transition(&mut state, SessionState::Closed, &session_id);

        self.deregister(&requests).await;

        result
    }

    async fn accept_streams(
        &self,
        session: &Session,
        token: &ValidToken,
        session_id: &str,
    ) -> Result<()> {
        let streams = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(session_id, "Hub shutting down, no new streams accepted");
                    // Let running streams finish before the session goes away.
                    streams.close();
                    streams.wait().await;
                    break Ok(());
                }
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(Some(stream)) => {
                    trace!(session_id, stream_id = stream.stream_id(), "accepted stream");
                    let ctx = StreamContext::new(stream, token.clone());
                    let handler = self.handler.clone();
                    self.tracker.spawn(streams.track_future(async move {
                        handler.handle_stream(ctx).await;
                    }));
                }
                Ok(None) => {
                    info!(session_id, "agent disconnected");
                    break Ok(());
                }
                Err(e) => {
                    error!(session_id, "error accepting new stream: {}", e);
                    break Err(e.into());
                }
            }
        }
    }

    /// Register every service in order, rolling back on the first failure
    async fn register(&self, requests: &[ServiceRequest]) -> Result<()> {
        for (i, request) in requests.iter().enumerate() {
            let added = self.bounded(self.control.add_service(request)).await;
            if let Err(e) = added {
                error!(service_id = %request.id, "error registering service: {}", e);
                self.deregister(&requests[..i]).await;

                return Err(HubError::Registration {
                    service_id: request.id,
                    source: e,
                });
            }
            debug!(service_id = %request.id, "Service registered");
        }

        Ok(())
    }

    /// Deregister every service in order, continuing past failures
    async fn deregister(&self, requests: &[ServiceRequest]) {
        for request in requests {
            match self.bounded(self.control.remove_service(request)).await {
                Ok(()) => debug!(service_id = %request.id, "Service deregistered"),
                Err(e) => error!(service_id = %request.id, "error removing service: {}", e),
            }
        }
    }

    /// Give up on a control-plane call after the configured timeout
    async fn bounded<F>(&self, call: F) -> hzn_control::Result<()>
    where
        F: Future<Output = hzn_control::Result<()>>,
    {
        let limit = self.config.control_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Rpc(RpcError::Timeout(format!(
                "control plane did not answer within {:?}",
                limit
            )))),
        }
    }
}

/// Send a failed confirmation and close the write side
async fn reject<W>(writer: &mut FramingWriter<W>, status: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer
        .write_marshal(CONFIRMATION_TAG, &Confirmation::new(status))
        .await
    {
        debug!("error writing {} confirmation: {}", status, e);
    }
    writer.recycle();
    let _ = writer.shutdown().await;
}

fn transition(state: &mut SessionState, next: SessionState, session_id: &str) {
    if !state.can_become(next) {
        warn!(session_id, from = ?*state, to = ?next, "unexpected session state change");
    }
    trace!(session_id, from = ?*state, to = ?next, "Session state change");
    *state = next;
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
