//! WebTransport server implementation
//!
//! Each accepted session gets one connection unit: it resolves identity,
//! registers with the session actor, then runs a reader loop on the
//! bidirectional stream while a writer task drains the outbound queue.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use wtransport::VarInt;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::framing::{read_message, write_message, FramingError};
use crate::net::tls::TlsConfig;
use crate::session::client::Channels;
use crate::session::{Dispatcher, Handshake, IdentityResolver, Payload, SessionHandle};

/// Application close code sent when a session is refused
const CLOSE_REFUSED: u32 = 4003;

/// Shared by every connection unit
struct ConnectionContext {
    session: SessionHandle,
    identity: IdentityResolver,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    outbound_capacity: usize,
    trust_forwarded_for: bool,
}

/// WebTransport server
pub struct PresenceServer {
    config: ServerConfig,
    tls_config: TlsConfig,
    context: Arc<ConnectionContext>,
}

impl PresenceServer {
    pub fn new(
        config: ServerConfig,
        tls_config: TlsConfig,
        session: SessionHandle,
        identity: IdentityResolver,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        let context = Arc::new(ConnectionContext {
            session,
            identity,
            dispatcher,
            metrics,
            outbound_capacity: config.outbound_queue_capacity,
            trust_forwarded_for: config.trust_forwarded_for,
        });
        Self {
            config,
            tls_config,
            context,
        }
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        &self.tls_config.cert_hash
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Run the accept loop
    pub async fn run(self) -> anyhow::Result<()> {
        use wtransport::Endpoint;
        use wtransport::ServerConfig;

        // Unspecified address binds dual-stack
        let builder = ServerConfig::builder();
        let builder = if self.config.bind_address.is_unspecified() {
            builder.with_bind_default(self.config.port)
        } else {
            builder.with_bind_address(self.bind_addr())
        };
        let server_config = builder.with_identity(self.tls_config.identity).build();

        let server = Endpoint::server(server_config)?;

        tracing::info!("WebTransport server listening on port {}", self.config.port);

        loop {
            let incoming = server.accept().await;
            let context = self.context.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(incoming, context).await {
                    tracing::warn!("Connection error: {}", e);
                }
            });
        }
    }
}

/// First `X-Forwarded-For` entry, if it is an address
pub fn forwarded_address(header: Option<&str>) -> Option<IpAddr> {
    header?.split(',').next()?.trim().parse().ok()
}

/// Handle a single WebTransport connection
async fn handle_connection(
    incoming: wtransport::endpoint::IncomingSession,
    ctx: Arc<ConnectionContext>,
) -> anyhow::Result<()> {
    let session_request = incoming.await?;

    let handshake = Handshake::from_path(session_request.path());
    let forwarded = if ctx.trust_forwarded_for {
        forwarded_address(
            session_request
                .headers()
                .get("x-forwarded-for")
                .map(String::as_str),
        )
    } else {
        None
    };

    let connection = session_request.accept().await?;
    let addr = forwarded.unwrap_or_else(|| connection.remote_address().ip());

    let admission = match ctx.identity.resolve(&handshake, addr).await {
        Ok(admission) => admission,
        Err(e) => {
            connection.close(VarInt::from_u32(CLOSE_REFUSED), e.to_string().as_bytes());
            return Ok(());
        }
    };

    let (mut send, mut recv) = connection.accept_bi().await?;

    let (outbound, mut outbound_rx) = mpsc::channel::<Payload>(ctx.outbound_capacity);
    let (hangup, mut hangup_rx) = oneshot::channel();

    let client = match ctx.session.connect(admission, Channels { outbound, hangup }).await {
        Ok(client) => client,
        Err(e) => {
            connection.close(VarInt::from_u32(CLOSE_REFUSED), e.to_string().as_bytes());
            return Ok(());
        }
    };

    // Writer: ends once the record drops its queue sender
    let metrics = ctx.metrics.clone();
    let uuid = client.uuid.clone();
    tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(e) = write_message(&mut send, payload.as_bytes()).await {
                tracing::debug!("Write to {} failed: {}", uuid, e);
                break;
            }
            Metrics::incr(&metrics.messages_sent);
            metrics
                .bytes_sent
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
    });

    loop {
        tokio::select! {
            _ = &mut hangup_rx => {
                tracing::debug!("Connection {} for {} released by server", client.connection_id, client.uuid);
                break;
            }
            frame = read_message(&mut recv) => match frame {
                Ok(bytes) => {
                    ctx.metrics
                        .bytes_received
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    ctx.dispatcher
                        .process_frame(&client.uuid, client.connection_id, &bytes)
                        .await;
                }
                Err(e) if e.is_recoverable() => {
                    Metrics::incr(&ctx.metrics.protocol_errors);
                    tracing::warn!("{} from {}", e, client.uuid);
                }
                Err(FramingError::ConnectionClosed) => break,
                Err(e) => {
                    Metrics::incr(&ctx.metrics.protocol_errors);
                    tracing::warn!("Closing {}: {}", client.uuid, e);
                    break;
                }
            }
        }
    }

    if let Err(e) = ctx
        .session
        .disconnect_connection(&client.uuid, client.connection_id)
        .await
    {
        tracing::debug!("Disconnect for {} not delivered: {}", client.uuid, e);
    }
    tracing::debug!("Connection closed (conn_id: {})", client.connection_id);
    Ok(())
}
