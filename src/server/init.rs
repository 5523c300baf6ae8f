use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::{sleep, timeout, Duration},
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument::WithSubscriber, warn};

use crate::{
    logger::Logger,
    sender::Sender,
    server::{
        dispatcher::dispatcher,
        error::{LockboxError, Result},
        helpers::{self, MAX_MESSAGE_BYTES},
        shutdown::ShutdownSignal,
    },
    storage::Storage,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_COMMAND: &str = "CLOSE";
const TIMEOUT_RESPONSE: &str = "error:timeout";
const INVALID_RESPONSE: &str = "error:invalid command";
const TOO_LARGE_RESPONSE: &str = "error:message too large";

/// Everything a connection task needs, shared across all of them.
pub struct Context {
    pub logger: Logger,
    pub storage: Storage,
    pub sender: Arc<dyn Sender>,
    pub tls: Option<TlsAcceptor>,
}

impl Context {
    async fn report_error(&self, peer: SocketAddr, err: &LockboxError) {
        error!(%peer, error = %err, "connection terminated with error");

        let Some(recipient) = self.logger.notify_errors() else {
            return;
        };
        let body = format!("Connection from {peer} terminated with error: {err}");
        if let Err(send_err) = self.sender.send(recipient, "lockbox error", &body).await {
            warn!(error = %send_err, "unable to deliver error notification");
        }
    }
}

/// Accepts until `shutdown` fires, then hands back the still-running
/// connection tasks so the caller can drain them.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<Context>,
    shutdown: ShutdownSignal,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let ctx = Arc::clone(&ctx);
                    let shutdown = shutdown.clone();
                    connections.spawn(
                        serve(stream, peer, ctx, shutdown).with_current_subscriber(),
                    );
                }
                Err(err) => {
                    warn!(error = %err, "listener accept error");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = finished {
                    if err.is_panic() {
                        error!("connection task panicked");
                    }
                }
            }
        }
    }

    info!(in_flight = connections.len(), "stopped accepting connections");
    connections
}

async fn serve(stream: TcpStream, peer: SocketAddr, ctx: Arc<Context>, shutdown: ShutdownSignal) {
    let result = match &ctx.tls {
        Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => handle_connection(tls_stream, &ctx, &shutdown).await,
            Ok(Err(err)) => Err(LockboxError::Io(err)),
            Err(_) => Err(LockboxError::ClientTimeout),
        },
        None => handle_connection(stream, &ctx, &shutdown).await,
    };

    match result {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(LockboxError::ClientDisconnected | LockboxError::ClientTimeout) => {
            debug!(%peer, "client went away")
        }
        Err(err) => ctx.report_error(peer, &err).await,
    }
}

async fn handle_connection<S>(mut stream: S, ctx: &Context, shutdown: &ShutdownSignal) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let read = tokio::select! {
            _ = shutdown.recv() => {
                let _ = stream.shutdown().await;
                return Ok(());
            }
            read = timeout(
                IDLE_TIMEOUT,
                helpers::read_message(&mut stream, MAX_MESSAGE_BYTES),
            ) => read,
        };

        let command = match read {
            Ok(Ok(command)) => command,
            Ok(Err(LockboxError::InvalidCommand(_))) => {
                helpers::write_message(&mut stream, INVALID_RESPONSE).await?;
                continue;
            }
            Ok(Err(err @ LockboxError::MessageTooLarge(_))) => {
                let _ = helpers::write_message(&mut stream, TOO_LARGE_RESPONSE).await;
                return Err(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let _ = helpers::write_message(&mut stream, TIMEOUT_RESPONSE).await;
                return Err(LockboxError::ClientTimeout);
            }
        };

        if command.trim().is_empty() {
            helpers::write_message(&mut stream, INVALID_RESPONSE).await?;
            continue;
        }

        if command == CLOSE_COMMAND {
            helpers::write_message(&mut stream, "Closing connection").await?;
            stream.shutdown().await?;
            return Ok(());
        }

        let response = match dispatcher(command, ctx).await {
            Ok(response) => response,
            Err(LockboxError::InvalidCommand(_)) => INVALID_RESPONSE.into(),
            Err(err) => return Err(err),
        };

        helpers::write_message(&mut stream, &response).await?;
    }
}
