//! The network-facing subsystem and its lifecycle.
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Stopped
//!   └──────────────stop──────────────▲
//! ```
//!
//! `start` binds the listener, spawns the accept loop and publishes the bound
//! address on the readiness channel before returning. `stop` stops accepting
//! at once, gives in-flight connections `timeout` to finish and aborts the
//! rest. Both run under the app's logger.

pub mod commands;
pub mod dispatcher;
pub mod error;
pub mod helpers;
pub mod init;
pub mod shutdown;

use std::{mem, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{info, instrument::WithSubscriber, warn};

use crate::{
    config::ServerConfig,
    logger::Logger,
    sender::Sender,
    storage::Storage,
    tls::TlsMaterial,
};
use error::{LockboxError, Result, Subsystem};
use init::Context;
use shutdown::ShutdownSignal;

/// Handles the server shares with the rest of the app.
#[derive(Clone)]
pub struct ServerDeps {
    pub logger: Logger,
    pub storage: Storage,
    pub sender: Arc<dyn Sender>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready(SocketAddr),
    Closed,
}

enum State {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownSignal,
    accept: JoinHandle<JoinSet<()>>,
}

pub struct Server {
    config: ServerConfig,
    ctx: Arc<Context>,
    state: Mutex<State>,
    readiness: watch::Sender<Readiness>,
}

impl Server {
    /// Resolves TLS material up front: a server that requires TLS is not
    /// constructed without it.
    pub fn new(config: ServerConfig, deps: ServerDeps) -> Result<Self> {
        let tls = deps
            .logger
            .in_scope(|| TlsMaterial::for_server(&config))?
            .map(TlsMaterial::into_acceptor)
            .transpose()?;

        if !config.assets_path.is_empty() && !std::path::Path::new(&config.assets_path).exists() {
            deps.logger.in_scope(|| {
                warn!(assets_path = %config.assets_path, "assets path does not exist")
            });
        }

        let (readiness, _) = watch::channel(Readiness::Pending);
        Ok(Self {
            config,
            ctx: Arc::new(Context {
                logger: deps.logger,
                storage: deps.storage,
                sender: deps.sender,
                tls,
            }),
            state: Mutex::new(State::Idle),
            readiness,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn uses_tls(&self) -> bool {
        self.ctx.tls.is_some()
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Binds and starts accepting. Calling it on a running server returns the
    /// bound address again; calling it after `stop` fails.
    pub async fn start(&self) -> Result<SocketAddr> {
        let dispatch = self.ctx.logger.dispatch().clone();
        self.start_inner().with_subscriber(dispatch).await
    }

    async fn start_inner(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Running(running) => return Ok(running.addr),
            State::Stopped => return Err(LockboxError::ServerStopped),
            State::Idle => {}
        }

        let requested = self.config.socket_addr()?;
        let listener = TcpListener::bind(requested).await.map_err(|err| {
            LockboxError::construction(Subsystem::Server, format!("cannot bind {requested}: {err}"))
        })?;
        let addr = listener.local_addr()?;

        let shutdown = ShutdownSignal::new();
        let accept = tokio::spawn(
            init::accept_loop(listener, Arc::clone(&self.ctx), shutdown.clone())
                .with_current_subscriber(),
        );

        *state = State::Running(Running {
            addr,
            shutdown,
            accept,
        });
        self.readiness.send_replace(Readiness::Ready(addr));
        info!(%addr, tls = self.uses_tls(), "server listening");
        Ok(addr)
    }

    /// Waits until the listener is bound. Fails if the server is stopped
    /// before it ever became ready.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut receiver = self.readiness.subscribe();
        let readiness = *receiver
            .wait_for(|readiness| *readiness != Readiness::Pending)
            .await
            .map_err(|_| LockboxError::ServerStopped)?;

        match readiness {
            Readiness::Ready(addr) => Ok(addr),
            _ => Err(LockboxError::ServerStopped),
        }
    }

    /// Resolves once the server has been stopped.
    pub async fn closed(&self) {
        let mut receiver = self.readiness.subscribe();
        let _ = receiver
            .wait_for(|readiness| *readiness == Readiness::Closed)
            .await;
    }

    /// Idempotent; a stopped server returns immediately.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let dispatch = self.ctx.logger.dispatch().clone();
        self.stop_inner(timeout).with_subscriber(dispatch).await
    }

    async fn stop_inner(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let running = match mem::replace(&mut *state, State::Stopped) {
            State::Running(running) => running,
            State::Idle => {
                self.readiness.send_replace(Readiness::Closed);
                return Ok(());
            }
            State::Stopped => return Ok(()),
        };

        self.readiness.send_replace(Readiness::Closed);
        running.shutdown.trigger();

        let mut connections = match running.accept.await {
            Ok(connections) => connections,
            Err(err) => {
                warn!(error = %err, "accept loop ended abnormally");
                JoinSet::new()
            }
        };

        let drained = tokio::time::timeout(timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = connections.len(),
                ?timeout,
                "shutdown timeout elapsed; closing remaining connections"
            );
            connections.shutdown().await;
        }

        info!(addr = %running.addr, "server stopped");
        Ok(())
    }
}
