use std::{
    ffi::OsString,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{error, info};

use crate::{
    cli::{Action, Invocation},
    config::Config,
    factory::{self, Subsystems},
    logger::Logger,
    sender::Sender,
    server::{
        error::{LockboxError, Result},
        Server,
    },
    storage::Storage,
};

/// One assembled process: the resolved configuration plus a live handle per
/// subsystem.
pub struct App {
    config: Config,
    logger: Logger,
    storage: Storage,
    sender: Arc<dyn Sender>,
    server: Server,
    stopped: AtomicBool,
}

impl App {
    /// Parses `args`, resolves the configuration, builds every subsystem and
    /// starts the server. Returns once the listener is bound.
    pub async fn run<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let invocation = Invocation::parse(args)?;
        match invocation.action {
            Action::RunServer { .. } => Self::launch(invocation.config).await,
            _ => Err(LockboxError::NotAServerCommand),
        }
    }

    pub async fn launch(config: Config) -> Result<Self> {
        let app = Self::build(config)?;
        app.start().await?;
        Ok(app)
    }

    pub fn build(config: Config) -> Result<Self> {
        Self::assemble(config, None)
    }

    /// Same as [`build`](Self::build) with a different sender backend.
    pub fn build_with_sender(config: Config, sender: Arc<dyn Sender>) -> Result<Self> {
        Self::assemble(config, Some(sender))
    }

    fn assemble(config: Config, sender: Option<Arc<dyn Sender>>) -> Result<Self> {
        config.validate()?;
        let Subsystems {
            logger,
            storage,
            sender,
            server,
        } = factory::assemble(&config, sender)?;

        Ok(Self {
            config,
            logger,
            storage,
            sender,
            server,
            stopped: AtomicBool::new(false),
        })
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        self.server.start().await
    }

    pub async fn ready(&self) -> Result<SocketAddr> {
        self.server.ready().await
    }

    /// Stops the server within `timeout` and flushes storage. Once a call
    /// has succeeded, later calls return immediately; a failed call leaves
    /// the app retryable.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.shutdown(timeout).await;
        if result.is_err() {
            self.stopped.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.server.stop(timeout).await?;
        self.logger.in_scope(|| -> Result<()> {
            if let Err(err) = self.storage.flush() {
                error!(error = %err, "storage flush failed during stop");
                return Err(err);
            }
            info!("app stopped");
            Ok(())
        })
    }

    /// Resolves on Ctrl-C, SIGTERM, or once the app has been stopped from
    /// elsewhere.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        tokio::select! {
            signal = wait_for_signal() => Ok(signal?),
            _ = self.server.closed() => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn sender(&self) -> &Arc<dyn Sender> {
        &self.sender
    }

    pub fn server(&self) -> &Server {
        &self.server
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
