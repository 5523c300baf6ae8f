//! Builds live subsystem handles from their resolved sections.
//!
//! Construction order is fixed: logger, storage, sender, server. Everything
//! after the logger is built under the logger's dispatch so construction
//! events land in the configured files.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::{Config, EmailConfig, LogConfig, ServerConfig, StorageConfig},
    logger::Logger,
    sender::{EmailSender, Sender},
    server::{error::Result, Server, ServerDeps},
    storage::Storage,
};

pub fn build_logger(config: &LogConfig) -> Result<Logger> {
    Logger::new(config.clone())
}

pub fn build_storage(config: &StorageConfig) -> Result<Storage> {
    Storage::open(config.clone())
}

pub fn build_sender(config: &EmailConfig) -> Result<Arc<dyn Sender>> {
    Ok(Arc::new(EmailSender::new(config.clone())?))
}

pub fn build_server(config: &ServerConfig, deps: ServerDeps) -> Result<Server> {
    Server::new(config.clone(), deps)
}

/// The four handles of one assembled app.
pub struct Subsystems {
    pub logger: Logger,
    pub storage: Storage,
    pub sender: Arc<dyn Sender>,
    pub server: Server,
}

/// Builds every subsystem in order. `sender` replaces the email backend
/// when given.
pub fn assemble(config: &Config, sender: Option<Arc<dyn Sender>>) -> Result<Subsystems> {
    let logger = build_logger(&config.log)?;

    logger.in_scope(|| -> Result<Subsystems> {
        let storage = build_storage(&config.storage)?;
        let sender = match sender {
            Some(sender) => sender,
            None => build_sender(&config.email)?,
        };
        let server = build_server(
            &config.server,
            ServerDeps {
                logger: logger.clone(),
                storage: storage.clone(),
                sender: Arc::clone(&sender),
            },
        )?;

        info!(
            storage = %config.storage.path,
            sender = sender.backend(),
            tls = server.uses_tls(),
            "subsystems assembled"
        );

        Ok(Subsystems {
            logger: logger.clone(),
            storage,
            sender,
            server,
        })
    })
}
