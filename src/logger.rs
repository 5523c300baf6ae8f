use std::{
    fs::{self, File, OpenOptions},
    path::Path,
    sync::Arc,
};

use tracing::Dispatch;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    Layer,
};

use crate::{
    config::LogConfig,
    server::error::{LockboxError, Result, Subsystem},
};

/// Owns the tracing pipeline for one assembled app: everything at the
/// configured level goes to `log_file`, warnings and errors additionally to
/// `err_file`.
#[derive(Clone)]
pub struct Logger {
    config: LogConfig,
    dispatch: Dispatch,
}

impl Logger {
    pub fn new(config: LogConfig) -> Result<Self> {
        let level = config
            .level_filter()
            .map_err(|err| LockboxError::construction(Subsystem::Log, err))?;

        let out = match config.log_file.trim() {
            "" => BoxMakeWriter::new(std::io::stdout),
            path => BoxMakeWriter::new(Arc::new(open_append(path)?)),
        };
        let err = match config.err_file.trim() {
            "" => BoxMakeWriter::new(std::io::stderr),
            path => BoxMakeWriter::new(Arc::new(open_append(path)?)),
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(out)
                    .with_ansi(false)
                    .with_filter(level),
            )
            .with(
                fmt::layer()
                    .with_writer(err)
                    .with_ansi(false)
                    .with_filter(level.min(LevelFilter::WARN)),
            );

        Ok(Self {
            config,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Address to notify about connection errors, if any.
    pub fn notify_errors(&self) -> Option<&str> {
        Some(self.config.notify_errors.trim()).filter(|addr| !addr.is_empty())
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Makes this logger the process-wide default. Returns `false` if another
    /// subscriber was installed first.
    pub fn install_global(&self) -> bool {
        tracing::dispatcher::set_global_default(self.dispatch.clone()).is_ok()
    }
}

fn open_append(path: &str) -> Result<File> {
    let path = Path::new(path);
    let fail = |err: std::io::Error| {
        LockboxError::construction(Subsystem::Log, format!("cannot open {}: {err}", path.display()))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(fail)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(fail)
}
