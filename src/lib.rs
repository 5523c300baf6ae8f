pub mod app;
pub mod cli;
pub mod config;
pub mod factory;
pub mod flags;
pub mod logger;
pub mod resolve;
pub mod sender;
pub mod server;
pub mod storage;
pub mod tls;

pub use app::App;
pub use config::Config;
pub use server::error::{LockboxError, Result};
