use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use crate::server::error::{LockboxError, Result};

/// The resolved configuration tree: one section per subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub email: EmailConfig,
}

impl Config {
    pub fn get(&self, field: Field) -> FieldValue {
        use FieldValue::{Bool, Int, Str};

        match field {
            Field::LogFile => Str(self.log.log_file.clone()),
            Field::ErrFile => Str(self.log.err_file.clone()),
            Field::NotifyErrors => Str(self.log.notify_errors.clone()),
            Field::LogLevel => Str(self.log.level.clone()),
            Field::ServerHost => Str(self.server.host.clone()),
            Field::ServerPort => Int(self.server.port.into()),
            Field::RequireTls => Bool(self.server.require_tls),
            Field::AssetsPath => Str(self.server.assets_path.clone()),
            Field::TlsCert => Str(self.server.tls_cert.clone()),
            Field::TlsKey => Str(self.server.tls_key.clone()),
            Field::StoragePath => Str(self.storage.path.clone()),
            Field::EmailUser => Str(self.email.user.clone()),
            Field::EmailPassword => Str(self.email.password.clone()),
            Field::EmailServer => Str(self.email.server.clone()),
            Field::EmailPort => Int(self.email.port.into()),
        }
    }

    /// Overwrites a single field. On a type mismatch the tree is left
    /// untouched and the expected type is returned.
    pub fn assign(
        &mut self,
        field: Field,
        value: FieldValue,
    ) -> std::result::Result<(), &'static str> {
        let expected = field.kind().expected();

        match (field, value) {
            (Field::LogFile, FieldValue::Str(v)) => self.log.log_file = v,
            (Field::ErrFile, FieldValue::Str(v)) => self.log.err_file = v,
            (Field::NotifyErrors, FieldValue::Str(v)) => self.log.notify_errors = v,
            (Field::LogLevel, FieldValue::Str(v)) => self.log.level = v,
            (Field::ServerHost, FieldValue::Str(v)) => self.server.host = v,
            (Field::ServerPort, FieldValue::Int(v)) => {
                self.server.port = u16::try_from(v).map_err(|_| expected)?
            }
            (Field::RequireTls, FieldValue::Bool(v)) => self.server.require_tls = v,
            (Field::AssetsPath, FieldValue::Str(v)) => self.server.assets_path = v,
            (Field::TlsCert, FieldValue::Str(v)) => self.server.tls_cert = v,
            (Field::TlsKey, FieldValue::Str(v)) => self.server.tls_key = v,
            (Field::StoragePath, FieldValue::Str(v)) => self.storage.path = v,
            (Field::EmailUser, FieldValue::Str(v)) => self.email.user = v,
            (Field::EmailPassword, FieldValue::Str(v)) => self.email.password = v,
            (Field::EmailServer, FieldValue::Str(v)) => self.email.server = v,
            (Field::EmailPort, FieldValue::Int(v)) => {
                self.email.port = u16::try_from(v).map_err(|_| expected)?
            }
            _ => return Err(expected),
        }
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|err| LockboxError::InvalidConfig(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        self.server.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Destination for all events; stdout when empty.
    pub log_file: String,
    /// Destination for warnings and errors; stderr when empty.
    pub err_file: String,
    /// Address that receives a message for every connection-level error.
    pub notify_errors: String,
    pub level: String,
}

impl LogConfig {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(self.level.trim()).map_err(|_| {
            LockboxError::InvalidConfig(format!("log.level {:?} is not a log level", self.level))
        })
    }

    fn validate(&self) -> Result<()> {
        self.level_filter().map(|_| ())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            err_file: String::new(),
            notify_errors: String::new(),
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub require_tls: bool,
    pub assets_path: String,
    pub tls_cert: String,
    pub tls_key: String,
}

impl ServerConfig {
    const fn default_port() -> u16 {
        3000
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host.trim(), self.port);
        addr.to_socket_addrs()
            .map_err(|err| LockboxError::InvalidConfig(format!("server address {addr}: {err}")))?
            .next()
            .ok_or_else(|| {
                LockboxError::InvalidConfig(format!("server address {addr} did not resolve"))
            })
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LockboxError::InvalidConfig(
                "server.host cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: Self::default_port(),
            require_tls: false,
            assets_path: "assets".into(),
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub path: String,
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(LockboxError::InvalidConfig(
                "storage.path cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: "db".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    pub user: String,
    pub password: String,
    pub server: String,
    pub port: u16,
}

impl EmailConfig {
    const fn default_port() -> u16 {
        587
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            server: String::new(),
            port: Self::default_port(),
        }
    }
}

/// Every configurable field, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    LogFile,
    ErrFile,
    NotifyErrors,
    LogLevel,
    ServerHost,
    ServerPort,
    RequireTls,
    AssetsPath,
    TlsCert,
    TlsKey,
    StoragePath,
    EmailUser,
    EmailPassword,
    EmailServer,
    EmailPort,
}

impl Field {
    pub const ALL: [Field; 15] = [
        Field::LogFile,
        Field::ErrFile,
        Field::NotifyErrors,
        Field::LogLevel,
        Field::ServerHost,
        Field::ServerPort,
        Field::RequireTls,
        Field::AssetsPath,
        Field::TlsCert,
        Field::TlsKey,
        Field::StoragePath,
        Field::EmailUser,
        Field::EmailPassword,
        Field::EmailServer,
        Field::EmailPort,
    ];

    pub const SECTIONS: [&'static str; 4] = ["log", "server", "storage", "email"];

    pub fn section(self) -> &'static str {
        match self {
            Field::LogFile | Field::ErrFile | Field::NotifyErrors | Field::LogLevel => "log",
            Field::ServerHost
            | Field::ServerPort
            | Field::RequireTls
            | Field::AssetsPath
            | Field::TlsCert
            | Field::TlsKey => "server",
            Field::StoragePath => "storage",
            Field::EmailUser | Field::EmailPassword | Field::EmailServer | Field::EmailPort => {
                "email"
            }
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Field::LogFile => "log_file",
            Field::ErrFile => "err_file",
            Field::NotifyErrors => "notify_errors",
            Field::LogLevel => "level",
            Field::ServerHost => "host",
            Field::ServerPort => "port",
            Field::RequireTls => "require_tls",
            Field::AssetsPath => "assets_path",
            Field::TlsCert => "tls_cert",
            Field::TlsKey => "tls_key",
            Field::StoragePath => "path",
            Field::EmailUser => "user",
            Field::EmailPassword => "password",
            Field::EmailServer => "server",
            Field::EmailPort => "port",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::ServerPort | Field::EmailPort => FieldKind::Int,
            Field::RequireTls => FieldKind::Bool,
            _ => FieldKind::Str,
        }
    }

    pub fn lookup(section: &str, key: &str) -> Option<Field> {
        Field::ALL
            .into_iter()
            .find(|field| field.section() == section && field.key() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Bool,
}

impl FieldKind {
    pub fn expected(self) -> &'static str {
        match self {
            FieldKind::Str => "a string",
            FieldKind::Int => "an integer between 0 and 65535",
            FieldKind::Bool => "a boolean",
        }
    }

    /// Converts a raw command-line value.
    pub fn parse(self, raw: &str) -> Option<FieldValue> {
        match self {
            FieldKind::Str => Some(FieldValue::Str(raw.to_string())),
            FieldKind::Int => raw.trim().parse::<u16>().ok().map(|v| FieldValue::Int(v.into())),
            FieldKind::Bool => parse_bool(raw).map(FieldValue::Bool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(u64),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(v) => f.write_str(v),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.storage.path, "db");
        assert_eq!(cfg.email.port, 587);
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.server.require_tls);
    }

    #[test]
    fn lookup_matches_section_and_key() {
        for field in Field::ALL {
            assert_eq!(Field::lookup(field.section(), field.key()), Some(field));
        }
        assert_eq!(Field::lookup("email", "port"), Some(Field::EmailPort));
        assert_eq!(Field::lookup("server", "port"), Some(Field::ServerPort));
        assert_eq!(Field::lookup("server", "nope"), None);
    }

    #[test]
    fn assign_then_get_is_field_local() {
        let mut cfg = Config::default();
        cfg.assign(Field::ServerPort, FieldValue::Int(9999)).unwrap();

        assert_eq!(cfg.get(Field::ServerPort), FieldValue::Int(9999));
        for field in Field::ALL.into_iter().filter(|f| *f != Field::ServerPort) {
            assert_eq!(cfg.get(field), Config::default().get(field), "{field} changed");
        }
    }

    #[test]
    fn assign_rejects_mismatched_types() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.assign(Field::RequireTls, FieldValue::Str("yes".into())),
            Err("a boolean")
        );
        assert!(cfg.assign(Field::ServerPort, FieldValue::Int(70_000)).is_err());
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parses_raw_flag_values_by_kind() {
        assert_eq!(FieldKind::Int.parse("5555"), Some(FieldValue::Int(5555)));
        assert_eq!(FieldKind::Int.parse("abc"), None);
        assert_eq!(FieldKind::Bool.parse("false"), Some(FieldValue::Bool(false)));
        assert_eq!(FieldKind::Bool.parse("YES"), Some(FieldValue::Bool(true)));
        assert_eq!(FieldKind::Bool.parse("maybe"), None);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = Config::default();
        cfg.log.level = "chatty".into();
        assert!(matches!(cfg.validate(), Err(LockboxError::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.storage.path = " ".into();
        assert!(matches!(cfg.validate(), Err(LockboxError::InvalidConfig(_))));
    }

    #[test]
    fn yaml_serialization_uses_section_names() {
        let yaml = Config::default().to_yaml_string().unwrap();
        for section in Field::SECTIONS {
            assert!(yaml.contains(&format!("{section}:")), "missing {section}");
        }
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
