//! Command-line flags, one per configuration field.
//!
//! The clap registry is rebuilt on every call to [`command`]; nothing about
//! flag parsing is kept in process-wide state, so resolving the same argv
//! twice always gives the same tree.

use std::path::PathBuf;

use clap::{parser::ValueSource, Arg, ArgAction, ArgMatches, Command};

use crate::config::{Field, FieldKind};

pub const CONFIG_FLAG: &str = "config";

/// Binds a flag name to the configuration field it overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagDescriptor {
    pub name: &'static str,
    pub field: Field,
    pub help: &'static str,
}

impl FlagDescriptor {
    const fn new(name: &'static str, field: Field, help: &'static str) -> Self {
        Self { name, field, help }
    }

    fn arg(&self) -> Arg {
        let value_name = match self.field.kind() {
            FieldKind::Str => "VALUE",
            FieldKind::Int => "NUMBER",
            FieldKind::Bool => "BOOL",
        };

        Arg::new(self.name)
            .long(self.name)
            .value_name(value_name)
            .help(self.help)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(String))
            .global(true)
    }
}

pub const FLAGS: &[FlagDescriptor] = &[
    FlagDescriptor::new("log-file", Field::LogFile, "Path to the log file (stdout when empty)"),
    FlagDescriptor::new(
        "err-file",
        Field::ErrFile,
        "Path to the error log file (stderr when empty)",
    ),
    FlagDescriptor::new(
        "notify-errors",
        Field::NotifyErrors,
        "Email address to notify when a connection fails",
    ),
    FlagDescriptor::new("log-level", Field::LogLevel, "Minimum level written to the log"),
    FlagDescriptor::new("host", Field::ServerHost, "Host name or address to listen on"),
    FlagDescriptor::new("port", Field::ServerPort, "Port to listen on (0 picks a free port)"),
    FlagDescriptor::new(
        "require-tls",
        Field::RequireTls,
        "Serve over TLS only (true/false)",
    ),
    FlagDescriptor::new("assets-path", Field::AssetsPath, "Path to static assets"),
    FlagDescriptor::new("tls-cert", Field::TlsCert, "Path to a PEM certificate chain"),
    FlagDescriptor::new("tls-key", Field::TlsKey, "Path to a PEM private key"),
    FlagDescriptor::new("db-path", Field::StoragePath, "Directory holding the database"),
    FlagDescriptor::new("email-user", Field::EmailUser, "SMTP user name"),
    FlagDescriptor::new("email-password", Field::EmailPassword, "SMTP password"),
    FlagDescriptor::new("email-server", Field::EmailServer, "SMTP server host"),
    FlagDescriptor::new("email-port", Field::EmailPort, "SMTP server port"),
];

pub fn descriptor_for(field: Field) -> Option<&'static FlagDescriptor> {
    FLAGS.iter().find(|descriptor| descriptor.field == field)
}

/// A fresh root command carrying `--config` and every field flag.
pub fn command() -> Command {
    let config = Arg::new(CONFIG_FLAG)
        .long(CONFIG_FLAG)
        .value_name("PATH")
        .help("Path to a YAML (or .toml) configuration file")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(PathBuf))
        .global(true);

    FLAGS.iter().fold(
        Command::new("lockbox")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Key/value server assembled from layered configuration")
            .arg(config),
        |cmd, descriptor| cmd.arg(descriptor.arg()),
    )
}

pub fn config_path(matches: &ArgMatches) -> Option<PathBuf> {
    matches.get_one::<PathBuf>(CONFIG_FLAG).cloned()
}

/// Raw values of the flags the user actually typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagValues {
    values: Vec<(&'static FlagDescriptor, String)>,
}

impl FlagValues {
    /// Keeps only flags whose value came from the command line, so a flag
    /// given with its default value is still an explicit override.
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let values = FLAGS
            .iter()
            .filter(|descriptor| {
                matches.value_source(descriptor.name) == Some(ValueSource::CommandLine)
            })
            .filter_map(|descriptor| {
                matches
                    .get_one::<String>(descriptor.name)
                    .map(|raw| (descriptor, raw.clone()))
            })
            .collect();

        Self { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static FlagDescriptor, &str)> + '_ {
        self.values
            .iter()
            .map(|(descriptor, raw)| (*descriptor, raw.as_str()))
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.iter()
            .find(|(descriptor, _)| descriptor.field == field)
            .map(|(_, raw)| raw)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
