use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context as _};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use tracing::info;

use crate::{
    app::App,
    config::{Config, Field},
    flags::{self, FlagValues},
    resolve::{resolve, FileLayer},
    server::error::Result,
};

const RUN_SERVER: &str = "runserver";
const CONFIG: &str = "config";
const SHOW: &str = "show";
const INIT: &str = "init";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_TIMEOUT_ARG: &str = "10";

/// What the subcommand asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunServer { shutdown_timeout: Duration },
    ConfigShow { json: bool },
    ConfigInit { output: PathBuf, force: bool },
}

/// A parsed command line with its configuration fully resolved.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: Action,
    pub config: Config,
    pub config_file: Option<PathBuf>,
    pub file: Option<FileLayer>,
    pub flags: FlagValues,
}

impl Invocation {
    pub fn parse<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        let action = action_from(&matches);

        let flags = FlagValues::from_matches(&matches);
        let config_file = flags::config_path(&matches);
        let file = config_file.as_ref().map(FileLayer::load).transpose()?;

        let config = resolve(Config::default(), file.as_ref(), &flags)?;
        config.validate()?;

        Ok(Self {
            action,
            config,
            config_file,
            file,
            flags,
        })
    }
}

/// The full command line: global field flags plus subcommands.
pub fn command() -> Command {
    let run_server = Command::new(RUN_SERVER).about("Start the server").arg(
        Arg::new("shutdown-timeout")
            .long("shutdown-timeout")
            .value_name("SECS")
            .help("Seconds in-flight connections get to finish on shutdown")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u64))
            .default_value(DEFAULT_SHUTDOWN_TIMEOUT_ARG),
    );

    let config = Command::new(CONFIG)
        .about("Inspect or create configuration files")
        .subcommand_required(true)
        .subcommand(
            Command::new(SHOW).about("Print the resolved configuration").arg(
                Arg::new("json")
                    .long("json")
                    .help("Emit JSON instead of YAML")
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(
            Command::new(INIT)
                .about("Write the default configuration to a file")
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_name("PATH")
                        .action(ArgAction::Set)
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("lockbox.yaml"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Overwrite an existing file")
                        .action(ArgAction::SetTrue),
                ),
        );

    flags::command()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(run_server)
        .subcommand(config)
}

fn action_from(matches: &ArgMatches) -> Action {
    match matches.subcommand() {
        Some((CONFIG, config)) => match config.subcommand() {
            Some((INIT, init)) => Action::ConfigInit {
                output: init
                    .get_one::<PathBuf>("output")
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from("lockbox.yaml")),
                force: init.get_flag("force"),
            },
            _ => Action::ConfigShow {
                json: config
                    .subcommand_matches(SHOW)
                    .is_some_and(|show| show.get_flag("json")),
            },
        },
        Some((_, run)) => Action::RunServer {
            shutdown_timeout: Duration::from_secs(
                run.get_one::<u64>("shutdown-timeout")
                    .copied()
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
        },
        None => Action::RunServer {
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        },
    }
}

/// Runs the binary: parse, then serve or handle a config subcommand.
pub async fn execute<I, T>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let invocation = Invocation::parse(args)?;

    match invocation.action {
        Action::RunServer { shutdown_timeout } => {
            let app = App::launch(invocation.config).await?;
            app.logger().install_global();

            let addr = app.ready().await?;
            info!(%addr, "lockbox is up; press Ctrl-C to stop");
            app.wait_for_shutdown().await?;

            info!(?shutdown_timeout, "shutting down");
            app.stop(shutdown_timeout).await?;
            Ok(())
        }
        Action::ConfigShow { json } => show_config(&invocation, json),
        Action::ConfigInit { output, force } => init_config(&output, force),
    }
}

fn show_config(invocation: &Invocation, json: bool) -> anyhow::Result<()> {
    let config = &invocation.config;
    let origin = invocation.file.as_ref().map(FileLayer::origin);
    let flags = &invocation.flags;
    let source_of = |field: Field| {
        if flags.get(field).is_some() {
            "flag"
        } else if invocation
            .file
            .as_ref()
            .is_some_and(|file| file.fields().any(|set| set == field))
        {
            "file"
        } else {
            "default"
        }
    };

    if json {
        let sources: serde_json::Map<String, serde_json::Value> = Field::ALL
            .into_iter()
            .map(|field| (field.to_string(), json!(source_of(field))))
            .collect();
        let payload = json!({
            "config_file": origin,
            "config": config,
            "sources": sources,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("# config file: {}", origin.unwrap_or("(none)"));
    for field in Field::ALL {
        match source_of(field) {
            "flag" => println!(
                "# {field} set by --{}",
                flags::descriptor_for(field).map_or("?", |d| d.name)
            ),
            "file" => println!("# {field} set by the config file"),
            _ => {}
        }
    }
    print!("{}", config.to_yaml_string()?);
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            output.display()
        ));
    }

    let template = Config::default().to_yaml_string()?;
    fs::write(output, template)
        .with_context(|| format!("unable to write {}", output.display()))?;
    println!("Wrote template configuration to {}", output.display());
    Ok(())
}
