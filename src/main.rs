#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use tsm_dispatcher::codec::load_schema;
use tsm_dispatcher::config::DispatcherConfig;
use tsm_dispatcher::telemetry;

enum CliCommand {
    Run {
        config_path: Option<PathBuf>,
        action: Option<String>,
        verbose: bool,
    },
    Validate {
        configs: Vec<PathBuf>,
    },
    Help,
    ValidateHelp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_cli_args()? {
        CliCommand::Run {
            config_path,
            action,
            verbose,
        } => {
            telemetry::init_tracing_with(verbose).context("failed to initialise telemetry")?;
            run(config_path.as_deref(), action.as_deref()).await
        }
        CliCommand::Validate { configs } => {
            telemetry::init_tracing().context("failed to initialise telemetry")?;
            run_validate_command(configs)
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::ValidateHelp => {
            print_validate_help();
            Ok(())
        }
    }
}

#[cfg(all(feature = "mqtt", feature = "db-postgres"))]
async fn run(config_path: Option<&Path>, action: Option<&str>) -> anyhow::Result<()> {
    let config = DispatcherConfig::load(config_path).context("failed to load configuration")?;
    let app = tsm_dispatcher::app::DispatcherApp::initialise(config, action)
        .context("failed to construct application")?;
    app.run_until_signal()
        .await
        .context("dispatcher runtime error")
}

#[cfg(not(all(feature = "mqtt", feature = "db-postgres")))]
async fn run(_config_path: Option<&Path>, _action: Option<&str>) -> anyhow::Result<()> {
    anyhow::bail!("tsm-dispatcher was built without the `mqtt` and `db-postgres` features")
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run {
            config_path: None,
            action: None,
            verbose: false,
        });
    };

    if first == "validate" {
        return parse_validate_args(args);
    }

    let mut config_path = None;
    let mut action = None;
    let mut verbose = false;
    let mut pending = Some(first);

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if config_path.is_some() {
                    anyhow::bail!("config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                config_path = Some(PathBuf::from(value));
            }
            "-a" | "--action" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected action name after {arg}"))?;
                action = Some(value);
            }
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run {
        config_path,
        action,
        verbose,
    })
}

fn parse_validate_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut configs = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliCommand::ValidateHelp),
            other => configs.push(PathBuf::from(other)),
        }
    }

    if configs.is_empty() {
        anyhow::bail!("tsm-dispatcher validate requires at least one config path");
    }

    Ok(CliCommand::Validate { configs })
}

fn print_help() {
    println!(
        "\
Usage: tsm-dispatcher [OPTIONS]
       tsm-dispatcher validate <CONFIG>...

Options:
  -c, --config <PATH>    Path to the dispatcher YAML file
                         (default: config/dispatcher.yaml if present)
  -a, --action <NAME>    Run only the named action
  -v, --verbose          Log at debug level unless RUST_LOG is set
  -h, --help             Print this help message

Environment:
  TSM__<SECTION>__<KEY>  Overrides a config value, e.g. TSM__MQTT__URL
"
    );
}

fn print_validate_help() {
    println!(
        "\
Usage: tsm-dispatcher validate <CONFIG>...

Checks each config file and every schema it references.

Options:
  -h, --help             Print this help message
"
    );
}

fn run_validate_command(configs: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut had_error = false;

    for path in configs {
        match validate_config(&path) {
            Ok(()) => println!("validated {}", path.display()),
            Err(err) => {
                eprintln!("{}: {err:#}", path.display());
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more configs failed validation"))
    } else {
        Ok(())
    }
}

fn validate_config(path: &Path) -> anyhow::Result<()> {
    let config = DispatcherConfig::from_path(path)?;
    for action in &config.actions {
        if let Some(schema) = &action.schema {
            load_schema(schema)
                .with_context(|| format!("action `{}` references a bad schema", action.name))?;
        }
    }
    Ok(())
}
