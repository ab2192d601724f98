//! `browser-bridge` host binary.
//!
//! Runs one worker session through its whole lifecycle and prints the JSON
//! result of a single operation:
//!
//! ```text
//! browser-bridge [--config PATH] tools
//! browser-bridge [--config PATH] resources
//! browser-bridge [--config PATH] health
//! browser-bridge [--config PATH] call <tool-name> [<json-arguments>]
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use browser_bridge::commands;
use browser_bridge::config::{self, BridgeConfig};
use browser_bridge::logging;
use browser_bridge::Session;

const USAGE: &str =
    "usage: browser-bridge [--config PATH] <tools | resources | health | call NAME [JSON]>";

enum Operation {
    Tools,
    Resources,
    Health,
    Call { name: String, arguments: serde_json::Value },
}

struct Args {
    config: Option<PathBuf>,
    operation: Operation,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => bail!(USAGE),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let operation = match positional.next().as_deref() {
        Some("tools") => Operation::Tools,
        Some("resources") => Operation::Resources,
        Some("health") => Operation::Health,
        Some("call") => {
            let name = positional.next().context("call needs a tool name")?;
            let arguments = match positional.next() {
                Some(raw) => serde_json::from_str(&raw)
                    .with_context(|| format!("invalid JSON arguments: {raw}"))?,
                None => serde_json::json!({}),
            };
            Operation::Call { name, arguments }
        }
        _ => bail!(USAGE),
    };

    Ok(Args { config, operation })
}

fn load_config(explicit: Option<PathBuf>) -> Result<BridgeConfig> {
    let path = match explicit {
        Some(path) => Some(path),
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            config::find_config_path(&cwd).ok()
        }
    };

    match path {
        Some(path) => config::load_config(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

async fn run(session: &Session, operation: Operation) -> Result<serde_json::Value> {
    let value = match operation {
        Operation::Tools => serde_json::to_value(
            commands::list_tools(session)
                .await
                .map_err(anyhow::Error::msg)?,
        )?,
        Operation::Resources => serde_json::to_value(commands::list_resources(session).await)?,
        Operation::Health => serde_json::to_value(commands::health(session))?,
        Operation::Call { name, arguments } => {
            serde_json::to_value(commands::call_tool(session, &name, arguments).await)?
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let config = load_config(args.config)?;
    logging::init_tracing(&config.logging).context("failed to initialize logging")?;

    let session = Session::new(config);
    session.start().await.context("worker failed to start")?;

    let outcome = tokio::select! {
        result = run(&session, args.operation) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    session.stop().await;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
