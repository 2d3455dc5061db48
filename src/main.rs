//! gc-ir-fleetd: a line-oriented stand-in for the HTTP front-end.
//!
//! Reads commands from stdin — `press`, `hold`, `stop`, `list`, `health` —
//! and prints the Dispatcher's structured outcome as JSON. The real
//! front-end (HTTP, YAML/JSON config delivery) lives outside this crate;
//! this binary exists to exercise the dispatcher end to end.

use std::path::PathBuf;

use anyhow::{Context, Result};
use gc_ir_fleet::config::FleetConfig;
use gc_ir_fleet::keyset;
use gc_ir_fleet::registry::Registry;
use gc_ir_fleet::Dispatcher;
use tokio::io::{AsyncBufReadExt, BufReader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gc_ir_fleet=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    tracing::info!("starting gc-ir-fleetd v{VERSION}");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(gc_ir_fleet::config::default_config_path);

    let config = FleetConfig::load(&config_path)
        .await
        .with_context(|| format!("loading fleet config from {}", config_path.display()))?;

    let catalogue = keyset::load_catalogue(&config.keyset_path)
        .await
        .with_context(|| format!("loading keyset from {}", config.keyset_path.display()))?;

    let registry = Registry::build(&config).context("building device registry")?;
    let dispatcher = Dispatcher::new(catalogue, registry);

    println!("gc-ir-fleetd v{VERSION} ready. Commands: press|hold|stop|list|health|quit");
    run_command_loop(&dispatcher).await;

    dispatcher.shutdown().await;
    Ok(())
}

async fn run_command_loop(dispatcher: &Dispatcher) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("> ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["press", slot, device, key] => {
                print_result(dispatcher.press(parse_slot(slot), device, key, 1).await)
            }
            ["press", slot, device, key, count] => print_result(
                dispatcher
                    .press(parse_slot(slot), device, key, count.parse().unwrap_or(1))
                    .await,
            ),
            ["hold", slot, device, key, duration_ms] => print_result(
                dispatcher
                    .press_and_hold(
                        parse_slot(slot),
                        device,
                        key,
                        duration_ms.parse().unwrap_or(0.0),
                    )
                    .await,
            ),
            ["stop", slot] => print_result(dispatcher.stop(parse_slot(slot)).await),
            ["list", device] => {
                let keys = dispatcher.list_keys(device);
                println!("{}", serde_json::to_string_pretty(&keys).unwrap());
            }
            ["health"] => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&dispatcher.health()).unwrap()
                );
            }
            _ => println!("unrecognized command: {line:?}"),
        }
    }
}

fn parse_slot(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

fn print_result<T: serde::Serialize>(result: gc_ir_fleet::Result<T>) {
    match result {
        Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome).unwrap()),
        Err(e) => println!(
            "{}",
            serde_json::json!({"status": "error", "kind": format!("{e:?}"), "message": e.to_string()})
        ),
    }
}
