//! fnbox - run an untrusted function worker in a sandbox
//!
//! `fnbox run <file.js>` executes the file once and prints the resulting
//! execution record as JSON.

use anyhow::{bail, Context, Result};
use fnbox_core::{init, BackendKind, Engine, EngineConfig, InvocationContext, Trigger};
use serde_json::Value;
use tracing::debug;

fn print_help() {
    println!("fnbox - sandboxed function worker runner v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  fnbox run <file.js> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  --payload <json>     Payload passed to fetch(payload, context) (default: {{}})");
    println!("  --config <file>      Engine config file (TOML)");
    println!("  --backend <kind>     isolate | worker (overrides config and FNBOX_BACKEND)");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  FNBOX_BACKEND        Backend used when --backend is not given");
    println!("  RUST_LOG             Log filter (default: info)");
}

#[derive(Debug, Default)]
struct RunArgs {
    file: String,
    payload: Option<String>,
    config: Option<String>,
    backend: Option<BackendKind>,
}

enum Command {
    Help,
    Version,
    Run(RunArgs),
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut iter = args.iter();
    let mut run: Option<RunArgs> = None;
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "run" if run.is_none() => {
                let file = value("run")?;
                run = Some(RunArgs {
                    file,
                    ..RunArgs::default()
                });
            }
            "--payload" | "--config" | "--backend" => {
                let flag = arg.as_str();
                let given = value(flag)?;
                let Some(run) = run.as_mut() else {
                    bail!("{flag} must follow 'run <file.js>'");
                };
                match flag {
                    "--payload" => run.payload = Some(given),
                    "--config" => run.config = Some(given),
                    _ => run.backend = Some(given.parse().map_err(anyhow::Error::msg)?),
                }
            }
            other => bail!("unrecognized argument '{other}'"),
        }
    }
    run.map(Command::Run).context("missing command; try 'fnbox run <file.js>'")
}

async fn run(args: RunArgs) -> Result<()> {
    let code = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file))?;
    let payload: Value = match &args.payload {
        Some(text) => serde_json::from_str(text).context("--payload is not valid JSON")?,
        None => Value::Object(Default::default()),
    };
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    debug!(file = %args.file, backend = %config.backend, "running source file");

    let engine = Engine::new(config)?;
    let invocation = InvocationContext::new(Trigger::Manual);
    let record = engine
        .execute_with(&invocation, &code, payload, Value::Object(Default::default()))
        .await;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if !record.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run 'fnbox --help' for usage information.");
            std::process::exit(2);
        }
    };

    match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            println!("fnbox {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Run(args) => {
            init()?;
            run(args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_run_with_options() {
        let parsed = parse_args(&args(&["run", "a.js", "--payload", "{\"x\":1}", "--backend", "worker"]));
        let Ok(Command::Run(run)) = parsed else {
            panic!("expected run command");
        };
        assert_eq!(run.file, "a.js");
        assert_eq!(run.payload.as_deref(), Some("{\"x\":1}"));
        assert_eq!(run.backend, Some(BackendKind::Worker));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["run"])).is_err());
        assert!(parse_args(&args(&["--payload", "{}"])).is_err());
        assert!(parse_args(&args(&["run", "a.js", "--backend", "vm"])).is_err());
        assert!(matches!(parse_args(&args(&["-v"])), Ok(Command::Version)));
    }
}
