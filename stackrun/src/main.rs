use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stackrun::{
    BridgeConfig, EXIT_FAILURE, InvocationBridge, LocalStore, STACKRUN_VERSION, ShimStack,
};
use stackrun_contract::{Contract, Server};

#[derive(Debug, Parser)]
#[command(
    name = "stackrun",
    about = "Run one JSON-RPC request against a service hosted in a shim subprocess",
    version
)]
struct Cli {
    /// Request document: {"req": {...}} or {"req": [...]}.
    #[arg(env = "STACKRUN_REQUEST")]
    request: PathBuf,

    #[arg(long, env = "STACKRUN_CONTRACT", help = "Service contract (IDL JSON)")]
    contract: PathBuf,

    #[arg(
        long,
        env = "STACKRUN_STACK",
        default_value = "python",
        help = "Shim stack: python, nodejs or shell"
    )]
    stack: String,

    #[arg(
        long = "work-dir",
        env = "STACKRUN_WORK_DIR",
        default_value = ".",
        help = "Directory the shim runs in; channels and the log file live here"
    )]
    work_dir: PathBuf,

    #[arg(
        long = "output-dir",
        env = "STACKRUN_OUTPUT_DIR",
        help = "Where the response and log are stored [default: work dir]"
    )]
    output_dir: Option<PathBuf>,

    #[arg(
        long = "shim-dir",
        env = "STACKRUN_SHIM_DIR",
        help = "Directory to copy the stack's shim files from"
    )]
    shim_dir: Option<PathBuf>,

    #[arg(
        long = "shim-cmd",
        env = "STACKRUN_SHIM_CMD",
        help = "Override the stack's launch command (shell-style quoting)"
    )]
    shim_cmd: Option<String>,

    #[arg(
        long = "default-service",
        env = "STACKRUN_DEFAULT_SERVICE",
        default_value = stackrun::DEFAULT_SERVICE
    )]
    default_service: String,

    #[arg(
        long = "timeout-secs",
        env = "STACKRUN_TIMEOUT_SECS",
        help = "Give up on a shim that has not answered after this many seconds"
    )]
    timeout_secs: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "stackrun failed to start");
            eprintln!("error: {e:#}");
            EXIT_FAILURE
        }
    };
    process::exit(code);
}

/// Initialize tracing with STACKRUN_LOG and LOG_FORMAT support.
///
/// Everything is also written to `log_file`, which becomes the invocation's
/// log artifact.
fn init_tracing(log_file: &Path) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("STACKRUN_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("stackrun={level},stackrun_contract={level}"))
    };

    let file = File::create(log_file)
        .with_context(|| format!("failed to create log file {}", log_file.display()))?;
    let file_layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
    Ok(())
}

fn build_stack(cli: &Cli) -> anyhow::Result<ShimStack> {
    let mut stack = ShimStack::builtin(&cli.stack, &cli.work_dir)?;
    if let Some(dir) = &cli.shim_dir {
        stack = stack.with_source_dir(dir);
    }
    if let Some(cmd) = &cli.shim_cmd {
        let argv = shell_words::split(cmd).context("invalid --shim-cmd")?;
        if argv.is_empty() {
            bail!("--shim-cmd is empty");
        }
        stack = stack.with_command(argv)?;
    }
    Ok(stack)
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = BridgeConfig::new(&cli.work_dir)
        .with_default_service(cli.default_service.clone())
        .with_exchange_timeout(cli.timeout_secs.map(Duration::from_secs));

    // Everything that can fail runs before the log file exists; only the
    // bridge's cleanup removes it.
    let contract = Contract::from_file(&cli.contract)?;
    let stack = build_stack(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    init_tracing(&config.log_file)?;
    tracing::info!("stackrun {}", STACKRUN_VERSION);
    tracing::info!(stack = %cli.stack, work_dir = %cli.work_dir.display(), "Selected stack");

    let output_dir = cli.output_dir.clone().unwrap_or_else(|| cli.work_dir.clone());
    let store = LocalStore::new(&cli.request, output_dir);

    let mut bridge = InvocationBridge::new(
        config,
        Server::new(contract),
        Arc::new(store),
        Arc::new(stack),
    );

    let code = runtime.block_on(bridge.execute());
    // A shim that never opened its end leaves a blocking thread behind; don't wait on it.
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(work: &Path, extra: &[&str]) -> Cli {
        let work = work.to_str().unwrap();
        let request = format!("{work}/request.json");
        let mut args = vec!["stackrun", request.as_str(), "--work-dir", work];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn bad_contract_leaves_no_log_file() {
        let work = tempfile::tempdir().unwrap();
        let missing = work.path().join("missing.json");
        let cli = cli(work.path(), &["--contract", missing.to_str().unwrap()]);

        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"));
        assert!(!work.path().join(BridgeConfig::LOG_FILE).exists());
    }

    #[test]
    fn unknown_stack_leaves_no_log_file() {
        let work = tempfile::tempdir().unwrap();
        let contract = work.path().join("contract.json");
        std::fs::write(&contract, "[]").unwrap();
        let cli = cli(
            work.path(),
            &["--contract", contract.to_str().unwrap(), "--stack", "cobol"],
        );

        assert!(run(cli).is_err());
        assert!(!work.path().join(BridgeConfig::LOG_FILE).exists());
    }
}
