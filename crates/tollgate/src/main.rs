//! Tollgate binary entry point (spec.md §6): CLI argument parsing and exit
//! code mapping around the `tollgate` library's `bootstrap`/`run` path.

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tollgate::config::Config;
use tollgate::logging::{self, LogFormat};
use tollgate::{bootstrap, shutdown, BootstrapError};
use tracing::error;

/// Scripted multi-tenant reverse-proxy gateway (spec.md §6 CLI detail).
#[derive(Parser, Debug)]
#[command(name = "tollgate", about = "Scripted multi-tenant reverse-proxy gateway")]
struct Args {
    /// Path to the YAML tenant/backend configuration.
    #[arg(short, long, default_value = "./tollgate.yaml", env = "TOLLGATE_CONFIG")]
    config: String,

    /// Overrides `scripts_dir` from the config file.
    #[arg(long, env = "TOLLGATE_SCRIPTS_DIR")]
    scripts_dir: Option<String>,

    /// Overrides `listen.address`/`listen.port` from the config file, as
    /// `host:port`.
    #[arg(long, env = "TOLLGATE_LISTEN")]
    listen: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "compact", env = "TOLLGATE_LOG_FORMAT")]
    log_format: LogFormat,

    /// How long to wait for in-flight requests to finish after a shutdown
    /// signal before the interpreter pool and health loops are torn down.
    #[arg(long, default_value_t = 10)]
    drain_grace_secs: u64,
}

/// Exit codes per spec.md §6: 0 clean shutdown, 1 config/startup failure
/// (bad config, route conflict, bad script), 2 listener bind failure.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_FAILURE: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format);

    let mut config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %args.config, "failed to load configuration");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    if let Some(dir) = &args.scripts_dir {
        config.scripts_dir = dir.clone();
    }
    if let Some(listen) = &args.listen {
        match parse_listen_override(listen) {
            Ok((address, port)) => {
                config.listen.address = address;
                config.listen.port = port;
            }
            Err(e) => {
                error!(listen = %listen, error = %e, "invalid --listen override, expected host:port");
                return ExitCode::from(EXIT_CONFIG_FAILURE);
            }
        }
    }

    let drain_grace = Duration::from_secs(args.drain_grace_secs);
    let shutdown_rx = shutdown::listen();

    let gateway = match bootstrap(config, shutdown_rx).await {
        Ok(g) => g,
        Err(BootstrapError::Bind(e)) => {
            error!(error = %e, "failed to bind listener");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
        Err(BootstrapError::Config(e)) => {
            error!(error = %e, "fatal startup error");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    match gateway.run(drain_grace).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!(error = %e, "gateway exited with an error");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
    }
}

fn parse_listen_override(listen: &str) -> anyhow::Result<(String, u16)> {
    let (addr, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing ':port'"))?;
    Ok((addr.to_string(), port.parse()?))
}
