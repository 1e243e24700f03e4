mod channel;
mod command;
mod dispatch;
mod helper;
mod metrics;
mod run;
mod service;
mod update;

use std::path::PathBuf;

use sentinel_core::paths;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Exit codes per the fleet CLI contract.
const EXIT_OK: i32 = 0;
const EXIT_TRANSIENT: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_PERMISSION: i32 = 3;
const EXIT_USAGE: i32 = 64;

fn print_usage() {
    eprintln!("Usage: sentinel-agent [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --server=URL --token=TOK --install   Install as OS service and start");
    eprintln!("  --uninstall --uninstall-token=TOK    Stop and remove the service");
    eprintln!("  --status                             Print service state and version");
    eprintln!("  --version                            Print version and exit");
    eprintln!("  --data-dir=PATH                      Override the data directory");
    eprintln!();
    eprintln!("With no options the agent runs as the installed service.");
}

#[derive(Debug, Default)]
struct CliArgs {
    server: Option<String>,
    token: Option<String>,
    uninstall_token: Option<String>,
    data_dir: Option<PathBuf>,
    install: bool,
    uninstall: bool,
    status: bool,
    version: bool,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    for arg in args {
        if let Some(value) = arg.strip_prefix("--server=") {
            parsed.server = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--token=") {
            parsed.token = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--uninstall-token=") {
            parsed.uninstall_token = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--data-dir=") {
            parsed.data_dir = Some(PathBuf::from(value));
        } else {
            match arg.as_str() {
                "--install" => parsed.install = true,
                "--uninstall" => parsed.uninstall = true,
                "--status" => parsed.status = true,
                "--version" => parsed.version = true,
                "--help" => parsed.help = true,
                other => return Err(format!("unknown option: {other}")),
            }
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            print_usage();
            std::process::exit(EXIT_USAGE);
        }
    };

    if args.version {
        println!("sentinel-agent {VERSION}");
        std::process::exit(EXIT_OK);
    }
    if args.help {
        print_usage();
        std::process::exit(EXIT_OK);
    }

    let data_dir = args.data_dir.clone().unwrap_or_else(paths::data_dir);

    if args.status {
        println!("{}", service::status_summary(&data_dir).await);
        std::process::exit(EXIT_OK);
    }

    init_tracing();

    if args.install {
        let (Some(server), Some(token)) = (args.server.as_deref(), args.token.as_deref()) else {
            eprintln!("--install requires --server=URL and --token=TOK");
            std::process::exit(EXIT_USAGE);
        };
        match service::install(&data_dir, server, token).await {
            Ok(()) => std::process::exit(EXIT_OK),
            Err(e) => {
                eprintln!("install failed: {e}");
                std::process::exit(service_exit_code(&e));
            }
        }
    }

    if args.uninstall {
        let Some(token) = args.uninstall_token.as_deref() else {
            eprintln!("--uninstall requires --uninstall-token=TOK");
            std::process::exit(EXIT_USAGE);
        };
        match service::uninstall(&data_dir, token).await {
            Ok(()) => std::process::exit(EXIT_OK),
            Err(e) => {
                eprintln!("uninstall failed: {e}");
                std::process::exit(service_exit_code(&e));
            }
        }
    }

    // No mode flags: run as the service.
    let shutdown = setup_shutdown_signal();
    match run::run_agent(data_dir, shutdown).await {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(e) => {
            eprintln!("sentinel-agent: {e:#}");
            let code = if e.to_string().contains("not installed") {
                EXIT_CONFIG
            } else {
                EXIT_TRANSIENT
            };
            std::process::exit(code);
        }
    }
}

fn service_exit_code(error: &service::ServiceError) -> i32 {
    match error {
        service::ServiceError::Permission(_) => EXIT_PERMISSION,
        service::ServiceError::Config(_) => EXIT_CONFIG,
        service::ServiceError::Failed(_) => EXIT_TRANSIENT,
    }
}

/// Tracing goes to stderr so stdout stays clean for --status output.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// SIGTERM/SIGINT trigger the shared cancellation token; every component
/// unwinds from it.
fn setup_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C), initiating shutdown");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_install_args() {
        let parsed = parse_args(&args(&[
            "--server=wss://fleet.example/ws",
            "--token=TK",
            "--install",
        ]))
        .unwrap();
        assert!(parsed.install);
        assert_eq!(parsed.server.as_deref(), Some("wss://fleet.example/ws"));
        assert_eq!(parsed.token.as_deref(), Some("TK"));
    }

    #[test]
    fn parse_uninstall_args() {
        let parsed =
            parse_args(&args(&["--uninstall", "--uninstall-token=abc"])).unwrap();
        assert!(parsed.uninstall);
        assert_eq!(parsed.uninstall_token.as_deref(), Some("abc"));
    }

    #[test]
    fn parse_data_dir_override() {
        let parsed = parse_args(&args(&["--status", "--data-dir=/tmp/x"])).unwrap();
        assert!(parsed.status);
        assert_eq!(parsed.data_dir.as_deref(), Some(std::path::Path::new("/tmp/x")));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
    }

    #[test]
    fn empty_args_mean_service_mode() {
        let parsed = parse_args(&[]).unwrap();
        assert!(!parsed.install && !parsed.uninstall && !parsed.status && !parsed.version);
    }
}
