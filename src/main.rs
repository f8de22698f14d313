//! webterm - browser terminal backend with sandboxed shell sessions.
//!
//! Usage:
//!   webterm serve [--port 5000]          # Start HTTP + WebSocket server
//!   webterm exec [--cwd DIR] -- <cmd>    # Run one command through the executor

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::exit;
use tracing_subscriber::EnvFilter;

use webterm::config::{ServeArgs, ServerConfig};
use webterm::executor::{ExecConfig, Executor};
use webterm::http_server;
use webterm::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "webterm")]
#[command(about = "Browser terminal backend with sandboxed shell sessions")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve(ServeArgs),
    /// Run a single command line through the executor and exit with its code
    Exec {
        /// Working directory [default: current directory]
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Command line to run
        #[arg(last = true, required = true)]
        cmd_args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("webterm=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            let config = ServerConfig::from(serve);
            if let Err(e) = serve_until_stopped(config).await {
                tracing::error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Commands::Exec { cwd, cmd_args } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => match std::env::current_dir() {
                    Ok(cwd) => cwd,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        exit(1);
                    }
                },
            };
            let executor = Executor::new(ExecConfig::default());
            match executor.execute(&cmd_args.join(" "), &cwd, &HashMap::new()).await {
                Ok(result) => {
                    print!("{}", result.output);
                    exit(result.exit_code.as_i32());
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(127);
                }
            }
        }
    }
}

async fn serve_until_stopped(config: ServerConfig) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&config.sandbox_base).await?;
    tracing::info!(sandbox_base = %config.sandbox_base.display(), "Sandbox base ready");

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    let (state, _history_task) = AppState::new(&config);
    http_server::run_server(listener, state).await
}
