//! Control client for the editor registry.
//!
//! Issues one registry call per invocation and prints the result. The daemon
//! is started on demand unless `--no-start` is given.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use editor_registry::daemon;
use editor_registry::ipc::{Acquired, QueryResult, RegistryClient};
use editor_registry::remote::{Focus, NvimRemote};
use editor_registry::{RegistryConfig, RegistryError, ReservationToken};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "editor-registry-control")]
#[command(about = "Control client for the editor registry daemon")]
struct Cli {
    /// Registry port on 127.0.0.1
    #[arg(short, long, env = "EDITOR_REGISTRY_PORT", default_value_t = RegistryConfig::DEFAULT_PORT)]
    port: u16,

    /// Fail instead of starting the daemon when it is not running
    #[arg(long)]
    no_start: bool,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the running instance for an identifier, or null
    Query {
        identifier: String,
        /// Reserve the identifier when no instance is running
        #[arg(long)]
        reserve: bool,
    },
    /// Print all running instances
    List,
    /// Register a running instance
    Register {
        identifier: String,
        server_address: String,
        /// Reservation token from a previous `query --reserve`
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove an instance, or release a reservation when a token is given
    Unregister {
        identifier: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Wait for a running instance or win the right to launch one
    Acquire {
        identifier: String,
        /// Give up after this many milliseconds of someone else launching
        #[arg(long, default_value_t = 20_000)]
        wait_ms: u64,
    },
    /// Bring the window of a running instance to the foreground
    Focus {
        identifier: String,
        /// Neovim client binary
        #[arg(long, default_value = "nvim")]
        nvim: PathBuf,
    },
    /// Stop the daemon
    Shutdown,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Attach the wire code to registry errors for scripts that parse stderr.
fn report(err: RegistryError) -> anyhow::Error {
    anyhow!("{} (code: {})", err, err.to_rpc_error_code())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let endpoint = SocketAddr::from((RegistryConfig::BIND_ADDR, cli.port));
    let client = RegistryClient::new(endpoint);

    if let Commands::Shutdown = cli.command {
        if !client.is_reachable().await {
            println!("Registry is not running");
            return Ok(());
        }
        client.shutdown().await.map_err(report)?;
        println!("Success: shutting_down");
        return Ok(());
    }

    if cli.no_start {
        if !client.is_reachable().await {
            return Err(report(RegistryError::DaemonUnreachable {
                addr: endpoint.to_string(),
            }));
        }
    } else {
        daemon::ensure_daemon(&client).await.map_err(report)?;
    }
    debug!("Registry reachable at {}", endpoint);

    match cli.command {
        Commands::Query {
            identifier,
            reserve: false,
        } => {
            let found = client.query(&identifier).await.map_err(report)?;
            print_json(&found)
        }
        Commands::Query {
            identifier,
            reserve: true,
        } => {
            let result = client.find_or_claim(&identifier).await.map_err(report)?;
            print_json(&result)
        }
        Commands::List => {
            let instances = client.list().await.map_err(report)?;
            print_json(&instances)
        }
        Commands::Register {
            identifier,
            server_address,
            token,
        } => {
            let token = token.map(ReservationToken::from);
            client
                .register(&identifier, &server_address, token.as_ref())
                .await
                .map_err(report)?;
            println!("Success: registered");
            Ok(())
        }
        Commands::Unregister { identifier, token } => {
            match token {
                Some(token) => client
                    .release(&identifier, &ReservationToken::from(token))
                    .await
                    .map_err(report)?,
                None => client.unregister(&identifier).await.map_err(report)?,
            }
            println!("Success: unregistered");
            Ok(())
        }
        Commands::Acquire { identifier, wait_ms } => {
            let acquired = client
                .acquire(
                    &identifier,
                    RegistryConfig::CLAIM_POLL_INTERVAL,
                    Duration::from_millis(wait_ms),
                )
                .await
                .map_err(report)?;
            let result = match acquired {
                Acquired::Existing(instance) => QueryResult::Active(instance),
                Acquired::Claimed(reservation) => QueryResult::Reserved(reservation),
            };
            print_json(&result)
        }
        Commands::Focus { identifier, nvim } => {
            let instance = client
                .query(&identifier)
                .await
                .map_err(report)?
                .ok_or_else(|| report(RegistryError::NotFound { identifier }))?;
            NvimRemote::new(nvim)
                .focus(&instance.server_address)
                .await
                .map_err(report)?;
            println!("Focused {}", instance.server_address);
            Ok(())
        }
        Commands::Shutdown => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_register_with_token() {
        let cli = Cli::try_parse_from([
            "editor-registry-control",
            "--port",
            "6000",
            "register",
            "/work/p",
            "127.0.0.1:51000",
            "--token",
            "abc",
        ])
        .unwrap();
        assert_eq!(cli.port, 6000);
        match cli.command {
            Commands::Register {
                identifier,
                server_address,
                token,
            } => {
                assert_eq!(identifier, "/work/p");
                assert_eq!(server_address, "127.0.0.1:51000");
                assert_eq!(token.as_deref(), Some("abc"));
            }
            other => panic!("Expected Register, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_query_reserve_flag() {
        let cli =
            Cli::try_parse_from(["editor-registry-control", "query", "/p", "--reserve"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Query { reserve: true, .. }
        ));
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["editor-registry-control", "open"]).is_err());
    }
}
