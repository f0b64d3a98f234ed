//! # wrapmgr CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the manager against a local worker, with the admin server on 18924
//! wrapmgr serve --admin-bind 127.0.0.1:18924
//!
//! # Sign an account in (prompts for a two-factor code when needed)
//! WRAPMGR_PASSWORD=... wrapmgr login alice@example.com
//!
//! # One-off lookups, printed to stdout
//! wrapmgr status
//! wrapmgr m3u8 1440818664
//! wrapmgr lyrics 1440818664 -l en-US -r us
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use wrapmgr_cli::args::{
    process_env, resolve_addr, Cli, Commands, LoginArgs, LyricsArgs, ServeArgs,
};
use wrapmgr_client::ManagerClient;
use wrapmgr_manager::WrapperManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Lookup commands print to stdout; keep it clean for piping.
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Status(args) => {
            let client = ManagerClient::new(resolve_addr(args.addr, &process_env));
            let status = client.status().await?;
            println!("{}", serde_json::to_string(&status)?);
            Ok(())
        }
        Commands::M3u8(args) => {
            let client = ManagerClient::new(resolve_addr(args.addr, &process_env));
            println!("{}", client.m3u8(&args.adam_id).await?);
            Ok(())
        }
        Commands::Lyrics(args) => run_lyrics(args).await,
        Commands::Login(args) => run_login(args).await,
        Commands::Logout(args) => {
            let client = ManagerClient::new(resolve_addr(args.addr, &process_env));
            client.logout(&args.username).await?;
            eprintln!("Logged out {}", args.username);
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config(&process_env)?;
    tracing::info!("Starting wrapper manager on {}", config.rpc_bind);
    tracing::info!(
        "Worker at {} (decrypt {}, m3u8 {}, account {})",
        config.proxy.host,
        config.proxy.decrypt_port,
        config.proxy.m3u8_port,
        config.proxy.account_port
    );
    if !config.health_enabled {
        tracing::info!("Health checking disabled");
    }

    let manager = Arc::new(WrapperManager::new(config)?);
    let handle = manager.start().await?;
    if let Some(addr) = handle.admin_addr() {
        tracing::info!("Admin HTTP on http://{}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Received ctrl-c, shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn run_lyrics(args: LyricsArgs) -> Result<()> {
    let client = ManagerClient::new(resolve_addr(args.addr, &process_env));
    let lyrics = client
        .lyrics(&args.adam_id, &args.language, &args.region)
        .await?;
    println!("{}", lyrics);
    Ok(())
}

async fn run_login(args: LoginArgs) -> Result<()> {
    let password = args
        .password
        .or_else(|| process_env("WRAPMGR_PASSWORD"))
        .context("no password given; pass -p or set WRAPMGR_PASSWORD")?;
    let client = ManagerClient::new(resolve_addr(args.addr, &process_env));

    client
        .login(&args.username, &password, || async {
            eprint!("Two-factor code: ");
            let mut line = String::new();
            let mut stdin = BufReader::new(tokio::io::stdin());
            match stdin.read_line(&mut line).await {
                Ok(n) if n > 0 => Some(line.trim().to_string()).filter(|code| !code.is_empty()),
                _ => None,
            }
        })
        .await?;

    eprintln!("Logged in {}", args.username);
    Ok(())
}
