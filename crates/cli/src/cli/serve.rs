use clap::Args;
use optiflux_core::{Manager, ManagerConfig, UserDirectory, server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::run_cli_async;

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        help = "Profile whose .env.<PROFILE> file overrides .env in the current directory"
    )]
    pub profile: Option<String>,
    #[arg(long, help = "Address to bind. Overrides OPTIFLUX_HOST")]
    pub host: Option<String>,
    #[arg(long, short = 'p', help = "Port to bind. Overrides OPTIFLUX_PORT")]
    pub port: Option<u16>,
    #[arg(long, help = "TOML file of user tokens. Overrides OPTIFLUX_USERS_FILE")]
    pub users: Option<PathBuf>,
}

pub async fn run(args: ServeArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

async fn run_inner(args: ServeArgs) -> Result<(), String> {
    let mut config = ManagerConfig::load(args.profile.as_deref()).map_err(|err| err.to_string())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(users) = args.users {
        config.users_file = Some(users);
    }

    config
        .ensure_environment_dirs()
        .map_err(|err| err.to_string())?;
    let users =
        UserDirectory::load_optional(config.users_file.as_deref()).map_err(|err| err.to_string())?;
    if config.users_file.is_none() {
        warn!("No users file configured, every request is anonymous and read-only.");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("Failed to bind {addr}: {err}"))?;
    info!(
        dev = %config.dev_root.display(),
        preprod = %config.preprod_root.display(),
        prod = %config.prod_root.display(),
        "Environment roots ready."
    );
    println!("✅ Deployment manager listening on http://{addr}");

    let manager = Arc::new(Manager::new(Arc::new(config)));
    server::serve(listener, manager, Arc::new(users)).await
}
