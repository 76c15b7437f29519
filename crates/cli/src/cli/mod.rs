use clap::Args;

use crate::client::ManagerClient;

pub mod deploy;
pub mod models;
pub mod restart;
pub mod serve;
pub mod status;
pub mod versions;

pub async fn run_cli_async<F, Fut>(f: F) -> i32
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    match f().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

/// Fails fast with a readable message when the manager is down.
pub async fn ensure_reachable(client: &ManagerClient) -> Result<(), String> {
    match client.health().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("Manager at {} is unhealthy", client.base())),
        Err(err) => Err(format!("Manager at {} is not reachable: {err}", client.base())),
    }
}

/// Where the manager server is and who is talking to it.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(
        long,
        env = "OPTIFLUX_SERVER",
        default_value = "http://127.0.0.1:8912",
        help = "Base URL of the deployment manager"
    )]
    pub server: String,
    #[arg(
        long,
        env = "OPTIFLUX_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with state-changing requests"
    )]
    pub token: Option<String>,
}

impl ServerArgs {
    pub fn client(&self) -> Result<ManagerClient, String> {
        ManagerClient::new(&self.server, self.token.clone())
    }
}

/// Environment and model a command works on.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long, short = 'e', help = "Target environment: dev, preprod or prod")]
    pub env: String,
    #[arg(long, short = 'm', help = "Model name")]
    pub model: String,
}

/// A single model version.
#[derive(Args, Debug, Clone)]
pub struct VersionArgs {
    #[arg(long, short = 'e', help = "Target environment: dev, preprod or prod")]
    pub env: String,
    #[arg(long, short = 'm', help = "Model name")]
    pub model: String,
    #[arg(long = "version", id = "model_version", short = 'v', help = "Model version")]
    pub version: String,
}
