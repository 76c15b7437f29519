use clap::Args;
use optiflux_common::RestartRequest;

use crate::cli::{ServerArgs, VersionArgs, ensure_reachable, run_cli_async};
use crate::common::{format_elapsed_ms, with_spinner};

#[derive(Args, Debug, Clone)]
pub struct RestartArgs {
    #[command(flatten)]
    pub target: VersionArgs,
    #[command(flatten)]
    pub server: ServerArgs,
}

pub async fn run(args: RestartArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

async fn run_inner(args: RestartArgs) -> Result<(), String> {
    let client = args.server.client()?;
    ensure_reachable(&client).await?;
    let request = RestartRequest {
        env: args.target.env,
        model_name: args.target.model,
        model_version: args.target.version,
    };

    let (report, start) = with_spinner(
        &format!(
            "Restarting services of {} {}...",
            request.model_name, request.model_version
        ),
        || client.restart(&request),
    )
    .await?;

    for instance in &report.launched {
        let pid = instance
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        println!(
            "  {} :{} {:?} (pid {pid})",
            instance.service, instance.port, instance.status
        );
    }
    println!(
        "✅ {} {} is serving with {} instances ({})",
        report.model_name,
        report.version,
        report.launched.len(),
        format_elapsed_ms(start)
    );
    Ok(())
}
