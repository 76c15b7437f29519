use clap::Args;
use console::style;
use optiflux_common::{PortState, ServiceKind, ServiceStatusReport};

use crate::cli::{ServerArgs, VersionArgs, run_cli_async};

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub target: VersionArgs,
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long, help = "Print the raw JSON report")]
    pub json: bool,
}

pub async fn run(args: StatusArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

async fn run_inner(args: StatusArgs) -> Result<(), String> {
    let client = args.server.client()?;
    let target = &args.target;
    let report = client
        .service_status(&target.env, &target.model, &target.version)
        .await?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| format!("Failed to encode report: {err}"))?;
        println!("{json}");
        return Ok(());
    }

    println!("{} {} ({})", target.model, target.version, target.env);
    for line in render(&report) {
        println!("{line}");
    }
    Ok(())
}

fn render(report: &ServiceStatusReport) -> Vec<String> {
    let mut lines = Vec::new();
    for kind in ServiceKind::ALL {
        let ports = match kind {
            ServiceKind::Recommendation => &report.recom_status,
            ServiceKind::Reward => &report.reward_status,
        };
        for (port, state) in ports {
            let label = match state {
                PortState::Running => style(format!("✅ {state}")).green(),
                PortState::Stopped => style(format!("⚠️  {state}")).yellow(),
            };
            lines.push(format!("  {kind} :{port} {label}"));
        }
    }
    if lines.is_empty() {
        lines.push(format!("  {}", style("No service instances declared").dim()));
    }
    lines
}
