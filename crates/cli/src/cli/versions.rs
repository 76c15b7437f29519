use clap::Args;
use console::style;
use optiflux_common::VersionSummary;

use crate::cli::{ModelArgs, ServerArgs, run_cli_async};

#[derive(Args, Debug, Clone)]
pub struct VersionsArgs {
    #[command(flatten)]
    pub target: ModelArgs,
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long, help = "Print the raw JSON listing")]
    pub json: bool,
}

pub async fn run(args: VersionsArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

async fn run_inner(args: VersionsArgs) -> Result<(), String> {
    let client = args.server.client()?;
    let versions = client.versions(&args.target.env, &args.target.model).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&versions)
            .map_err(|err| format!("Failed to encode versions: {err}"))?;
        println!("{json}");
        return Ok(());
    }

    if versions.is_empty() {
        println!("{}", style("No versions found").dim());
        return Ok(());
    }
    for version in &versions {
        println!("{}", render(version));
    }
    Ok(())
}

fn render(version: &VersionSummary) -> String {
    let timestamp = version
        .timestamp
        .map_or_else(|| "-".to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string());
    let marker = if version.is_serving {
        style("* serving").green().to_string()
    } else {
        String::new()
    };
    format!(
        "{:<16} {:>12} B  {timestamp}  {marker}",
        version.version, version.size
    )
    .trim_end()
    .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn render_marks_serving_version() {
        let version = VersionSummary {
            version: "1.0.0".to_string(),
            timestamp: None,
            size: 42,
            is_serving: true,
            services: BTreeMap::new(),
        };
        let line = render(&version);
        assert!(line.starts_with("1.0.0"));
        assert!(line.contains("42 B"));
        assert!(line.contains("serving"));
    }
}
