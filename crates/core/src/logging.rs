//! Tracing setup for the server and the CLI.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Crates whose events a plain `OPTIFLUX_LOG=<level>` applies to.
const LOG_TARGETS: [&str; 3] = ["optiflux_core", "optiflux_cli", "optiflux"];

/// Installs the stderr fmt subscriber.
///
/// `OPTIFLUX_LOG` is either a plain level ("trace", "debug", "info", "warn",
/// "error") applied to the optiflux crates, or a full filter spec such as
/// `optiflux_core=debug,axum=warn`.
pub fn init_tracing() {
    let filter = filter_spec(std::env::var("OPTIFLUX_LOG").ok().as_deref());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_filter(EnvFilter::new(filter));

    if tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("Warning: tracing subscriber already initialized");
    }
}

fn filter_spec(value: Option<&str>) -> String {
    match value {
        Some(level) if is_plain_level(level) => scoped(level),
        Some(spec) if !spec.trim().is_empty() => spec.to_string(),
        _ => scoped("info"),
    }
}

fn scoped(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_plain_level(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}
