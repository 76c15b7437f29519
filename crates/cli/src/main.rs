//! `optiflux` command line: runs the manager server and talks to it.

#![forbid(unsafe_code)]
#![deny(warnings, unused_must_use, dead_code, missing_debug_implementations)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]

use clap::{CommandFactory, Parser, Subcommand};

mod cli;
mod client;
mod common;

#[derive(Parser, Debug)]
#[command(
    name = "optiflux",
    version,
    about = "\x1b[33moptiflux\x1b[0m deploys model versions and keeps their services running 🚀"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 🖥️  Run the deployment manager server
    Serve(cli::serve::ServeArgs),
    /// 📦 Upload a model version
    Deploy(cli::deploy::DeployArgs),
    /// 🔁 Make a version the serving one and restart its services
    Restart(cli::restart::RestartArgs),
    /// 📊 Probe the service ports of a model version
    Status(cli::status::StatusArgs),
    /// 🗂️  List the versions of a model
    Versions(cli::versions::VersionsArgs),
    /// 📚 List the models of an environment
    Models(cli::models::ModelsArgs),
}

fn main() {
    optiflux_core::init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(dispatch(Cli::parse()));
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> i32 {
    match cli.command {
        Some(Commands::Serve(args)) => cli::serve::run(args).await,
        Some(Commands::Deploy(args)) => cli::deploy::run(args).await,
        Some(Commands::Restart(args)) => cli::restart::run(args).await,
        Some(Commands::Status(args)) => cli::status::run(args).await,
        Some(Commands::Versions(args)) => cli::versions::run(args).await,
        Some(Commands::Models(args)) => cli::models::run(args).await,
        None => {
            let mut cmd = Cli::command();
            let _ = cmd.print_help();
            println!();
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn deploy_arguments_parse() {
        let cli = Cli::try_parse_from([
            "optiflux",
            "deploy",
            "--path",
            "./weights.bin",
            "--env",
            "dev",
            "--model",
            "ranker",
            "--version",
            "1.0.0",
        ])
        .unwrap();
        let Some(Commands::Deploy(args)) = cli.command else {
            unreachable!("expected deploy");
        };
        assert_eq!(args.target.model, "ranker");
        assert_eq!(args.target.version, "1.0.0");
        assert_eq!(args.path, std::path::PathBuf::from("./weights.bin"));
    }
}
