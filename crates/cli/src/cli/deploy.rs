use clap::Args;
use std::path::{Path, PathBuf};

use crate::cli::{ServerArgs, VersionArgs, ensure_reachable, run_cli_async};
use crate::client::Upload;
use crate::common::{format_elapsed_ms, with_spinner, zip_directory};

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: VersionArgs,
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(
        long,
        value_name = "PATH",
        help = "File or directory to upload. A .zip file is extracted on the server"
    )]
    pub path: PathBuf,
}

pub async fn run(args: DeployArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

fn read_upload(artifact: &Path) -> Result<Upload, String> {
    if artifact.is_dir() {
        return Ok(Upload::Folder {
            bytes: zip_directory(artifact)?,
        });
    }
    let name = artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{} is not a file", artifact.display()))?;
    let bytes = std::fs::read(artifact)
        .map_err(|err| format!("Failed to read {}: {err}", artifact.display()))?;
    Ok(Upload::File { name, bytes })
}

async fn run_inner(args: DeployArgs) -> Result<(), String> {
    let client = args.server.client()?;
    ensure_reachable(&client).await?;
    let upload = read_upload(&args.path)?;
    let target = &args.target;

    let (receipt, start) = with_spinner(
        &format!("Uploading {} {}...", target.model, target.version),
        || client.deploy(&target.env, &target.model, &target.version, upload),
    )
    .await?;

    println!(
        "✅ Deployed {} {} to {} ({} files, {} bytes, {})",
        receipt.model_name,
        receipt.model_version,
        target.env,
        receipt.files,
        receipt.bytes,
        format_elapsed_ms(start)
    );
    Ok(())
}
