use clap::Args;
use console::style;

use crate::cli::{ServerArgs, run_cli_async};

#[derive(Args, Debug, Clone)]
pub struct ModelsArgs {
    #[arg(long, short = 'e', help = "Target environment: dev, preprod or prod")]
    pub env: String,
    #[arg(long, default_value_t = 1, help = "Page to show, starting at 1")]
    pub page: usize,
    #[arg(long, default_value_t = 10, help = "Models per page")]
    pub per_page: usize,
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long, help = "Print the raw JSON page")]
    pub json: bool,
}

pub async fn run(args: ModelsArgs) -> i32 {
    run_cli_async(|| run_inner(args)).await
}

async fn run_inner(args: ModelsArgs) -> Result<(), String> {
    let client = args.server.client()?;
    let page = client.models(&args.env, args.page, args.per_page).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&page)
            .map_err(|err| format!("Failed to encode models: {err}"))?;
        println!("{json}");
        return Ok(());
    }

    if page.models.is_empty() {
        println!("{}", style("No models found").dim());
        return Ok(());
    }
    for model in &page.models {
        let serving = model.serving_version.as_deref().unwrap_or("-");
        println!(
            "{:<24} {:>3} versions  latest {:<12} serving {serving}",
            model.model_name,
            model.version_count,
            model.max_version.as_deref().unwrap_or("-"),
        );
    }
    let pages = page.total.div_ceil(page.per_page.max(1));
    println!(
        "{}",
        style(format!("page {} of {pages} ({} models)", page.page, page.total)).dim()
    );
    Ok(())
}
