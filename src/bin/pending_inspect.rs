use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use media_producer::config;
use media_producer::db;
use media_producer::dispatcher::build_message;

#[derive(Parser, Debug)]
#[command(about = "List token records still waiting for media dispatch")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Source to inspect (defaults to app.source)
    #[arg(long)]
    source: Option<String>,

    /// Maximum rows to print
    #[arg(long, default_value = "20")]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let source = args.source.unwrap_or_else(|| cfg.app.source.clone());

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let total = db::count_pending(&pool, &source).await?;
    println!("Source: {}", source);
    println!("Pending: {}", total);

    for item in db::find_pending(&pool, &source, args.limit).await? {
        let message = build_message(&item);
        println!(
            "  {} -> {{ priority: {}, media_files: {} }}",
            message.id,
            item.priority
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            message.body.media_files.len()
        );
    }
    Ok(())
}
