use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scout_analysis::ScoutRuntime;
use scout_captcha::ChallengeImage;
use scout_core::{ManualAnnotation, SearchQuery, SortKey};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Second-hand marketplace search and CAPTCHA tooling")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search several marketplaces and print the merged listings.
    Analyze(AnalyzeArgs),
    /// Print one listing with its seller and attributes.
    Item { platform: String, item_id: String },
    /// Print earlier analyses of a search, newest first.
    History {
        text: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    #[command(subcommand)]
    Captcha(CaptchaCommand),
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    text: String,
    /// Platform tags; defaults to every built-in marketplace.
    #[arg(short, long = "platform")]
    platforms: Vec<String>,
    #[arg(long)]
    min_price: Option<f64>,
    #[arg(long)]
    max_price: Option<f64>,
    #[arg(long = "brand")]
    brands: Vec<String>,
    #[arg(long = "size")]
    sizes: Vec<String>,
    #[arg(long = "condition")]
    conditions: Vec<String>,
    /// price_asc, price_desc, newest or relevance.
    #[arg(long)]
    sort: Option<SortKey>,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    limit: Option<u32>,
    /// Check each platform first and skip unreachable ones.
    #[arg(long)]
    check_availability: bool,
    /// Print the full report with per-platform outcomes and price statistics.
    #[arg(long)]
    report: bool,
}

impl AnalyzeArgs {
    fn query(&self) -> SearchQuery {
        SearchQuery {
            text: self.text.clone(),
            min_price: self.min_price,
            max_price: self.max_price,
            brands: self.brands.iter().cloned().collect(),
            sizes: self.sizes.iter().cloned().collect(),
            conditions: self.conditions.iter().cloned().collect(),
            page: self.page,
            limit: self.limit,
            sort: self.sort,
        }
    }
}

#[derive(Debug, Subcommand)]
enum CaptchaCommand {
    /// Estimate the gap offset for a challenge/piece image pair.
    Solve {
        #[arg(long)]
        challenge: PathBuf,
        #[arg(long)]
        piece: PathBuf,
        /// Arbitrary JSON stored with the attempt.
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Record whether an attempt's answer was accepted.
    Validate {
        attempt_id: Uuid,
        #[arg(long, conflicts_with = "failure")]
        success: bool,
        #[arg(long)]
        failure: bool,
        #[arg(long)]
        position: Option<u32>,
    },
    /// Store a human-corrected gap position.
    Annotate {
        attempt_id: Uuid,
        gap_position: i64,
        #[arg(long = "by", env = "SCOUT_ANNOTATOR")]
        annotated_by: String,
    },
    /// Print solver accuracy figures.
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_image(path: &PathBuf) -> Result<ChallengeImage> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(ChallengeImage::new(path.display().to_string(), bytes))
}

async fn run(cli: Cli) -> Result<()> {
    let runtime = ScoutRuntime::from_env().await?;
    debug!(database_url = %runtime.config.database_url, "runtime loaded");

    match cli.command {
        Commands::Analyze(args) => {
            let platforms = if args.platforms.is_empty() {
                runtime.factory().known_tags()
            } else {
                args.platforms.clone()
            };
            let query = args.query();
            let report = if args.check_availability {
                let ScoutRuntime { analyzer, .. } = runtime;
                analyzer
                    .with_availability_check(true)
                    .analyze_market_report(&query, &platforms)
                    .await?
            } else {
                runtime.analyzer.analyze_market_report(&query, &platforms).await?
            };
            if args.report {
                print_json(&report)?;
            } else {
                print_json(&report.results)?;
            }
        }
        Commands::Item { platform, item_id } => {
            let provider = runtime.factory().get_provider(&platform)?;
            print_json(&provider.get_item(&item_id).await?)?;
        }
        Commands::History { text, limit } => {
            print_json(&runtime.analyzer.historical_analyses(&text, limit).await?)?;
        }
        Commands::Captcha(CaptchaCommand::Solve {
            challenge,
            piece,
            metadata,
        }) => {
            let metadata = metadata
                .map(|raw| serde_json::from_str(&raw).context("parsing --metadata as json"))
                .transpose()?;
            let attempt = runtime
                .solver
                .solve(read_image(&challenge).await?, read_image(&piece).await?, metadata)
                .await?;
            print_json(&attempt)?;
        }
        Commands::Captcha(CaptchaCommand::Validate {
            attempt_id,
            success,
            failure,
            position,
        }) => {
            anyhow::ensure!(success || failure, "pass --success or --failure");
            let attempt = runtime
                .solver
                .validate_result(attempt_id, success, position)
                .await?;
            print_json(&attempt)?;
        }
        Commands::Captcha(CaptchaCommand::Annotate {
            attempt_id,
            gap_position,
            annotated_by,
        }) => {
            let row = runtime
                .training
                .annotate_manually(ManualAnnotation::new(attempt_id, gap_position, annotated_by))
                .await?;
            print_json(&row)?;
        }
        Commands::Captcha(CaptchaCommand::Stats) => {
            print_json(&runtime.training.get_training_stats().await?)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "scout=debug" } else { "scout=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    run(cli).await
}
