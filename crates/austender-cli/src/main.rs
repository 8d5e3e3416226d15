//! `austender` CLI: scrape and aggregate Australian contract-award
//! totals, with an incremental parquet cache.

mod duck;

use std::process;
use std::sync::Arc;

use anyhow::Result;
use austender_cache::{CacheConfig, CacheManager, CollectorEngine};
use austender_core::dates::{parse_date_input, validate_date_order};
use austender_core::{CollectError, MatchSummary, SearchRequest};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::filter::LevelFilter;

const DATE_TYPES: &[&str] = &[
    "contractPublished",
    "contractStart",
    "contractEnd",
    "contractLastModified",
];

#[derive(Debug, Parser)]
#[command(name = "austender")]
#[command(about = "Scrape and persist Australian tender-award totals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Debug, Clone, Args)]
struct SearchArgs {
    /// Company to scan
    #[arg(long = "company", visible_alias = "c", global = true, default_value = "")]
    company: String,

    /// Department/agency to scan
    #[arg(long = "agency", visible_alias = "d", global = true, default_value = "")]
    agency: String,

    /// Keywords to scan
    #[arg(long = "keyword", visible_alias = "k", global = true, default_value = "")]
    keyword: String,

    /// Source portal: federal, nsw, vic, sa, or wa
    #[arg(long, global = true, default_value = "federal")]
    source: String,

    /// Optional start date (YYYY-MM-DD or RFC3339)
    #[arg(long = "start-date", global = true, default_value = "")]
    start_date: String,

    /// Optional end date (YYYY-MM-DD or RFC3339)
    #[arg(long = "end-date", global = true, default_value = "")]
    end_date: String,

    /// OCDS date field: contractPublished, contractStart, contractEnd,
    /// contractLastModified
    #[arg(long = "date-type", global = true, default_value = "contractPublished")]
    date_type: String,

    /// Window (years) when start date not specified; falls back to
    /// AUSTENDER_LOOKBACK_PERIOD or 20 years
    #[arg(long = "lookback-period", global = true, default_value_t = 0)]
    lookback_period: i32,

    /// Stream each matching contract as it is processed
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental ETL into the local parquet cache, resuming from the
    /// stored checkpoint
    Cache {
        #[command(subcommand)]
        command: Option<CacheCommands>,

        /// Directory for parquet files and the sqlite catalog
        #[arg(long = "cache-dir", default_value = "")]
        cache_dir: String,

        /// Bypass the cache and run a full scrape (does not write parquet)
        #[arg(long = "no-cache")]
        no_cache: bool,
    },
    /// Rebuild the lake index from parquet files on disk
    ReindexLake {
        #[arg(long = "cache-dir", default_value = "")]
        cache_dir: String,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    /// Run a DuckDB query over the cached parquet files (requires the
    /// external duckdb CLI)
    Query {
        #[arg(long = "cache-dir", default_value = "")]
        cache_dir: String,

        /// Custom DuckDB SQL; defaults to an agency/year aggregation
        #[arg(long = "sql", default_value = "")]
        sql: String,

        /// Row limit for the default aggregation
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.search.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        let code = err
            .downcast_ref::<CollectError>()
            .map(CollectError::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None => scrape(&cli.search).await?,
        Some(Commands::Cache {
            command: Some(CacheCommands::Query {
                cache_dir,
                sql,
                limit,
            }),
            ..
        }) => {
            let dir = resolve_cache_dir(&cache_dir);
            duck::run_duckdb_query(&dir, &sql, limit).await?;
        }
        Some(Commands::Cache {
            command: None,
            cache_dir,
            no_cache,
        }) => cache_run(&cli.search, &cache_dir, no_cache).await?,
        Some(Commands::ReindexLake { cache_dir }) => {
            let dir = resolve_cache_dir(&cache_dir);
            let manager = CacheManager::open(&dir)?;
            let indexed = manager.lake().rebuild_index()?;
            println!("lake index rebuilt ({indexed} parquet files)");
        }
    }
    Ok(())
}

/// Root command: cached search over the requested range, printing either
/// a progress bar or per-match lines.
async fn scrape(args: &SearchArgs) -> Result<()> {
    let req = build_request(args)?;
    let engine = CollectorEngine::new(CacheConfig::from_env())?;

    let progress = if args.verbose { None } else { Some(progress_bar()) };
    let req = wire_output(req, args.verbose, progress.clone());

    let outcome = engine.run_search_with_cache(&req).await;
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    let (total, cache_hit) = outcome?;

    if cache_hit {
        println!("Total Contract (cache): {total}");
    } else {
        println!("Total Contract: {total}");
    }
    Ok(())
}

async fn cache_run(args: &SearchArgs, cache_dir: &str, no_cache: bool) -> Result<()> {
    if args.keyword.trim().is_empty() && args.company.trim().is_empty() {
        return Err(CollectError::InvalidArgument(
            "keyword or company is required".into(),
        )
        .into());
    }

    let req = build_request(args)?;
    let config = CacheConfig::from_env().with_cache_dir(resolve_cache_dir(cache_dir));
    let engine = CollectorEngine::new(config)?;

    let progress = if args.verbose { None } else { Some(progress_bar()) };
    let req = wire_output(req, args.verbose, progress.clone());

    if no_cache {
        let outcome = engine.run_search(&req).await;
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        println!("Total Contract: {}", outcome?);
        return Ok(());
    }

    let outcome = engine.run_search_with_cache(&req).await;
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    let (total, cache_hit) = outcome?;
    if cache_hit {
        println!("Cache refreshed. Total Contract (cache): {total}");
    } else {
        println!("Cache primed. Total Contract: {total}");
    }
    Ok(())
}

fn build_request(args: &SearchArgs) -> Result<SearchRequest, CollectError> {
    let start = parse_date_input(&args.start_date)?;
    let end = parse_date_input(&args.end_date)?;
    validate_date_order(start, end)?;

    let date_type = args.date_type.trim();
    if !date_type.is_empty() && !DATE_TYPES.contains(&date_type) {
        return Err(CollectError::InvalidArgument(format!(
            "invalid date type {:?}; expected one of: {}",
            date_type,
            DATE_TYPES.join(", ")
        )));
    }

    Ok(SearchRequest {
        keyword: args.keyword.clone(),
        company: args.company.clone(),
        agency: args.agency.clone(),
        source: args.source.clone(),
        start_date: start,
        end_date: end,
        date_type: date_type.to_string(),
        lookback_period: args.lookback_period,
        verbose: args.verbose,
        ..Default::default()
    })
}

/// Attach either a per-match printer (verbose) or a window progress bar.
fn wire_output(
    mut req: SearchRequest,
    verbose: bool,
    progress: Option<ProgressBar>,
) -> SearchRequest {
    if verbose {
        req.on_match = Some(Arc::new(print_match));
    } else if let Some(bar) = progress {
        req.on_progress = Some(Arc::new(move |completed, total| {
            bar.set_length(total as u64);
            bar.set_position(completed as u64);
        }));
    }
    req
}

fn print_match(summary: &MatchSummary) {
    let date = summary
        .release_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    println!(
        "[match] {date} | {} | {} | {} | {} | {}",
        summary.contract_id,
        summary.supplier,
        summary.agency,
        austender_core::money::format_money(summary.amount),
        summary.title,
    );
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("Progress [{bar:28}] {pos}/{len} windows")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    bar
}

fn resolve_cache_dir(flag: &str) -> std::path::PathBuf {
    let flag = flag.trim();
    if flag.is_empty() {
        austender_cache::default_cache_dir()
    } else {
        std::path::PathBuf::from(flag)
    }
}
