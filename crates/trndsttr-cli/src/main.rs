use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use trndsttr_core::{parse_keyword_list, Geo, IngestOutcome, KpiSummary, Timeframe};
use trndsttr_sync::{
    connect_pool, ingest_outcome, IngestConfig, IngestRequest, TrendServices, TrendSink, Watchlist,
    DEFAULT_WINDOW_DAYS,
};

const DEFAULT_FOCUS_KEYWORDS: usize = 3;

#[derive(Debug, Parser)]
#[command(name = "trndsttr")]
#[command(about = "Search-interest tracker: ingest Google Trends data and report movers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch interest over time and append it to the store.
    Ingest {
        /// Comma-separated keywords; defaults to the watchlist.
        keywords: Option<String>,
        #[arg(long)]
        timeframe: Option<Timeframe>,
        #[arg(long)]
        geo: Option<Geo>,
    },
    /// Create the trends table and indexes if missing.
    Migrate,
    /// List stored keywords.
    Keywords,
    /// Compare the latest window with the one before it.
    Kpis {
        #[arg(long)]
        keywords: Option<String>,
        #[arg(long, default_value_t = DEFAULT_WINDOW_DAYS)]
        window_days: u32,
    },
    Timeseries {
        keywords: String,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest {
        keywords: None,
        timeframe: None,
        geo: None,
    }) {
        Commands::Ingest {
            keywords,
            timeframe,
            geo,
        } => {
            let watchlist = Watchlist::load_or_default(&config.watchlist_path)?;
            let request = IngestRequest {
                keywords: keywords
                    .as_deref()
                    .map(parse_keyword_list)
                    .unwrap_or(watchlist.keywords),
                timeframe: timeframe.unwrap_or(watchlist.timeframe),
                geo: geo.unwrap_or(watchlist.geo),
            };
            let services = TrendServices::from_config(&config).await?;
            info!(
                provider = services.pipeline.provider_id(),
                keywords = ?request.keywords,
                timeframe = %request.timeframe,
                geo = %request.geo,
                "starting ingest"
            );
            let result = services.pipeline.ingest(&request).await;
            if let Ok(report) = &result {
                info!(run_id = %report.run_id, batches = report.batches, "ingest report");
            }
            let outcome = ingest_outcome(&result);
            match outcome {
                IngestOutcome::Ingested { .. } | IngestOutcome::NoData => println!("{}", outcome.message()),
                _ => bail!(outcome.message()),
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            TrendSink::new(pool, config.append_mode()).ensure_schema().await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Keywords => {
            let services = TrendServices::from_config(&config).await?;
            let keywords = services.aggregator.list_keywords().await?;
            println!("{}", serde_json::to_string_pretty(&keywords)?);
        }
        Commands::Kpis {
            keywords,
            window_days,
        } => {
            let services = TrendServices::from_config(&config).await?;
            let mut filter = keywords.as_deref().map(parse_keyword_list).unwrap_or_default();
            if filter.is_empty() {
                filter = services
                    .aggregator
                    .default_focus_keywords(DEFAULT_FOCUS_KEYWORDS)
                    .await?;
            }
            match services.aggregator.compute_kpis(Some(&filter), window_days).await? {
                Some(rows) => {
                    let summary = KpiSummary::from_rows(&rows);
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "keywords": filter,
                            "window_days": window_days,
                            "rows": rows,
                            "summary": summary,
                        }))?
                    );
                }
                None => println!("No data yet. Run `trndsttr ingest` first."),
            }
        }
        Commands::Timeseries { keywords } => {
            let services = TrendServices::from_config(&config).await?;
            let points = services
                .aggregator
                .timeseries_for(&parse_keyword_list(&keywords))
                .await?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }
        Commands::Serve => {
            trndsttr_web::serve_from_env().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_flags_parse_into_domain_types() {
        let cli = Cli::parse_from([
            "trndsttr",
            "ingest",
            "rust, zig",
            "--timeframe",
            "now 7-d",
            "--geo",
            "worldwide",
        ]);
        match cli.command {
            Some(Commands::Ingest {
                keywords,
                timeframe,
                geo,
            }) => {
                assert_eq!(keywords.as_deref(), Some("rust, zig"));
                assert_eq!(timeframe, Some(Timeframe::Last7Days));
                assert_eq!(geo, Some(Geo::Worldwide));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_defaults_to_ingest() {
        let cli = Cli::parse_from(["trndsttr"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn kpis_window_defaults_to_a_week() {
        let cli = Cli::parse_from(["trndsttr", "kpis"]);
        match cli.command {
            Some(Commands::Kpis { window_days, keywords }) => {
                assert_eq!(window_days, 7);
                assert!(keywords.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
