mod analyze;
mod config;
mod db;
mod embed;
mod error;
mod orchestrator;
mod scrape;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::analyze::AnalyzeStage;
use crate::config::Config;
use crate::db::Competitor;
use crate::embed::EmbedStage;
use crate::orchestrator::{Orchestrator, RunState};
use crate::scrape::ScrapeStage;

#[derive(Parser)]
#[command(
    name = "rivalwatch",
    about = "Competitor monitoring: scrape websites, extract insights via LLM"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a competitor and run the pipeline for it
    Add {
        name: String,
        website: String,
        /// Display glyph shown next to the name
        #[arg(short, long, default_value = "🏢")]
        logo: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Register only, skip the initial scrape
        #[arg(long)]
        no_scrape: bool,
    },
    /// List registered competitors
    List,
    /// Re-run the pipeline for one competitor, or all of them
    Refresh {
        /// Competitor id (see `list`)
        id: Option<i64>,
        /// Refresh every registered competitor
        #[arg(long)]
        all: bool,
    },
    /// Show extracted insights, newest first
    Insights {
        /// Only unread insights
        #[arg(short, long)]
        unread: bool,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Mark an insight as read
    MarkRead { id: i64 },
    /// Populate embedding vectors for insights that lack one
    Embed {
        /// Max insights to embed
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    // Configuration problems surface here, before any command runs.
    let config = Config::from_env()?;
    if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
    }
    let conn = db::connect(&config.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Add {
            name,
            website,
            logo,
            description,
            no_scrape,
        } => {
            let competitor = db::insert_competitor(
                &conn,
                &db::NewCompetitor {
                    name,
                    logo,
                    website,
                    description,
                },
            )?;
            println!(
                "Added {} {} (#{}) — {}",
                competitor.logo, competitor.name, competitor.id, competitor.website
            );
            if no_scrape {
                Ok(())
            } else {
                let scrape = ScrapeStage::new(&config.primary, &config.fallback);
                let analyze = AnalyzeStage::new(&config.completion);
                run_one(&conn, &scrape, &analyze, &competitor).await
            }
        }
        Commands::List => {
            let competitors = db::list_competitors(&conn)?;
            if competitors.is_empty() {
                println!("No competitors registered. Use 'add <name> <website>'.");
                return Ok(());
            }
            println!(
                "{:>3} | {:<3} | {:<24} | {:<32} | {:<20}",
                "#", "", "Name", "Website", "Last checked"
            );
            println!("{}", "-".repeat(94));
            for c in &competitors {
                println!(
                    "{:>3} | {:<3} | {:<24} | {:<32} | {:<20}",
                    c.id,
                    c.logo,
                    truncate(&c.name, 24),
                    truncate(&c.website, 32),
                    c.last_checked.as_deref().unwrap_or("never"),
                );
            }
            println!("\n{} competitors", competitors.len());
            Ok(())
        }
        Commands::Refresh { id, all } => {
            let scrape = ScrapeStage::new(&config.primary, &config.fallback);
            let analyze = AnalyzeStage::new(&config.completion);
            match (id, all) {
                (Some(id), false) => {
                    let competitor = db::find_competitor(&conn, id)?
                        .with_context(|| format!("no competitor with id {}", id))?;
                    run_one(&conn, &scrape, &analyze, &competitor).await
                }
                (None, true) => refresh_all(&conn, &scrape, &analyze).await,
                _ => bail!("pass a competitor id or --all"),
            }
        }
        Commands::Insights { unread, limit } => {
            let rows = db::list_insights(&conn, unread, Some(limit))?;
            if rows.is_empty() {
                println!("No insights yet. Run 'refresh' first.");
                return Ok(());
            }
            println!(
                "{:>4} | {} | {:<10} | {:<12} | {:<18} | {:<44}",
                "#", " ", "Date", "Category", "Competitor", "Title"
            );
            println!("{}", "-".repeat(104));
            for row in &rows {
                let i = &row.insight;
                println!(
                    "{:>4} | {} | {:<10} | {:<12} | {:<18} | {:<44}",
                    i.id,
                    if i.is_read { " " } else { "●" },
                    i.timestamp.get(..10).unwrap_or(&i.timestamp),
                    i.category,
                    truncate(&row.competitor.name, 18),
                    truncate(&i.title, 44),
                );
            }
            println!("\n{} insights | mark-read <id> to dismiss", rows.len());
            Ok(())
        }
        Commands::MarkRead { id } => {
            if db::mark_insight_read(&conn, id)? {
                println!("Insight {} marked as read.", id);
                Ok(())
            } else {
                bail!("no insight with id {}", id)
            }
        }
        Commands::Embed { limit } => {
            let Some(embedding) = config.embedding.as_ref() else {
                bail!("HUGGINGFACE_API_KEY is not set; embedding enrichment is unavailable");
            };
            let stage = EmbedStage::new(embedding);
            let stats = stage.enrich(&conn, limit).await?;
            println!(
                "Embedded {} insight(s) ({} ok, {} errors).",
                stats.total, stats.ok, stats.errors
            );
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Competitors: {}", s.competitors);
            println!("Insights:    {}", s.insights);
            println!("Unread:      {}", s.unread);
            println!("Embedded:    {}", s.embedded);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Run the pipeline for one competitor and surface a single failure
/// notification if it did not reach Done.
async fn run_one(
    conn: &rusqlite::Connection,
    scrape: &ScrapeStage,
    analyze: &AnalyzeStage,
    competitor: &Competitor,
) -> Result<()> {
    let report = Orchestrator::new(scrape, analyze)
        .run(conn, competitor)
        .await;
    match report.state {
        RunState::Done => {
            println!(
                "{}: {} new insight(s) via {} provider",
                competitor.name,
                report.inserted,
                report.method.unwrap_or("unknown"),
            );
            Ok(())
        }
        RunState::Failed(reason) => bail!("{}: {}", competitor.name, reason),
        other => bail!(
            "{}: pipeline ended in unexpected state {:?}",
            competitor.name,
            other
        ),
    }
}

/// Refresh every competitor sequentially; runs are independent and one
/// failure does not stop the rest.
async fn refresh_all(
    conn: &rusqlite::Connection,
    scrape: &ScrapeStage,
    analyze: &AnalyzeStage,
) -> Result<()> {
    let competitors = db::list_competitors(conn)?;
    if competitors.is_empty() {
        println!("No competitors registered.");
        return Ok(());
    }

    let pb = ProgressBar::new(competitors.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let orchestrator = Orchestrator::new(scrape, analyze);
    let mut ok = 0usize;
    let mut failed = 0usize;
    let mut inserted = 0usize;
    for competitor in &competitors {
        pb.set_message(competitor.name.clone());
        let report = orchestrator.run(conn, competitor).await;
        match report.state {
            RunState::Done => {
                ok += 1;
                inserted += report.inserted;
            }
            RunState::Failed(reason) => {
                failed += 1;
                pb.println(format!("{}: {}", competitor.name, reason));
            }
            _ => failed += 1,
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!(
        "Refreshed {} competitors ({} ok, {} failed), {} new insights.",
        competitors.len(),
        ok,
        failed,
        inserted
    );
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
