use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::analyze::AnalyzeStage;
use crate::db::{self, Competitor, InsightWithCompetitor};
use crate::error::PipelineError;
use crate::scrape::ScrapeStage;

/// Pipeline position for one invocation. Any stage error jumps straight to
/// `Failed`; there is no automatic retry, the user re-invokes from `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scraping,
    Analyzing,
    Refreshing,
    Done,
    Failed(String),
}

/// What one pipeline run produced. The refreshed collections are only
/// populated on `Done`; a failed run leaves them empty and whatever was
/// durably written before the failing stage in place.
pub struct RunReport {
    pub state: RunState,
    pub method: Option<&'static str>,
    pub inserted: usize,
    pub competitors: Vec<Competitor>,
    pub insights: Vec<InsightWithCompetitor>,
}

pub struct Orchestrator<'a> {
    scrape: &'a ScrapeStage,
    analyze: &'a AnalyzeStage,
}

impl<'a> Orchestrator<'a> {
    pub fn new(scrape: &'a ScrapeStage, analyze: &'a AnalyzeStage) -> Self {
        Self { scrape, analyze }
    }

    /// Sequence scrape → analyze → refresh for one competitor. Invocations
    /// are independent; nothing prevents two runs for the same competitor
    /// from interleaving, so duplicate insight rows are possible under
    /// concurrent refresh.
    pub async fn run(&self, conn: &Connection, competitor: &Competitor) -> RunReport {
        let mut report = RunReport {
            state: RunState::Idle,
            method: None,
            inserted: 0,
            competitors: Vec::new(),
            insights: Vec::new(),
        };

        transition(&mut report, RunState::Scraping, &competitor.name);
        let outcome = match self.scrape.scrape(&competitor.website).await {
            Ok(outcome) => outcome,
            Err(e) => return fail(report, &competitor.name, e),
        };
        report.method = Some(outcome.method());
        debug!(
            "{}: {} content fetched at {}",
            competitor.name,
            outcome.method(),
            outcome.content().fetched_at
        );

        // A successful scrape of an empty page is still a dead end.
        if outcome.content().markdown.trim().is_empty() {
            return fail(
                report,
                &competitor.name,
                PipelineError::NoContent {
                    url: competitor.website.clone(),
                },
            );
        }

        transition(&mut report, RunState::Analyzing, &competitor.name);
        let inserted = match self
            .analyze
            .analyze(
                conn,
                competitor.id,
                &competitor.name,
                &outcome.content().markdown,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => return fail(report, &competitor.name, e),
        };
        report.inserted = inserted.len();

        transition(&mut report, RunState::Refreshing, &competitor.name);
        report.competitors = match db::list_competitors(conn) {
            Ok(competitors) => competitors,
            Err(e) => return fail(report, &competitor.name, e.into()),
        };
        report.insights = match db::list_insights(conn, false, None) {
            Ok(insights) => insights,
            Err(e) => return fail(report, &competitor.name, e.into()),
        };

        transition(&mut report, RunState::Done, &competitor.name);
        report
    }
}

fn transition(report: &mut RunReport, next: RunState, name: &str) {
    info!("{}: {:?} -> {:?}", name, report.state, next);
    report.state = next;
}

fn fail(mut report: RunReport, name: &str, error: PipelineError) -> RunReport {
    warn!("{}: {:?} -> Failed ({})", name, report.state, error);
    report.state = RunState::Failed(error.to_string());
    report
}

// ── Tests ──
