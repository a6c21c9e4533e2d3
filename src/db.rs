use std::fmt;
use std::path::Path;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Result};

pub fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS competitors (
            id           INTEGER PRIMARY KEY,
            name         TEXT NOT NULL,
            logo         TEXT NOT NULL DEFAULT '🏢',
            website      TEXT NOT NULL,
            description  TEXT NOT NULL DEFAULT '',
            last_checked TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS insights (
            id            INTEGER PRIMARY KEY,
            competitor_id INTEGER NOT NULL REFERENCES competitors(id),
            title         TEXT NOT NULL,
            description   TEXT NOT NULL,
            category      TEXT NOT NULL
                          CHECK(category IN ('product','funding','partnership','launch')),
            is_read       BOOLEAN NOT NULL DEFAULT 0,
            source_url    TEXT,
            embedding     TEXT,
            timestamp     TEXT NOT NULL,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_insights_competitor ON insights(competitor_id);
        CREATE INDEX IF NOT EXISTS idx_insights_timestamp ON insights(timestamp);
        CREATE INDEX IF NOT EXISTS idx_insights_unread ON insights(is_read);
        ",
    )?;
    Ok(())
}

// ── Categories ──

/// Closed category set for insights. Drafts outside it never reach the store;
/// the CHECK constraint backs that up at the SQL level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Product,
    Funding,
    Partnership,
    Launch,
}

impl Category {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "product" => Some(Self::Product),
            "funding" => Some(Self::Funding),
            "partnership" => Some(Self::Partnership),
            "launch" => Some(Self::Launch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Funding => "funding",
            Self::Partnership => "partnership",
            Self::Launch => "launch",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl ToSql for Category {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Category {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Category::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

// ── Competitors ──

#[derive(Debug, Clone)]
pub struct Competitor {
    pub id: i64,
    pub name: String,
    pub logo: String,
    pub website: String,
    pub description: String,
    pub last_checked: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct NewCompetitor {
    pub name: String,
    pub logo: String,
    pub website: String,
    pub description: String,
}

const COMPETITOR_COLS: &str =
    "id, name, logo, website, description, last_checked, created_at, updated_at";

fn competitor_from_row(row: &rusqlite::Row<'_>, offset: usize) -> Result<Competitor> {
    Ok(Competitor {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        logo: row.get(offset + 2)?,
        website: row.get(offset + 3)?,
        description: row.get(offset + 4)?,
        last_checked: row.get(offset + 5)?,
        created_at: row.get(offset + 6)?,
        updated_at: row.get(offset + 7)?,
    })
}

pub fn insert_competitor(conn: &Connection, new: &NewCompetitor) -> Result<Competitor> {
    conn.execute(
        "INSERT INTO competitors (name, logo, website, description) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![new.name, new.logo, new.website, new.description],
    )?;
    get_competitor(conn, conn.last_insert_rowid())
}

pub fn get_competitor(conn: &Connection, id: i64) -> Result<Competitor> {
    conn.query_row(
        &format!("SELECT {} FROM competitors WHERE id = ?1", COMPETITOR_COLS),
        [id],
        |row| competitor_from_row(row, 0),
    )
}

pub fn find_competitor(conn: &Connection, id: i64) -> Result<Option<Competitor>> {
    conn.query_row(
        &format!("SELECT {} FROM competitors WHERE id = ?1", COMPETITOR_COLS),
        [id],
        |row| competitor_from_row(row, 0),
    )
    .optional()
}

/// Registered competitors, newest first.
pub fn list_competitors(conn: &Connection) -> Result<Vec<Competitor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM competitors ORDER BY created_at DESC, id DESC",
        COMPETITOR_COLS
    ))?;
    let rows = stmt
        .query_map([], |row| competitor_from_row(row, 0))?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

/// Stamp a competitor as analyzed. Called exactly once per analyze
/// invocation, insight count notwithstanding.
pub fn touch_last_checked(conn: &Connection, id: i64, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE competitors SET last_checked = ?2, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id, now],
    )?;
    Ok(())
}

// ── Insights ──

#[derive(Debug, Clone)]
pub struct Insight {
    pub id: i64,
    pub competitor_id: i64,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub is_read: bool,
    pub source_url: Option<String>,
    pub embedding: Option<String>,
    pub timestamp: String,
    pub created_at: String,
}

pub struct NewInsight {
    pub competitor_id: i64,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub source_url: Option<String>,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct InsightWithCompetitor {
    pub insight: Insight,
    pub competitor: Competitor,
}

const INSIGHT_COLS: &str = "id, competitor_id, title, description, category, is_read, \
                            source_url, embedding, timestamp, created_at";

fn insight_from_row(row: &rusqlite::Row<'_>) -> Result<Insight> {
    Ok(Insight {
        id: row.get(0)?,
        competitor_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        is_read: row.get(5)?,
        source_url: row.get(6)?,
        embedding: row.get(7)?,
        timestamp: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn insert_insight(conn: &Connection, new: &NewInsight) -> Result<Insight> {
    conn.execute(
        "INSERT INTO insights (competitor_id, title, description, category, is_read, source_url, timestamp)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
        rusqlite::params![
            new.competitor_id,
            new.title,
            new.description,
            new.category,
            new.source_url,
            new.timestamp,
        ],
    )?;
    conn.query_row(
        &format!("SELECT {} FROM insights WHERE id = ?1", INSIGHT_COLS),
        [conn.last_insert_rowid()],
        insight_from_row,
    )
}

/// Insights joined with their owning competitor, newest event first.
pub fn list_insights(
    conn: &Connection,
    unread_only: bool,
    limit: Option<usize>,
) -> Result<Vec<InsightWithCompetitor>> {
    let sql = format!(
        "SELECT i.id, i.competitor_id, i.title, i.description, i.category, i.is_read,
                i.source_url, i.embedding, i.timestamp, i.created_at,
                c.id, c.name, c.logo, c.website, c.description, c.last_checked,
                c.created_at, c.updated_at
         FROM insights i
         JOIN competitors c ON c.id = i.competitor_id{}
         ORDER BY i.timestamp DESC, i.id DESC{}",
        if unread_only { " WHERE i.is_read = 0" } else { "" },
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(InsightWithCompetitor {
                insight: insight_from_row(row)?,
                competitor: competitor_from_row(row, 10)?,
            })
        })?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

/// Flip the read flag. Returns false if no such insight exists.
pub fn mark_insight_read(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn.execute("UPDATE insights SET is_read = 1 WHERE id = ?1", [id])?;
    Ok(changed > 0)
}

// ── Embedding enrichment ──

/// Insights still missing an embedding vector: (id, text to embed).
pub fn unembedded_insights(
    conn: &Connection,
    limit: Option<usize>,
) -> Result<Vec<(i64, String)>> {
    let sql = format!(
        "SELECT id, title || '. ' || description
         FROM insights WHERE embedding IS NULL ORDER BY id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_embedding(conn: &Connection, id: i64, embedding_json: &str) -> Result<()> {
    conn.execute(
        "UPDATE insights SET embedding = ?2 WHERE id = ?1",
        rusqlite::params![id, embedding_json],
    )?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub competitors: usize,
    pub insights: usize,
    pub unread: usize,
    pub embedded: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let competitors: usize = conn.query_row("SELECT COUNT(*) FROM competitors", [], |r| r.get(0))?;
    let insights: usize = conn.query_row("SELECT COUNT(*) FROM insights", [], |r| r.get(0))?;
    let unread: usize = conn.query_row(
        "SELECT COUNT(*) FROM insights WHERE is_read = 0",
        [],
        |r| r.get(0),
    )?;
    let embedded: usize = conn.query_row(
        "SELECT COUNT(*) FROM insights WHERE embedding IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        competitors,
        insights,
        unread,
        embedded,
    })
}

// ── Tests ──
