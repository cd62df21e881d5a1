use crate::error::StoreError;
use crate::models::{Announcement, Forum, Post, Record, SourceFetchState};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use duckdb::{params, Connection, OptionalExt, ToSql};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS forums (
    id          INTEGER PRIMARY KEY,
    name        VARCHAR NOT NULL,
    base_url    VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS posts (
    forum_id    INTEGER   NOT NULL,
    -- external id when the site has one, else 'h:' + content hash
    post_key    VARCHAR   NOT NULL,
    external_id VARCHAR,
    ticker      VARCHAR,
    timestamp   TIMESTAMP NOT NULL,
    author      VARCHAR   NOT NULL,
    title       VARCHAR,
    raw_text    VARCHAR   NOT NULL,
    clean_text  VARCHAR   NOT NULL,
    url         VARCHAR,
    thread_url  VARCHAR,
    metadata    VARCHAR   NOT NULL DEFAULT '{}',
    scraped_at  TIMESTAMP NOT NULL,
    PRIMARY KEY (forum_id, post_key)
);

CREATE TABLE IF NOT EXISTS announcements (
    ticker       VARCHAR   NOT NULL,
    source       VARCHAR   NOT NULL,
    headline     VARCHAR   NOT NULL,
    published_at TIMESTAMP NOT NULL,
    summary      VARCHAR,
    body         VARCHAR,
    link         VARCHAR,
    category     VARCHAR   NOT NULL,
    importance   DOUBLE    NOT NULL,
    scraped_at   TIMESTAMP NOT NULL,
    PRIMARY KEY (ticker, source, headline, published_at)
);

CREATE TABLE IF NOT EXISTS source_fetch_state (
    source            VARCHAR PRIMARY KEY,
    last_fetch_ts     TIMESTAMP,
    last_backfill_ts  TIMESTAMP,
    total_fetch_count BIGINT NOT NULL DEFAULT 0
);

CREATE SEQUENCE IF NOT EXISTS scrape_run_ids START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('scrape_run_ids'),
    source          VARCHAR NOT NULL,
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    status          VARCHAR NOT NULL DEFAULT 'running',
    records_found   BIGINT DEFAULT 0,
    records_stored  BIGINT DEFAULT 0,
    error_msg       VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// Only columns that are never updated get secondary indexes.
const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_runs_source ON scrape_runs (source);
"#;

/// Timestamps are stored as naive UTC at microsecond precision.
fn db_ts(ts: DateTime<Utc>) -> NaiveDateTime {
    ts.trunc_subsecs(6).naive_utc()
}

// ── Read models ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeRun {
    pub id: i64,
    pub source: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub records_found: i64,
    pub records_stored: i64,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// (forum name, post count)
    pub posts_per_forum: Vec<(String, i64)>,
    /// (source, announcement count)
    pub announcements_per_source: Vec<(String, i64)>,
    pub recent_runs: Vec<ScrapeRun>,
}

impl StoreStats {
    pub fn total_posts(&self) -> i64 {
        self.posts_per_forum.iter().map(|(_, n)| n).sum()
    }

    pub fn total_announcements(&self) -> i64 {
        self.announcements_per_source.iter().map(|(_, n)| n).sum()
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Forums ────────────────────────────────────────────────────────────────

    pub fn seed_forums(&self, forums: &[Forum]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for f in forums {
            tx.execute(
                r#"INSERT INTO forums (id, name, base_url) VALUES (?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name,
                       base_url = excluded.base_url"#,
                params![f.id, f.name, f.base_url],
            )
            .with_context(|| format!("seed forum {}", f.name))?;
        }
        tx.commit()?;
        Ok(forums.len())
    }

    // ── Records ───────────────────────────────────────────────────────────────

    /// Upsert one batch in a single transaction and return how many records
    /// were new. Existing records only get their changed fields written; a
    /// key that appears twice in the batch is stored once.
    pub fn upsert_records(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = db_ts(Utc::now());

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for record in records {
            let outcome = match record {
                Record::Post(p) => upsert_post(&tx, p, now),
                Record::Announcement(a) => upsert_announcement(&tx, a, now),
            }
            .with_context(|| format!("upsert {:?}", record.natural_key()))?;
            match outcome {
                Upsert::Inserted => inserted += 1,
                Upsert::Updated => updated += 1,
                Upsert::Unchanged => {}
            }
        }
        tx.commit()?;
        debug!(
            "Batch of {}: {} inserted, {} updated",
            records.len(),
            inserted,
            updated
        );
        Ok(inserted)
    }

    #[cfg(test)]
    pub fn post_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM posts", [], |r| r.get(0))?)
    }

    #[cfg(test)]
    pub fn announcement_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM announcements", [], |r| r.get(0))?)
    }

    // ── Fetch state ───────────────────────────────────────────────────────────

    pub fn fetch_state(&self, source: &str) -> Result<Option<SourceFetchState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                r#"SELECT source, last_fetch_ts, last_backfill_ts, total_fetch_count
                   FROM source_fetch_state WHERE source = ?"#,
                params![source],
                fetch_state_row,
            )
            .optional()?;
        Ok(state)
    }

    pub fn fetch_states(&self) -> Result<Vec<SourceFetchState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT source, last_fetch_ts, last_backfill_ts, total_fetch_count
               FROM source_fetch_state ORDER BY source"#,
        )?;
        let states = stmt
            .query_map([], fetch_state_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Set the fetch watermark and bump the fetch counter.
    pub fn record_fetch(&self, source: &str, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO source_fetch_state (source, last_fetch_ts, total_fetch_count)
               VALUES (?, ?, 1)
               ON CONFLICT (source) DO UPDATE SET
                   last_fetch_ts = excluded.last_fetch_ts,
                   total_fetch_count = source_fetch_state.total_fetch_count + 1"#,
            params![source, db_ts(ts)],
        )
        .with_context(|| format!("record fetch for {}", source))?;
        Ok(())
    }

    pub fn record_backfill(&self, source: &str, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO source_fetch_state (source, last_backfill_ts, total_fetch_count)
               VALUES (?, ?, 0)
               ON CONFLICT (source) DO UPDATE SET
                   last_backfill_ts = excluded.last_backfill_ts"#,
            params![source, db_ts(ts)],
        )
        .with_context(|| format!("record backfill for {}", source))?;
        Ok(())
    }

    pub fn delete_fetch_state(&self, source: &str) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM source_fetch_state WHERE source = ?",
            params![source],
        )?)
    }

    pub fn delete_all_fetch_states(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM source_fetch_state", [])?)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self, source: &str) -> Result<i64> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row(
            r#"INSERT INTO scrape_runs (source, started_at, status)
               VALUES (?, ?, 'running') RETURNING id"#,
            params![source, Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(
        &self,
        run_id: i64,
        found: usize,
        stored: usize,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               records_found = ?, records_stored = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                found as i64,
                stored as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"SELECT COALESCE(f.name, CAST(p.forum_id AS VARCHAR)), COUNT(*)
               FROM posts p LEFT JOIN forums f ON f.id = p.forum_id
               GROUP BY 1 ORDER BY 1"#,
        )?;
        let posts_per_forum = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT source, COUNT(*) FROM announcements GROUP BY source ORDER BY source",
        )?;
        let announcements_per_source = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"SELECT id, source, started_at, finished_at, status,
                      records_found, records_stored, error_msg
               FROM scrape_runs ORDER BY id DESC LIMIT 10"#,
        )?;
        let recent_runs = stmt
            .query_map([], |r| {
                Ok(ScrapeRun {
                    id: r.get(0)?,
                    source: r.get(1)?,
                    started_at: r.get(2)?,
                    finished_at: r.get(3)?,
                    status: r.get(4)?,
                    records_found: r.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    records_stored: r.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    error_msg: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            posts_per_forum,
            announcements_per_source,
            recent_runs,
        })
    }
}

fn fetch_state_row(r: &duckdb::Row<'_>) -> duckdb::Result<SourceFetchState> {
    let last_fetch: Option<NaiveDateTime> = r.get(1)?;
    let last_backfill: Option<NaiveDateTime> = r.get(2)?;
    Ok(SourceFetchState {
        source: r.get(0)?,
        last_fetch_ts: last_fetch.map(|t| t.and_utc()),
        last_backfill_ts: last_backfill.map(|t| t.and_utc()),
        total_fetch_count: r.get(3)?,
    })
}

// ── Upsert internals ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// Write `sets` (column, value) onto the row matched by `key`.
fn apply_changes(
    conn: &Connection,
    table: &str,
    key_sql: &str,
    mut sets: Vec<(&str, &dyn ToSql)>,
    key: &[&dyn ToSql],
) -> Result<Upsert, StoreError> {
    if sets.is_empty() {
        return Ok(Upsert::Unchanged);
    }
    let assignments = sets
        .iter()
        .map(|(col, _)| format!("{} = ?", col))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE {} SET {} WHERE {}", table, assignments, key_sql);
    let mut args: Vec<&dyn ToSql> = sets.drain(..).map(|(_, v)| v).collect();
    args.extend_from_slice(key);
    conn.execute(&sql, &args[..])?;
    Ok(Upsert::Updated)
}

struct StoredPost {
    external_id: Option<String>,
    ticker: Option<String>,
    timestamp: NaiveDateTime,
    author: String,
    title: Option<String>,
    raw_text: String,
    url: Option<String>,
    thread_url: Option<String>,
    metadata: String,
}

fn upsert_post(conn: &Connection, p: &Post, now: NaiveDateTime) -> Result<Upsert, StoreError> {
    let key = p.post_key();
    let ts = db_ts(p.timestamp);
    let metadata = serde_json::to_string(&p.metadata)?;

    let existing = conn
        .query_row(
            r#"SELECT external_id, ticker, timestamp, author, title, raw_text,
                      url, thread_url, metadata
               FROM posts WHERE forum_id = ? AND post_key = ?"#,
            params![p.forum_id, key],
            |r| {
                Ok(StoredPost {
                    external_id: r.get(0)?,
                    ticker: r.get(1)?,
                    timestamp: r.get(2)?,
                    author: r.get(3)?,
                    title: r.get(4)?,
                    raw_text: r.get(5)?,
                    url: r.get(6)?,
                    thread_url: r.get(7)?,
                    metadata: r.get(8)?,
                })
            },
        )
        .optional()?;

    let Some(old) = existing else {
        // A concurrent writer may have claimed the key since the lookup.
        let n = conn.execute(
            r#"INSERT INTO posts
                   (forum_id, post_key, external_id, ticker, timestamp, author, title,
                    raw_text, clean_text, url, thread_url, metadata, scraped_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT DO NOTHING"#,
            params![
                p.forum_id,
                key,
                p.external_id,
                p.ticker,
                ts,
                p.author,
                p.title,
                p.raw_text,
                p.clean_text,
                p.url,
                p.thread_url,
                metadata,
                now,
            ],
        )?;
        return Ok(if n > 0 { Upsert::Inserted } else { Upsert::Unchanged });
    };

    let old_meta: Map<String, Value> = serde_json::from_str(&old.metadata)?;

    let mut sets: Vec<(&str, &dyn ToSql)> = Vec::new();
    if old.external_id != p.external_id {
        sets.push(("external_id", &p.external_id));
    }
    if old.ticker != p.ticker {
        sets.push(("ticker", &p.ticker));
    }
    // An estimated time never replaces the one already stored.
    if old.timestamp != ts && !p.approximate_time {
        sets.push(("timestamp", &ts));
    }
    if old.author != p.author {
        sets.push(("author", &p.author));
    }
    if old.title != p.title {
        sets.push(("title", &p.title));
    }
    if old.raw_text != p.raw_text {
        // New source text invalidates any downstream cleaning.
        sets.push(("raw_text", &p.raw_text));
        sets.push(("clean_text", &p.raw_text));
    }
    if old.url != p.url {
        sets.push(("url", &p.url));
    }
    if old.thread_url != p.thread_url {
        sets.push(("thread_url", &p.thread_url));
    }
    if old_meta != p.metadata {
        sets.push(("metadata", &metadata));
    }

    apply_changes(
        conn,
        "posts",
        "forum_id = ? AND post_key = ?",
        sets,
        &[&p.forum_id as &dyn ToSql, &key],
    )
}

struct StoredAnnouncement {
    summary: Option<String>,
    body: Option<String>,
    link: Option<String>,
    category: String,
    importance: f64,
}

fn upsert_announcement(
    conn: &Connection,
    a: &Announcement,
    now: NaiveDateTime,
) -> Result<Upsert, StoreError> {
    let published = db_ts(a.published_at);
    let key: [&dyn ToSql; 4] = [&a.ticker, &a.source, &a.headline, &published];
    let key_sql = "ticker = ? AND source = ? AND headline = ? AND published_at = ?";

    let existing = conn
        .query_row(
            &format!(
                "SELECT summary, body, link, category, importance FROM announcements WHERE {}",
                key_sql
            ),
            &key[..],
            |r| {
                Ok(StoredAnnouncement {
                    summary: r.get(0)?,
                    body: r.get(1)?,
                    link: r.get(2)?,
                    category: r.get(3)?,
                    importance: r.get(4)?,
                })
            },
        )
        .optional()?;

    let Some(old) = existing else {
        let n = conn.execute(
            r#"INSERT INTO announcements
                   (ticker, source, headline, published_at, summary, body, link,
                    category, importance, scraped_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT DO NOTHING"#,
            params![
                a.ticker,
                a.source,
                a.headline,
                published,
                a.summary,
                a.body,
                a.link,
                a.category,
                a.importance,
                now,
            ],
        )?;
        return Ok(if n > 0 { Upsert::Inserted } else { Upsert::Unchanged });
    };

    let mut sets: Vec<(&str, &dyn ToSql)> = Vec::new();
    if old.summary != a.summary {
        sets.push(("summary", &a.summary));
    }
    if old.body != a.body {
        sets.push(("body", &a.body));
    }
    if old.link != a.link {
        sets.push(("link", &a.link));
    }
    if old.category != a.category {
        sets.push(("category", &a.category));
    }
    if (old.importance - a.importance).abs() > f64::EPSILON {
        sets.push(("importance", &a.importance));
    }

    apply_changes(conn, "announcements", key_sql, sets, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 19, 16, 18, 0).unwrap()
    }

    fn post(id: &str, body: &str) -> Record {
        let mut p = Post::new(1, "ola", ts(), body).with_meta("source", "individual_post");
        p.external_id = Some(id.to_string());
        Record::Post(p)
    }

    fn filing(headline: &str) -> Record {
        Record::Announcement(Announcement::new("EQNR", "oslobors", headline, ts()))
    }

    #[test]
    fn rerunning_a_batch_inserts_nothing() {
        let repo = repo();
        let batch = vec![post("1", "Første innlegg"), post("2", "Andre innlegg"), filing("Q2")];
        assert_eq!(repo.upsert_records(&batch).unwrap(), 3);
        assert_eq!(repo.upsert_records(&batch).unwrap(), 0);
        assert_eq!(repo.post_count().unwrap(), 2);
        assert_eq!(repo.announcement_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_keys_in_one_batch_store_once() {
        let repo = repo();
        let batch = vec![post("7", "samme innlegg"), post("7", "samme innlegg"), filing("A"), filing("A")];
        assert_eq!(repo.upsert_records(&batch).unwrap(), 2);
        assert_eq!(repo.post_count().unwrap(), 1);
        assert_eq!(repo.announcement_count().unwrap(), 1);
    }

    #[test]
    fn hashed_posts_dedup_without_external_id() {
        let repo = repo();
        let a = Record::Post(Post::new(3, "kari", ts(), "Samme tekst igjen"));
        let b = Record::Post(Post::new(3, "kari", ts(), "Samme tekst igjen"));
        assert_eq!(repo.upsert_records(&[a]).unwrap(), 1);
        assert_eq!(repo.upsert_records(&[b]).unwrap(), 0);
        assert_eq!(repo.post_count().unwrap(), 1);
    }

    #[test]
    fn changed_text_updates_and_resets_clean_text() {
        let repo = repo();
        repo.upsert_records(&[post("9", "original tekst")]).unwrap();
        repo.conn()
            .unwrap()
            .execute("UPDATE posts SET clean_text = 'scored' WHERE post_key = '9'", [])
            .unwrap();

        // Unchanged content leaves the cleaned text alone.
        assert_eq!(repo.upsert_records(&[post("9", "original tekst")]).unwrap(), 0);
        let clean: String = repo
            .conn()
            .unwrap()
            .query_row("SELECT clean_text FROM posts WHERE post_key = '9'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(clean, "scored");

        assert_eq!(repo.upsert_records(&[post("9", "redigert tekst")]).unwrap(), 0);
        let (raw, clean): (String, String) = repo
            .conn()
            .unwrap()
            .query_row("SELECT raw_text, clean_text FROM posts WHERE post_key = '9'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(raw, "redigert tekst");
        assert_eq!(clean, "redigert tekst");
    }

    #[test]
    fn announcement_fields_are_updated() {
        let repo = repo();
        repo.upsert_records(&[filing("Q2 results")]).unwrap();
        let mut a = Announcement::new("EQNR", "oslobors", "Q2 results", ts());
        a.summary = Some("Strong quarter".into());
        a.importance = 1.0;
        assert_eq!(repo.upsert_records(&[Record::Announcement(a)]).unwrap(), 0);

        let (summary, importance): (Option<String>, f64) = repo
            .conn()
            .unwrap()
            .query_row("SELECT summary, importance FROM announcements", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(summary.as_deref(), Some("Strong quarter"));
        assert_eq!(importance, 1.0);
    }

    #[test]
    fn fetch_state_round_trip() {
        let repo = repo();
        assert!(repo.fetch_state("hegnar").unwrap().is_none());

        repo.record_fetch("hegnar", ts()).unwrap();
        repo.record_fetch("hegnar", ts() + Duration::hours(1)).unwrap();
        repo.record_backfill("hegnar", ts()).unwrap();

        let state = repo.fetch_state("hegnar").unwrap().unwrap();
        assert_eq!(state.last_fetch_ts, Some(ts() + Duration::hours(1)));
        assert_eq!(state.last_backfill_ts, Some(ts()));
        assert_eq!(state.total_fetch_count, 2);

        repo.record_fetch("nasdaq", ts()).unwrap();
        assert_eq!(repo.fetch_states().unwrap().len(), 2);
        assert_eq!(repo.delete_fetch_state("hegnar").unwrap(), 1);
        assert_eq!(repo.delete_all_fetch_states().unwrap(), 1);
        assert!(repo.fetch_states().unwrap().is_empty());
    }

    #[test]
    fn stats_cover_runs_and_counts() {
        let repo = repo();
        repo.seed_forums(&[Forum {
            id: 1,
            name: "hegnar".into(),
            base_url: "https://www.finansavisen.no".into(),
        }])
        .unwrap();
        repo.upsert_records(&[post("1", "et innlegg her"), filing("Q3")]).unwrap();

        let run = repo.begin_scrape_run("hegnar").unwrap();
        repo.finish_scrape_run(run, 2, 1, None).unwrap();
        let failed = repo.begin_scrape_run("nasdaq").unwrap();
        repo.finish_scrape_run(failed, 0, 0, Some("timeout")).unwrap();
        assert_ne!(run, failed);

        let stats = repo.stats().unwrap();
        assert_eq!(stats.posts_per_forum, vec![("hegnar".to_string(), 1)]);
        assert_eq!(stats.total_announcements(), 1);
        assert_eq!(stats.recent_runs.len(), 2);
        assert_eq!(stats.recent_runs[0].status, "error");
        assert_eq!(stats.recent_runs[1].records_found, 2);
    }

    #[test]
    fn open_creates_missing_parent_dirs() {
        let root = std::env::temp_dir().join(format!("forum-ingest-open-{}", std::process::id()));
        let path = root.join("nested/data/ingest.duckdb");
        let repo = Repository::open(&path).unwrap();
        repo.run_migrations().unwrap();
        assert!(path.exists());
        drop(repo);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
