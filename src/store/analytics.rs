//! Analytics Snapshots
//!
//! Cached roll-ups over runs, variants, arms, ratings and golden KPIs for a
//! fixed set of time windows. The cache is swap-on-write with a TTL; readers
//! get the previous snapshot while a rebuild is in flight.

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use super::MetaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyticsWindow {
    Days7,
    Days30,
    All,
}

impl AnalyticsWindow {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "7d" => Some(Self::Days7),
            "30d" => Some(Self::Days30),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days7 => "7d",
            Self::Days30 => "30d",
            Self::All => "all",
        }
    }

    fn cutoff(&self) -> i64 {
        match self {
            Self::Days7 => Utc::now().timestamp() - 7 * 86_400,
            Self::Days30 => Utc::now().timestamp() - 30 * 86_400,
            Self::All => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub totals: serde_json::Value,
    pub series: serde_json::Value,
    pub meta: serde_json::Value,
    pub cached: bool,
    pub age_seconds: u64,
}

struct CachedEntry {
    payload: Arc<serde_json::Value>,
    built_at: Instant,
}

pub struct SnapshotCache {
    store: MetaStore,
    ttl: Duration,
    entries: RwLock<HashMap<AnalyticsWindow, CachedEntry>>,
}

impl SnapshotCache {
    pub fn new(store: MetaStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Serve from cache inside the TTL, otherwise rebuild and swap.
    pub async fn get(&self, window: AnalyticsWindow) -> Result<AnalyticsSnapshot> {
        {
            let entries = self.entries.read().expect("snapshot cache read");
            if let Some(entry) = entries.get(&window) {
                let age = entry.built_at.elapsed();
                if age < self.ttl {
                    return Ok(snapshot_from_payload(&entry.payload, true, age.as_secs()));
                }
            }
        }

        debug!(window = window.as_str(), "rebuilding analytics snapshot");
        let payload = Arc::new(self.build(window).await?);
        self.store.snapshot_put(window.as_str(), &payload).await?;
        {
            let mut entries = self.entries.write().expect("snapshot cache write");
            entries.insert(
                window,
                CachedEntry { payload: Arc::clone(&payload), built_at: Instant::now() },
            );
        }
        Ok(snapshot_from_payload(&payload, false, 0))
    }

    async fn build(&self, window: AnalyticsWindow) -> Result<serde_json::Value> {
        let cutoff = window.cutoff();
        let path = self.store.db_path().to_path_buf();

        let payload = tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
            let conn = rusqlite::Connection::open(&path)?;

            let (runs, best_total): (i64, Option<f64>) = conn.query_row(
                "SELECT COUNT(*), MAX(best_score) FROM runs WHERE started_at >= ?1",
                params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (variants, avg_total): (i64, Option<f64>) = conn.query_row(
                "SELECT COUNT(*), AVG(total_reward) FROM variants WHERE created_at >= ?1",
                params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let ratings: i64 = conn.query_row(
                "SELECT COUNT(*) FROM ratings WHERE created_at >= ?1",
                params![cutoff],
                |row| row.get(0),
            )?;

            let mut series = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT date(created_at, 'unixepoch') AS day, COUNT(*), AVG(total_reward)
                     FROM variants WHERE created_at >= ?1
                     GROUP BY day ORDER BY day ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (day, count, avg) = row?;
                    series.push(json!({
                        "day": day,
                        "variants": count,
                        "avg_total_reward": avg,
                    }));
                }
            }

            let mut operators = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT task_class, operator, pulls, mean_reward
                     FROM operator_stats WHERE last_updated >= ?1
                     ORDER BY mean_reward DESC LIMIT 20",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?;
                for row in rows {
                    let (task_class, operator, pulls, mean) = row?;
                    operators.push(json!({
                        "task_class": task_class,
                        "operator": operator,
                        "pulls": pulls,
                        "mean_reward": mean,
                    }));
                }
            }

            let golden: Option<(f64, f64, i64)> = conn
                .query_row(
                    "SELECT pass_rate, avg_total_reward, created_at
                     FROM golden_kpis ORDER BY id DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .ok();

            Ok(json!({
                "totals": {
                    "runs": runs,
                    "variants": variants,
                    "avg_total_reward": avg_total,
                    "best_total_reward": best_total,
                    "ratings": ratings,
                },
                "series": series,
                "meta": {
                    "operators": operators,
                    "golden": golden.map(|(pass_rate, avg, at)| json!({
                        "pass_rate": pass_rate,
                        "avg_total_reward": avg,
                        "created_at": at,
                    })),
                    "generated_at": Utc::now().timestamp(),
                },
            }))
        })
        .await??;

        Ok(payload)
    }
}

fn snapshot_from_payload(
    payload: &serde_json::Value,
    cached: bool,
    age_seconds: u64,
) -> AnalyticsSnapshot {
    AnalyticsSnapshot {
        totals: payload["totals"].clone(),
        series: payload["series"].clone(),
        meta: payload["meta"].clone(),
        cached,
        age_seconds,
    }
}
