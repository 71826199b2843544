use crate::db::Database;
use crate::model::{ChannelCandidate, ChannelLifecycle, OpenHistory, Rejection, RejectionReason};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

/// Candidate persistence. Writes are synchronous on the underlying
/// connection, so a load issued after an `add_rejection` always observes
/// the rejection. The convergence loop depends on this read-after-write
/// discipline.
pub struct CandidateStore<'a> {
    db: &'a Database,
}

impl<'a> CandidateStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Load every stored candidate with its history and rejection log.
    pub fn load(&self) -> anyhow::Result<Vec<ChannelCandidate>> {
        let conn = self.db.conn();

        let mut history: HashMap<String, Vec<ChannelLifecycle>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT pubkey, channel_id, opened_at, closed_at, capacity_sats, fees_earned_msat \
                 FROM candidate_history ORDER BY opened_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ChannelLifecycle {
                        channel_id: row.get(1)?,
                        opened_at: ts_to_datetime(row.get(2)?),
                        closed_at: row.get::<_, Option<f64>>(3)?.map(ts_to_datetime),
                        capacity_sats: row.get::<_, i64>(4)? as u64,
                        fees_earned_msat: row.get::<_, i64>(5)? as u64,
                    },
                ))
            })?;
            for row in rows {
                let (pubkey, entry) = row?;
                history.entry(pubkey).or_default().push(entry);
            }
        }

        let mut rejections: HashMap<String, Vec<Rejection>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT pubkey, rejected_at, reason, details, min_channel_size \
                 FROM rejections ORDER BY rejected_at, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?;
            for row in rows {
                let (pubkey, at, reason, details, min) = row?;
                let reason = RejectionReason::from_str(&reason)
                    .with_context(|| format!("bad rejection reason for {}", pubkey))?;
                rejections.entry(pubkey).or_default().push(Rejection {
                    date: ts_to_datetime(at),
                    reason,
                    details,
                    min_channel_size: min.map(|m| m as u64),
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT pubkey, alias, sources, added_at, channels, capacity_sats, \
             last_update, distance, min_channel_size \
             FROM candidates ORDER BY added_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (pubkey, alias, sources, added_at, channels, capacity, last_update, distance, min) =
                row?;
            let sources: BTreeSet<String> = serde_json::from_str(&sources)
                .with_context(|| format!("bad sources for {}", pubkey))?;
            candidates.push(ChannelCandidate {
                alias,
                sources,
                added_at: ts_to_datetime(added_at),
                channels: channels as u64,
                capacity_sats: capacity as u64,
                last_update: last_update.map(ts_to_datetime),
                distance: distance.map(|d| d as u32),
                history: history.remove(&pubkey).unwrap_or_default(),
                rejections: rejections.remove(&pubkey).unwrap_or_default(),
                min_channel_size: min.map(|m| m as u64),
                pubkey,
            });
        }
        Ok(candidates)
    }

    pub fn get(&self, pubkey: &str) -> anyhow::Result<Option<ChannelCandidate>> {
        // Candidate sets are small; reuse the bulk loader.
        Ok(self.load()?.into_iter().find(|c| c.pubkey == pubkey))
    }

    /// Insert or merge a candidate record. `added_at` is preserved from the
    /// first sighting, sources are unioned, history entries are deduplicated
    /// by channel id, and the learned minimum never decreases.
    pub fn upsert(&self, candidate: &ChannelCandidate) -> anyhow::Result<()> {
        let conn = self.db.conn();
        let existing = self.get(&candidate.pubkey)?;

        let (added_at, mut sources, min_floor) = match &existing {
            Some(prev) => (
                prev.added_at,
                prev.sources.clone(),
                prev.min_channel_size.unwrap_or(0),
            ),
            None => (candidate.added_at, BTreeSet::new(), 0),
        };
        sources.extend(candidate.sources.iter().cloned());

        conn.execute(
            "INSERT INTO candidates \
             (pubkey, alias, sources, added_at, channels, capacity_sats, \
              last_update, distance, min_channel_size) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(pubkey) DO UPDATE SET \
               alias = excluded.alias, \
               sources = excluded.sources, \
               channels = excluded.channels, \
               capacity_sats = excluded.capacity_sats, \
               last_update = excluded.last_update, \
               distance = excluded.distance, \
               min_channel_size = excluded.min_channel_size",
            rusqlite::params![
                candidate.pubkey,
                candidate.alias,
                serde_json::to_string(&sources)?,
                datetime_to_ts(added_at),
                candidate.channels as i64,
                candidate.capacity_sats as i64,
                candidate.last_update.map(datetime_to_ts),
                candidate.distance.map(|d| d as i64),
                candidate.min_channel_size.map(|m| m as i64),
            ],
        )?;

        for entry in &candidate.history {
            conn.execute(
                "INSERT INTO candidate_history \
                 (channel_id, pubkey, opened_at, closed_at, capacity_sats, fees_earned_msat) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(channel_id) DO UPDATE SET \
                   closed_at = excluded.closed_at, \
                   capacity_sats = excluded.capacity_sats, \
                   fees_earned_msat = excluded.fees_earned_msat",
                rusqlite::params![
                    entry.channel_id,
                    candidate.pubkey,
                    datetime_to_ts(entry.opened_at),
                    entry.closed_at.map(datetime_to_ts),
                    entry.capacity_sats as i64,
                    entry.fees_earned_msat as i64,
                ],
            )?;
        }

        let already = existing.map(|p| p.rejections.len()).unwrap_or(0);
        for rejection in candidate.rejections.iter().skip(already) {
            self.insert_rejection(&candidate.pubkey, rejection)?;
        }

        self.recompute_learned_minimum(&candidate.pubkey, min_floor)?;
        Ok(())
    }

    /// Append a rejection and bump the learned minimum if it carries one.
    pub fn add_rejection(&self, pubkey: &str, rejection: &Rejection) -> anyhow::Result<()> {
        self.insert_rejection(pubkey, rejection)?;
        self.recompute_learned_minimum(pubkey, 0)
    }

    fn insert_rejection(&self, pubkey: &str, rejection: &Rejection) -> anyhow::Result<()> {
        self.db.conn().execute(
            "INSERT INTO rejections (pubkey, rejected_at, reason, details, min_channel_size) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                pubkey,
                datetime_to_ts(rejection.date),
                rejection.reason.as_str(),
                rejection.details,
                rejection.min_channel_size.map(|m| m as i64),
            ],
        )?;
        Ok(())
    }

    /// Learned minimum = max over all min_channel_size rejections, floored
    /// by any previously stored value. Monotonically non-decreasing.
    fn recompute_learned_minimum(&self, pubkey: &str, floor: u64) -> anyhow::Result<()> {
        let conn = self.db.conn();
        let from_rejections: Option<i64> = conn.query_row(
            "SELECT MAX(min_channel_size) FROM rejections \
             WHERE pubkey = ?1 AND reason = 'min_channel_size'",
            [pubkey],
            |row| row.get(0),
        )?;
        // The candidate row may not exist yet when a rejection arrives first.
        let current: Option<Option<i64>> = conn
            .query_row(
                "SELECT min_channel_size FROM candidates WHERE pubkey = ?1",
                [pubkey],
                |row| row.get(0),
            )
            .optional()?;
        let learned = (floor as i64)
            .max(from_rejections.unwrap_or(0))
            .max(current.flatten().unwrap_or(0));
        if learned > 0 {
            conn.execute(
                "UPDATE candidates SET min_channel_size = ?1 WHERE pubkey = ?2",
                rusqlite::params![learned, pubkey],
            )?;
        }
        Ok(())
    }
}

/// Batch execution audit log.
pub struct HistoryStore<'a> {
    db: &'a Database,
}

impl<'a> HistoryStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn append(&self, history: &OpenHistory) -> anyhow::Result<()> {
        self.db.conn().execute(
            "INSERT INTO open_history (executed_at, plan_json, results_json) \
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                datetime_to_ts(history.date),
                serde_json::to_string(&history.plan)?,
                serde_json::to_string(&history.results)?,
            ],
        )?;
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<Vec<OpenHistory>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT executed_at, plan_json, results_json FROM open_history ORDER BY executed_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (at, plan, results) = row?;
            out.push(OpenHistory {
                date: ts_to_datetime(at),
                plan: serde_json::from_str(&plan).context("bad plan_json")?,
                results: serde_json::from_str(&results).context("bad results_json")?,
            });
        }
        Ok(out)
    }
}

fn datetime_to_ts(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

fn ts_to_datetime(ts: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis((ts * 1000.0) as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
