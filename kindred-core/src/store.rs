//! SQLite persistence for relationship state, scheduled events and the
//! activity log.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS relationships (
//!     user_id    TEXT NOT NULL,
//!     persona_id TEXT NOT NULL,
//!     data       BLOB NOT NULL,
//!     version    INTEGER NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     PRIMARY KEY (user_id, persona_id)
//! );
//! ```
//!
//! The relationship record is JSON inside a BLOB column, which keeps the
//! schema stable as the record grows (forward-compatible). The `version`
//! column is the compare-and-set guard: every write must name the version
//! it read, so concurrent deltas for one key serialize instead of
//! last-writer-wins. Scheduled events get real columns because due-ness
//! queries and the delivery compare-and-set run against them. WAL mode is
//! on for concurrent reads.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Transaction};
use tracing::{debug, info, warn};

use crate::activity::ActivityEntry;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::relationship::{FlagMutations, RelationshipState};
use crate::scheduler::{EventStatus, ScheduledEvent};
use crate::types::{EpisodeId, EventId, PersonaId, RuleId, UserId};

/// Handle to the engine's SQLite database.
///
/// All operations are bounded synchronous reads/writes; there is no
/// background thread. The connection sits behind a mutex so the store can
/// be shared across request handlers.
pub struct EngineStore {
    conn: Mutex<Connection>,
    config: EngineConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for EngineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS relationships (
            user_id    TEXT NOT NULL,
            persona_id TEXT NOT NULL,
            data       BLOB NOT NULL,
            version    INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, persona_id)
        );
        CREATE TABLE IF NOT EXISTS scheduled_events (
            event_id      TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            persona_id    TEXT NOT NULL,
            event_type    TEXT NOT NULL,
            scheduled_for INTEGER NOT NULL,
            payload       TEXT NOT NULL,
            status        TEXT NOT NULL,
            rule_id       TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_due
            ON scheduled_events (user_id, status, scheduled_for);
        CREATE TABLE IF NOT EXISTS activity_log (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL,
            persona_id TEXT NOT NULL,
            kind       TEXT NOT NULL,
            data       TEXT NOT NULL,
            at         INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_recent
            ON activity_log (user_id, persona_id, at);
        CREATE TABLE IF NOT EXISTS applied_deltas (
            idempotency_key TEXT PRIMARY KEY,
            applied_at      TEXT NOT NULL
        );",
    )?;
    Ok(())
}

impl EngineStore {
    /// Open (or create) the database at `path`. The schema is created if
    /// absent and WAL mode enabled per `config.persistence`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &EngineConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.persistence.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            config.persistence.busy_timeout_ms
        ))?;

        init_schema(&conn)?;

        info!(
            path = %db_path.display(),
            wal = config.persistence.wal_mode,
            "Engine store opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Path to the database file (or `:memory:`).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ------------------------------------------------------------------
    // Relationship state
    // ------------------------------------------------------------------

    /// Pure read of a relationship record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StateNotFound`] when no record exists; use
    /// [`EngineStore::state_or_default`] for the self-healing variant.
    pub fn state(&self, user: UserId, persona: PersonaId) -> Result<RelationshipState> {
        let conn = self.conn.lock();
        read_state(&conn, user, persona)?
            .ok_or(EngineError::StateNotFound { user, persona })
    }

    /// Read a relationship record, creating the default (affection 0,
    /// stranger, seed episode unlocked) when absent. This is an upsert,
    /// not a read failure.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn state_or_default(&self, user: UserId, persona: PersonaId) -> Result<RelationshipState> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let state = load_or_seed(&tx, user, persona, &self.config)?;
        tx.commit()?;
        Ok(state)
    }

    /// Atomic read-modify-write of a relationship record under the version
    /// compare-and-set, with bounded retry and backoff. Creates the default
    /// record first when absent.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error (no write happens in that case), or
    /// [`EngineError::Busy`] when retries are exhausted.
    pub(crate) fn mutate<F>(
        &self,
        user: UserId,
        persona: PersonaId,
        operation: &'static str,
        f: F,
    ) -> Result<RelationshipState>
    where
        F: Fn(&mut RelationshipState) -> Result<()>,
    {
        self.mutate_inner(user, persona, operation, None, f)
    }

    fn mutate_inner<F>(
        &self,
        user: UserId,
        persona: PersonaId,
        operation: &'static str,
        idempotency_key: Option<&str>,
        f: F,
    ) -> Result<RelationshipState>
    where
        F: Fn(&mut RelationshipState) -> Result<()>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            let outcome = {
                let mut conn = self.conn.lock();
                let tx = conn.transaction()?;

                if let Some(key) = idempotency_key {
                    if delta_already_applied(&tx, key)? {
                        let state = load_or_seed(&tx, user, persona, &self.config)?;
                        tx.commit()?;
                        debug!(%user, %persona, key, "Delta already applied, returning current state");
                        return Ok(state);
                    }
                }

                let mut state = load_or_seed(&tx, user, persona, &self.config)?;
                let read_version = state.version;
                f(&mut state)?;
                state.version = read_version + 1;

                let json = serde_json::to_vec(&state)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?;
                let rows = tx.execute(
                    "UPDATE relationships
                     SET data = ?1, version = ?2, updated_at = ?3
                     WHERE user_id = ?4 AND persona_id = ?5 AND version = ?6",
                    params![
                        json,
                        state.version,
                        Utc::now().to_rfc3339(),
                        user.to_string(),
                        persona.to_string(),
                        read_version
                    ],
                )?;

                if rows == 1 {
                    if let Some(key) = idempotency_key {
                        tx.execute(
                            "INSERT INTO applied_deltas (idempotency_key, applied_at)
                             VALUES (?1, ?2)",
                            params![key, Utc::now().to_rfc3339()],
                        )?;
                    }
                    tx.commit()?;
                    Some(state)
                } else {
                    None
                }
            };

            match outcome {
                Some(state) => {
                    debug!(
                        %user,
                        %persona,
                        operation,
                        version = state.version,
                        elapsed_us = start.elapsed().as_micros() as u64,
                        "Relationship state written"
                    );
                    return Ok(state);
                }
                None => {
                    attempt += 1;
                    if attempt > self.config.delivery.max_retries {
                        warn!(%user, %persona, operation, attempt, "State write lost the race, giving up");
                        return Err(EngineError::Busy { operation });
                    }
                    std::thread::sleep(Duration::from_millis(
                        self.config.delivery.retry_backoff_ms,
                    ));
                }
            }
        }
    }

    /// Apply an affection delta and flag mutations atomically.
    ///
    /// The delta clamps at 0 at this step, not on some final sum; stage is
    /// re-derived. An optional idempotency key makes caller retries safe:
    /// a key seen before returns the current state without reapplying.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] when the compare-and-set retries are
    /// exhausted.
    pub fn apply_delta(
        &self,
        user: UserId,
        persona: PersonaId,
        delta: i32,
        mutations: &FlagMutations,
        idempotency_key: Option<&str>,
    ) -> Result<RelationshipState> {
        let ladder = self.config.stages.clone();
        self.mutate_inner(user, persona, "apply_delta", idempotency_key, move |state| {
            state.apply_affection(delta, &ladder);
            state.merge_flags(mutations);
            Ok(())
        })
    }

    /// Add an episode to the unlocked set. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] when retries are exhausted.
    pub fn unlock_episode(
        &self,
        user: UserId,
        persona: PersonaId,
        episode: &EpisodeId,
    ) -> Result<RelationshipState> {
        let episode = episode.clone();
        self.mutate(user, persona, "unlock_episode", move |state| {
            state.unlock(episode.clone());
            Ok(())
        })
    }

    /// Stamp `last_interaction_at`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] when retries are exhausted.
    pub fn touch(&self, user: UserId, persona: PersonaId, at: DateTime<Utc>) -> Result<()> {
        self.mutate(user, persona, "touch", move |state| {
            state.last_interaction_at = at;
            Ok(())
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduled events
    // ------------------------------------------------------------------

    /// Persist a freshly created event (normally in `Pending`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn insert_event(&self, event: &ScheduledEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scheduled_events
                 (event_id, user_id, persona_id, event_type, scheduled_for,
                  payload, status, rule_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id.to_string(),
                event.user.to_string(),
                event.persona.to_string(),
                event.event_type,
                event.scheduled_for.timestamp_millis(),
                payload,
                event.status.as_str(),
                event.trigger_rule.as_ref().map(|r| r.0.clone()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(
            event = %event.id,
            user = %event.user,
            event_type = %event.event_type,
            scheduled_for = %event.scheduled_for,
            "Scheduled event persisted"
        );
        Ok(())
    }

    /// Load one event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownEvent`] when absent.
    pub fn event(&self, id: EventId) -> Result<ScheduledEvent> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, user_id, persona_id, event_type, scheduled_for,
                    payload, status, rule_id
             FROM scheduled_events WHERE event_id = ?1",
        )?;
        stmt.query_row(params![id.to_string()], row_to_event)
            .optional()?
            .ok_or(EngineError::UnknownEvent(id))?
    }

    /// Events due at `now` for a user: `scheduled_for <= now` and still
    /// pending, earliest due time first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn list_due(&self, user: UserId, now: DateTime<Utc>) -> Result<Vec<ScheduledEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, user_id, persona_id, event_type, scheduled_for,
                    payload, status, rule_id
             FROM scheduled_events
             WHERE user_id = ?1 AND status = 'pending' AND scheduled_for <= ?2
             ORDER BY scheduled_for ASC",
        )?;
        let rows = stmt.query_map(
            params![user.to_string(), now.timestamp_millis()],
            row_to_event,
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    /// Deliver an event: the `pending -> delivered` transition happens via
    /// a conditional update, so two concurrent calls produce exactly one
    /// success. Returns the renderer payload on the winning call.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyDelivered`] when the event already
    /// reached a terminal state (delivered or cancelled), or
    /// [`EngineError::UnknownEvent`] when it never existed.
    pub fn mark_delivered(&self, id: EventId) -> Result<serde_json::Value> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE scheduled_events SET status = 'delivered'
             WHERE event_id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        if rows == 1 {
            let payload: String = conn.query_row(
                "SELECT payload FROM scheduled_events WHERE event_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            debug!(event = %id, "Event delivered");
            return serde_json::from_str(&payload)
                .map_err(|e| EngineError::Serialization(e.to_string()));
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM scheduled_events WHERE event_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(_) => Err(EngineError::AlreadyDelivered(id)),
            None => Err(EngineError::UnknownEvent(id)),
        }
    }

    /// Cancel a pending event. Returns `true` if this call performed the
    /// transition; delivered events are not revocable and yield `false`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownEvent`] when the event never existed.
    pub fn cancel(&self, id: EventId) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE scheduled_events SET status = 'cancelled'
             WHERE event_id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        if rows == 1 {
            debug!(event = %id, "Event cancelled");
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM scheduled_events WHERE event_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            Ok(false)
        } else {
            Err(EngineError::UnknownEvent(id))
        }
    }

    /// Cancel every pending event of a given type for (user, persona).
    /// Used when a started scenario supersedes outstanding invitations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn cancel_pending_for(
        &self,
        user: UserId,
        persona: PersonaId,
        event_type: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE scheduled_events SET status = 'cancelled'
             WHERE user_id = ?1 AND persona_id = ?2
               AND event_type = ?3 AND status = 'pending'",
            params![user.to_string(), persona.to_string(), event_type],
        )?;
        if rows > 0 {
            debug!(%user, %persona, event_type, cancelled = rows, "Superseded pending events");
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    /// Append one entry to the activity log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn record_activity(&self, entry: &ActivityEntry) -> Result<()> {
        let data = serde_json::to_string(&entry.data)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO activity_log (user_id, persona_id, kind, data, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.user.to_string(),
                entry.persona.to_string(),
                entry.kind,
                data,
                entry.at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Entries for (user, persona) at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on SQLite failures.
    pub fn recent_activity(
        &self,
        user: UserId,
        persona: PersonaId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, persona_id, kind, data, at
             FROM activity_log
             WHERE user_id = ?1 AND persona_id = ?2 AND at >= ?3
             ORDER BY at ASC",
        )?;
        let rows = stmt.query_map(
            params![
                user.to_string(),
                persona.to_string(),
                since.timestamp_millis()
            ],
            |row| {
                let user_s: String = row.get(0)?;
                let persona_s: String = row.get(1)?;
                let kind: String = row.get(2)?;
                let data: String = row.get(3)?;
                let at_ms: i64 = row.get(4)?;
                Ok((user_s, persona_s, kind, data, at_ms))
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            let (user_s, persona_s, kind, data, at_ms) = row?;
            entries.push(ActivityEntry {
                user: parse_user(&user_s)?,
                persona: parse_persona(&persona_s)?,
                kind,
                data: serde_json::from_str(&data)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?,
                at: millis_to_datetime(at_ms)?,
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn read_state(
    conn: &Connection,
    user: UserId,
    persona: PersonaId,
) -> Result<Option<RelationshipState>> {
    let mut stmt = conn.prepare_cached(
        "SELECT data, version FROM relationships WHERE user_id = ?1 AND persona_id = ?2",
    )?;
    let row: Option<(Vec<u8>, u64)> = stmt
        .query_row(params![user.to_string(), persona.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;
    let Some((data, version)) = row else {
        return Ok(None);
    };
    let mut state: RelationshipState = serde_json::from_slice(&data)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    // Column is authoritative for concurrency control.
    state.version = version;
    Ok(Some(state))
}

fn load_or_seed(
    tx: &Transaction<'_>,
    user: UserId,
    persona: PersonaId,
    config: &EngineConfig,
) -> Result<RelationshipState> {
    if let Some(state) = read_state(tx, user, persona)? {
        return Ok(state);
    }
    let seed = EpisodeId::new(config.onboarding.seed_episode.clone());
    let state = RelationshipState::fresh(user, persona, seed, Utc::now());
    let json =
        serde_json::to_vec(&state).map_err(|e| EngineError::Serialization(e.to_string()))?;
    tx.execute(
        "INSERT INTO relationships (user_id, persona_id, data, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user.to_string(),
            persona.to_string(),
            json,
            state.version,
            Utc::now().to_rfc3339()
        ],
    )?;
    debug!(%user, %persona, "Seeded fresh relationship state");
    Ok(state)
}

fn delta_already_applied(tx: &Transaction<'_>, key: &str) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM applied_deltas WHERE idempotency_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ScheduledEvent>> {
    let id_s: String = row.get(0)?;
    let user_s: String = row.get(1)?;
    let persona_s: String = row.get(2)?;
    let event_type: String = row.get(3)?;
    let scheduled_ms: i64 = row.get(4)?;
    let payload: String = row.get(5)?;
    let status_s: String = row.get(6)?;
    let rule_s: Option<String> = row.get(7)?;

    Ok((|| {
        Ok(ScheduledEvent {
            id: EventId(parse_uuid(&id_s)?),
            user: parse_user(&user_s)?,
            persona: parse_persona(&persona_s)?,
            event_type,
            scheduled_for: millis_to_datetime(scheduled_ms)?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| EngineError::Serialization(e.to_string()))?,
            status: EventStatus::parse(&status_s).ok_or_else(|| {
                EngineError::Serialization(format!("bad event status: {status_s}"))
            })?,
            trigger_rule: rule_s.map(RuleId),
        })
    })())
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| EngineError::Serialization(e.to_string()))
}

fn parse_user(s: &str) -> Result<UserId> {
    Ok(UserId(parse_uuid(s)?))
}

fn parse_persona(s: &str) -> Result<PersonaId> {
    Ok(PersonaId(parse_uuid(s)?))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::Serialization(format!("bad timestamp: {ms}")))
}

/// Extension trait that adds an `.optional()` combinator to `rusqlite::Result`.
///
/// Converts `Err(QueryReturnedNoRows)` into `Ok(None)`.
trait OptionalExt<T> {
    /// Convert `QueryReturnedNoRows` into `Ok(None)`.
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
