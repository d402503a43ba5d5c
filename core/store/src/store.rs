//! SQLite-backed local store.
//!
//! Three record sets live in one database: `readings` (the sync queue and
//! reading history), `devices` and `users` (replace-on-refresh caches).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use meterline_common::{encode_photo, DeviceId, Error, ReadingId, Result, UserIdentity};

use crate::model::{Device, NewReading, Reading, ReadingUpdate, Role, SyncStatus, User};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL,
        device_name TEXT NOT NULL,
        counter_value REAL NOT NULL,
        photo TEXT NOT NULL,
        notes TEXT,
        timestamp TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        server_reading_id INTEGER,
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_readings_device ON readings(device_id);
    CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp);
    CREATE INDEX IF NOT EXISTS idx_readings_status ON readings(sync_status);

    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        location TEXT,
        serial_number TEXT,
        description TEXT,
        last_synced_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_devices_name ON devices(name);

    CREATE TABLE IF NOT EXISTS users (
        telegram_id INTEGER PRIMARY KEY,
        first_name TEXT,
        last_name TEXT,
        username TEXT,
        role TEXT NOT NULL,
        last_synced_at TEXT
    );
"#;

/// Columns added after the first schema; applied with `ALTER TABLE` when missing.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] =
    &[("readings", "attempts", "INTEGER NOT NULL DEFAULT 0")];

const READING_COLUMNS: &str = "id, device_id, device_name, counter_value, photo, notes, \
     timestamp, sync_status, server_reading_id, error_message, attempts";

/// Durable local store.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage_err)?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        migrate(&conn)?;

        info!("Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Store connection lock poisoned".to_string()))
    }

    /// Queue a newly captured reading with status `pending`.
    ///
    /// # Errors
    /// - `Validation` if the payload is malformed; nothing is written
    /// - `Storage` if the insert fails
    pub fn save(&self, reading: &NewReading) -> Result<ReadingId> {
        reading.validate()?;

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO readings
            (device_id, device_name, counter_value, photo, notes, timestamp, sync_status, attempts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
            "#,
            params![
                reading.device_id.get(),
                reading.device_name,
                reading.counter_value,
                encode_photo(&reading.photo),
                reading.notes,
                format_timestamp(&reading.timestamp),
                SyncStatus::Pending.as_str(),
            ],
        )
        .map_err(storage_err)?;

        let id = ReadingId::new(conn.last_insert_rowid());
        debug!("Reading {} queued for device {}", id, reading.device_id);
        Ok(id)
    }

    /// Apply a partial mutation to a reading's sync fields.
    ///
    /// The state machine and the field invariants are enforced here:
    /// `server_reading_id` only on `synced`, `error_message` only on `error`.
    /// Entering `syncing` counts an attempt and clears the previous error.
    ///
    /// # Errors
    /// - `NotFound` if `id` does not exist
    /// - `InvalidTransition` for a status change outside the state machine,
    ///   including any change to a `synced` reading
    /// - `InvalidInput` if the fields contradict the resulting status
    pub fn update(&self, id: ReadingId, update: &ReadingUpdate) -> Result<()> {
        let conn = self.conn()?;

        let current = conn
            .query_row(
                "SELECT sync_status, server_reading_id, error_message FROM readings WHERE id = ?1",
                params![id.get()],
                |row| {
                    Ok((
                        parse_status(row, 0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;

        let Some((current_status, current_server_id, current_message)) = current else {
            return Err(Error::NotFound(format!("Reading {} does not exist", id)));
        };

        let next = update.status.unwrap_or(current_status);
        if current_status.is_terminal()
            || (update.status.is_some() && !current_status.can_transition_to(next))
        {
            return Err(Error::InvalidTransition {
                from: current_status.to_string(),
                to: next.to_string(),
            });
        }

        let server_reading_id = match next {
            SyncStatus::Synced => Some(update.server_reading_id.or(current_server_id).ok_or_else(
                || Error::InvalidInput("A synced reading needs a server reading id".to_string()),
            )?),
            _ if update.server_reading_id.is_some() => {
                return Err(Error::InvalidInput(format!(
                    "Server reading id can only be set on a synced reading, not {}",
                    next
                )));
            }
            _ => None,
        };

        let error_message = match next {
            SyncStatus::Error => Some(
                update
                    .error_message
                    .clone()
                    .or(current_message)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            _ if update.error_message.is_some() => {
                return Err(Error::InvalidInput(format!(
                    "Error message can only be set on a failed reading, not {}",
                    next
                )));
            }
            _ => None,
        };

        let attempt = i64::from(update.status == Some(SyncStatus::Syncing));

        conn.execute(
            r#"
            UPDATE readings
            SET sync_status = ?1, server_reading_id = ?2, error_message = ?3,
                attempts = attempts + ?4
            WHERE id = ?5
            "#,
            params![
                next.as_str(),
                server_reading_id,
                error_message,
                attempt,
                id.get()
            ],
        )
        .map_err(storage_err)?;

        debug!("Reading {}: {} -> {}", id, current_status, next);
        Ok(())
    }

    /// Get a reading by id.
    pub fn get(&self, id: ReadingId) -> Result<Option<Reading>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM readings WHERE id = ?1", READING_COLUMNS),
            params![id.get()],
            reading_from_row,
        )
        .optional()
        .map_err(storage_err)
    }

    /// All readings whose status is in `statuses`, oldest first.
    pub fn query_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<Reading>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM readings WHERE sync_status IN ({}) ORDER BY id",
            READING_COLUMNS,
            placeholders(statuses.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(
                params_from_iter(statuses.iter().map(SyncStatus::as_str)),
                reading_from_row,
            )
            .map_err(storage_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }

    /// Number of readings whose status is in `statuses`.
    pub fn count_by_status(&self, statuses: &[SyncStatus]) -> Result<usize> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM readings WHERE sync_status IN ({})",
            placeholders(statuses.len())
        );
        let count: i64 = conn
            .query_row(
                &sql,
                params_from_iter(statuses.iter().map(SyncStatus::as_str)),
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Reading count per status.
    pub fn status_counts(&self) -> Result<HashMap<SyncStatus, usize>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT sync_status, COUNT(*) FROM readings GROUP BY sync_status")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((parse_status(row, 0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(storage_err)?;
            counts.insert(status, count as usize);
        }
        Ok(counts)
    }

    /// Full reading history, newest capture first.
    pub fn all_readings(&self) -> Result<Vec<Reading>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM readings ORDER BY timestamp DESC, id DESC",
                READING_COLUMNS
            ))
            .map_err(storage_err)?;
        let rows = stmt.query_map([], reading_from_row).map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }

    /// Readings captured for one device, newest first.
    pub fn readings_for_device(&self, device_id: DeviceId) -> Result<Vec<Reading>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM readings WHERE device_id = ?1 ORDER BY timestamp DESC, id DESC",
                READING_COLUMNS
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![device_id.get()], reading_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }

    /// Move readings left in `syncing` by an interrupted pass back to `pending`.
    ///
    /// Must only be called while no sync pass is running.
    pub fn requeue_interrupted(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE readings SET sync_status = ?1 WHERE sync_status = ?2",
                params![SyncStatus::Pending.as_str(), SyncStatus::Syncing.as_str()],
            )
            .map_err(storage_err)?;
        if changed > 0 {
            info!("Requeued {} interrupted readings", changed);
        }
        Ok(changed)
    }

    /// Replace the whole device cache.
    pub fn replace_devices(&self, devices: &[Device]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        tx.execute("DELETE FROM devices", []).map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR REPLACE INTO devices
                    (id, name, location, serial_number, description, last_synced_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                )
                .map_err(storage_err)?;
            for device in devices {
                stmt.execute(params![
                    device.id.get(),
                    device.name,
                    device.location,
                    device.serial_number,
                    device.description,
                    device.last_synced_at.as_ref().map(format_timestamp),
                ])
                .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)?;

        debug!("Device cache replaced with {} devices", devices.len());
        Ok(())
    }

    /// Cached devices ordered by name.
    pub fn devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, name, location, serial_number, description, last_synced_at
                FROM devices ORDER BY name, id
                "#,
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], device_from_row).map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }

    /// Get a cached device.
    pub fn device(&self, id: DeviceId) -> Result<Option<Device>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT id, name, location, serial_number, description, last_synced_at
            FROM devices WHERE id = ?1
            "#,
            params![id.get()],
            device_from_row,
        )
        .optional()
        .map_err(storage_err)
    }

    /// Insert or replace a cached user profile.
    pub fn put_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO users
            (telegram_id, first_name, last_name, username, role, last_synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                user.telegram_id.get(),
                user.first_name,
                user.last_name,
                user.username,
                user.role.as_str(),
                user.last_synced_at.as_ref().map(format_timestamp),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Get a cached user profile.
    pub fn user(&self, telegram_id: UserIdentity) -> Result<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT telegram_id, first_name, last_name, username, role, last_synced_at
            FROM users WHERE telegram_id = ?1
            "#,
            params![telegram_id.get()],
            |row| {
                Ok(User {
                    telegram_id: UserIdentity::new(row.get(0)?)
                        .map_err(|e| conversion_err(0, Type::Integer, e))?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    username: row.get(3)?,
                    role: row
                        .get::<_, String>(4)?
                        .parse::<Role>()
                        .map_err(|e| conversion_err(4, Type::Text, e))?,
                    last_synced_at: parse_optional_timestamp(row, 5)?,
                })
            },
        )
        .optional()
        .map_err(storage_err)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    for (table, column, definition) in ADDITIVE_COLUMNS {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(storage_err)?;
        let exists = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?
            .iter()
            .any(|name| name == column);

        if !exists {
            info!("Adding column {}.{}", table, column);
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        id: ReadingId::new(row.get(0)?),
        device_id: DeviceId::new(row.get(1)?).map_err(|e| conversion_err(1, Type::Integer, e))?,
        device_name: row.get(2)?,
        counter_value: row.get(3)?,
        photo: row.get(4)?,
        notes: row.get(5)?,
        timestamp: parse_timestamp(row, 6)?,
        sync_status: parse_status(row, 7)?,
        server_reading_id: row.get(8)?,
        error_message: row.get(9)?,
        attempts: row.get(10)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: DeviceId::new(row.get(0)?).map_err(|e| conversion_err(0, Type::Integer, e))?,
        name: row.get(1)?,
        location: row.get(2)?,
        serial_number: row.get(3)?,
        description: row.get(4)?,
        last_synced_at: parse_optional_timestamp(row, 5)?,
    })
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<SyncStatus> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

fn parse_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, Type::Text, e)),
        None => Ok(None),
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conversion_err<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterline_common::Photo;

    fn new_reading(device: i64, value: f64) -> NewReading {
        NewReading::new(
            DeviceId::new(device).unwrap(),
            format!("Meter {}", device),
            value,
            Photo::jpeg(vec![0xff, 0xd8, device as u8]),
        )
    }

    #[test]
    fn test_save_and_get() {
        let store = LocalStore::in_memory().unwrap();
        let captured = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();

        let id = store
            .save(&new_reading(4, 1234.5).with_notes("leaking valve").with_timestamp(captured))
            .unwrap();
        let reading = store.get(id).unwrap().unwrap();

        assert_eq!(reading.device_id.get(), 4);
        assert_eq!(reading.device_name, "Meter 4");
        assert_eq!(reading.counter_value, 1234.5);
        assert_eq!(reading.notes.as_deref(), Some("leaking valve"));
        assert_eq!(reading.timestamp, captured);
        assert_eq!(reading.sync_status, SyncStatus::Pending);
        assert!(reading.server_reading_id.is_none());
        assert!(reading.error_message.is_none());
        assert_eq!(reading.attempts, 0);
        assert_eq!(reading.decode_photo().unwrap().bytes(), &[0xff, 0xd8, 4]);
    }

    #[test]
    fn test_ids_are_distinct() {
        let store = LocalStore::in_memory().unwrap();
        let a = store.save(&new_reading(1, 1.0)).unwrap();
        let b = store.save(&new_reading(1, 2.0)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_reading_never_queued() {
        let store = LocalStore::in_memory().unwrap();
        let err = store.save(&new_reading(1, -5.0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.all_readings().unwrap().len(), 0);
    }

    #[test]
    fn test_photo_with_undecodable_mime_rejected() {
        let store = LocalStore::in_memory().unwrap();
        let reading = NewReading::new(
            DeviceId::new(1).unwrap(),
            "Meter 1",
            10.0,
            Photo::new("image/x,y", vec![1, 2, 3]),
        );

        let err = store.save(&reading).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.all_readings().unwrap().len(), 0);

        let png = NewReading::new(
            DeviceId::new(1).unwrap(),
            "Meter 1",
            10.0,
            Photo::new("image/png", vec![1, 2, 3]),
        );
        let id = store.save(&png).unwrap();
        let photo = store.get(id).unwrap().unwrap().decode_photo().unwrap();
        assert_eq!(photo.mime(), "image/png");
    }

    #[test]
    fn test_update_unknown_id() {
        let store = LocalStore::in_memory().unwrap();
        let err = store
            .update(ReadingId::new(99), &ReadingUpdate::syncing())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_update_lifecycle() {
        let store = LocalStore::in_memory().unwrap();
        let id = store.save(&new_reading(1, 10.0)).unwrap();

        store.update(id, &ReadingUpdate::syncing()).unwrap();
        store.update(id, &ReadingUpdate::failed("timeout")).unwrap();
        let failed = store.get(id).unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));

        store.update(id, &ReadingUpdate::syncing()).unwrap();
        let retrying = store.get(id).unwrap().unwrap();
        assert_eq!(retrying.sync_status, SyncStatus::Syncing);
        assert!(retrying.error_message.is_none());
        assert_eq!(retrying.attempts, 2);

        store.update(id, &ReadingUpdate::synced(501)).unwrap();
        let synced = store.get(id).unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.server_reading_id, Some(501));
        assert!(synced.error_message.is_none());
    }

    #[test]
    fn test_synced_is_terminal() {
        let store = LocalStore::in_memory().unwrap();
        let id = store.save(&new_reading(1, 10.0)).unwrap();
        store.update(id, &ReadingUpdate::syncing()).unwrap();
        store.update(id, &ReadingUpdate::synced(7)).unwrap();

        assert!(matches!(
            store.update(id, &ReadingUpdate::syncing()),
            Err(Error::InvalidTransition { .. })
        ));
        let partial = ReadingUpdate {
            server_reading_id: Some(8),
            ..Default::default()
        };
        assert!(store.update(id, &partial).is_err());
        assert_eq!(store.get(id).unwrap().unwrap().server_reading_id, Some(7));
    }

    #[test]
    fn test_pending_cannot_skip_syncing() {
        let store = LocalStore::in_memory().unwrap();
        let id = store.save(&new_reading(1, 10.0)).unwrap();
        assert!(matches!(
            store.update(id, &ReadingUpdate::synced(1)),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_server_id_rejected_outside_synced() {
        let store = LocalStore::in_memory().unwrap();
        let id = store.save(&new_reading(1, 10.0)).unwrap();
        let update = ReadingUpdate {
            status: Some(SyncStatus::Syncing),
            server_reading_id: Some(3),
            error_message: None,
        };
        assert!(matches!(store.update(id, &update), Err(Error::InvalidInput(_))));
        assert_eq!(store.get(id).unwrap().unwrap().sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_query_and_count_by_status() {
        let store = LocalStore::in_memory().unwrap();
        let a = store.save(&new_reading(1, 1.0)).unwrap();
        let b = store.save(&new_reading(2, 2.0)).unwrap();
        let c = store.save(&new_reading(3, 3.0)).unwrap();

        store.update(b, &ReadingUpdate::syncing()).unwrap();
        store.update(b, &ReadingUpdate::failed("boom")).unwrap();
        store.update(c, &ReadingUpdate::syncing()).unwrap();
        store.update(c, &ReadingUpdate::synced(30)).unwrap();

        let eligible = store.query_by_status(&SyncStatus::ELIGIBLE).unwrap();
        let ids: Vec<_> = eligible.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);

        assert_eq!(store.count_by_status(&SyncStatus::ELIGIBLE).unwrap(), 2);
        assert_eq!(store.count_by_status(&[SyncStatus::Synced]).unwrap(), 1);
        assert_eq!(store.count_by_status(&[]).unwrap(), 0);
        assert!(store.query_by_status(&[]).unwrap().is_empty());

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.get(&SyncStatus::Pending), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Error), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Synced), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Syncing), None);
    }

    #[test]
    fn test_history_newest_first() {
        let store = LocalStore::in_memory().unwrap();
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let old = store.save(&new_reading(1, 1.0).with_timestamp(early)).unwrap();
        let new = store.save(&new_reading(2, 2.0).with_timestamp(late)).unwrap();
        store.save(&new_reading(2, 3.0).with_timestamp(early)).unwrap();

        let history = store.all_readings().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, new);
        assert_eq!(history[2].id, old);

        let device_two = store.readings_for_device(DeviceId::new(2).unwrap()).unwrap();
        assert_eq!(device_two.len(), 2);
        assert_eq!(device_two[0].id, new);
    }

    #[test]
    fn test_requeue_interrupted() {
        let store = LocalStore::in_memory().unwrap();
        let id = store.save(&new_reading(1, 1.0)).unwrap();
        store.update(id, &ReadingUpdate::syncing()).unwrap();

        assert_eq!(store.requeue_interrupted().unwrap(), 1);
        assert_eq!(store.get(id).unwrap().unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(store.requeue_interrupted().unwrap(), 0);
    }

    #[test]
    fn test_device_cache_replaced() {
        let store = LocalStore::in_memory().unwrap();
        let device = |id: i64, name: &str| Device {
            id: DeviceId::new(id).unwrap(),
            name: name.to_string(),
            location: None,
            serial_number: Some(format!("SN-{}", id)),
            description: None,
            last_synced_at: Some(Utc::now()),
        };

        store
            .replace_devices(&[device(1, "Boiler"), device(2, "Annex")])
            .unwrap();
        store.replace_devices(&[device(3, "Cellar")]).unwrap();

        let devices = store.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Cellar");
        assert!(store.device(DeviceId::new(1).unwrap()).unwrap().is_none());
        assert_eq!(
            store
                .device(DeviceId::new(3).unwrap())
                .unwrap()
                .unwrap()
                .serial_number
                .as_deref(),
            Some("SN-3")
        );
    }

    #[test]
    fn test_user_cache_last_write_wins() {
        let store = LocalStore::in_memory().unwrap();
        let identity = UserIdentity::new(42).unwrap();
        let mut user = User {
            telegram_id: identity,
            first_name: Some("Anna".to_string()),
            last_name: None,
            username: None,
            role: Role::Employee,
            last_synced_at: None,
        };
        store.put_user(&user).unwrap();
        user.role = Role::Admin;
        store.put_user(&user).unwrap();

        let cached = store.user(identity).unwrap().unwrap();
        assert_eq!(cached.role, Role::Admin);
        assert!(store.user(UserIdentity::new(43).unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meterline.db");

        let id = {
            let store = LocalStore::open(&path).unwrap();
            store.save(&new_reading(5, 55.0)).unwrap()
        };

        let store = LocalStore::open(&path).unwrap();
        let reading = store.get(id).unwrap().unwrap();
        assert_eq!(reading.counter_value, 55.0);
        assert_eq!(reading.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_additive_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute(
                r#"
                INSERT INTO readings
                (device_id, device_name, counter_value, photo, notes, timestamp, sync_status)
                VALUES (1, 'Boiler', 3.0, 'AQID', NULL, '2025-01-01T00:00:00.000Z', 'pending')
                "#,
                [],
            )
            .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let readings = store.query_by_status(&[SyncStatus::Pending]).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].attempts, 0);
        assert_eq!(readings[0].decode_photo().unwrap().bytes(), &[1, 2, 3]);
    }
}
