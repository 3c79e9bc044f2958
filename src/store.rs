use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::error::{FleetError, Result};

/// Base schema, applied as migration step 1.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Additive column migrations, applied in order after the base schema.
/// Each entry bumps `PRAGMA user_version` by one; existing rows keep NULL
/// for the new columns.
const MIGRATIONS: &[&str] = &["ALTER TABLE commands ADD COLUMN lease_expires_at TEXT;"];

/// A device with no telemetry for this many seconds is reported offline.
/// The boundary is inclusive: exactly 30 seconds old is still online.
pub const LIVENESS_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// How long a delivered command stays invisible to further polls before
    /// it becomes deliverable again.
    pub command_lease_secs: i64,
    /// Maximum undelivered or unconfirmed commands per device.
    pub max_pending_per_device: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            command_lease_secs: crate::config::DEFAULT_COMMAND_LEASE_SECS as i64,
            max_pending_per_device: crate::config::DEFAULT_MAX_PENDING_PER_DEVICE,
        }
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            command_lease_secs: config.command_lease_secs as i64,
            max_pending_per_device: config.max_pending_per_device,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub org_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Registry read model: one device annotated with liveness computed at the
/// caller's clock.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    pub last_payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Acked,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Acked => "acked",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "acked" => Some(Self::Acked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: i64,
    pub device_id: String,
    #[serde(skip_serializing)]
    pub org_id: i64,
    pub name: String,
    pub args: Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub message: Option<String>,
}

/// SQLite-backed store for organizations, users, devices and commands.
///
/// One table per entity; every read-modify-write sequence runs as a single
/// immediate transaction so concurrent request handlers cannot interleave
/// on the same key.
pub struct Store {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// In-memory store for tests.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "user_version", 1)?;
        }
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let target = index as i64 + 2;
            if version < target {
                conn.execute_batch(migration)?;
                conn.pragma_update(None, "user_version", target)?;
            }
        }
        Ok(())
    }

    // --- organizations ---

    /// Seeds the bootstrap organization when the table is empty. Idempotent.
    pub fn ensure_default_org(&self, name: &str, api_token: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM organizations", [], |row| row.get(0))?;
        if count == 0 {
            tx.execute(
                "INSERT INTO organizations (name, api_token, created_at) VALUES (?1, ?2, ?3)",
                params![name, api_token, fmt_ts(Utc::now())],
            )?;
            info!(org = name, "seeded default organization");
        }
        tx.commit()?;
        Ok(())
    }

    pub fn create_org(&self, name: &str, api_token: &str) -> Result<Organization> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO organizations (name, api_token, created_at) VALUES (?1, ?2, ?3)",
            params![name, api_token, fmt_ts(created_at)],
        )
        .map_err(|err| constraint_to_config(err, &format!("organization '{name}' already exists")))?;
        Ok(Organization {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            api_token: api_token.to_string(),
            created_at,
        })
    }

    /// Replaces the organization's API token in a single UPDATE: there is no
    /// window in which both the old and the new token resolve.
    pub fn rotate_org_token(&self, name: &str, new_token: &str) -> Result<Organization> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE organizations SET api_token = ?1 WHERE name = ?2",
            params![new_token, name],
        )?;
        if changed == 0 {
            return Err(FleetError::OrgNotFound);
        }
        let org = tx.query_row(
            "SELECT id, name, api_token, created_at FROM organizations WHERE name = ?1",
            params![name],
            org_from_row,
        )?;
        tx.commit()?;
        info!(org = name, "rotated organization api token");
        Ok(org)
    }

    /// Exact-match token lookup; no trimming or normalization.
    pub fn org_by_token(&self, api_token: &str) -> Result<Option<Organization>> {
        let conn = self.conn.lock();
        let org = conn
            .query_row(
                "SELECT id, name, api_token, created_at FROM organizations WHERE api_token = ?1",
                params![api_token],
                org_from_row,
            )
            .optional()?;
        Ok(org)
    }

    pub fn org_by_name(&self, name: &str) -> Result<Organization> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, api_token, created_at FROM organizations WHERE name = ?1",
            params![name],
            org_from_row,
        )
        .optional()?
        .ok_or(FleetError::OrgNotFound)
    }

    pub fn list_orgs(&self) -> Result<Vec<Organization>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, api_token, created_at FROM organizations ORDER BY id")?;
        let rows = stmt.query_map([], org_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- users ---

    pub fn create_user(&self, name: &str, org_id: i64) -> Result<User> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO users (name, org_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, org_id, fmt_ts(created_at)],
        )
        .map_err(|err| constraint_to_config(err, &format!("user '{name}' already exists")))?;
        Ok(User {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            org_id,
            created_at,
        })
    }

    pub fn user_by_name(&self, name: &str) -> Result<User> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, org_id, created_at FROM users WHERE name = ?1",
            params![name],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    org_id: row.get(2)?,
                    created_at: ts_column(row, 3)?,
                })
            },
        )
        .optional()?
        .ok_or(FleetError::UserNotFound)
    }

    // --- device registry ---

    /// Full replace-on-conflict ingest. A device owned by a different
    /// organization is rejected; ownership only changes through
    /// [`Store::reassign_device`].
    pub fn upsert_device(
        &self,
        device_id: &str,
        org_id: i64,
        hostname: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owner: Option<i64> = tx
            .query_row(
                "SELECT org_id FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = owner {
            if owner != org_id {
                return Err(FleetError::OwnershipConflict(device_id.to_string()));
            }
        }
        tx.execute(
            "INSERT INTO devices (device_id, org_id, hostname, last_seen, last_payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO UPDATE SET
                 hostname = excluded.hostname,
                 last_seen = excluded.last_seen,
                 last_payload = excluded.last_payload",
            params![
                device_id,
                org_id,
                hostname,
                fmt_ts(now),
                serde_json::to_string(payload)?
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Explicit ownership transfer; the only operation allowed to change a
    /// device's organization.
    pub fn reassign_device(&self, device_id: &str, org_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE devices SET org_id = ?1 WHERE device_id = ?2",
            params![org_id, device_id],
        )?;
        if changed == 0 {
            return Err(FleetError::DeviceNotFound);
        }
        info!(device_id, org_id, "device ownership reassigned");
        Ok(())
    }

    /// All devices owned by the organization, liveness computed against the
    /// caller's `now`. One SELECT, one consistent snapshot.
    pub fn list_devices(&self, org_id: i64, now: DateTime<Utc>) -> Result<Vec<DeviceView>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, hostname, last_seen, last_payload
             FROM devices WHERE org_id = ?1 ORDER BY device_id",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            let last_seen = ts_column(row, 2)?;
            let payload: Option<String> = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                last_seen,
                payload,
            ))
        })?;

        let mut devices = Vec::new();
        for row in rows {
            let (device_id, hostname, last_seen, payload) = row?;
            let last_payload = payload
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|err| FleetError::Serialization(err.to_string()))?;
            devices.push(DeviceView {
                device_id,
                hostname,
                online: now - last_seen <= Duration::seconds(LIVENESS_WINDOW_SECS),
                last_seen,
                last_payload,
            });
        }
        Ok(devices)
    }

    // --- command queue ---

    /// Queues a command for a device. No registry existence check: a command
    /// may target a device that has never reported. Rejects once the device
    /// has `max_pending_per_device` undelivered or unconfirmed commands.
    pub fn enqueue_command(
        &self,
        device_id: &str,
        org_id: i64,
        name: &str,
        args: Value,
        now: DateTime<Utc>,
    ) -> Result<Command> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let backlog: i64 = tx.query_row(
            "SELECT COUNT(*) FROM commands
             WHERE device_id = ?1 AND org_id = ?2 AND status IN ('pending', 'in_progress')",
            params![device_id, org_id],
            |row| row.get(0),
        )?;
        if backlog >= self.options.max_pending_per_device as i64 {
            return Err(FleetError::QueueFull);
        }
        tx.execute(
            "INSERT INTO commands (device_id, org_id, name, args, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                device_id,
                org_id,
                name,
                serde_json::to_string(&args)?,
                fmt_ts(now)
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Command {
            id,
            device_id: device_id.to_string(),
            org_id,
            name: name.to_string(),
            args,
            status: CommandStatus::Pending,
            created_at: now,
            lease_expires_at: None,
            acked_at: None,
            success: None,
            message: None,
        })
    }

    /// Returns the lowest-id deliverable command for the exact (device,
    /// organization) pair and leases it in the same transaction: the command
    /// moves to `in_progress` and stays invisible to further polls until the
    /// lease expires or it is acknowledged. Deliverable means `pending` or
    /// `in_progress` with an expired lease, so delivery is at-least-once and
    /// execution must be idempotent.
    pub fn next_command(
        &self,
        device_id: &str,
        org_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Command>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let found = tx
            .query_row(
                "SELECT id, device_id, org_id, name, args, status, created_at,
                        lease_expires_at, acked_at, success, message
                 FROM commands
                 WHERE device_id = ?1 AND org_id = ?2
                   AND (status = 'pending'
                        OR (status = 'in_progress' AND lease_expires_at <= ?3))
                 ORDER BY id LIMIT 1",
                params![device_id, org_id, fmt_ts(now)],
                command_from_row,
            )
            .optional()?;

        let Some(mut command) = found else {
            return Ok(None);
        };

        let lease_expires_at = now + Duration::seconds(self.options.command_lease_secs);
        tx.execute(
            "UPDATE commands SET status = 'in_progress', lease_expires_at = ?1 WHERE id = ?2",
            params![fmt_ts(lease_expires_at), command.id],
        )?;
        tx.commit()?;

        command.status = CommandStatus::InProgress;
        command.lease_expires_at = Some(lease_expires_at);
        Ok(Some(command))
    }

    /// Terminal transition to `acked`, recording the result. Only a command
    /// matching id, device and organization exactly is visible; anything else
    /// is `CommandNotFound`. Re-acking an acked command overwrites the prior
    /// result rather than erroring.
    pub fn ack_command(
        &self,
        command_id: i64,
        device_id: &str,
        org_id: i64,
        success: bool,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Command> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let found = tx
            .query_row(
                "SELECT id, device_id, org_id, name, args, status, created_at,
                        lease_expires_at, acked_at, success, message
                 FROM commands
                 WHERE id = ?1 AND device_id = ?2 AND org_id = ?3",
                params![command_id, device_id, org_id],
                command_from_row,
            )
            .optional()?;

        let Some(mut command) = found else {
            return Err(FleetError::CommandNotFound);
        };

        tx.execute(
            "UPDATE commands
             SET status = 'acked', acked_at = ?1, success = ?2, message = ?3,
                 lease_expires_at = NULL
             WHERE id = ?4",
            params![fmt_ts(now), success, message, command_id],
        )?;
        tx.commit()?;

        command.status = CommandStatus::Acked;
        command.acked_at = Some(now);
        command.lease_expires_at = None;
        command.success = Some(success);
        command.message = message.map(str::to_string);
        Ok(command)
    }

    pub fn list_commands(&self, device_id: &str, org_id: i64) -> Result<Vec<Command>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, org_id, name, args, status, created_at,
                    lease_expires_at, acked_at, success, message
             FROM commands WHERE device_id = ?1 AND org_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![device_id, org_id], command_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Fixed-width UTC timestamps so lexicographic comparison inside SQL matches
/// chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
            })
    })
    .transpose()
}

fn org_from_row(row: &Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        api_token: row.get(2)?,
        created_at: ts_column(row, 3)?,
    })
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<Command> {
    let args_raw: String = row.get(4)?;
    let args = serde_json::from_str(&args_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(err))
    })?;
    let status_raw: String = row.get(5)?;
    let status = CommandStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown command status '{status_raw}'").into(),
        )
    })?;
    Ok(Command {
        id: row.get(0)?,
        device_id: row.get(1)?,
        org_id: row.get(2)?,
        name: row.get(3)?,
        args,
        status,
        created_at: ts_column(row, 6)?,
        lease_expires_at: opt_ts_column(row, 7)?,
        acked_at: opt_ts_column(row, 8)?,
        success: row.get(9)?,
        message: row.get(10)?,
    })
}

fn constraint_to_config(err: rusqlite::Error, message: &str) -> FleetError {
    match err {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation =>
        {
            FleetError::Config(message.to_string())
        }
        other => FleetError::Storage(other),
    }
}
