//! Command repository and durable command state machine
//!
//! Every state transition is a conditional UPDATE guarded by the set of
//! legal source states, so concurrent movers (dispatcher workers, the
//! registry recording results, producers cancelling) can never skip a
//! state or move one backward.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::device::parse_datetime;
use super::DbPool;
use crate::{Error, Result};

/// Command delivery shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Single,
    Broadcast,
    Scheduled,
}

impl CommandType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Broadcast => "BROADCAST",
            Self::Scheduled => "SCHEDULED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "BROADCAST" => Self::Broadcast,
            "SCHEDULED" => Self::Scheduled,
            _ => Self::Single,
        }
    }
}

/// What set of devices a command resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Device,
    Group,
    All,
}

impl TargetType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Device => "DEVICE",
            Self::Group => "GROUP",
            Self::All => "ALL",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "GROUP" => Self::Group,
            "ALL" => Self::All,
            _ => Self::Device,
        }
    }
}

/// Command lifecycle status
///
/// Terminal states are `Completed` and `Cancelled`; `Failed` can re-enter
/// the pipeline through [`CommandRepo::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "PENDING" => Self::Pending,
            "PROCESSING" => Self::Processing,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Queued,
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(Error::Protocol(format!("unknown command status: {other}"))),
        }
    }
}

/// A durable command record
#[derive(Debug, Clone, serde::Serialize)]
pub struct Command {
    pub id: String,
    pub kind: CommandType,
    pub target_type: TargetType,
    pub target_device_id: Option<String>,
    pub target_group_id: Option<String>,
    pub command_name: String,
    pub params: serde_json::Value,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a command
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub kind: CommandType,
    pub target_type: TargetType,
    pub target_device_id: Option<String>,
    pub target_group_id: Option<String>,
    pub command_name: String,
    pub params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Command repository
#[derive(Clone)]
pub struct CommandRepo {
    pool: DbPool,
}

const COMMAND_COLUMNS: &str = "id, kind, target_type, target_device_id, target_group_id, \
     command_name, params, status, result, error, scheduled_at, executed_at, \
     retry_count, created_by, created_at, updated_at";

impl CommandRepo {
    /// Create a new command repository
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a command row
    ///
    /// Commands with a `scheduled_at` start PENDING; everything else
    /// starts QUEUED.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, new: &NewCommand) -> Result<Command> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let status = if new.scheduled_at.is_some() {
            CommandStatus::Pending
        } else {
            CommandStatus::Queued
        };

        conn.execute(
            "INSERT INTO commands (id, kind, target_type, target_device_id, target_group_id,
                                   command_name, params, status, scheduled_at, created_by,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            rusqlite::params![
                id,
                new.kind.as_str(),
                new.target_type.as_str(),
                new.target_device_id,
                new.target_group_id,
                new.command_name,
                new.params.to_string(),
                status.as_str(),
                new.scheduled_at.map(|t| t.to_rfc3339()),
                new.created_by,
                now,
            ],
        )?;

        self.find(&id)?
            .ok_or_else(|| Error::NotFound(format!("command {id}")))
    }

    /// Find a command by ID (returns None if not found)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Command>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let command = conn
            .query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"),
                [id],
                row_to_command,
            )
            .ok();

        Ok(command)
    }

    /// List commands, newest first, optionally filtered by status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, status: Option<CommandStatus>, limit: usize) -> Result<Vec<Command>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let sql = status.map_or_else(
            || {
                format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands
                     ORDER BY created_at DESC LIMIT ?1"
                )
            },
            |s| {
                format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands WHERE status = '{}'
                     ORDER BY created_at DESC LIMIT ?1",
                    s.as_str()
                )
            },
        );

        let mut stmt = conn.prepare(&sql)?;
        let commands = stmt
            .query_map([limit], row_to_command)?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(commands)
    }

    /// Claim a command for processing: QUEUED -> PROCESSING
    ///
    /// Returns false when the command was no longer claimable (cancelled
    /// or already taken by another worker).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn claim_processing(&self, id: &str) -> Result<bool> {
        self.transition(id, &["QUEUED"], CommandStatus::Processing, None, None)
    }

    /// Park a scheduled command back to PENDING until its due time
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn park_pending(&self, id: &str) -> Result<bool> {
        self.transition(id, &["PROCESSING"], CommandStatus::Pending, None, None)
    }

    /// Promote a due scheduled command: PENDING -> QUEUED
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn promote_due(&self, id: &str) -> Result<bool> {
        self.transition(id, &["PENDING"], CommandStatus::Queued, None, None)
    }

    /// Mark delivery success: PROCESSING -> COMPLETED with `executed_at`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_completed(&self, id: &str, result: Option<&serde_json::Value>) -> Result<bool> {
        self.transition(
            id,
            &["PROCESSING"],
            CommandStatus::Completed,
            result,
            None,
        )
    }

    /// Mark delivery failure: PROCESSING -> FAILED with error text
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        self.transition(
            id,
            &["PROCESSING"],
            CommandStatus::Failed,
            None,
            Some(error),
        )
    }

    /// Record a device-reported execution result
    ///
    /// Revises the command to COMPLETED (no error) or FAILED (error
    /// present), stamping `executed_at`. The device's word is final, so
    /// this also revises a command the dispatcher already completed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_result(
        &self,
        id: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let status = if error.is_some() {
            CommandStatus::Failed
        } else {
            CommandStatus::Completed
        };
        self.transition(
            id,
            &["PROCESSING", "COMPLETED", "FAILED"],
            status,
            result,
            error,
        )
    }

    /// Cancel a command: PENDING/QUEUED -> CANCELLED
    ///
    /// Anything already PROCESSING or terminal is left untouched and
    /// `false` is returned. Callers must also purge matching queue jobs.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn cancel(&self, id: &str) -> Result<bool> {
        self.transition(
            id,
            &["PENDING", "QUEUED"],
            CommandStatus::Cancelled,
            None,
            None,
        )
    }

    /// Retry a failed command: FAILED -> QUEUED, `retry_count` += 1
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn retry(&self, id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE commands
             SET status = 'QUEUED', retry_count = retry_count + 1,
                 error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'FAILED'",
            [&now, id],
        )?;

        Ok(changed > 0)
    }

    fn transition(
        &self,
        id: &str,
        from: &[&str],
        to: CommandStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let guard = from
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let executed_at = matches!(
            to,
            CommandStatus::Completed | CommandStatus::Failed
        )
        .then(|| now.clone());

        let changed = conn.execute(
            &format!(
                "UPDATE commands
                 SET status = ?1,
                     result = COALESCE(?2, result),
                     error = ?3,
                     executed_at = COALESCE(?4, executed_at),
                     updated_at = ?5
                 WHERE id = ?6 AND status IN ({guard})"
            ),
            rusqlite::params![
                to.as_str(),
                result.map(ToString::to_string),
                error,
                executed_at,
                now,
                id,
            ],
        )?;

        Ok(changed > 0)
    }
}

fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let params: String = row.get(6)?;
    let result: Option<String> = row.get(8)?;

    Ok(Command {
        id: row.get(0)?,
        kind: CommandType::parse(&row.get::<_, String>(1)?),
        target_type: TargetType::parse(&row.get::<_, String>(2)?),
        target_device_id: row.get(3)?,
        target_group_id: row.get(4)?,
        command_name: row.get(5)?,
        params: serde_json::from_str(&params).unwrap_or_else(|_| serde_json::json!({})),
        status: CommandStatus::parse(&row.get::<_, String>(7)?),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(9)?,
        scheduled_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_datetime(&s)),
        executed_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_datetime(&s)),
        retry_count: row.get(12)?,
        created_by: row.get(13)?,
        created_at: parse_datetime(&row.get::<_, String>(14)?),
        updated_at: parse_datetime(&row.get::<_, String>(15)?),
    })
}
