//! Device repository for fleet roster persistence

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// Device liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl DeviceStatus {
    /// Database column representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Busy => "BUSY",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ONLINE" => Self::Online,
            "BUSY" => Self::Busy,
            "ERROR" => Self::Error,
            _ => Self::Offline,
        }
    }
}

/// A registered device
#[derive(Debug, Clone, serde::Serialize)]
pub struct Device {
    pub id: String,
    /// Stable caller-supplied identity, unique across the fleet
    pub uuid: String,
    pub name: String,
    pub status: DeviceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

const DEVICE_COLUMNS: &str =
    "id, uuid, name, status, last_heartbeat, metadata, group_id, created_at, updated_at";

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a device by its stable uuid, creating it on first sight
    ///
    /// An existing device comes back ONLINE with its heartbeat refreshed,
    /// metadata merged key-by-key, and its name preserved unless a new one
    /// is supplied.
    ///
    /// # Errors
    ///
    /// Returns error if the uuid is empty or the database operation fails
    pub fn register(
        &self,
        uuid: &str,
        name: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Device> {
        if uuid.trim().is_empty() {
            return Err(Error::Registration("uuid is required".to_string()));
        }

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.find_by_uuid(uuid)? {
            let mut merged = existing.metadata.clone();
            if let (Some(target), Some(serde_json::Value::Object(incoming))) =
                (merged.as_object_mut(), metadata)
            {
                for (k, v) in incoming {
                    target.insert(k.clone(), v.clone());
                }
            }

            let name = name.unwrap_or(&existing.name);
            conn.execute(
                "UPDATE devices
                 SET status = 'ONLINE', last_heartbeat = ?1, name = ?2,
                     metadata = ?3, updated_at = ?1
                 WHERE id = ?4",
                rusqlite::params![now, name, merged.to_string(), existing.id],
            )?;

            return self
                .find(&existing.id)?
                .ok_or_else(|| Error::NotFound(format!("device {}", existing.id)));
        }

        let id = Uuid::new_v4().to_string();
        let name = name.map_or_else(
            || format!("Device-{}", uuid.chars().take(8).collect::<String>()),
            ToString::to_string,
        );
        let metadata = metadata
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        conn.execute(
            "INSERT INTO devices (id, uuid, name, status, last_heartbeat, metadata,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, 'ONLINE', ?4, ?5, ?4, ?4)",
            rusqlite::params![id, uuid, name, now, metadata.to_string()],
        )?;

        self.find(&id)?
            .ok_or_else(|| Error::NotFound(format!("device {id}")))
    }

    /// Find a device by ID (returns None if not found)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Device>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                [id],
                row_to_device,
            )
            .ok();

        Ok(device)
    }

    /// Find a device by its stable external uuid
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_uuid(&self, uuid: &str) -> Result<Option<Device>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE uuid = ?1"),
                [uuid],
                row_to_device,
            )
            .ok();

        Ok(device)
    }

    /// Refresh a device's heartbeat timestamp
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch_heartbeat(&self, id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE devices SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            [&now, id],
        )?;

        Ok(())
    }

    /// Set a device's status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(&self, id: &str, status: DeviceStatus) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE devices SET status = ?1, updated_at = ?2 WHERE id = ?3",
            [status.as_str(), &now, id],
        )?;

        Ok(())
    }

    /// Mark a device OFFLINE only if its heartbeat still predates the cutoff
    ///
    /// Conditional update in the same style as command transitions: a
    /// device that re-registered or heartbeated since the caller's
    /// staleness query is left alone, and `false` comes back.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn demote_stale(&self, id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE devices SET status = 'OFFLINE', updated_at = ?1
             WHERE id = ?2
               AND status = 'ONLINE'
               AND last_heartbeat IS NOT NULL
               AND last_heartbeat < ?3",
            rusqlite::params![now, id, cutoff.to_rfc3339()],
        )?;

        Ok(changed > 0)
    }

    /// List every device, most recently created first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_all(&self) -> Result<Vec<Device>> {
        self.query_devices(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY created_at DESC"),
            [],
        )
    }

    /// IDs of every ONLINE device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn online_ids(&self) -> Result<Vec<String>> {
        self.query_ids("SELECT id FROM devices WHERE status = 'ONLINE'", [])
    }

    /// IDs of ONLINE devices in the given group
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn online_ids_in_group(&self, group_id: &str) -> Result<Vec<String>> {
        self.query_ids(
            "SELECT id FROM devices WHERE status = 'ONLINE' AND group_id = ?1",
            [group_id],
        )
    }

    /// ONLINE devices whose last heartbeat predates the cutoff
    ///
    /// Devices that have never heartbeated are skipped; they only entered
    /// ONLINE through registration, which stamps a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn stale_online(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        self.query_devices(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices
                 WHERE status = 'ONLINE'
                   AND last_heartbeat IS NOT NULL
                   AND last_heartbeat < ?1"
            ),
            [cutoff.to_rfc3339()],
        )
    }

    fn query_devices<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Device>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(sql)?;
        let devices = stmt
            .query_map(params, row_to_device)?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(devices)
    }

    fn query_ids<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(ids)
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        status: DeviceStatus::parse(&row.get::<_, String>(3)?),
        last_heartbeat: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_datetime(&s)),
        metadata: row
            .get::<_, String>(5)
            .map(|s| serde_json::from_str(&s).unwrap_or_else(|_| serde_json::json!({})))?,
        group_id: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
