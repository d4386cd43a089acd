use chrono::Utc;
use rusqlite::Row;
use tracing::instrument;

use drover_core::machine::{MachineId, MachineRecord, SystemInfo};

use crate::database::Database;
use crate::error::StoreError;

/// Repository for known machines.
pub struct MachineRepo {
    db: Database,
}

impl MachineRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or refresh a machine record. Registration is idempotent: the
    /// machine id is derived from stable host identity, so reconnects hit
    /// the same row.
    #[instrument(skip(self, info), fields(machine_id = %machine_id))]
    pub fn upsert(&self, machine_id: &MachineId, info: &SystemInfo) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let hostname = if info.hostname.is_empty() {
            machine_id.hostname().unwrap_or("unknown").to_owned()
        } else {
            info.hostname.clone()
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO machines (machine_id, hostname, os, arch, last_seen, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(machine_id) DO UPDATE SET
                     hostname = excluded.hostname,
                     last_seen = excluded.last_seen,
                     is_active = 1",
                rusqlite::params![machine_id.as_str(), hostname, info.os, info.arch, now],
            )?;
            Ok(())
        })
    }

    /// Refresh the liveness timestamp (heartbeat).
    pub fn touch(&self, machine_id: &MachineId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE machines SET last_seen = ?1, is_active = 1 WHERE machine_id = ?2",
                rusqlite::params![now, machine_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Overwrite the announced system facts.
    #[instrument(skip(self, info), fields(machine_id = %machine_id))]
    pub fn update_system_info(
        &self,
        machine_id: &MachineId,
        info: &SystemInfo,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE machines SET os = ?1, arch = ?2, hostname = ?3, last_seen = ?4
                 WHERE machine_id = ?5",
                rusqlite::params![info.os, info.arch, info.hostname, now, machine_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Flip the active flag (set false on disconnect).
    pub fn set_active(&self, machine_id: &MachineId, active: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE machines SET is_active = ?1 WHERE machine_id = ?2",
                rusqlite::params![active as i64, machine_id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub fn get(&self, machine_id: &MachineId) -> Result<MachineRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT machine_id, hostname, os, arch, last_seen, is_active
                 FROM machines WHERE machine_id = ?1",
            )?;
            let mut rows = stmt.query([machine_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_machine(row),
                None => Err(StoreError::NotFound(format!("machine {machine_id}"))),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<MachineRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT machine_id, hostname, os, arch, last_seen, is_active
                 FROM machines ORDER BY machine_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_machine(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_machine(row: &Row<'_>) -> Result<MachineRecord, StoreError> {
    Ok(MachineRecord {
        machine_id: MachineId::from_raw(row.get::<_, String>(0)?),
        hostname: row.get(1)?,
        os: row.get(2)?,
        arch: row.get(3)?,
        last_seen: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(os: &str, arch: &str, hostname: &str) -> SystemInfo {
        SystemInfo {
            os: os.into(),
            arch: arch.into(),
            hostname: hostname.into(),
        }
    }

    #[test]
    fn upsert_creates_then_refreshes() {
        let db = Database::in_memory().unwrap();
        let repo = MachineRepo::new(db);
        let id = MachineId::from_raw("aabb_box_12ab34cd");

        repo.upsert(&id, &info("Linux", "x86_64", "box")).unwrap();
        let first = repo.get(&id).unwrap();
        assert_eq!(first.hostname, "box");
        assert!(first.is_active);

        // Second upsert hits the same row
        repo.upsert(&id, &info("Linux", "x86_64", "box")).unwrap();
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn upsert_falls_back_to_id_hostname() {
        let db = Database::in_memory().unwrap();
        let repo = MachineRepo::new(db);
        let id = MachineId::from_raw("aabb_workhorse_12ab34cd");

        repo.upsert(&id, &SystemInfo::default()).unwrap();
        assert_eq!(repo.get(&id).unwrap().hostname, "workhorse");
    }

    #[test]
    fn touch_updates_last_seen() {
        let db = Database::in_memory().unwrap();
        let repo = MachineRepo::new(db);
        let id = MachineId::from_raw("aabb_box_12ab34cd");
        repo.upsert(&id, &SystemInfo::default()).unwrap();
        repo.set_active(&id, false).unwrap();
        assert!(!repo.get(&id).unwrap().is_active);

        repo.touch(&id).unwrap();
        assert!(repo.get(&id).unwrap().is_active);
    }

    #[test]
    fn update_system_info_overwrites() {
        let db = Database::in_memory().unwrap();
        let repo = MachineRepo::new(db);
        let id = MachineId::from_raw("aabb_box_12ab34cd");
        repo.upsert(&id, &SystemInfo::default()).unwrap();

        repo.update_system_info(&id, &info("Linux", "aarch64", "renamed"))
            .unwrap();
        let rec = repo.get(&id).unwrap();
        assert_eq!(rec.arch, "aarch64");
        assert_eq!(rec.hostname, "renamed");
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = Database::in_memory().unwrap();
        let repo = MachineRepo::new(db);
        let err = repo.get(&MachineId::from_raw("zz_none_00000000")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
