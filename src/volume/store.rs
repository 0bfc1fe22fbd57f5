use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The persisted shape of one volume: key is the host path, value is this
/// record serialized as a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: String,
    pub path: String,
    pub backend: String,
    pub ready: bool,
    pub build_time: u64,
    pub change_time: u64,
    pub state: String,
    #[serde(default)]
    pub private: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "_id", default)]
    pub raw_id: String,
    #[serde(rename = "_containers", default)]
    pub containers: Vec<String>,
    #[serde(rename = "_loop_dev", default = "no_loop_dev")]
    pub loop_dev: i32,
    #[serde(rename = "_auto_path", default)]
    pub auto_path: bool,
    #[serde(default)]
    pub target_container: String,
    #[serde(default)]
    pub owner_container: String,
    #[serde(default)]
    pub owner_user: String,
    #[serde(default)]
    pub owner_group: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub storage: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub space_limit: u64,
    #[serde(default)]
    pub inode_limit: u64,
    #[serde(default)]
    pub space_guarantee: u64,
    #[serde(default)]
    pub inode_guarantee: u64,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub place_key: String,
    #[serde(default)]
    pub device_name: String,
}

fn no_loop_dev() -> i32 {
    -1
}

/// One persisted container row for restart recovery.
#[derive(Debug, Clone)]
pub struct ContainerRow {
    pub id: String,
    pub name: String,
    pub state: String,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub start_error: Option<String>,
}

fn timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Sqlite-backed KV store for volumes plus the container state rows. All
/// writes happen after the in-memory update and before any client reply.
pub struct VolumeStore {
    pool: SqlitePool,
}

impl VolumeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                path TEXT PRIMARY KEY,
                record TEXT NOT NULL, -- JSON blob
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT CHECK(state IN ('stopped', 'starting', 'running', 'stopping', 'dead')) NOT NULL,
                pid INTEGER,
                exit_code INTEGER,
                start_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("volume store schema initialized");
        Ok(())
    }

    pub async fn save_volume(&self, record: &VolumeRecord) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO volumes (path, record, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET record = excluded.record,
                                             updated_at = excluded.updated_at",
        )
        .bind(&record.path)
        .bind(&json)
        .bind(timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_volumes(&self) -> StoreResult<Vec<VolumeRecord>> {
        let rows = sqlx::query("SELECT record FROM volumes ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("record");
            match serde_json::from_str(&json) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping unreadable volume record: {}", e),
            }
        }
        Ok(records)
    }

    pub async fn remove_volume(&self, path: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM volumes WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_container(&self, row: &ContainerRow) -> StoreResult<()> {
        let now = timestamp();
        sqlx::query(
            "INSERT INTO containers (id, name, state, pid, exit_code, start_error, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state,
                                           pid = excluded.pid,
                                           exit_code = excluded.exit_code,
                                           start_error = excluded.start_error,
                                           updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.state)
        .bind(row.pid)
        .bind(row.exit_code)
        .bind(&row.start_error)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_containers(&self) -> StoreResult<Vec<ContainerRow>> {
        let rows = sqlx::query(
            "SELECT id, name, state, pid, exit_code, start_error FROM containers ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerRow {
                id: row.get("id"),
                name: row.get("name"),
                state: row.get("state"),
                pid: row.get("pid"),
                exit_code: row.get("exit_code"),
                start_error: row.get("start_error"),
            })
            .collect())
    }

    pub async fn remove_container(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> VolumeStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = VolumeStore::new(pool);
        store.initialize_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn volume_record_round_trip() {
        let store = memory_store().await;
        let mut record = VolumeRecord {
            id: "v-1".to_string(),
            path: "/place/volumes/v-1/volume".to_string(),
            backend: "loop".to_string(),
            state: "ready".to_string(),
            ready: true,
            loop_dev: 3,
            space_limit: 16 << 20,
            ..Default::default()
        };
        record.labels.insert("team".to_string(), "infra".to_string());
        store.save_volume(&record).await.unwrap();

        let loaded = store.load_volumes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, record.path);
        assert_eq!(loaded[0].loop_dev, 3);
        assert_eq!(loaded[0].labels.get("team").unwrap(), "infra");

        store.remove_volume(&record.path).await.unwrap();
        assert!(store.load_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn volume_save_is_upsert() {
        let store = memory_store().await;
        let mut record = VolumeRecord {
            path: "/v".to_string(),
            state: "building".to_string(),
            ..Default::default()
        };
        store.save_volume(&record).await.unwrap();
        record.state = "ready".to_string();
        store.save_volume(&record).await.unwrap();

        let loaded = store.load_volumes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, "ready");
    }

    #[test]
    fn record_keys_match_wire_names() {
        let record = VolumeRecord {
            raw_id: "17".to_string(),
            loop_dev: 5,
            auto_path: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], "17");
        assert_eq!(json["_loop_dev"], 5);
        assert_eq!(json["_auto_path"], true);
        assert!(json.get("space_guarantee").is_some());
        assert!(json.get("place_key").is_some());
    }

    #[tokio::test]
    async fn container_rows_persist() {
        let store = memory_store().await;
        let row = ContainerRow {
            id: "ct-1".to_string(),
            name: "web".to_string(),
            state: "running".to_string(),
            pid: Some(4242),
            exit_code: None,
            start_error: None,
        };
        store.save_container(&row).await.unwrap();

        let mut updated = row.clone();
        updated.state = "dead".to_string();
        updated.exit_code = Some(137);
        store.save_container(&updated).await.unwrap();

        let rows = store.load_containers().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "dead");
        assert_eq!(rows[0].exit_code, Some(137));

        store.remove_container("ct-1").await.unwrap();
        assert!(store.load_containers().await.unwrap().is_empty());
    }
}
