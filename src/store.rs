use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{
    ConnectOptions, Connection,
    sqlite::{SqliteConnectOptions, SqliteConnection},
};

use crate::config::TunnelConfig;

const RECENT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RecentConfig {
    pub id: i64,
    pub name: String,
    pub filepath: String,
    pub role: String,
    pub config_json: String,
    pub created_at: String,
    pub last_used: String,
}

/// Settings and recent-configuration store. Every operation opens its own
/// connection; reads fall back to defaults and writes are best-effort, so a
/// broken database never takes the application down.
pub struct Database {
    path: PathBuf,
}

fn now() -> String {
    return Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
}

impl Database {
    pub async fn open(path: PathBuf) -> Database {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let database = Database { path: path };
        if let Err(e) = database.init().await {
            logging!("Store", "Cannot initialize database: {:?}", e);
        }
        return database;
    }

    async fn connect(&self) -> Result<SqliteConnection, sqlx::Error> {
        return SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .connect()
            .await;
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.connect().await?;

        let legacy: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'state'")
                .fetch_optional(&mut conn)
                .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&mut conn)
        .await?;

        if legacy.is_some() {
            logging!("Store", "Migrating legacy state table.");
            let copied =
                sqlx::query("INSERT OR IGNORE INTO settings (key, value) SELECT key, val FROM state")
                    .execute(&mut conn)
                    .await;
            // The old table survives a failed copy so nothing is lost.
            match copied {
                Ok(_) => {
                    let _ = sqlx::query("DROP TABLE state").execute(&mut conn).await;
                }
                Err(e) => logging!("Store", "Cannot migrate legacy state table: {:?}", e),
            }
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS recent_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                filepath TEXT,
                role TEXT,
                config_json TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                last_used TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&mut conn)
        .await?;

        conn.close().await?;
        return Ok(());
    }

    pub async fn set(&self, key: &str, value: &Value) {
        if let Err(e) = self.try_set(key, value).await {
            logging!("Store", "Cannot save setting {}: {:?}", key, e);
        }
    }

    async fn try_set(&self, key: &str, value: &Value) -> Result<(), sqlx::Error> {
        let mut conn = self.connect().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO settings (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&mut conn)
        .await?;
        return Ok(());
    }

    pub async fn get(&self, key: &str, default: Value) -> Value {
        return match self.try_get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                logging!("Store", "Cannot read setting {}: {:?}", key, e);
                default
            }
        };
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, sqlx::Error> {
        let mut conn = self.connect().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut conn)
            .await?;
        return Ok(row.and_then(|(text,)| serde_json::from_str(&text).ok()));
    }

    /// Records a saved configuration. One row per file path; the list is
    /// trimmed to the ten most recently used entries.
    pub async fn add_recent(&self, name: &str, filepath: &Path, config: &TunnelConfig) {
        if let Err(e) = self.try_add_recent(name, filepath, config).await {
            logging!("Store", "Cannot record recent configuration: {:?}", e);
        }
    }

    async fn try_add_recent(
        &self,
        name: &str,
        filepath: &Path,
        config: &TunnelConfig,
    ) -> Result<(), sqlx::Error> {
        let mut conn = self.connect().await?;
        let filepath = filepath.to_string_lossy();
        let stamp = now();

        sqlx::query("DELETE FROM recent_configs WHERE filepath = ?1")
            .bind(filepath.as_ref())
            .execute(&mut conn)
            .await?;

        sqlx::query(
            "INSERT INTO recent_configs (name, filepath, role, config_json, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(name)
        .bind(filepath.as_ref())
        .bind(config.role.as_str())
        .bind(serde_json::to_string(config).unwrap_or_default())
        .bind(&stamp)
        .execute(&mut conn)
        .await?;

        sqlx::query(
            "DELETE FROM recent_configs WHERE id NOT IN (
                SELECT id FROM recent_configs ORDER BY last_used DESC, id DESC LIMIT ?1
            )",
        )
        .bind(RECENT_LIMIT)
        .execute(&mut conn)
        .await?;

        return Ok(());
    }

    /// Most recently used first. Reading never refreshes recency.
    pub async fn recent(&self) -> Vec<RecentConfig> {
        return match self.try_recent().await {
            Ok(rows) => rows,
            Err(e) => {
                logging!("Store", "Cannot list recent configurations: {:?}", e);
                vec![]
            }
        };
    }

    async fn try_recent(&self) -> Result<Vec<RecentConfig>, sqlx::Error> {
        let mut conn = self.connect().await?;
        return sqlx::query_as(
            "SELECT id, name, filepath, role, config_json, created_at, last_used
             FROM recent_configs ORDER BY last_used DESC, id DESC",
        )
        .fetch_all(&mut conn)
        .await;
    }

    /// Bumps `last_used` when an entry is applied back to the form.
    pub async fn touch_recent(&self, filepath: &str) {
        let result = async {
            let mut conn = self.connect().await?;
            sqlx::query("UPDATE recent_configs SET last_used = ?1 WHERE filepath = ?2")
                .bind(now())
                .bind(filepath)
                .execute(&mut conn)
                .await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;

        if let Err(e) = result {
            logging!("Store", "Cannot refresh recent configuration: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, Settings};
    use serde_json::json;

    async fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open(dir.path().join("paqet_gui.db")).await;
        return (dir, database);
    }

    fn sample_config() -> TunnelConfig {
        return config::build(&Settings::default());
    }

    #[rocket::async_test]
    async fn set_then_get_round_trips() {
        let (_dir, database) = open_temp().await;

        database.set("binary_path", &json!("/usr/bin/paqet")).await;
        let value = database.get("binary_path", Value::Null).await;
        assert_eq!(value, json!("/usr/bin/paqet"));
    }

    #[rocket::async_test]
    async fn get_returns_default_for_missing_key() {
        let (_dir, database) = open_temp().await;

        let value = database.get("missing", json!({"fallback": true})).await;
        assert_eq!(value, json!({"fallback": true}));
    }

    #[rocket::async_test]
    async fn set_overwrites_existing_key() {
        let (_dir, database) = open_temp().await;

        database.set("k", &json!(1)).await;
        database.set("k", &json!(2)).await;
        assert_eq!(database.get("k", Value::Null).await, json!(2));
    }

    #[rocket::async_test]
    async fn recent_list_is_capped_at_ten() {
        let (dir, database) = open_temp().await;
        let config = sample_config();

        for i in 0..11 {
            let path = dir.path().join(format!("config-{}.yaml", i));
            database
                .add_recent(&format!("config-{}", i), &path, &config)
                .await;
        }

        let rows = database.recent().await;
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].name, "config-10");
        assert!(rows.iter().all(|row| row.name != "config-0"));
    }

    #[rocket::async_test]
    async fn duplicate_filepath_does_not_grow_the_list() {
        let (dir, database) = open_temp().await;
        let config = sample_config();
        let path = dir.path().join("config.yaml");

        database.add_recent("first", &path, &config).await;
        database
            .add_recent("other", &dir.path().join("other.yaml"), &config)
            .await;
        database.add_recent("again", &path, &config).await;

        let rows = database.recent().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "again");
        assert_eq!(rows[0].role, "client");
    }

    #[rocket::async_test]
    async fn touch_moves_an_entry_to_the_front() {
        let (dir, database) = open_temp().await;
        let config = sample_config();
        let first = dir.path().join("first.yaml");

        database.add_recent("first", &first, &config).await;
        database
            .add_recent("second", &dir.path().join("second.yaml"), &config)
            .await;

        database.touch_recent(&first.to_string_lossy()).await;

        let rows = database.recent().await;
        assert_eq!(rows[0].name, "first");
    }

    #[rocket::async_test]
    async fn listing_does_not_refresh_recency() {
        let (dir, database) = open_temp().await;
        let config = sample_config();

        database
            .add_recent("old", &dir.path().join("old.yaml"), &config)
            .await;
        database
            .add_recent("new", &dir.path().join("new.yaml"), &config)
            .await;

        let _ = database.recent().await;
        let rows = database.recent().await;
        assert_eq!(rows[0].name, "new");
        assert_eq!(rows[1].name, "old");
    }

    #[rocket::async_test]
    async fn legacy_state_table_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paqet_gui.db");

        {
            let mut conn = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .connect()
                .await
                .unwrap();
            sqlx::query("CREATE TABLE state (key TEXT PRIMARY KEY, val TEXT)")
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO state (key, val) VALUES ('theme', '\"dark\"')")
                .execute(&mut conn)
                .await
                .unwrap();
            conn.close().await.unwrap();
        }

        let database = Database::open(path.clone()).await;
        assert_eq!(database.get("theme", Value::Null).await, json!("dark"));

        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .connect()
            .await
            .unwrap();
        let legacy: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'state'")
                .fetch_optional(&mut conn)
                .await
                .unwrap();
        assert!(legacy.is_none());
    }

    #[rocket::async_test]
    async fn open_on_broken_path_still_returns_a_store() {
        let database = Database::open(PathBuf::from("/dev/null/not-a-dir/x.db")).await;
        assert_eq!(database.get("k", json!(0)).await, json!(0));
        database.set("k", &json!(1)).await;
        assert!(database.recent().await.is_empty());
    }
}
