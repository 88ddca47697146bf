use crate::models::{AppSettings, Chat, Theme};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use std::path::Path;
use uuid::Uuid;

// Document keys, one JSON value each
pub const CHATS_KEY: &str = "ai-chat-history";
pub const THEME_KEY: &str = "ai-chat-theme";
pub const SETTINGS_KEY: &str = "ai-chat-settings";

const MIGRATIONS_SQL: &str = "
-- Key-value documents (no schema version: format changes are breaking)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Local store holding the chat list, theme and settings documents.
///
/// Read and write failures never escape the public accessors: they are
/// logged and the caller gets the default value instead.
#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the store file and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Store backed by a private in-memory database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        // A single connection that never expires: every connection would
        // otherwise get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    // --- Raw key-value access ---

    async fn get_item(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read '{}' from storage", key))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write '{}' to storage", key))?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), anyhow::Error> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to remove '{}' from storage", key))?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, anyhow::Error> {
        match self.get_item(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Stored '{}' is not valid JSON", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), anyhow::Error> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize '{}'", key))?;
        self.set_item(key, &raw).await
    }

    // --- Chat list ---

    /// All chats, most recent first. Empty on any read failure.
    pub async fn get_chats(&self) -> Vec<Chat> {
        match self.read_json::<Vec<Chat>>(CHATS_KEY).await {
            Ok(chats) => chats.unwrap_or_default(),
            Err(e) => {
                log::error!("Error reading chats from storage: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn save_chats(&self, chats: &[Chat]) {
        if let Err(e) = self.write_json(CHATS_KEY, chats).await {
            log::error!("Error saving chats to storage: {:#}", e);
        }
    }

    pub async fn get_chat(&self, id: Uuid) -> Option<Chat> {
        self.get_chats().await.into_iter().find(|chat| chat.id == id)
    }

    /// Replaces the chat with the same id in place, or prepends it.
    pub async fn save_chat(&self, chat: &Chat) {
        let mut chats = self.get_chats().await;
        match chats.iter().position(|c| c.id == chat.id) {
            Some(index) => chats[index] = chat.clone(),
            None => chats.insert(0, chat.clone()),
        }
        log::debug!("Saving chat {} ({} chats total)", chat.id, chats.len());
        self.save_chats(&chats).await;
    }

    /// Removes a chat. Unknown ids leave the list untouched.
    pub async fn delete_chat(&self, id: Uuid) {
        let chats = self.get_chats().await;
        let before = chats.len();
        let filtered: Vec<Chat> = chats.into_iter().filter(|chat| chat.id != id).collect();
        if filtered.len() == before {
            log::warn!("Attempted to delete non-existent chat: {}", id);
            return;
        }
        self.save_chats(&filtered).await;
        log::info!("Deleted chat {}", id);
    }

    pub async fn clear_all_chats(&self) {
        if let Err(e) = self.remove_item(CHATS_KEY).await {
            log::error!("Error clearing chats: {:#}", e);
        }
    }

    // --- Theme ---

    // Stored as the bare theme name, not JSON.
    pub async fn get_theme(&self) -> Theme {
        match self.get_item(THEME_KEY).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
                log::warn!("{}; falling back to system theme", e);
                Theme::System
            }),
            Ok(None) => Theme::System,
            Err(e) => {
                log::error!("Error reading theme: {:#}", e);
                Theme::System
            }
        }
    }

    pub async fn save_theme(&self, theme: Theme) {
        if let Err(e) = self.set_item(THEME_KEY, theme.as_str()).await {
            log::error!("Error saving theme: {:#}", e);
        }
    }

    // --- Settings ---

    pub async fn get_settings(&self) -> AppSettings {
        match self.read_json::<AppSettings>(SETTINGS_KEY).await {
            Ok(settings) => settings.unwrap_or_default(),
            Err(e) => {
                log::error!("Error reading settings: {:#}", e);
                AppSettings::default()
            }
        }
    }

    pub async fn save_settings(&self, settings: &AppSettings) {
        if let Err(e) = self.write_json(SETTINGS_KEY, settings).await {
            log::error!("Error saving settings: {:#}", e);
        }
    }
}
