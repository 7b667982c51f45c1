//! Postgres-backed event datasets + Google Sheets CSV fetch for Konf.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use konf_core::{EntityKind, Event, Exhibitor, Participant, ProgramItem};
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "konf-storage";

/// Embedded schema migrations, applied via `PgStore::run_migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

static SHARE_URL_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://docs\.google\.com/spreadsheets/d/([A-Za-z0-9_-]+)")
        .expect("share url pattern is valid")
});

/// Scheme and host of the Google Sheets CSV export endpoint.
pub const SHEETS_EXPORT_BASE: &str = "https://docs.google.com";

/// The document key of a Google spreadsheet, extracted from an organizer's
/// share URL. Only the key is kept; trailing path segments and fragments
/// (`/edit#gid=0` and friends) are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetKey(String);

impl SheetKey {
    pub fn from_share_url(url: &str) -> Option<Self> {
        SHARE_URL_KEY
            .captures(url.trim())
            .map(|caps| Self(caps[1].to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// CSV export endpoint for one named tab of this spreadsheet, under the
    /// given base (scheme and host).
    pub fn export_url(&self, base: &str, sheet_name: &str) -> String {
        format!(
            "{}/spreadsheets/d/{}/gviz/tq?tqx=out:csv&sheet={}",
            base, self.0, sheet_name
        )
    }
}

impl fmt::Display for SheetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_bytes: u64,
    pub user_agent: Option<String>,
    /// Base of the export endpoint. Tests point this at a local listener.
    pub export_base: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 10 * 1024 * 1024,
            user_agent: None,
            export_base: SHEETS_EXPORT_BASE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body exceeded {max_bytes} bytes for {url}")]
    TooLarge { max_bytes: u64, url: String },
}

/// Fetches one spreadsheet tab as CSV text.
#[async_trait]
pub trait SheetFetch: Send + Sync {
    async fn fetch_sheet(&self, key: &SheetKey, sheet_name: &str) -> Result<String, FetchError>;
}

#[derive(Debug)]
pub struct HttpSheetFetcher {
    client: reqwest::Client,
    max_bytes: u64,
    export_base: String,
}

impl HttpSheetFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
            export_base: config.export_base,
        })
    }
}

#[async_trait]
impl SheetFetch for HttpSheetFetcher {
    async fn fetch_sheet(&self, key: &SheetKey, sheet_name: &str) -> Result<String, FetchError> {
        let url = key.export_url(&self.export_base, sheet_name);
        debug!(key = %key, sheet = sheet_name, "fetching sheet csv");

        let mut resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        if let Some(declared) = resp.content_length() {
            if declared > self.max_bytes {
                return Err(FetchError::TooLarge {
                    max_bytes: self.max_bytes,
                    url,
                });
            }
        }

        // The declared length can be absent or wrong; enforce the cap on the
        // actual stream as well.
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    max_bytes: self.max_bytes,
                    url,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Event lookup plus full-replace persistence of the per-event datasets.
///
/// Each `replace_*` call swaps the named dataset for one event in a single
/// transaction; callers never observe a mix of old and new rows.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn event_by_id(&self, event_id: Uuid) -> Result<Option<Event>, StoreError>;
    async fn is_admin(&self, user_id: Uuid) -> Result<bool, StoreError>;
    async fn replace_program_items(
        &self,
        event_id: Uuid,
        items: &[ProgramItem],
    ) -> Result<usize, StoreError>;
    async fn replace_participants(
        &self,
        event_id: Uuid,
        participants: &[Participant],
    ) -> Result<usize, StoreError>;
    async fn replace_exhibitors(
        &self,
        event_id: Uuid,
        exhibitors: &[Exhibitor],
    ) -> Result<usize, StoreError>;
    async fn touch_last_synced(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        sheets_url: row.try_get("sheets_url")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

#[async_trait]
impl SyncStore for PgStore {
    async fn event_by_id(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, slug, sheets_url, last_synced_at
              FROM events
             WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| event_from_row(&row)).transpose()?)
    }

    async fn is_admin(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT role
              FROM profiles
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let role: String = row.try_get("role")?;
                Ok(role == "admin")
            }
            None => Ok(false),
        }
    }

    async fn replace_program_items(
        &self,
        event_id: Uuid,
        items: &[ProgramItem],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM program_items WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO program_items
                    (event_id, external_id, day, starts_at, ends_at, title, description, location, category)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event_id)
            .bind(&item.external_id)
            .bind(item.day)
            .bind(item.starts_at)
            .bind(item.ends_at)
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.location)
            .bind(&item.category)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(event_id = %event_id, deleted, inserted = items.len(), "replaced program items");
        Ok(items.len())
    }

    async fn replace_participants(
        &self,
        event_id: Uuid,
        participants: &[Participant],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM participants WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for participant in participants {
            sqlx::query(
                r#"
                INSERT INTO participants (event_id, external_id, name, company)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(event_id)
            .bind(&participant.external_id)
            .bind(&participant.name)
            .bind(&participant.company)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(event_id = %event_id, deleted, inserted = participants.len(), "replaced participants");
        Ok(participants.len())
    }

    async fn replace_exhibitors(
        &self,
        event_id: Uuid,
        exhibitors: &[Exhibitor],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM exhibitors WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for exhibitor in exhibitors {
            sqlx::query(
                r#"
                INSERT INTO exhibitors (event_id, external_id, company_name, stand_number)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(event_id)
            .bind(&exhibitor.external_id)
            .bind(&exhibitor.company_name)
            .bind(&exhibitor.stand_number)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(event_id = %event_id, deleted, inserted = exhibitors.len(), "replaced exhibitors");
        Ok(exhibitors.len())
    }

    async fn touch_last_synced(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE events
               SET last_synced_at = $2
             WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory `SyncStore` used by tests and local smoke runs. Supports
/// injecting per-entity replace failures to exercise error paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<Uuid, Event>,
    admins: HashSet<Uuid>,
    program_items: HashMap<Uuid, Vec<ProgramItem>>,
    participants: HashMap<Uuid, Vec<Participant>>,
    exhibitors: HashMap<Uuid, Vec<Exhibitor>>,
    fail_replacing: HashSet<EntityKind>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        self.inner.lock().await.events.insert(event.id, event);
    }

    pub async fn grant_admin(&self, user_id: Uuid) {
        self.inner.lock().await.admins.insert(user_id);
    }

    /// Make every later replace of `kind` fail with `StoreError::Unavailable`.
    pub async fn fail_replacing(&self, kind: EntityKind) {
        self.inner.lock().await.fail_replacing.insert(kind);
    }

    pub async fn program_items(&self, event_id: Uuid) -> Vec<ProgramItem> {
        self.inner
            .lock()
            .await
            .program_items
            .get(&event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn participants(&self, event_id: Uuid) -> Vec<Participant> {
        self.inner
            .lock()
            .await
            .participants
            .get(&event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn exhibitors(&self, event_id: Uuid) -> Vec<Exhibitor> {
        self.inner
            .lock()
            .await
            .exhibitors
            .get(&event_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn event_by_id(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.lock().await.events.get(&event_id).cloned())
    }

    async fn is_admin(&self, user_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.admins.contains(&user_id))
    }

    async fn replace_program_items(
        &self,
        event_id: Uuid,
        items: &[ProgramItem],
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        if state.fail_replacing.contains(&EntityKind::Program) {
            return Err(StoreError::Unavailable("program replace disabled".into()));
        }
        state.program_items.insert(event_id, items.to_vec());
        Ok(items.len())
    }

    async fn replace_participants(
        &self,
        event_id: Uuid,
        participants: &[Participant],
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        if state.fail_replacing.contains(&EntityKind::Participants) {
            return Err(StoreError::Unavailable(
                "participant replace disabled".into(),
            ));
        }
        state.participants.insert(event_id, participants.to_vec());
        Ok(participants.len())
    }

    async fn replace_exhibitors(
        &self,
        event_id: Uuid,
        exhibitors: &[Exhibitor],
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        if state.fail_replacing.contains(&EntityKind::Exhibitors) {
            return Err(StoreError::Unavailable("exhibitor replace disabled".into()));
        }
        state.exhibitors.insert(event_id, exhibitors.to_vec());
        Ok(exhibitors.len())
    }

    async fn touch_last_synced(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(event) = self.inner.lock().await.events.get_mut(&event_id) {
            event.last_synced_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("identity service returned status {0}")]
    HttpStatus(u16),
}

/// Resolves a bearer token to a user id, or `None` when the token is invalid
/// or expired.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<Option<Uuid>, IdentityError>;
}

#[derive(Debug)]
pub struct HttpIdentity {
    client: reqwest::Client,
    user_url: String,
}

#[derive(Debug, Deserialize)]
struct IdentityUser {
    id: Uuid,
}

impl HttpIdentity {
    pub fn new(user_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building identity client")?;
        Ok(Self {
            client,
            user_url: user_url.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentity {
    async fn verify_token(&self, token: &str) -> Result<Option<Uuid>, IdentityError> {
        let resp = self
            .client
            .get(&self.user_url)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            let user: IdentityUser = resp.json().await?;
            return Ok(Some(user.id));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        Err(IdentityError::HttpStatus(status.as_u16()))
    }
}
