use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Pool;
use sqlx::Postgres;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::instrument;

use crate::models::UserRecord;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
  #[error(transparent)]
  Database(#[from] sqlx::Error),
  #[error(transparent)]
  Migration(#[from] sqlx::migrate::MigrateError),
  #[error("failed to (de)serialize learner record: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Where learner records live. The engine only ever loads a full record and
/// writes it back whole.
#[async_trait]
pub trait UserStore: Send + Sync {
  async fn load(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError>;
  async fn save(&self, record: &UserRecord) -> Result<(), StoreError>;
}

/// Process-lifetime store; records vanish on restart.
#[derive(Default)]
pub struct MemoryStore {
  records: DashMap<i64, UserRecord>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl UserStore for MemoryStore {
  async fn load(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
    Ok(self.records.get(&user_id).map(|entry| entry.value().clone()))
  }

  async fn save(&self, record: &UserRecord) -> Result<(), StoreError> {
    self.records.insert(record.user_id, record.clone());
    Ok(())
  }
}

#[derive(Clone)]
pub struct PgUserStore {
  pool: Pool<Postgres>,
}

impl PgUserStore {
  pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
    let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    Ok(Self { pool })
  }
}

#[async_trait]
impl UserStore for PgUserStore {
  #[instrument(skip(self))]
  async fn load(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
    let raw = sqlx::query_scalar::<_, String>("SELECT record FROM learners WHERE id = $1")
      .bind(user_id)
      .fetch_optional(&self.pool)
      .await?;
    raw
      .map(|raw| serde_json::from_str(&raw))
      .transpose()
      .map_err(StoreError::from)
  }

  #[instrument(skip(self, record), fields(user_id = record.user_id))]
  async fn save(&self, record: &UserRecord) -> Result<(), StoreError> {
    let raw = serde_json::to_string(record)?;
    sqlx::query(
      r#"
      INSERT INTO learners (id, record, updated_at)
      VALUES ($1, $2, NOW())
      ON CONFLICT (id) DO UPDATE SET
        record = EXCLUDED.record,
        updated_at = EXCLUDED.updated_at
      "#,
    )
    .bind(record.user_id)
    .bind(raw)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}
