//! SQLite profile store.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::error::ErrorKind;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::profile::split_interests;
use super::schema::{Users, CREATE_USERS_TABLE};
use super::{Profile, ProfileSink, SinkError};
use crate::event::Payload;

/// Constraint violations can never succeed on retry; everything else might.
fn sink_error(err: sqlx::Error) -> SinkError {
    if let sqlx::Error::Database(db) = &err {
        match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => {
                return SinkError::Validation(db.message().to_string());
            }
            _ => {}
        }
    }
    SinkError::Storage(err.to_string())
}

/// Profiles in the `users` table. One transaction per sink call.
pub struct SqliteProfileStore {
    pool: SqlitePool,
}

impl SqliteProfileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<(), SinkError> {
        sqlx::query(CREATE_USERS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(sink_error)?;
        Ok(())
    }

    pub async fn get(&self, entity_id: i64) -> Result<Option<Profile>, SinkError> {
        let row = sqlx::query(&select_query(entity_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(sink_error)?;

        row.map(|row| profile_from_row(&row)).transpose()
    }

    fn upsert_query(profile: &Profile) -> String {
        let updated_at = chrono::Utc::now().to_rfc3339();

        Query::insert()
            .into_table(Users::Table)
            .columns([
                Users::Id,
                Users::Name,
                Users::Age,
                Users::Gender,
                Users::City,
                Users::Interests,
                Users::Photo,
                Users::PreferredGender,
                Users::PreferredAgeMin,
                Users::PreferredAgeMax,
                Users::PreferredCity,
                Users::UpdatedAt,
            ])
            .values_panic([
                profile.id.into(),
                profile.name.clone().into(),
                profile.age.into(),
                profile.gender.as_str().into(),
                profile.city.clone().into(),
                profile.joined_interests().into(),
                profile.photo.clone().into(),
                profile
                    .preferred_gender
                    .map(|g| g.as_str().to_string())
                    .into(),
                profile.preferred_age_min.into(),
                profile.preferred_age_max.into(),
                profile.preferred_city.clone().into(),
                updated_at.into(),
            ])
            .on_conflict(
                OnConflict::column(Users::Id)
                    .update_columns([
                        Users::Name,
                        Users::Age,
                        Users::Gender,
                        Users::City,
                        Users::Interests,
                        Users::Photo,
                        Users::PreferredGender,
                        Users::PreferredAgeMin,
                        Users::PreferredAgeMax,
                        Users::PreferredCity,
                        Users::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder)
    }
}

fn select_query(entity_id: i64) -> String {
    Query::select()
        .columns([
            Users::Id,
            Users::Name,
            Users::Age,
            Users::Gender,
            Users::City,
            Users::Interests,
            Users::Photo,
            Users::PreferredGender,
            Users::PreferredAgeMin,
            Users::PreferredAgeMax,
            Users::PreferredCity,
        ])
        .from(Users::Table)
        .and_where(Expr::col(Users::Id).eq(entity_id))
        .to_string(SqliteQueryBuilder)
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile, SinkError> {
    let gender: String = row.try_get("gender").map_err(sink_error)?;
    let preferred_gender: Option<String> = row.try_get("preferred_gender").map_err(sink_error)?;
    let interests: String = row.try_get("interests").map_err(sink_error)?;

    Ok(Profile {
        id: row.try_get("id").map_err(sink_error)?,
        name: row.try_get("name").map_err(sink_error)?,
        age: row.try_get("age").map_err(sink_error)?,
        gender: gender.parse()?,
        city: row.try_get("city").map_err(sink_error)?,
        interests: split_interests(&interests),
        photo: row.try_get("photo").map_err(sink_error)?,
        preferred_gender: preferred_gender.map(|g| g.parse()).transpose()?,
        preferred_age_min: row.try_get("preferred_age_min").map_err(sink_error)?,
        preferred_age_max: row.try_get("preferred_age_max").map_err(sink_error)?,
        preferred_city: row.try_get("preferred_city").map_err(sink_error)?,
    })
}

#[async_trait]
impl ProfileSink for SqliteProfileStore {
    async fn create(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError> {
        let profile = Profile::from_payload(entity_id, payload)?;

        let mut tx = self.pool.begin().await.map_err(sink_error)?;
        sqlx::query(&Self::upsert_query(&profile))
            .execute(&mut *tx)
            .await
            .map_err(sink_error)?;
        tx.commit().await.map_err(sink_error)?;

        debug!(entity_id = entity_id, "Stored profile");
        Ok(())
    }

    async fn update(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await.map_err(sink_error)?;

        let row = sqlx::query(&select_query(entity_id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(sink_error)?
            .ok_or(SinkError::NotFound(entity_id))?;
        let updated = profile_from_row(&row)?.merged(payload)?;

        sqlx::query(&Self::upsert_query(&updated))
            .execute(&mut *tx)
            .await
            .map_err(sink_error)?;
        tx.commit().await.map_err(sink_error)?;

        debug!(entity_id = entity_id, "Updated profile");
        Ok(())
    }

    async fn delete(&self, entity_id: i64) -> Result<(), SinkError> {
        let query = Query::delete()
            .from_table(Users::Table)
            .and_where(Expr::col(Users::Id).eq(entity_id))
            .to_string(SqliteQueryBuilder);

        let mut tx = self.pool.begin().await.map_err(sink_error)?;
        let result = sqlx::query(&query)
            .execute(&mut *tx)
            .await
            .map_err(sink_error)?;
        tx.commit().await.map_err(sink_error)?;

        debug!(
            entity_id = entity_id,
            removed = result.rows_affected(),
            "Deleted profile"
        );
        Ok(())
    }
}
