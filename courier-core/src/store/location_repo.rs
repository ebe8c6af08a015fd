use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{decode_time, decode_uuid, encode_time, StoreResult};
use crate::models::{DriverId, LocationSample};

const SAMPLES: &str = "location_samples";

/// Persistence for buffered GPS samples.
#[derive(Debug, Clone)]
pub struct LocationRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    id: String,
    driver_id: i64,
    latitude: f64,
    longitude: f64,
    accuracy_meters: Option<f64>,
    speed_mps: Option<f64>,
    heading_deg: Option<f64>,
    captured_at: String,
    synced: bool,
}

impl SampleRow {
    fn into_sample(self) -> StoreResult<LocationSample> {
        Ok(LocationSample {
            id: decode_uuid(SAMPLES, &self.id)?,
            driver_id: self.driver_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_meters: self.accuracy_meters,
            speed_mps: self.speed_mps,
            heading_deg: self.heading_deg,
            captured_at: decode_time(SAMPLES, &self.captured_at)?,
            synced: self.synced,
        })
    }
}

impl LocationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, sample: &LocationSample) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO location_samples (id, driver_id, latitude, longitude, accuracy_meters, speed_mps, heading_deg, captured_at, synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.id.to_string())
        .bind(sample.driver_id)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.accuracy_meters)
        .bind(sample.speed_mps)
        .bind(sample.heading_deg)
        .bind(encode_time(&sample.captured_at))
        .bind(sample.synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest unsynced samples in capture order.
    pub async fn unsynced_batch(&self, limit: usize) -> StoreResult<Vec<LocationSample>> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT id, driver_id, latitude, longitude, accuracy_meters, speed_mps, heading_deg, captured_at, synced
            FROM location_samples
            WHERE synced = 0
            ORDER BY captured_at, seq
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SampleRow::into_sample).collect()
    }

    /// Unsynced samples for one driver in capture order.
    pub async fn pending_for_driver(&self, driver_id: DriverId) -> StoreResult<Vec<LocationSample>> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT id, driver_id, latitude, longitude, accuracy_meters, speed_mps, heading_deg, captured_at, synced
            FROM location_samples
            WHERE synced = 0 AND driver_id = ?
            ORDER BY captured_at, seq
            "#,
        )
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SampleRow::into_sample).collect()
    }

    pub async fn mark_synced(&self, ids: &[Uuid]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for id in ids {
            let result = sqlx::query("UPDATE location_samples SET synced = 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn prune_synced(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM location_samples WHERE synced = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn unsynced_count(&self) -> StoreResult<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM location_samples WHERE synced = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    /// Drops the oldest unsynced samples so that at most `keep` remain.
    pub async fn drop_oldest_unsynced(&self, keep: usize) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM location_samples
            WHERE seq IN (
                SELECT seq FROM location_samples
                WHERE synced = 0
                ORDER BY captured_at DESC, seq DESC
                LIMIT -1 OFFSET ?
            )
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops unsynced samples captured before `cutoff`.
    pub async fn drop_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM location_samples WHERE synced = 0 AND captured_at < ?")
                .bind(encode_time(&cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_driver(&self, driver_id: DriverId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM location_samples WHERE driver_id = ?")
            .bind(driver_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM location_samples")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
