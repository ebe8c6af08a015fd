use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{decode_optional_time, decode_time, decode_uuid, encode_time, StoreResult};
use crate::models::{ActionPayload, DeadLetter, OrderId, PendingAction};

const ACTIONS: &str = "pending_actions";
const DEAD_LETTERS: &str = "dead_letters";
const SNAPSHOTS: &str = "order_snapshots";

/// Persistence for pending actions, dead letters and order snapshots.
#[derive(Debug, Clone)]
pub struct ActionRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: String,
    order_id: i64,
    payload: String,
    created_at: String,
    server_snapshot_updated_at: Option<String>,
    retry_count: i64,
    last_retry_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    order_id: i64,
    payload: String,
    created_at: String,
    retry_count: i64,
    failed_at: String,
    reason: String,
}

impl ActionRow {
    fn into_action(self) -> StoreResult<PendingAction> {
        let payload: ActionPayload = serde_json::from_str(&self.payload)?;
        Ok(PendingAction {
            id: decode_uuid(ACTIONS, &self.id)?,
            order_id: self.order_id,
            payload,
            created_at: decode_time(ACTIONS, &self.created_at)?,
            server_snapshot_updated_at: decode_optional_time(
                ACTIONS,
                self.server_snapshot_updated_at.as_deref(),
            )?,
            retry_count: self.retry_count.max(0) as u32,
            last_retry_at: decode_optional_time(ACTIONS, self.last_retry_at.as_deref())?,
        })
    }
}

impl DeadLetterRow {
    fn into_dead_letter(self) -> StoreResult<DeadLetter> {
        let payload: ActionPayload = serde_json::from_str(&self.payload)?;
        Ok(DeadLetter {
            id: decode_uuid(DEAD_LETTERS, &self.id)?,
            order_id: self.order_id,
            payload,
            created_at: decode_time(DEAD_LETTERS, &self.created_at)?,
            retry_count: self.retry_count.max(0) as u32,
            failed_at: decode_time(DEAD_LETTERS, &self.failed_at)?,
            reason: self.reason,
        })
    }
}

impl ActionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, action: &PendingAction) -> StoreResult<()> {
        let payload = serde_json::to_string(&action.payload)?;

        sqlx::query(
            r#"
            INSERT INTO pending_actions (id, kind, order_id, payload, created_at, server_snapshot_updated_at, retry_count, last_retry_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(action.id.to_string())
        .bind(action.kind().to_string())
        .bind(action.order_id)
        .bind(&payload)
        .bind(encode_time(&action.created_at))
        .bind(action.server_snapshot_updated_at.as_ref().map(encode_time))
        .bind(action.retry_count as i64)
        .bind(action.last_retry_at.as_ref().map(encode_time))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All pending actions, oldest first.
    pub async fn list_pending(&self) -> StoreResult<Vec<PendingAction>> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, payload, created_at, server_snapshot_updated_at, retry_count, last_retry_at
            FROM pending_actions
            ORDER BY created_at, seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_action).collect()
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<PendingAction>> {
        let row: Option<ActionRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, payload, created_at, server_snapshot_updated_at, retry_count, last_retry_at
            FROM pending_actions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ActionRow::into_action).transpose()
    }

    /// Persists the retry bookkeeping of an action.
    pub async fn update_retry(&self, action: &PendingAction) -> StoreResult<()> {
        sqlx::query("UPDATE pending_actions SET retry_count = ?, last_retry_at = ? WHERE id = ?")
            .bind(action.retry_count as i64)
            .bind(action.last_retry_at.as_ref().map(encode_time))
            .bind(action.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes an action. Returns whether it was present.
    pub async fn remove(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pending_actions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> StoreResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Moves an action out of the active queue into the dead-letter list.
    pub async fn move_to_dead_letter(&self, letter: &DeadLetter) -> StoreResult<()> {
        let payload = serde_json::to_string(&letter.payload)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters (id, kind, order_id, payload, created_at, retry_count, failed_at, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(letter.id.to_string())
        .bind(letter.kind().to_string())
        .bind(letter.order_id)
        .bind(&payload)
        .bind(encode_time(&letter.created_at))
        .bind(letter.retry_count as i64)
        .bind(encode_time(&letter.failed_at))
        .bind(&letter.reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pending_actions WHERE id = ?")
            .bind(letter.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, payload, created_at, retry_count, failed_at, reason
            FROM dead_letters
            ORDER BY failed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRow::into_dead_letter).collect()
    }

    pub async fn clear_dead_letters(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM dead_letters")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Last server `updated_at` observed for an order.
    pub async fn snapshot(&self, order_id: OrderId) -> StoreResult<Option<DateTime<Utc>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT updated_at FROM order_snapshots WHERE order_id = ?")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(ts,)| decode_time(SNAPSHOTS, &ts)).transpose()
    }

    /// Records an observed `updated_at`, never moving a snapshot backwards.
    pub async fn record_snapshot(
        &self,
        order_id: OrderId,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_snapshots (order_id, updated_at)
            VALUES (?, ?)
            ON CONFLICT(order_id) DO UPDATE SET updated_at = excluded.updated_at
            WHERE excluded.updated_at > order_snapshots.updated_at
            "#,
        )
        .bind(order_id)
        .bind(encode_time(&updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves the baseline of every queued action for `order_id` up to
    /// `updated_at`. Returns how many actions were rebased.
    pub async fn rebase_snapshots(
        &self,
        order_id: OrderId,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let ts = encode_time(&updated_at);
        let result = sqlx::query(
            r#"
            UPDATE pending_actions
            SET server_snapshot_updated_at = ?
            WHERE order_id = ?
              AND (server_snapshot_updated_at IS NULL OR server_snapshot_updated_at < ?)
            "#,
        )
        .bind(&ts)
        .bind(order_id)
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes every queued action, dead letter and snapshot.
    pub async fn purge(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_actions")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dead_letters")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM order_snapshots")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::store::init_db;
    use tempfile::TempDir;

    struct TestContext {
        repo: ActionRepository,
        _temp_dir: TempDir,
    }

    async fn setup() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        TestContext {
            repo: ActionRepository::new(pool),
            _temp_dir: temp_dir,
        }
    }

    fn status_update(order_id: OrderId) -> PendingAction {
        PendingAction::new(
            order_id,
            ActionPayload::StatusUpdate {
                status: OrderStatus::PickedUp,
                notes: Some("at the counter".to_string()),
            },
        )
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let ctx = setup().await;
        let action = status_update(7).with_snapshot(ts("2026-10-18T08:00:00Z"));

        ctx.repo.insert(&action).await.unwrap();

        let fetched = ctx.repo.get(action.id).await.unwrap().unwrap();
        assert_eq!(fetched.order_id, 7);
        assert_eq!(fetched.payload, action.payload);
        assert_eq!(
            fetched.server_snapshot_updated_at,
            Some(ts("2026-10-18T08:00:00Z"))
        );
        assert_eq!(ctx.repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_pending_is_fifo() {
        let ctx = setup().await;
        let later = status_update(1).with_created_at(ts("2026-10-18T10:00:00Z"));
        let earlier = status_update(2).with_created_at(ts("2026-10-18T09:00:00Z"));
        ctx.repo.insert(&later).await.unwrap();
        ctx.repo.insert(&earlier).await.unwrap();

        let pending = ctx.repo.list_pending().await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[tokio::test]
    async fn test_update_retry_and_remove() {
        let ctx = setup().await;
        let mut action = status_update(3);
        ctx.repo.insert(&action).await.unwrap();

        let now = Utc::now();
        action.record_failure(now);
        ctx.repo.update_retry(&action).await.unwrap();

        let fetched = ctx.repo.get(action.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 1);
        assert!(fetched.last_retry_at.is_some());

        assert!(ctx.repo.remove(action.id).await.unwrap());
        assert!(!ctx.repo.remove(action.id).await.unwrap());
        assert_eq!(ctx.repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_to_dead_letter() {
        let ctx = setup().await;
        let action = status_update(9);
        ctx.repo.insert(&action).await.unwrap();

        let letter = DeadLetter::from_action(&action, "server error (500)");
        ctx.repo.move_to_dead_letter(&letter).await.unwrap();

        assert_eq!(ctx.repo.count().await.unwrap(), 0);
        let letters = ctx.repo.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, action.id);
        assert_eq!(letters[0].reason, "server error (500)");

        assert_eq!(ctx.repo.clear_dead_letters().await.unwrap(), 1);
        assert!(ctx.repo.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_never_moves_backwards() {
        let ctx = setup().await;
        ctx.repo
            .record_snapshot(5, ts("2026-10-18T10:00:00Z"))
            .await
            .unwrap();
        ctx.repo
            .record_snapshot(5, ts("2026-10-18T09:00:00Z"))
            .await
            .unwrap();
        assert_eq!(
            ctx.repo.snapshot(5).await.unwrap(),
            Some(ts("2026-10-18T10:00:00Z"))
        );

        ctx.repo
            .record_snapshot(5, ts("2026-10-18T11:00:00Z"))
            .await
            .unwrap();
        assert_eq!(
            ctx.repo.snapshot(5).await.unwrap(),
            Some(ts("2026-10-18T11:00:00Z"))
        );
        assert_eq!(ctx.repo.snapshot(6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rebase_snapshots() {
        let ctx = setup().await;
        let stale = status_update(4).with_snapshot(ts("2026-10-18T08:00:00Z"));
        let other = status_update(5).with_snapshot(ts("2026-10-18T08:00:00Z"));
        ctx.repo.insert(&stale).await.unwrap();
        ctx.repo.insert(&other).await.unwrap();

        let rebased = ctx
            .repo
            .rebase_snapshots(4, ts("2026-10-18T09:00:00Z"))
            .await
            .unwrap();
        assert_eq!(rebased, 1);

        let fetched = ctx.repo.get(stale.id).await.unwrap().unwrap();
        assert_eq!(
            fetched.server_snapshot_updated_at,
            Some(ts("2026-10-18T09:00:00Z"))
        );
        let untouched = ctx.repo.get(other.id).await.unwrap().unwrap();
        assert_eq!(
            untouched.server_snapshot_updated_at,
            Some(ts("2026-10-18T08:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_purge() {
        let ctx = setup().await;
        ctx.repo.insert(&status_update(1)).await.unwrap();
        ctx.repo.record_snapshot(1, Utc::now()).await.unwrap();

        ctx.repo.purge().await.unwrap();
        assert_eq!(ctx.repo.count().await.unwrap(), 0);
        assert_eq!(ctx.repo.snapshot(1).await.unwrap(), None);
    }
}
