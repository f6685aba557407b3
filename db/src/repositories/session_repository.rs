use crate::filter_utils::FilterUtils;
use crate::models::{
    archived_session, attendance_record, attendance_session, offline_attendance_session,
    temporal_key_epoch,
};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde::Serialize;
use util::filters::FilterParam;

pub type SessionRow = attendance_session::Model;
pub type OfflineSessionRow = offline_attendance_session::Model;
pub type KeyEpoch = temporal_key_epoch::Model;
pub type RecordRow = attendance_record::Model;
pub type ArchivedRow = archived_session::Model;

/// Everything the relational store knows about one session, frozen at archival.
#[derive(Debug, Serialize)]
pub struct ArchiveBlob {
    pub session: SessionRow,
    pub key_epochs: Vec<KeyEpoch>,
    pub records: Vec<RecordRow>,
}

/// Relational store for sessions, their fallback rows, key epochs,
/// attendance rows and archives.
#[derive(Clone)]
pub struct SessionRepository {
    db: DatabaseConnection,
}

impl SessionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Insert the live row, pre-create its offline fallback row and open the
    /// first key epoch, all in one transaction.
    pub async fn insert_session(&self, session: SessionRow) -> Result<SessionRow, DbErr> {
        let txn = self.db.begin().await?;

        let inserted = session.clone().into_active_model().reset_all().insert(&txn).await?;
        replace_offline_row(&txn, &inserted).await?;
        open_epoch(
            &txn,
            &inserted.id,
            &inserted.temporal_key,
            inserted.created_at.min(inserted.starts_at),
        )
        .await?;

        txn.commit().await?;
        tracing::info!(session_id = %inserted.id, course = %inserted.course_code, "session row inserted");
        Ok(inserted)
    }

    /// Whole-object write of the live row and its offline copy.
    pub async fn update_session(&self, session: SessionRow) -> Result<SessionRow, DbErr> {
        let txn = self.db.begin().await?;
        let updated = session.into_active_model().reset_all().update(&txn).await?;
        replace_offline_row(&txn, &updated).await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Apply `change` to every live row matching `filters` and write each back whole.
    pub async fn update_where<F>(
        &self,
        filters: &[FilterParam],
        mut change: F,
    ) -> Result<Vec<SessionRow>, DbErr>
    where
        F: FnMut(&mut SessionRow),
    {
        let rows = self.select_where(filters).await?;
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            change(&mut row);
            out.push(self.update_session(row).await?);
        }
        Ok(out)
    }

    pub async fn select_where(&self, filters: &[FilterParam]) -> Result<Vec<SessionRow>, DbErr> {
        let condition = FilterUtils::apply_all_filters::<attendance_session::Column>(filters)?;
        attendance_session::Entity::find()
            .filter(condition)
            .order_by_asc(attendance_session::Column::StartsAt)
            .all(&self.db)
            .await
    }

    pub async fn select_offline_where(
        &self,
        filters: &[FilterParam],
    ) -> Result<Vec<OfflineSessionRow>, DbErr> {
        let condition =
            FilterUtils::apply_all_filters::<offline_attendance_session::Column>(filters)?;
        offline_attendance_session::Entity::find()
            .filter(condition)
            .order_by_asc(offline_attendance_session::Column::StartsAt)
            .all(&self.db)
            .await
    }

    pub async fn find_session(&self, id: &str) -> Result<Option<SessionRow>, DbErr> {
        attendance_session::Entity::find_by_id(id.to_owned())
            .one(&self.db)
            .await
    }

    pub async fn find_offline_session(&self, id: &str) -> Result<Option<OfflineSessionRow>, DbErr> {
        offline_attendance_session::Entity::find_by_id(id.to_owned())
            .one(&self.db)
            .await
    }

    /// Live row if present, otherwise the fallback row.
    pub async fn find_session_or_fallback(&self, id: &str) -> Result<Option<SessionRow>, DbErr> {
        if let Some(row) = self.find_session(id).await? {
            return Ok(Some(row));
        }
        Ok(self.find_offline_session(id).await?.map(SessionRow::from))
    }

    /// Remove the live row only. The fallback row, epochs and attendance
    /// rows stay until archival.
    pub async fn delete_session(&self, id: &str) -> Result<u64, DbErr> {
        let res = attendance_session::Entity::delete_by_id(id.to_owned())
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn delete_where(&self, filters: &[FilterParam]) -> Result<u64, DbErr> {
        if filters.is_empty() {
            return Err(DbErr::Custom(
                "Refusing to delete without filters. Provide at least one filter param.".to_string(),
            ));
        }
        let condition = FilterUtils::apply_all_filters::<attendance_session::Column>(filters)?;
        let res = attendance_session::Entity::delete_many()
            .filter(condition)
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Swap the current key in one transaction: close the open epoch, open a
    /// new one at `at`, and rewrite the live and fallback rows.
    pub async fn rotate_key(
        &self,
        id: &str,
        new_key: &str,
        at: DateTime<Utc>,
    ) -> Result<SessionRow, DbErr> {
        let txn = self.db.begin().await?;

        let mut row = attendance_session::Entity::find_by_id(id.to_owned())
            .one(&txn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("attendance session {id}")))?;
        row.temporal_key = new_key.to_owned();
        row.updated_at = at;

        let updated = row.into_active_model().reset_all().update(&txn).await?;
        replace_offline_row(&txn, &updated).await?;

        temporal_key_epoch::Entity::update_many()
            .col_expr(temporal_key_epoch::Column::ValidUntil, Expr::value(at))
            .filter(temporal_key_epoch::Column::SessionId.eq(id))
            .filter(temporal_key_epoch::Column::ValidUntil.is_null())
            .exec(&txn)
            .await?;
        open_epoch(&txn, id, new_key, at).await?;

        txn.commit().await?;
        tracing::info!(session_id = %id, "temporal key rotated");
        Ok(updated)
    }

    pub async fn key_epochs(&self, session_id: &str) -> Result<Vec<KeyEpoch>, DbErr> {
        temporal_key_epoch::Entity::find()
            .filter(temporal_key_epoch::Column::SessionId.eq(session_id))
            .order_by_asc(temporal_key_epoch::Column::Id)
            .all(&self.db)
            .await
    }

    /// The key that was current for `session_id` at instant `at`.
    pub async fn key_at(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<String>, DbErr> {
        let epochs = self.key_epochs(session_id).await?;
        Ok(epochs
            .into_iter()
            .rev()
            .find(|e| e.covers(at))
            .map(|e| e.temporal_key))
    }

    /// Insert or overwrite the row for (session, student).
    pub async fn save_record(&self, record: RecordRow) -> Result<RecordRow, DbErr> {
        attendance_record::Entity::insert(record.clone().into_active_model().reset_all())
            .on_conflict(
                OnConflict::columns([
                    attendance_record::Column::SessionId,
                    attendance_record::Column::StudentId,
                ])
                .update_columns([
                    attendance_record::Column::ScannedAt,
                    attendance_record::Column::IsOnline,
                    attendance_record::Column::DeviceId,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(record)
    }

    pub async fn find_record(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<RecordRow>, DbErr> {
        attendance_record::Entity::find_by_id((session_id.to_owned(), student_id.to_owned()))
            .one(&self.db)
            .await
    }

    pub async fn records_for(&self, session_id: &str) -> Result<Vec<RecordRow>, DbErr> {
        attendance_record::Entity::find()
            .filter(attendance_record::Column::SessionId.eq(session_id))
            .order_by_asc(attendance_record::Column::ScannedAt)
            .all(&self.db)
            .await
    }

    pub async fn record_for_device(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Result<Option<RecordRow>, DbErr> {
        attendance_record::Entity::find()
            .filter(attendance_record::Column::SessionId.eq(session_id))
            .filter(attendance_record::Column::DeviceId.eq(device_id))
            .one(&self.db)
            .await
    }

    /// Fallback rows whose window closed before `cutoff`.
    pub async fn ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<OfflineSessionRow>, DbErr> {
        self.select_offline_where(&[FilterParam::lt("expires_at", cutoff)])
            .await
    }

    /// Freeze a session into `archived_sessions` and delete every other row
    /// it owns.
    pub async fn archive_session(&self, id: &str, at: DateTime<Utc>) -> Result<ArchivedRow, DbErr> {
        let txn = self.db.begin().await?;

        let session = match attendance_session::Entity::find_by_id(id.to_owned())
            .one(&txn)
            .await?
        {
            Some(row) => row,
            None => offline_attendance_session::Entity::find_by_id(id.to_owned())
                .one(&txn)
                .await?
                .map(SessionRow::from)
                .ok_or_else(|| DbErr::RecordNotFound(format!("attendance session {id}")))?,
        };

        let key_epochs = temporal_key_epoch::Entity::find()
            .filter(temporal_key_epoch::Column::SessionId.eq(id))
            .order_by_asc(temporal_key_epoch::Column::Id)
            .all(&txn)
            .await?;
        let records = attendance_record::Entity::find()
            .filter(attendance_record::Column::SessionId.eq(id))
            .order_by_asc(attendance_record::Column::ScannedAt)
            .all(&txn)
            .await?;

        let course_code = session.course_code.clone();
        let blob = serde_json::to_string(&ArchiveBlob {
            session,
            key_epochs,
            records,
        })
        .map_err(|e| DbErr::Custom(format!("archive blob for {id}: {e}")))?;

        let archived = archived_session::ActiveModel {
            session_id: Set(id.to_owned()),
            course_code: Set(course_code),
            blob: Set(blob),
            archived_at: Set(at),
        }
        .insert(&txn)
        .await?;

        attendance_record::Entity::delete_many()
            .filter(attendance_record::Column::SessionId.eq(id))
            .exec(&txn)
            .await?;
        temporal_key_epoch::Entity::delete_many()
            .filter(temporal_key_epoch::Column::SessionId.eq(id))
            .exec(&txn)
            .await?;
        offline_attendance_session::Entity::delete_by_id(id.to_owned())
            .exec(&txn)
            .await?;
        attendance_session::Entity::delete_by_id(id.to_owned())
            .exec(&txn)
            .await?;

        txn.commit().await?;
        tracing::info!(session_id = %id, "session archived");
        Ok(archived)
    }

    pub async fn find_archived(&self, id: &str) -> Result<Option<ArchivedRow>, DbErr> {
        archived_session::Entity::find_by_id(id.to_owned())
            .one(&self.db)
            .await
    }
}

async fn replace_offline_row<C: ConnectionTrait>(conn: &C, live: &SessionRow) -> Result<(), DbErr> {
    offline_attendance_session::Entity::delete_by_id(live.id.clone())
        .exec(conn)
        .await?;
    OfflineSessionRow::from(live.clone())
        .into_active_model()
        .reset_all()
        .insert(conn)
        .await?;
    Ok(())
}

async fn open_epoch<C: ConnectionTrait>(
    conn: &C,
    session_id: &str,
    key: &str,
    from: DateTime<Utc>,
) -> Result<KeyEpoch, DbErr> {
    temporal_key_epoch::ActiveModel {
        id: NotSet,
        session_id: Set(session_id.to_owned()),
        temporal_key: Set(key.to_owned()),
        valid_from: Set(from),
        valid_until: Set(None),
    }
    .insert(conn)
    .await
}
