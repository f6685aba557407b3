// migration: create_attendance_sessions + offline_attendance_sessions (same shape)
use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m202510010001_create_attendance_sessions"
    }
}

const LIVE: &str = "attendance_sessions";
const OFFLINE: &str = "offline_attendance_sessions";

fn session_table(name: &str) -> TableCreateStatement {
    Table::create()
        .table(Alias::new(name))
        .if_not_exists()
        .col(
            ColumnDef::new(Alias::new("id"))
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(Alias::new("course_code")).string().not_null())
        .col(ColumnDef::new(Alias::new("course_name")).string().not_null())
        .col(
            ColumnDef::new(Alias::new("temporal_key"))
                .string_len(64)
                .not_null(),
        )
        .col(ColumnDef::new(Alias::new("starts_at")).timestamp().not_null())
        .col(ColumnDef::new(Alias::new("expires_at")).timestamp().not_null())
        .col(
            ColumnDef::new(Alias::new("duration_minutes"))
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Alias::new("restrict_by_ip"))
                .boolean()
                .not_null()
                .default(false),
        )
        .col(ColumnDef::new(Alias::new("allowed_ip_cidr")).string().null())
        .col(
            ColumnDef::new(Alias::new("device_binding"))
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(Alias::new("created_at"))
                .timestamp()
                .not_null()
                .default(Expr::cust("CURRENT_TIMESTAMP")),
        )
        .col(
            ColumnDef::new(Alias::new("updated_at"))
                .timestamp()
                .not_null()
                .default(Expr::cust("CURRENT_TIMESTAMP")),
        )
        .to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.create_table(session_table(LIVE)).await?;
        manager.create_table(session_table(OFFLINE)).await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_att_sess_course")
                    .table(Alias::new(LIVE))
                    .col(Alias::new("course_code"))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new(OFFLINE)).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Alias::new(LIVE)).to_owned())
            .await
    }
}
