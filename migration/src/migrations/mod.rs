pub mod m202510010001_create_attendance_sessions;
pub mod m202510010002_create_temporal_key_epochs;
pub mod m202510010003_create_attendance_records;
pub mod m202510010004_create_archived_sessions;
pub mod m202510010005_create_attendance_documents;
pub mod m202510010006_create_local_cache;
