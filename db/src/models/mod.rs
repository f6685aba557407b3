pub mod archived_session;
pub mod attendance_document;
pub mod attendance_record;
pub mod attendance_session;
pub mod local_cache_entry;
pub mod offline_attendance_session;
pub mod temporal_key_epoch;
