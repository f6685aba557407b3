pub mod attendance_merger;
pub mod connectivity;
pub mod credential_cache;
pub mod crypto_vault;
pub mod device;
pub mod document_store;
pub mod error;
pub mod identity;
pub mod local_cache;
pub mod models;
pub mod offline_queue;
pub mod scan_processor;
pub mod scheduler;
pub mod session_admin;
pub mod session_store;
pub mod sync_reconciler;
pub mod temporal_key;
pub mod token;
pub mod validation;

pub use error::AppError;
