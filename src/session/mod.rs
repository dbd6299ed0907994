//! Session records, persistence, provisioning, and cleanup.

mod archive;
mod cleaner;
mod manager;
mod models;
mod repository;
mod worker;

pub use archive::{generate_env_file, tar_directory};
pub use cleaner::{cleanup_all_active, CleanerConfig, SessionCleaner, SessionTerminator};
pub use manager::SessionManager;
pub use models::{
    Session, SessionCreatePayload, SessionParams, SessionStatus, SESSION_CREATE_TASK,
};
pub use repository::{PgSessionRepository, SessionStore};
pub use worker::{SessionTaskWorker, WorkerConfig};
