//! Infrastructure layer: database, locks, destination stores, HTTP and process setup

pub mod config;
pub mod crm_client;
pub mod database_connection;
pub mod http_client;
pub mod lock_coordinator;
pub mod logging;
pub mod person_repository;
pub mod quiz_session_repository;

pub use config::{AppConfig, ConfigManager};
pub use database_connection::DatabaseConnection;
pub use http_client::{HttpClient, HttpClientConfig};
pub use lock_coordinator::{LockConfig, LockCoordinator, LockGuard};
pub use logging::init_logging_with_config;
pub use person_repository::PersonStore;
pub use quiz_session_repository::QuizSessionStore;
