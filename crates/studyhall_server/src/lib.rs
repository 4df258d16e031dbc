//! Studyhall Provisioning Server
//!
//! Runs the per-user provisioning controller against a SQLite-backed store
//! and reports its health over HTTP.
//!
//! ## Endpoints
//!
//! - `GET /`: server banner
//! - `GET /health`: controller state as JSON; 503 once it has failed or stopped
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3040)
//! - `DATABASE_PATH`: Path to the SQLite store (default: ./studyhall.db)
//! - `ADMIN_USERNAME`: Platform administrator (default: admin)
//! - `ADMIN_PASSWORD`: Creates the administrator account on startup when set
//! - `PROVISIONING_CONCURRENCY`: Accounts provisioned at once (default: 4)
//! - `RUST_LOG`: Log filter (default: studyhall_server=debug,studyhall_core=info)

pub mod config;
pub mod handlers;

pub use config::Config;
