//! Database layer for gator: schema, migrations, and typed query functions.
//!
//! Connections are pooled `sqlx::PgPool`s. Migrations run at runtime via
//! [`sqlx::migrate::Migrator`] (see [`pool::run_migrations`]) rather than
//! the compile-time `sqlx::migrate!()` macro, so the workspace builds
//! without a live database.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
