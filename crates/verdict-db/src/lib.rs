//! PostgreSQL persistence for verdict: connection config, pooling,
//! embedded migrations, row models and query functions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
