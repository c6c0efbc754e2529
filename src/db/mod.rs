pub mod elasticsearch;
pub mod postgres;

pub use elasticsearch::{setup_es, shutdown_es, ConnectionRegistry, SearchSettings};
pub use postgres::{setup_db, setup_db_with, shutdown_db, DbSettings};
