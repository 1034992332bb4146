pub mod db;
pub mod helpers;
pub mod migrations;
pub mod models;

pub use db::Database;
pub use models::StateRecord;
