mod audit;
mod db;
mod patterns;
mod schema;

pub use audit::JsonlAuditLogger;
pub use db::{ConsolidationLogRow, Database, SessionRecord};
pub use schema::schema_version;
