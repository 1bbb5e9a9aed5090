pub mod blob;
pub mod compactor;
pub mod config;
pub mod draft;
pub mod engine;
pub mod limits;
pub mod message;
pub mod model;
pub mod observability;
pub mod quote;
pub mod rate;
pub mod recurrence;
pub mod wal;
