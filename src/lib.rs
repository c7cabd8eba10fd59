pub mod compactor;
pub mod config;
pub mod engine;
pub mod ids;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod permission;
pub mod tenant;
pub mod wal;
pub mod wire;
