pub mod cache;
pub mod clock;
pub mod config;
pub mod limits;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod plan;
pub mod reaper;
pub mod runs;
pub mod scheduler;
pub mod store;
pub mod vendor;
pub mod wal;
