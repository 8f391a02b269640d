pub mod dashboard;
pub mod env;
pub mod flipside;
pub mod health;
mod json_codecs;
pub mod log;
pub mod metawin;
pub mod metrics;
pub mod pagination;
mod performance;
pub mod serve;
pub mod snapshot;
pub mod time_windows;

pub use metawin::load_weekly_activity;
pub use serve::start_server;
