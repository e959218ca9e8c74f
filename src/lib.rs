pub mod config;
pub mod crypto;
pub mod db;
pub mod metrics;
pub mod order_agg;
pub mod order_sync;
pub mod providers;
pub mod renewal;
pub mod scheduler;
pub mod stats_sync;
pub mod sync_task;
pub mod telemetry;
pub mod token_refresh;
pub mod video_agg;
pub mod window;
pub mod worker;
