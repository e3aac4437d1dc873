mod purge;

pub use purge::{
    PurgeCleanupJob, PurgeJobContext, PurgeTickJob, process_purge_cleanup_job,
    process_purge_tick_job,
};
