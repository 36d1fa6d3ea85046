// Layer 3 - Recommendations
// Periodic AI analysis over stored market windows

// Reply schema shared by primary and chained analyses
pub mod analysis;

// Short-term / long-term jobs
pub mod scheduler;

pub use analysis::{AnalysisResponse, normalize_confidence};
pub use scheduler::{
    JobSpec, RecommendationScheduler, SchedulerError, SchedulerStats, TickOutcome,
    LONG_TERM_JOB, SHORT_TERM_JOB,
};
