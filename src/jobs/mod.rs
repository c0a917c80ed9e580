pub mod commands;
pub mod manager;
pub mod model;
pub mod registry;
pub mod service;
pub mod worker;

pub use commands::{
    ClearLockTimesCmd, CompleteJobCmd, CountJobsCmd, CreateJobCmd, DeleteDeadLetterJobCmd,
    DeleteJobCmd, ExecuteJobCmd, FindAcquirableJobsCmd, FindDeadLetterJobsCmd, FindJobCmd,
    FindJobsBySearchKeyCmd, FindSuspendedJobsCmd, LockJobCmd, MoveDeadLetterJobToExecutableCmd,
    MoveJobToDeadLetterCmd, RecordJobFailureCmd, RescheduleJobCmd, SetJobRetriesCmd,
    UnacquireAllOwnedByCmd, UnacquireJobCmd,
};
pub use manager::{JobFailure, JobManager};
pub use model::{
    DeadLetterJob, Job, JobCore, JobDefinition, JobPopulation, JobState, JobType, SuspendedJob,
};
pub use registry::{JobHandler, JobHandlerRegistry};
pub use service::JobService;
pub use worker::{JobExecutor, JobOutcome, RunSummary};
