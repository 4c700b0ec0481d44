pub mod action;
pub mod file;
pub mod location;
pub mod log_record;
pub mod task;
pub mod worker;

pub use action::{ActionKind, FileAction, StagingStep};
pub use file::File;
pub use location::{Drive, Location};
pub use log_record::{LogRecord, LogStream};
pub use task::{
    dependency_okay, CallSpec, ObjectRef, Resources, StagePlan, Task, TaskKind, TaskState,
    RESTARTABLE_STATES,
};
pub use worker::{WorkerCommand, WorkerRecord, WorkerState, SHELL_COMMAND_PREFIX};
