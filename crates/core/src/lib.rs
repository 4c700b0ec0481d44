pub mod config;
pub mod errors;
pub mod id;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use id::{IdGenerator, ObjectId};
pub use logging::init_logging;
pub use models::{
    ActionKind, CallSpec, Drive, File, FileAction, Location, LogRecord, LogStream, StagingStep,
    Task, TaskKind, TaskState, WorkerCommand, WorkerRecord, WorkerState,
};
pub use traits::{
    DocumentBackend, Filter, IndexFields, IndexValue, Modification, StoreObject, StoredRecord,
};
