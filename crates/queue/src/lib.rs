//! Encode Queue
//!
//! Durable job queue and single-slot orchestration for an external encode
//! engine: job records, progress decoding, engine supervision, crash recovery.

pub mod disk_space;
pub mod driver;
pub mod events;
pub mod job;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod supervisor;

pub use encode_queue_config as config;
pub use encode_queue_config::Config;
pub use disk_space::{available_space, DiskSpaceError, DiskSpaceGate};
pub use driver::{DriverError, DriverState, QueueDriver};
pub use events::QueueEvent;
pub use job::{InvalidTransition, Job, JobId, JobOutcome, JobStatus, Task};
pub use persistence::{
    find_recoverable_queues, recovery_file_name, ExportedJob, PersistenceError, QueueExport,
    QueueSnapshot, RecoverableQueue,
};
pub use progress::{EncodePhase, EngineStatus, ProgressDecoder, ProgressSample, ProgressTracker};
pub use queue::{QueueError, QueueManager, QueueStats};
pub use supervisor::{
    Completion, EncodeEngine, EncodeRequest, EncodeSupervisor, EngineEvent, LibrarySupervisor,
    ProcessSupervisor, SupervisorError, SupervisorEvent,
};
