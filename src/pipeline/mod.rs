pub mod capture;
pub mod counters;
pub mod ledger;
pub mod pacer;
pub mod session;
pub mod store;
pub mod worker;

pub use capture::{CameraFeed, PacedCapture};
pub use counters::{CameraCounters, CounterSnapshot};
pub use ledger::{LedgerSummary, TimestampLedger};
pub use pacer::RatePacer;
pub use session::{CameraOutcome, CameraReport, RecordingSession, SessionState, SessionSummary};
pub use worker::{PersistenceWorker, RetryPolicy, WorkerReport, WorkerState};
