//! Event sink system for run progress and observability.
//!
//! Event types emitted by the orchestrator and adapters:
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `run.started` / `run.completed` / `run.failed` | run boundaries |
//! | `stage.started` / `stage.succeeded` / `stage.failed` / `stage.skipped` / `stage.resumed` | per stage |
//! | `stage.tolerated` | a tolerated stage failed and the run continues |
//! | `unit.started` / `unit.installed` / `unit.failed` | per service unit |
//! | `job.submitted` / `job.phase` / `job.timed_out` | batch job progress |

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
