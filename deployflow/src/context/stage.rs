//! Per-stage execution context.

use super::RunIdentity;
use crate::cancellation::CancellationToken;
use crate::core::ParameterSet;
use crate::events::{EventSink, NoOpEventSink};
use std::sync::Arc;

/// Everything an adapter needs while executing one stage.
#[derive(Clone)]
pub struct StageContext {
    run: RunIdentity,
    stage: String,
    params: ParameterSet,
    cancel: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        run: RunIdentity,
        stage: impl Into<String>,
        params: ParameterSet,
        cancel: Arc<CancellationToken>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            run,
            stage: stage.into(),
            params,
            cancel,
            events,
        }
    }

    /// Creates a detached context for ad-hoc adapter calls and tests.
    #[must_use]
    pub fn detached(stage: impl Into<String>) -> Self {
        Self::new(
            RunIdentity::new(),
            stage,
            ParameterSet::new(),
            Arc::new(CancellationToken::new()),
            Arc::new(NoOpEventSink),
        )
    }

    /// Returns the run identity.
    #[must_use]
    pub fn run(&self) -> &RunIdentity {
        &self.run
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage
    }

    /// Returns the resolved parameters.
    #[must_use]
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emits an event tagged with the run id and stage name.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        let mut payload = serde_json::json!({
            "run_id": self.run.run_id,
            "stage": self.stage,
        });
        if let (Some(target), serde_json::Value::Object(extra)) = (payload.as_object_mut(), data) {
            target.extend(extra);
        }
        self.events.try_emit(event_type, Some(payload));
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run.run_id)
            .field("stage", &self.stage)
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}
