//! Console progress trace.

use async_trait::async_trait;
use deployflow::events::EventSink;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::Write;

/// Prints one line per run and stage event.
pub struct ConsoleProgress<W: Write + Send> {
    out: Mutex<W>,
}

impl ConsoleProgress<std::io::Stderr> {
    /// Writes to stderr so stdout stays parseable.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

fn field<'a>(data: Option<&'a Value>, key: &str) -> &'a str {
    data.and_then(|d| d.get(key)).and_then(Value::as_str).unwrap_or("")
}

/// Renders an event as a progress line, or `None` for events not traced.
pub fn render(event_type: &str, data: Option<&Value>) -> Option<String> {
    let stage = field(data, "stage");
    let line = match event_type {
        "run.started" => format!("==> run {}", field(data, "run_id")),
        "stage.started" => format!("--> {stage} ({})", field(data, "action")),
        "stage.succeeded" => {
            let ms = data.and_then(|d| d["duration_ms"].as_i64()).unwrap_or(0);
            format!("    {stage}: ok ({ms} ms)")
        }
        "stage.skipped" => format!("    {stage}: skipped, {}", field(data, "reason")),
        "stage.resumed" => format!("    {stage}: already succeeded"),
        "stage.failed" => format!("    {stage}: FAILED {}", field(data, "error")),
        "stage.tolerated" => format!("    {stage}: failure tolerated, continuing"),
        "unit.installed" => format!("    {} installed", field(data, "unit")),
        "unit.failed" => format!("    {} FAILED {}", field(data, "unit"), field(data, "error")),
        "job.submitted" => format!("    job {} submitted", field(data, "job")),
        "job.phase" => format!("    job {} {}", field(data, "job"), field(data, "phase")),
        "job.timed_out" => {
            let secs = data.and_then(|d| d["waited_secs"].as_u64()).unwrap_or(0);
            format!("    job {} still running after {secs}s", field(data, "job"))
        }
        "run.completed" => format!("==> complete ({} tolerated)", data.map_or(0, |d| d["tolerated"].as_u64().unwrap_or(0))),
        "run.failed" => format!("==> failed in {stage}: {}", field(data, "error")),
        "run.teardown" => format!("==> deleting {}", field(data, "resource_group")),
        _ => return None,
    };
    Some(line)
}

#[async_trait]
impl<W: Write + Send> EventSink for ConsoleProgress<W> {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        if let Some(line) = render(event_type, data.as_ref()) {
            let _ = writeln!(self.out.lock(), "{line}");
        }
    }
}
