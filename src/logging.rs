//! Per-project log routing (§10.2, §6): every tracing event carrying a
//! `project_id` field also lands in that project's own
//! `.anima/logs/anima.log`, alongside the process-wide stderr feed `main.rs`
//! installs.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use uuid::Uuid;

struct ProjectWriter {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

/// Routes events by their `project_id` field into a per-project file sink.
/// Cheap to clone: the registry lives behind an `Arc<Mutex<_>>` shared with
/// the `Supervisor` that opens and closes entries as projects are
/// registered and removed.
#[derive(Clone, Default)]
pub struct ProjectLogLayer {
    writers: Arc<Mutex<HashMap<Uuid, ProjectWriter>>>,
}

impl ProjectLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `<anima_dir>/logs/anima.log` for `project_id`. Idempotent: a
    /// later call (project re-registered, crash-recovery restart) replaces
    /// the writer rather than erroring.
    pub fn register_project(&self, project_id: Uuid, anima_dir: &Path) -> std::io::Result<()> {
        let logs_dir = anima_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let appender = tracing_appender::rolling::never(&logs_dir, "anima.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        self.writers
            .lock()
            .unwrap()
            .insert(project_id, ProjectWriter { writer, _guard: guard });
        Ok(())
    }

    pub fn remove_project(&self, project_id: Uuid) {
        self.writers.lock().unwrap().remove(&project_id);
    }
}

#[derive(Default)]
struct FieldCollector {
    project_id: Option<Uuid>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "project_id" {
            self.project_id = rendered.trim_matches('"').parse().ok();
        } else {
            self.fields.push((field.name(), rendered));
        }
    }
}

impl<S: Subscriber> Layer<S> for ProjectLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let Some(project_id) = collector.project_id else {
            return;
        };

        let mut writers = self.writers.lock().unwrap();
        let Some(entry) = writers.get_mut(&project_id) else {
            return;
        };

        let fields = collector
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let line = format!(
            "{} {} {}: {}\n",
            chrono::Utc::now().to_rfc3339(),
            event.metadata().level(),
            event.metadata().target(),
            fields
        );
        let _ = entry.writer.write_all(line.as_bytes());
    }
}
