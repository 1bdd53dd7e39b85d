//! Fan-out of process output to per-role sinks.
//!
//! Each tracked app has up to three sinks (`system`, `frontend`,
//! `backend`). Which sinks see a process's output depends on the app's
//! [`RunMode`] and the process's [`ProcessRole`]; see [`route`].

mod sink;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::AppId;
use crate::kernel::{OutputCallback, OutputLine, OutputStream};

pub use sink::LogSink;

/// How an app was launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Fullstack,
    #[default]
    FrontendOnly,
    BackendOnly,
}

/// The part of an app a process belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Frontend,
    Backend,
}

/// Sink identity, and the origin tag carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRole {
    System,
    Backend,
    Frontend,
}

impl From<ProcessRole> for LogRole {
    fn from(role: ProcessRole) -> Self {
        match role {
            ProcessRole::Frontend => Self::Frontend,
            ProcessRole::Backend => Self::Backend,
        }
    }
}

impl std::str::FromStr for LogRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            other => Err(format!("unknown log role {other:?}")),
        }
    }
}

/// One line of output as stored in a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Position within the sink it was read from.
    pub seq: u64,
    pub app_id: AppId,
    /// Where the line originated, not which sink holds it.
    pub role: LogRole,
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Sinks that receive output from a process of `origin` role.
///
/// Backend output is mirrored into the frontend sink in full-stack mode;
/// frontend output is never mirrored into the backend sink.
pub fn route(mode: RunMode, origin: ProcessRole) -> &'static [LogRole] {
    use LogRole::{Backend, Frontend, System};

    match (mode, origin) {
        (RunMode::Fullstack, ProcessRole::Backend) => &[Backend, Frontend, System],
        (RunMode::Fullstack, ProcessRole::Frontend) => &[Frontend, System],
        (RunMode::FrontendOnly, ProcessRole::Frontend) => &[Frontend, System],
        (RunMode::BackendOnly, ProcessRole::Backend) => &[Backend, System],
        (RunMode::FrontendOnly, ProcessRole::Backend)
        | (RunMode::BackendOnly, ProcessRole::Frontend) => &[],
    }
}

/// Per-role output callbacks handed to a provider's `run`.
#[derive(Clone, Default)]
pub struct OutputTaps {
    pub frontend: Option<OutputCallback>,
    pub backend: Option<OutputCallback>,
}

impl OutputTaps {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_role(&self, role: ProcessRole) -> Option<OutputCallback> {
        match role {
            ProcessRole::Frontend => self.frontend.clone(),
            ProcessRole::Backend => self.backend.clone(),
        }
    }
}

impl std::fmt::Debug for OutputTaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTaps")
            .field("frontend", &self.frontend.is_some())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

/// Owns every sink and hands out output callbacks bound to them.
#[derive(Debug)]
pub struct LogRouter {
    capacity: usize,
    sinks: Mutex<HashMap<(AppId, LogRole), Arc<LogSink>>>,
}

impl LogRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// The sink for `(app_id, role)`, created on first use.
    pub fn sink(&self, app_id: AppId, role: LogRole) -> Arc<LogSink> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((app_id, role))
            .or_insert_with(|| Arc::new(LogSink::new(self.capacity)))
            .clone()
    }

    /// Output callback for one process. Sinks are resolved up front, so
    /// the callback itself only appends.
    pub fn tap(&self, app_id: AppId, mode: RunMode, origin: ProcessRole) -> Option<OutputCallback> {
        let targets: Vec<Arc<LogSink>> = route(mode, origin)
            .iter()
            .map(|role| self.sink(app_id, *role))
            .collect();
        if targets.is_empty() {
            return None;
        }
        let tag = LogRole::from(origin);
        Some(Arc::new(move |line: OutputLine| {
            for sink in &targets {
                sink.append(app_id, tag, line.stream, &line.text);
            }
        }))
    }

    pub fn taps(&self, app_id: AppId, mode: RunMode) -> OutputTaps {
        OutputTaps {
            frontend: self.tap(app_id, mode, ProcessRole::Frontend),
            backend: self.tap(app_id, mode, ProcessRole::Backend),
        }
    }

    /// Callback writing only to the system sink, for tooling output that
    /// belongs to no app role (builds, installs, watchers).
    pub fn system_tap(&self, app_id: AppId) -> OutputCallback {
        let sink = self.sink(app_id, LogRole::System);
        Arc::new(move |line: OutputLine| {
            sink.append(app_id, LogRole::System, line.stream, &line.text);
        })
    }

    /// Orchestrator status line.
    pub fn system(&self, app_id: AppId, text: impl AsRef<str>) {
        self.sink(app_id, LogRole::System)
            .append(app_id, LogRole::System, OutputStream::Stdout, text.as_ref());
    }

    pub fn logs(&self, app_id: AppId, role: LogRole) -> Vec<LogEvent> {
        self.existing(app_id, role)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    pub fn logs_since(&self, app_id: AppId, role: LogRole, after: u64) -> Vec<LogEvent> {
        self.existing(app_id, role)
            .map(|s| s.since(after))
            .unwrap_or_default()
    }

    /// Live events only. A subscriber that falls behind skips what it
    /// missed rather than slowing producers.
    pub fn subscribe(&self, app_id: AppId, role: LogRole) -> impl Stream<Item = LogEvent> + use<> {
        use tokio_stream::StreamExt;
        use tokio_stream::wrappers::BroadcastStream;

        BroadcastStream::new(self.sink(app_id, role).subscribe()).filter_map(Result::ok)
    }

    /// Backlog followed by live events, without gaps or duplicates.
    pub fn follow(&self, app_id: AppId, role: LogRole) -> impl Stream<Item = LogEvent> + use<> {
        let sink = self.sink(app_id, role);
        let mut rx = sink.subscribe();
        let backlog = sink.snapshot();

        async_stream::stream! {
            let mut cursor = 0;
            for event in backlog {
                cursor = event.seq;
                yield event;
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.seq > cursor => {
                        cursor = event.seq;
                        yield event;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        for event in sink.since(cursor) {
                            cursor = event.seq;
                            yield event;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Drop every sink belonging to `app_id`.
    pub fn clear(&self, app_id: AppId) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _), _| *id != app_id);
    }

    fn existing(&self, app_id: AppId, role: LogRole) -> Option<Arc<LogSink>> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(app_id, role))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_is_asymmetric() {
        use LogRole::*;
        assert_eq!(
            route(RunMode::Fullstack, ProcessRole::Backend),
            &[Backend, Frontend, System]
        );
        assert_eq!(route(RunMode::Fullstack, ProcessRole::Frontend), &[Frontend, System]);
        assert!(route(RunMode::FrontendOnly, ProcessRole::Backend).is_empty());
        assert!(route(RunMode::BackendOnly, ProcessRole::Frontend).is_empty());
        assert_eq!(route(RunMode::BackendOnly, ProcessRole::Backend), &[Backend, System]);
    }

    #[test]
    fn events_keep_their_origin_tag_when_mirrored() {
        let router = LogRouter::new(100);
        let backend = router.tap(1, RunMode::Fullstack, ProcessRole::Backend).unwrap();
        backend(OutputLine {
            stream: OutputStream::Stdout,
            text: "B1".into(),
        });
        let frontend_view = router.logs(1, LogRole::Frontend);
        assert_eq!(frontend_view.len(), 1);
        assert_eq!(frontend_view[0].role, LogRole::Backend);
    }

    #[test]
    fn no_tap_for_a_role_the_mode_excludes() {
        let router = LogRouter::new(100);
        let taps = router.taps(1, RunMode::FrontendOnly);
        assert!(taps.frontend.is_some());
        assert!(taps.backend.is_none());
    }

    #[test]
    fn system_lines_only_reach_the_system_sink() {
        let router = LogRouter::new(100);
        router.system(3, "build started");
        assert_eq!(router.logs(3, LogRole::System)[0].text, "build started");
        assert!(router.logs(3, LogRole::Frontend).is_empty());
    }

    #[test]
    fn clear_drops_only_that_app() {
        let router = LogRouter::new(100);
        router.system(1, "a");
        router.system(2, "b");
        router.clear(1);
        assert!(router.logs(1, LogRole::System).is_empty());
        assert_eq!(router.logs(2, LogRole::System).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follow_has_no_gaps_under_concurrent_producers() {
        use futures::StreamExt;

        for _ in 0..20 {
            let router = LogRouter::new(1000);
            let taps = [ProcessRole::Backend, ProcessRole::Frontend, ProcessRole::Backend]
                .map(|role| router.tap(1, RunMode::Fullstack, role).unwrap());
            let stream = router.follow(1, LogRole::Frontend);

            let producers: Vec<_> = taps
                .into_iter()
                .enumerate()
                .map(|(n, tap)| {
                    std::thread::spawn(move || {
                        for i in 0..100 {
                            tap(OutputLine {
                                stream: OutputStream::Stdout,
                                text: format!("{n}-{i}"),
                            });
                        }
                    })
                })
                .collect();

            let seqs: Vec<u64> = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                stream.take(300).map(|e| e.seq).collect::<Vec<_>>(),
            )
            .await
            .expect("follow delivered every event");
            for producer in producers {
                producer.join().unwrap();
            }
            assert_eq!(seqs, (1..=300).collect::<Vec<_>>());
        }
    }

    #[test]
    fn parses_role_names() {
        assert_eq!("frontend".parse::<LogRole>().unwrap(), LogRole::Frontend);
        assert!("client".parse::<LogRole>().is_err());
    }
}
