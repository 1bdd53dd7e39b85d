use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;

use super::{LogEvent, LogRole};
use crate::AppId;
use crate::kernel::OutputStream;

/// Bounded, append-only buffer of events for one `(app, role)` pair.
///
/// Appends take a short std mutex around a non-blocking broadcast send, so
/// a slow or absent reader can never stall the producing process.
#[derive(Debug)]
pub struct LogSink {
    inner: Mutex<SinkState>,
    capacity: usize,
    tx: broadcast::Sender<LogEvent>,
}

#[derive(Debug)]
struct SinkState {
    events: VecDeque<LogEvent>,
    next_seq: u64,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity.min(1024));
        Self {
            inner: Mutex::new(SinkState {
                events: VecDeque::new(),
                next_seq: 1,
            }),
            capacity,
            tx,
        }
    }

    pub(crate) fn append(
        &self,
        app_id: AppId,
        role: LogRole,
        stream: OutputStream,
        text: &str,
    ) -> LogEvent {
        let mut state = self.lock();
        let event = LogEvent {
            seq: state.next_seq,
            app_id,
            role,
            stream,
            text: text.to_owned(),
            timestamp: Utc::now(),
        };
        state.next_seq += 1;
        state.events.push_back(event.clone());
        while state.events.len() > self.capacity {
            state.events.pop_front();
        }
        // Sent under the lock so subscribers see events in sequence order.
        // No receivers is the common case.
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Events with `seq > after`, for cursor-based polling.
    pub fn since(&self, after: u64) -> Vec<LogEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
