//! In-process telemetry sink. The runner's transport is out of scope; tests
//! and the control channel read records from here.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    NodeExecutionStarted {
        composition: String,
        node: String,
    },
    NodeExecutionFinished {
        composition: String,
        node: String,
    },
    InputPortsUpdated {
        composition: String,
        port: String,
        received_event: bool,
        received_data: bool,
        summary: Option<String>,
    },
    OutputPortsUpdated {
        composition: String,
        port: String,
        sent_event: bool,
        sent_data: bool,
        summary: Option<String>,
    },
    PublishedOutputPortsUpdated {
        composition: String,
        port: String,
        sent_data: bool,
        summary: Option<String>,
    },
    EventFinished {
        composition: String,
        event_id: u64,
    },
    EventDropped {
        composition: String,
        port: String,
    },
    Error {
        composition: String,
        message: String,
    },
}

/// Collects telemetry records; waiters are woken on every send.
pub struct TelemetrySink {
    records: Mutex<Vec<TelemetryEvent>>,
    cv: Condvar,
}

impl TelemetrySink {
    pub fn new() -> Self {
        TelemetrySink { records: Mutex::new(Vec::new()), cv: Condvar::new() }
    }

    pub fn send(&self, event: TelemetryEvent) {
        self.records.lock().push(event);
        self.cv.notify_all();
    }

    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.records.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Block until the predicate holds over the record list, or time out.
    /// Returns whether the predicate held.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[TelemetryEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock();
        while !predicate(&records) {
            if self.cv.wait_until(&mut records, deadline).timed_out() {
                return predicate(&records);
            }
        }
        true
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_sees_later_records() {
        let sink = std::sync::Arc::new(TelemetrySink::new());
        let sink2 = sink.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sink2.send(TelemetryEvent::EventFinished { composition: "Top".into(), event_id: 7 });
        });
        let found = sink.wait_for(Duration::from_secs(2), |records| {
            records
                .iter()
                .any(|r| matches!(r, TelemetryEvent::EventFinished { event_id: 7, .. }))
        });
        assert!(found);
    }
}
