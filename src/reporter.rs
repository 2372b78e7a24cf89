use crate::types::{EventKind, MonitorEvent};

/// Emit a monitor event as a single JSON line to stdout.
pub fn report_event(event: &MonitorEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

/// Stamp `kind` with the current time and emit it.
pub fn report(kind: EventKind) {
    report_event(&MonitorEvent::now(kind));
}
