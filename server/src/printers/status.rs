use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized printer state, independent of vendor protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Unknown,
    Idle,
    Printing,
    Paused,
    Error,
    Offline,
}

impl PrinterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterState::Unknown => "unknown",
            PrinterState::Idle => "idle",
            PrinterState::Printing => "printing",
            PrinterState::Paused => "paused",
            PrinterState::Error => "error",
            PrinterState::Offline => "offline",
        }
    }
}

/// One complete status observation. Extraction always yields a full
/// record: a field the vendor payload is missing comes back as the
/// neutral default rather than failing the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterStatus {
    pub state: PrinterState,
    pub bed_current: Option<f64>,
    pub bed_target: Option<f64>,
    pub nozzle_current: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub percent_complete: Option<f64>,
    pub current_layer: Option<i64>,
    pub total_layers: Option<i64>,
    pub remaining_minutes: Option<i64>,
    pub elapsed_minutes: Option<i64>,
    pub print_start: Option<DateTime<Utc>>,
    pub estimated_end: Option<DateTime<Utc>>,
    pub current_job_filename: Option<String>,
    pub current_job_file_id: Option<String>,
    pub current_job_has_thumbnail: bool,
    pub last_observed_at: DateTime<Utc>,
}

impl PrinterStatus {
    pub fn offline() -> Self {
        Self::with_state(PrinterState::Offline)
    }

    pub fn with_state(state: PrinterState) -> Self {
        Self {
            state,
            bed_current: None,
            bed_target: None,
            nozzle_current: None,
            nozzle_target: None,
            percent_complete: None,
            current_layer: None,
            total_layers: None,
            remaining_minutes: None,
            elapsed_minutes: None,
            print_start: None,
            estimated_end: None,
            current_job_filename: None,
            current_job_file_id: None,
            current_job_has_thumbnail: false,
            last_observed_at: Utc::now(),
        }
    }
}

fn opt_f64(value: &Value, pointer: &str) -> Option<f64> {
    match value.pointer(pointer) {
        Some(v) => match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => {
                tracing::debug!(pointer, "non-numeric field, using default");
                None
            }
        },
        None => None,
    }
}

fn opt_i64(value: &Value, pointer: &str) -> Option<i64> {
    match value.pointer(pointer) {
        Some(v) => match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => {
                tracing::debug!(pointer, "non-integer field, using default");
                None
            }
        },
        None => None,
    }
}

fn opt_str(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Map a Bambu MQTT report (merged `print` object) to a status record.
pub fn extract_bambu(report: &Value) -> PrinterStatus {
    let state = match opt_str(report, "/print/gcode_state").as_deref() {
        Some("RUNNING") => PrinterState::Printing,
        Some("PAUSE") => PrinterState::Paused,
        Some("IDLE") => PrinterState::Idle,
        _ => PrinterState::Unknown,
    };

    let remaining_minutes = opt_i64(report, "/print/mc_remaining_time");
    let estimated_end = if state == PrinterState::Printing {
        remaining_minutes.map(|m| Utc::now() + Duration::minutes(m))
    } else {
        None
    };
    let print_start = opt_i64(report, "/print/gcode_start_time")
        .filter(|t| *t > 0)
        .and_then(|t| DateTime::from_timestamp(t, 0));

    PrinterStatus {
        state,
        bed_current: opt_f64(report, "/print/bed_temper"),
        bed_target: opt_f64(report, "/print/bed_target_temper"),
        nozzle_current: opt_f64(report, "/print/nozzle_temper"),
        nozzle_target: opt_f64(report, "/print/nozzle_target_temper"),
        percent_complete: opt_f64(report, "/print/mc_percent"),
        current_layer: opt_i64(report, "/print/layer_num"),
        total_layers: opt_i64(report, "/print/total_layer_num"),
        remaining_minutes,
        elapsed_minutes: print_start
            .map(|start| ((Utc::now() - start).num_seconds() / 60).max(0)),
        print_start,
        estimated_end,
        current_job_filename: opt_str(report, "/print/subtask_name"),
        current_job_file_id: None,
        current_job_has_thumbnail: false,
        last_observed_at: Utc::now(),
    }
}

/// Map a PrusaLink `/api/printer` response (and optionally `/api/job`)
/// to a status record.
pub fn extract_prusa(printer: &Value, job: Option<&Value>) -> PrinterStatus {
    let text = opt_str(printer, "/state/text").unwrap_or_default().to_lowercase();
    let state = if text.contains("printing") {
        PrinterState::Printing
    } else if text.contains("paused") {
        PrinterState::Paused
    } else if text.contains("operational") || text.contains("ready") {
        PrinterState::Idle
    } else if text.contains("error") {
        PrinterState::Error
    } else {
        PrinterState::Unknown
    };

    let mut status = PrinterStatus {
        state,
        bed_current: opt_f64(printer, "/temperature/bed/actual"),
        bed_target: opt_f64(printer, "/temperature/bed/target"),
        nozzle_current: opt_f64(printer, "/temperature/extruder/actual"),
        nozzle_target: opt_f64(printer, "/temperature/extruder/target"),
        ..PrinterStatus::with_state(state)
    };

    if let Some(job) = job {
        status.percent_complete = opt_f64(job, "/progress/completion");
        status.remaining_minutes = opt_i64(job, "/progress/printTimeLeft").map(|s| s / 60);
        status.elapsed_minutes = opt_i64(job, "/progress/printTime").map(|s| s / 60);
        status.current_job_filename = opt_str(job, "/job/file/display")
            .or_else(|| opt_str(job, "/job/file/name"));
        if status.state == PrinterState::Printing {
            status.estimated_end = status
                .remaining_minutes
                .map(|m| Utc::now() + Duration::minutes(m));
        }
    }

    status
}

/// Map an OctoPrint `current`/`history` push message to a status record.
pub fn extract_octoprint(current: &Value) -> PrinterStatus {
    let flags = current.pointer("/state/flags");
    let flag = |name: &str| {
        flags
            .and_then(|f| f.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };

    let state = if flag("printing") {
        PrinterState::Printing
    } else if flag("paused") || flag("pausing") {
        PrinterState::Paused
    } else if flag("error") || flag("closedOrError") {
        PrinterState::Error
    } else if flag("operational") || flag("ready") {
        PrinterState::Idle
    } else {
        PrinterState::Unknown
    };

    // Temps arrive as a history array; the last entry is current.
    let temps = current
        .pointer("/temps")
        .and_then(Value::as_array)
        .and_then(|a| a.last());

    let remaining_minutes =
        opt_i64(current, "/progress/printTimeLeft").map(|s| s / 60);
    let estimated_end = if state == PrinterState::Printing {
        remaining_minutes.map(|m| Utc::now() + Duration::minutes(m))
    } else {
        None
    };

    PrinterStatus {
        state,
        bed_current: temps.and_then(|t| opt_f64(t, "/bed/actual")),
        bed_target: temps.and_then(|t| opt_f64(t, "/bed/target")),
        nozzle_current: temps.and_then(|t| opt_f64(t, "/tool0/actual")),
        nozzle_target: temps.and_then(|t| opt_f64(t, "/tool0/target")),
        percent_complete: opt_f64(current, "/progress/completion"),
        current_layer: None,
        total_layers: None,
        remaining_minutes,
        elapsed_minutes: opt_i64(current, "/progress/printTime").map(|s| s / 60),
        print_start: None,
        estimated_end,
        current_job_filename: opt_str(current, "/job/file/display")
            .or_else(|| opt_str(current, "/job/file/name")),
        current_job_file_id: None,
        current_job_has_thumbnail: false,
        last_observed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bambu_running_report_maps_to_printing() {
        let report = json!({
            "print": {
                "gcode_state": "RUNNING",
                "mc_percent": 42,
                "bed_temper": 59.8,
                "nozzle_temper": 215.0,
                "mc_remaining_time": 37,
                "subtask_name": "cube.3mf"
            }
        });
        let status = extract_bambu(&report);

        assert_eq!(status.state, PrinterState::Printing);
        assert_eq!(status.percent_complete, Some(42.0));
        assert_eq!(status.bed_current, Some(59.8));
        assert_eq!(status.nozzle_current, Some(215.0));
        assert_eq!(status.remaining_minutes, Some(37));
        assert_eq!(status.current_job_filename.as_deref(), Some("cube.3mf"));
        assert!(status.estimated_end.is_some());
    }

    #[test]
    fn bambu_unknown_gcode_state_defaults_to_unknown() {
        let report = json!({ "print": { "gcode_state": "FINISH" } });
        assert_eq!(extract_bambu(&report).state, PrinterState::Unknown);
    }

    #[test]
    fn bambu_missing_fields_use_neutral_defaults() {
        let status = extract_bambu(&json!({ "print": {} }));
        assert_eq!(status.state, PrinterState::Unknown);
        assert_eq!(status.bed_current, None);
        assert_eq!(status.percent_complete, None);
        assert_eq!(status.current_job_filename, None);
    }

    #[test]
    fn bambu_malformed_field_types_do_not_fail_extraction() {
        let report = json!({
            "print": {
                "gcode_state": "RUNNING",
                "bed_temper": { "nested": true },
                "mc_percent": "42",
                "mc_remaining_time": []
            }
        });
        let status = extract_bambu(&report);
        assert_eq!(status.state, PrinterState::Printing);
        assert_eq!(status.bed_current, None);
        assert_eq!(status.percent_complete, Some(42.0));
        assert_eq!(status.remaining_minutes, None);
    }

    #[test]
    fn prusa_state_text_is_matched_case_insensitively() {
        let printer = json!({
            "state": { "text": "Printing" },
            "temperature": {
                "bed": { "actual": 60.1, "target": 60.0 },
                "extruder": { "actual": 214.9, "target": 215.0 }
            }
        });
        let status = extract_prusa(&printer, None);
        assert_eq!(status.state, PrinterState::Printing);
        assert_eq!(status.bed_current, Some(60.1));
        assert_eq!(status.nozzle_target, Some(215.0));
    }

    #[test]
    fn prusa_operational_maps_to_idle() {
        let printer = json!({ "state": { "text": "Operational" } });
        assert_eq!(extract_prusa(&printer, None).state, PrinterState::Idle);
        let printer = json!({ "state": { "text": "Ready" } });
        assert_eq!(extract_prusa(&printer, None).state, PrinterState::Idle);
    }

    #[test]
    fn prusa_job_fields_fill_progress() {
        let printer = json!({ "state": { "text": "Printing" } });
        let job = json!({
            "job": { "file": { "name": "benchy.gcode" } },
            "progress": { "completion": 34.5, "printTimeLeft": 1800, "printTime": 600 }
        });
        let status = extract_prusa(&printer, Some(&job));
        assert_eq!(status.percent_complete, Some(34.5));
        assert_eq!(status.remaining_minutes, Some(30));
        assert_eq!(status.elapsed_minutes, Some(10));
        assert_eq!(status.current_job_filename.as_deref(), Some("benchy.gcode"));
    }

    #[test]
    fn octoprint_current_message_maps_flags_and_temps() {
        let current = json!({
            "state": { "text": "Printing", "flags": { "printing": true } },
            "progress": { "completion": 55.0, "printTimeLeft": 120, "printTime": 300 },
            "job": { "file": { "name": "part.gcode" } },
            "temps": [
                { "bed": { "actual": 54.0, "target": 55.0 }, "tool0": { "actual": 200.0, "target": 205.0 } },
                { "bed": { "actual": 55.0, "target": 55.0 }, "tool0": { "actual": 205.0, "target": 205.0 } }
            ]
        });
        let status = extract_octoprint(&current);
        assert_eq!(status.state, PrinterState::Printing);
        // Last temps entry wins.
        assert_eq!(status.bed_current, Some(55.0));
        assert_eq!(status.nozzle_current, Some(205.0));
        assert_eq!(status.percent_complete, Some(55.0));
        assert_eq!(status.remaining_minutes, Some(2));
    }
}
