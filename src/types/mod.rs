pub mod stats;

pub use stats::*;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Timestamps plus per-channel forces copied out of the session buffer
#[derive(Clone, Debug)]
pub struct SessionData {
    pub time: Vec<f64>,
    /// One row per sample, one column per channel (N)
    pub forces: Array2<f64>,
}

impl SessionData {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Vertical force: channels summed per sample
    pub fn summed(&self) -> Vec<f64> {
        self.forces.sum_axis(Axis(1)).to_vec()
    }
}

/// A completed flight confirmed by the real-time detector.
/// Indices are absolute sample indices (see `BufferManager::total_appended`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightEvent {
    pub jump_number: u32,
    pub takeoff_index: usize,
    pub landing_index: usize,
}

/// Time/force coordinates for plotting the key instants of a jump
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMarkers {
    pub jump_number: u32,
    pub onset_time: f64,
    pub onset_force_n: f64,
    pub takeoff_time: f64,
    pub takeoff_force_n: f64,
    pub landing_time: f64,
    pub landing_force_n: f64,
}

/// Metrics for one jump. `None` means "not computed".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JumpResult {
    pub jump_number: u32,
    pub body_weight_n: Option<f64>,
    pub peak_propulsive_force_n: Option<f64>,
    pub peak_braking_force_n: Option<f64>,
    pub flight_time_s: Option<f64>,
    pub jump_height_flight_m: Option<f64>,
    pub jump_height_impulse_m: Option<f64>,
    pub net_impulse_ns: Option<f64>,
    pub takeoff_velocity_ms: Option<f64>,
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl JumpResult {
    /// Result with zeroed force/flight metrics, filled in as analysis progresses
    pub fn zeroed(jump_number: u32) -> Self {
        Self {
            jump_number,
            peak_propulsive_force_n: Some(0.0),
            peak_braking_force_n: Some(0.0),
            flight_time_s: Some(0.0),
            jump_height_flight_m: Some(0.0),
            jump_height_impulse_m: Some(0.0),
            ..Default::default()
        }
    }

    /// Result carrying nothing but a note
    pub fn note_only(jump_number: u32, note: &str) -> Self {
        Self {
            jump_number,
            notes: vec![note.to_string()],
            ..Default::default()
        }
    }

    pub fn note(&self) -> Option<String> {
        let joined = self.notes.join(" ");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Labelled "Jump #N <metric> (<unit>)" mapping for display and export
    pub fn to_report(&self) -> Map<String, Value> {
        let n = self.jump_number;
        let mut report = Map::new();
        let mut put = |label: &str, value: Option<f64>, decimals: i32| {
            if let Some(v) = value {
                report.insert(format!("Jump #{} {}", n, label), json!(round_to(v, decimals)));
            }
        };

        put("Body Weight (N)", self.body_weight_n, 2);
        put("Peak Propulsive Force (N)", self.peak_propulsive_force_n, 2);
        put("Peak Braking Force (N)", self.peak_braking_force_n, 2);
        put("Flight Time (s)", self.flight_time_s, 3);
        put("Jump Height (Flight Time) (m)", self.jump_height_flight_m, 3);
        put("Jump Height (Impulse) (m)", self.jump_height_impulse_m, 3);
        put("Net Impulse (Ns)", self.net_impulse_ns, 2);
        put("Takeoff Velocity (m/s)", self.takeoff_velocity_ms, 3);

        if let Some(note) = self.note() {
            report.insert(format!("Jump #{} Analysis Note", n), json!(note));
        }
        if let Some(err) = &self.error {
            report.insert(format!("Jump #{} Error", n), json!(err));
        }
        report
    }
}

/// Calibration phases of the body-weight state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Waiting,
    WaitingForStability,
    Calibrating,
    Ready,
    Completed,
}

impl CalibrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationPhase::Waiting => "WAITING",
            CalibrationPhase::WaitingForStability => "WAITING_FOR_STABILITY",
            CalibrationPhase::Calibrating => "CALIBRATING",
            CalibrationPhase::Ready => "READY",
            CalibrationPhase::Completed => "COMPLETED",
        }
    }
}

/// Everything the processor tells the presentation layer
#[derive(Clone, Debug)]
pub enum ProcessorEvent {
    /// Every accepted chunk: per-sample timestamps and calibrated per-channel forces
    ForceData { time: Vec<f64>, forces: Array2<f64> },
    Status(String),
    CalibrationStatus { message: String, countdown_s: u32 },
    CalibrationComplete { body_weight_n: f64 },
    /// Immediate metrics; braking peak is 0.0 until patched
    JumpResult(JumpResult),
    /// Deferred braking-peak patch for an already emitted result
    BrakingPeak { jump_number: u32, peak_braking_force_n: f64 },
    EventMarkers(EventMarkers),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_labels_and_rounding() {
        let mut result = JumpResult::zeroed(2);
        result.body_weight_n = Some(701.2345);
        result.flight_time_s = Some(0.299_06);
        result.notes.push(" ".to_string());

        let report = result.to_report();
        assert_eq!(report["Jump #2 Body Weight (N)"], json!(701.23));
        assert_eq!(report["Jump #2 Flight Time (s)"], json!(0.299));
        assert!(!report.contains_key("Jump #2 Net Impulse (Ns)"));
        assert!(!report.contains_key("Jump #2 Analysis Note"));
    }

    #[test]
    fn test_note_only_report() {
        let report = JumpResult::note_only(1, "Not enough data for analysis.").to_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report["Jump #1 Analysis Note"], json!("Not enough data for analysis."));
    }
}
