use crate::error::{PlateError, PlateResult};
use crate::types::whole_samples;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// DAQ and plate hardware parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sample_rate_hz: f64,
    pub num_channels: usize,
    /// Samples per delivered chunk (nominal)
    pub chunk_size: usize,
    /// Load-cell amplifier gain, Newtons per Volt
    pub n_per_volt: f64,
    pub buffer_max_duration_s: f64,
    pub timing_jitter_threshold_ms: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1000.0,
            num_channels: 4,
            chunk_size: 500,
            n_per_volt: 327.0,
            buffer_max_duration_s: 300.0,
            timing_jitter_threshold_ms: 5.0,
        }
    }
}

/// Body-weight calibration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Mean chunk force above which someone is standing on the plate
    pub person_present_threshold_n: f64,
    pub stability_std_threshold_n: f64,
    pub stability_min_chunks: usize,
    /// Number of most recent chunks the stability check looks at
    pub stability_window_chunks: usize,
    pub calibration_duration_s: f64,
    pub low_body_weight_warning_n: f64,
    pub ready_body_weight_n: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            person_present_threshold_n: 200.0,
            stability_std_threshold_n: 10.0,
            stability_min_chunks: 3,
            stability_window_chunks: 10,
            calibration_duration_s: 3.0,
            low_body_weight_warning_n: 200.0,
            ready_body_weight_n: 100.0,
        }
    }
}

/// Real-time takeoff/landing detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Summed force below which the plate is considered unloaded
    pub flight_threshold_n: f64,
    pub min_flight_samples: usize,
    pub min_contact_samples: usize,
    pub min_flight_time_s: f64,
    pub min_contact_time_s: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            flight_threshold_n: 20.0,
            min_flight_samples: 20,
            min_contact_samples: 10,
            min_flight_time_s: 0.05,
            min_contact_time_s: 0.02,
        }
    }
}

/// Post-jump metric computation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub gravity: f64,
    pub filter_order: usize,
    pub filter_cutoff_hz: f64,
    /// Filtered-signal level used to anchor the landing search
    pub landing_anchor_threshold_n: f64,
    pub max_flight_time_s: f64,
    pub pre_takeoff_window_s: f64,
    pub braking_window_s: f64,
    pub braking_patch_delay_s: f64,
    pub braking_patch_window_s: f64,
    pub onset_sd_multiplier: f64,
    pub onset_fallback_std_n: f64,
    pub onset_search_guard_s: f64,
    pub landing_search_window_s: f64,
    pub landing_min_gap_s: f64,
    /// Manual flight fallback uses max(flight threshold, this fraction of body weight)
    pub fallback_threshold_fraction: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            filter_order: 4,
            filter_cutoff_hz: 50.0,
            landing_anchor_threshold_n: 50.0,
            max_flight_time_s: 0.8,
            pre_takeoff_window_s: 1.0,
            braking_window_s: 0.5,
            braking_patch_delay_s: 0.3,
            braking_patch_window_s: 0.3,
            onset_sd_multiplier: 5.0,
            onset_fallback_std_n: 5.0,
            onset_search_guard_s: 0.1,
            landing_search_window_s: 0.2,
            landing_min_gap_s: 0.05,
            fallback_threshold_fraction: 0.2,
        }
    }
}

/// Session-wide configuration, built once and shared read-only by every component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateConfig {
    pub acquisition: AcquisitionConfig,
    pub calibration: CalibrationConfig,
    pub detection: DetectionConfig,
    pub analysis: AnalysisConfig,
}

impl PlateConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PlateResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: PlateConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PlateResult<()> {
        let acq = &self.acquisition;
        if !(acq.sample_rate_hz > 0.0) {
            return Err(invalid("sample_rate_hz must be positive"));
        }
        if acq.num_channels == 0 {
            return Err(invalid("num_channels must be at least 1"));
        }
        if acq.chunk_size == 0 {
            return Err(invalid("chunk_size must be at least 1"));
        }
        if !(acq.n_per_volt > 0.0) {
            return Err(invalid("n_per_volt must be positive"));
        }
        if !(acq.buffer_max_duration_s > 0.0) {
            return Err(invalid("buffer_max_duration_s must be positive"));
        }

        let cal = &self.calibration;
        if cal.stability_min_chunks == 0 || cal.stability_window_chunks < cal.stability_min_chunks {
            return Err(invalid(
                "stability_window_chunks must be >= stability_min_chunks >= 1",
            ));
        }
        if !(cal.calibration_duration_s > 0.0) {
            return Err(invalid("calibration_duration_s must be positive"));
        }

        let det = &self.detection;
        if det.min_flight_samples == 0 || det.min_contact_samples == 0 {
            return Err(invalid("minimum flight/contact sample counts must be at least 1"));
        }

        let ana = &self.analysis;
        if ana.filter_order == 0 {
            return Err(invalid("filter_order must be at least 1"));
        }
        // cutoffs at or above Nyquist are clamped by the analyzer
        if !(ana.filter_cutoff_hz > 0.0) {
            return Err(invalid("filter_cutoff_hz must be positive"));
        }
        if !(ana.gravity > 0.0) {
            return Err(invalid("gravity must be positive"));
        }
        Ok(())
    }

    /// Number of samples spanning `seconds` at the nominal sample rate
    pub fn samples_for(&self, seconds: f64) -> usize {
        whole_samples(seconds, self.acquisition.sample_rate_hz)
    }
}

fn invalid(msg: &str) -> PlateError {
    PlateError::InvalidConfig(msg.to_string())
}
