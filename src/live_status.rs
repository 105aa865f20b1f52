use crate::processor::StreamProcessor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Periodically written snapshot of a running session
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    // Acquisition
    pub chunks_processed: u64,
    pub chunks_rejected: u64,
    pub samples_processed: u64,
    pub jitter_events: u64,
    pub buffered_samples: usize,
    // Calibration
    pub calibration_phase: String,
    pub body_weight_n: Option<f64>,
    // Jumps
    pub jumps_detected: u32,
    pub jumps_analyzed: u64,
    pub braking_patches: u64,
    pub pending_braking_patches: usize,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            chunks_processed: 0,
            chunks_rejected: 0,
            samples_processed: 0,
            jitter_events: 0,
            buffered_samples: 0,
            calibration_phase: "WAITING".to_string(),
            body_weight_n: None,
            jumps_detected: 0,
            jumps_analyzed: 0,
            braking_patches: 0,
            pending_braking_patches: 0,
        }
    }

    /// Refresh every field from the processor
    pub fn update(&mut self, processor: &StreamProcessor, uptime_seconds: u64) {
        let stats = processor.stats();
        self.timestamp = current_timestamp();
        self.uptime_seconds = uptime_seconds;
        self.chunks_processed = stats.chunks_processed;
        self.chunks_rejected = stats.chunks_rejected;
        self.samples_processed = stats.samples_processed;
        self.jitter_events = stats.jitter_events;
        self.buffered_samples = processor.buffered_samples();
        self.calibration_phase = processor.calibration_phase().as_str().to_string();
        self.body_weight_n = processor.body_weight();
        self.jumps_detected = processor.jump_count();
        self.jumps_analyzed = stats.jumps_analyzed;
        self.braking_patches = stats.braking_patches;
        self.pending_braking_patches = processor.pending_tasks().len();
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlateConfig;
    use ndarray::Array2;

    #[test]
    fn test_update_and_save() {
        let mut config = PlateConfig::default();
        config.acquisition.chunk_size = 100;
        let mut processor = StreamProcessor::new(&config).unwrap();
        let chunk = Array2::<f64>::zeros((100, 4));
        processor.process_chunk(chunk.view(), 0.1);
        processor.process_chunk(Array2::<f64>::zeros((100, 2)).view(), 0.2);

        let mut status = SessionStatus::new();
        status.update(&processor, 3);
        assert_eq!(status.chunks_processed, 1);
        assert_eq!(status.chunks_rejected, 1);
        assert_eq!(status.buffered_samples, 100);
        assert_eq!(status.calibration_phase, processor.calibration_phase().as_str());
        assert_eq!(status.body_weight_n, None);

        let path = std::env::temp_dir().join(format!("plate_status_{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        status.save(&path).unwrap();
        let back: SessionStatus = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.uptime_seconds, 3);
        assert_eq!(back.chunks_processed, 1);
        let _ = fs::remove_file(&path);
    }
}
