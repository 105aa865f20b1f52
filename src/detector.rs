use crate::buffer::BufferManager;
use crate::config::DetectionConfig;
use crate::types::{mean, whole_samples, FlightEvent, ProcessorEvent};
use log::{debug, info};

/// Real-time takeoff/landing detection on the summed force.
///
/// Hysteresis by persistence: takeoff needs every one of the last
/// `min_flight` samples below threshold, landing every one of the last
/// `min_contact` samples at or above it.
pub struct JumpDetector {
    config: DetectionConfig,
    sample_rate: f64,
    in_flight: bool,
    last_takeoff_index: Option<usize>,
    jump_counter: u32,
}

impl JumpDetector {
    pub fn new(config: &DetectionConfig, sample_rate: f64) -> Self {
        JumpDetector {
            config: config.clone(),
            sample_rate,
            in_flight: false,
            last_takeoff_index: None,
            jump_counter: 0,
        }
    }

    pub fn reset(&mut self) {
        self.in_flight = false;
        self.last_takeoff_index = None;
        self.jump_counter = 0;
    }

    /// Persistence requirements (flight, contact) for the rate seen in `chunk_time`
    pub fn required_samples(&self, chunk_time: &[f64]) -> (usize, usize) {
        let mut min_flight = self.config.min_flight_samples;
        let mut min_contact = self.config.min_contact_samples;

        if chunk_time.len() > 1 {
            let diffs: Vec<f64> = chunk_time.windows(2).map(|w| w[1] - w[0]).collect();
            let dt = mean(&diffs).unwrap_or(0.0);
            let rate = if dt > 0.0 { 1.0 / dt } else { self.sample_rate };
            min_flight = min_flight.max(whole_samples(self.config.min_flight_time_s, rate));
            min_contact = min_contact.max(whole_samples(self.config.min_contact_time_s, rate));
        }
        (min_flight, min_contact)
    }

    /// Inspect the buffer after a chunk was appended. `chunk_time` holds the
    /// timestamps of that chunk. Returns a completed flight when a landing is
    /// confirmed after a recorded takeoff.
    pub fn process_chunk(
        &mut self,
        chunk_time: &[f64],
        buffer: &BufferManager,
        events: &mut Vec<ProcessorEvent>,
    ) -> Option<FlightEvent> {
        let (min_flight, min_contact) = self.required_samples(chunk_time);
        let history = min_flight.max(min_contact) * 3;
        let recent = buffer.get_summed_force_history(history)?;
        let current_index = buffer.total_appended().checked_sub(1)?;
        let threshold = self.config.flight_threshold_n;

        let last = *recent.last()?;
        let below = last < threshold;

        if !self.in_flight {
            if below {
                debug!("[detector] potential takeoff: {:.2} N < {:.2} N", last, threshold);
            }
            let tail = &recent[recent.len() - min_flight..];
            if below && tail.iter().all(|&f| f < threshold) {
                self.in_flight = true;
                let offset = first_run_below(&recent, threshold, min_flight)
                    .unwrap_or(recent.len() - min_flight);
                let takeoff = current_index + 1 - recent.len() + offset;
                self.last_takeoff_index = Some(takeoff);

                info!("[detector] takeoff at sample {}", takeoff);
                events.push(ProcessorEvent::Status(format!(
                    "Takeoff detected! Force: {:.2}N",
                    tail[0]
                )));
            }
            return None;
        }

        if !below {
            debug!("[detector] potential landing: {:.2} N >= {:.2} N", last, threshold);
        }
        let tail = &recent[recent.len() - min_contact..];
        if below || !tail.iter().all(|&f| f >= threshold) {
            return None;
        }

        let landing = current_index + 1 - min_contact;
        self.in_flight = false;
        self.jump_counter += 1;
        events.push(ProcessorEvent::Status(format!(
            "Landing detected! Force: {:.2}N. Analyzing jump.",
            tail[0]
        )));

        let takeoff = self.last_takeoff_index.take()?;
        info!(
            "[detector] jump #{}: takeoff {} landing {}",
            self.jump_counter, takeoff, landing
        );
        Some(FlightEvent {
            jump_number: self.jump_counter,
            takeoff_index: takeoff,
            landing_index: landing,
        })
    }

    pub fn jump_count(&self) -> u32 {
        self.jump_counter
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Offset of the first run of at least `len` consecutive values below `threshold`
fn first_run_below(values: &[f64], threshold: f64, len: usize) -> Option<usize> {
    let mut run_start = None;
    for (i, &v) in values.iter().enumerate() {
        if v < threshold {
            let start = *run_start.get_or_insert(i);
            if i + 1 - start >= len {
                return Some(start);
            }
        } else {
            run_start = None;
        }
    }
    None
}
