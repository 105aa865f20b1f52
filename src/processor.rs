use crate::analyzer::JumpAnalyzer;
use crate::buffer::BufferManager;
use crate::calibration::CalibrationManager;
use crate::config::PlateConfig;
use crate::detector::JumpDetector;
use crate::error::PlateResult;
use crate::live_status::current_timestamp;
use crate::types::{max_of, CalibrationPhase, FlightEvent, JumpResult, ProcessorEvent, SessionData};
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A braking-peak computation waiting for enough post-landing data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrakingTask {
    pub jump_number: u32,
    /// Absolute sample index of landing
    pub landing_index: usize,
    pub landing_time: f64,
    /// Runs once the newest buffered timestamp reaches this time
    pub due_time: f64,
}

/// Running counters for the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub chunks_processed: u64,
    pub chunks_rejected: u64,
    pub samples_processed: u64,
    pub jitter_events: u64,
    pub jumps_analyzed: u64,
    pub braking_patches: u64,
    pub braking_cancelled: u64,
}

/// Streaming pipeline: raw voltage chunks in, ordered events out.
///
/// Everything runs on the caller's thread; a chunk is fully handled
/// (including any due braking patches) before the next one is accepted.
pub struct StreamProcessor {
    config: PlateConfig,
    zero_offset_v: Array1<f64>,
    buffer: BufferManager,
    calibration: CalibrationManager,
    detector: JumpDetector,
    analyzer: JumpAnalyzer,
    last_arrival: Option<f64>,
    pending: VecDeque<BrakingTask>,
    stats: ProcessorStats,
}

impl StreamProcessor {
    pub fn new(config: &PlateConfig) -> PlateResult<Self> {
        config.validate()?;
        let acq = &config.acquisition;
        Ok(StreamProcessor {
            config: config.clone(),
            zero_offset_v: Array1::zeros(acq.num_channels),
            buffer: BufferManager::new(acq),
            calibration: CalibrationManager::new(&config.calibration),
            detector: JumpDetector::new(&config.detection, acq.sample_rate_hz),
            analyzer: JumpAnalyzer::new(config)?,
            last_arrival: None,
            pending: VecDeque::new(),
            stats: ProcessorStats::default(),
        })
    }

    /// Install per-channel zero offsets (V). A wrong-length vector is rejected
    /// and the previous offsets stay in place.
    pub fn set_zero_offset(&mut self, offset_v: &[f64]) -> Vec<ProcessorEvent> {
        if offset_v.len() != self.config.acquisition.num_channels {
            warn!("[processor] rejected zero offset of length {}", offset_v.len());
            return vec![ProcessorEvent::Status(format!(
                "Invalid offset voltages received. Shape: ({},)",
                offset_v.len()
            ))];
        }
        self.zero_offset_v = Array1::from(offset_v.to_vec());
        let shown: Vec<String> = offset_v.iter().map(|v| format!("{:.3}", v)).collect();
        vec![ProcessorEvent::Status(format!(
            "Zero offset updated: [{}] V",
            shown.join(", ")
        ))]
    }

    /// Average an unloaded raw block per channel and use it as the zero offset
    pub fn tare(&mut self, raw: ArrayView2<f64>) -> Vec<ProcessorEvent> {
        if raw.ncols() != self.config.acquisition.num_channels {
            return vec![invalid_chunk(&raw)];
        }
        match raw.mean_axis(Axis(0)) {
            Some(offsets) => self.set_zero_offset(&offsets.to_vec()),
            None => vec![ProcessorEvent::Status("Tare failed: empty chunk".to_string())],
        }
    }

    /// Clear all session state before a new acquisition
    pub fn reset(&mut self) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();
        self.buffer.reset();
        self.calibration.reset(&mut events);
        self.detector.reset();
        self.pending.clear();
        self.last_arrival = None;
        self.stats = ProcessorStats::default();
        events.push(ProcessorEvent::Status("Data buffers and jump state cleared.".to_string()));
        events
    }

    /// End of acquisition: pending braking patches are dropped
    pub fn stop(&mut self) -> Vec<ProcessorEvent> {
        let cancelled = self.pending.len();
        self.pending.clear();
        self.stats.braking_cancelled += cancelled as u64;
        info!("[processor] stopped, {} braking patch(es) cancelled", cancelled);
        vec![ProcessorEvent::Status(format!(
            "Acquisition stopped; {} pending braking-peak computation(s) cancelled",
            cancelled
        ))]
    }

    /// Process a chunk stamped with the current wall clock
    pub fn process_chunk_now(&mut self, raw: ArrayView2<f64>) -> Vec<ProcessorEvent> {
        self.process_chunk(raw, current_timestamp())
    }

    /// Process one raw `(samples, channels)` voltage chunk that arrived at `arrival_time` (s)
    pub fn process_chunk(&mut self, raw: ArrayView2<f64>, arrival_time: f64) -> Vec<ProcessorEvent> {
        let num_channels = self.config.acquisition.num_channels;
        let n_per_volt = self.config.acquisition.n_per_volt;
        if raw.ncols() != num_channels || raw.nrows() == 0 {
            self.stats.chunks_rejected += 1;
            warn!("[processor] rejected chunk of shape {:?}", raw.dim());
            return vec![invalid_chunk(&raw)];
        }

        let n = raw.nrows();
        let time = self.chunk_timestamps(n, arrival_time);

        let mut forces = raw.to_owned();
        forces -= &self.zero_offset_v;
        forces *= n_per_volt;
        let summed = forces.sum_axis(Axis(1)).to_vec();

        let mut events = vec![ProcessorEvent::ForceData {
            time: time.clone(),
            forces: forces.clone(),
        }];

        if let Err(e) = self.buffer.append_chunk(&time, forces.view()) {
            self.stats.chunks_rejected += 1;
            events.push(ProcessorEvent::Status(format!("Chunk not buffered: {}", e)));
            return events;
        }
        self.stats.chunks_processed += 1;
        self.stats.samples_processed += n as u64;

        self.run_due_braking_tasks(&mut events);

        self.calibration
            .process_chunk(&time, &summed, self.buffer.total_appended(), &mut events);

        if self.calibration.is_ready_for_jump() {
            if let Some(flight) = self.detector.process_chunk(&time, &self.buffer, &mut events) {
                self.calibration.set_completed();
                self.on_jump_detected(flight, &mut events);
            }
        }
        events
    }

    /// Per-sample timestamps spread evenly between the previous and current arrival
    fn chunk_timestamps(&mut self, n: usize, arrival_time: f64) -> Vec<f64> {
        let acq = &self.config.acquisition;
        let nominal = n as f64 / acq.sample_rate_hz;

        let (prev, now) = match self.last_arrival {
            Some(prev) => {
                let interval = arrival_time - prev;
                if ((interval - nominal) * 1000.0).abs() > acq.timing_jitter_threshold_ms {
                    self.stats.jitter_events += 1;
                    warn!(
                        "[processor] chunk interval {:.1} ms vs nominal {:.1} ms",
                        interval * 1000.0,
                        nominal * 1000.0
                    );
                }
                (prev, arrival_time.max(prev))
            }
            None => (arrival_time - nominal, arrival_time),
        };
        self.last_arrival = Some(now);

        (0..n)
            .map(|i| prev + (now - prev) * (i + 1) as f64 / n as f64)
            .collect()
    }

    fn on_jump_detected(&mut self, flight: FlightEvent, events: &mut Vec<ProcessorEvent>) {
        let ana = &self.config.analysis;
        let jump_number = flight.jump_number;

        let start = match self.buffer.time_at(flight.takeoff_index) {
            Some(t) => self
                .buffer
                .index_nearest_time(t - ana.pre_takeoff_window_s)
                .unwrap_or(self.buffer.first_index()),
            None => flight
                .takeoff_index
                .saturating_sub(self.config.samples_for(ana.pre_takeoff_window_s)),
        };
        let (seg_time, seg_force) = self
            .buffer
            .summed_range(start, flight.landing_index + 1)
            .unwrap_or_default();
        let seg_start = start.max(self.buffer.first_index());

        let Some(snapshot) = self.calibration.snapshot() else {
            events.push(ProcessorEvent::JumpResult(JumpResult::note_only(
                jump_number,
                "Body weight not calibrated.",
            )));
            return;
        };

        let analysis = self.analyzer.analyze(jump_number, &seg_time, &seg_force, &snapshot);
        let mut result = analysis.result;
        // filled in later by the braking patch
        result.peak_braking_force_n = Some(0.0);
        self.stats.jumps_analyzed += 1;

        if let Some(ft) = result.flight_time_s {
            info!("[processor] jump #{}: flight {:.3} s", jump_number, ft);
        }
        events.push(ProcessorEvent::JumpResult(result));
        if let Some(markers) = analysis.markers {
            events.push(ProcessorEvent::EventMarkers(markers));
        }

        let landing_index = analysis
            .landing_offset
            .map(|off| seg_start + off)
            .unwrap_or(flight.landing_index);
        let Some(landing_time) = self.buffer.time_at(landing_index) else {
            events.push(ProcessorEvent::Status(format!(
                "Braking peak for Jump #{} unavailable: landing not buffered",
                jump_number
            )));
            return;
        };

        let delay = self.config.analysis.braking_patch_delay_s;
        self.pending.push_back(BrakingTask {
            jump_number,
            landing_index,
            landing_time,
            due_time: landing_time + delay,
        });
        events.push(ProcessorEvent::Status(format!(
            "Scheduling braking-peak calc in {} ms",
            (delay * 1000.0).round() as u64
        )));
    }

    fn run_due_braking_tasks(&mut self, events: &mut Vec<ProcessorEvent>) {
        let Some(latest) = self.buffer.latest_time() else {
            return;
        };
        while self.pending.front().map_or(false, |t| t.due_time <= latest) {
            if let Some(task) = self.pending.pop_front() {
                self.compute_braking_peak(task, events);
            }
        }
    }

    fn compute_braking_peak(&mut self, task: BrakingTask, events: &mut Vec<ProcessorEvent>) {
        if task.landing_index < self.buffer.first_index() {
            warn!("[processor] landing of jump #{} already evicted", task.jump_number);
            events.push(ProcessorEvent::Status(format!(
                "Braking peak for Jump #{} unavailable: data no longer buffered",
                task.jump_number
            )));
            return;
        }

        let window_end_time = task.landing_time + self.config.analysis.braking_patch_window_s;
        let end = self
            .buffer
            .index_nearest_time(window_end_time)
            .unwrap_or(task.landing_index);
        let peak = self
            .buffer
            .summed_range(task.landing_index, end)
            .and_then(|(_, force)| max_of(&force))
            .unwrap_or(0.0);

        self.stats.braking_patches += 1;
        debug!("[processor] braking peak jump #{}: {:.2} N", task.jump_number, peak);
        events.push(ProcessorEvent::Status(format!(
            "Computed braking peak for Jump #{}: {:.2} N",
            task.jump_number, peak
        )));
        events.push(ProcessorEvent::BrakingPeak {
            jump_number: task.jump_number,
            peak_braking_force_n: peak,
        });
    }

    pub fn get_full_data(&self) -> Option<SessionData> {
        self.buffer.get_full_data()
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub fn body_weight(&self) -> Option<f64> {
        self.calibration.body_weight()
    }

    pub fn jump_count(&self) -> u32 {
        self.detector.jump_count()
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.get_buffer_size()
    }

    pub fn pending_tasks(&self) -> &VecDeque<BrakingTask> {
        &self.pending
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn config(&self) -> &PlateConfig {
        &self.config
    }
}

fn invalid_chunk(raw: &ArrayView2<f64>) -> ProcessorEvent {
    let (rows, cols) = raw.dim();
    ProcessorEvent::Status(format!(
        "Invalid raw data chunk received. Shape: ({}, {})",
        rows, cols
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventMarkers;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    const CHUNK: usize = 100;
    const N_PER_VOLT: f64 = 327.0;

    fn config() -> PlateConfig {
        let mut config = PlateConfig::default();
        config.acquisition.chunk_size = CHUNK;
        config
    }

    /// Off the plate for 0.5 s, standing at 700 ± 2 N, a 300 ms flight at
    /// 5.0 s and a 1500 N landing impact lasting 50 ms
    fn plate_force(s: usize) -> f64 {
        let sway = if s % 2 == 0 { 2.0 } else { -2.0 };
        match s {
            0..=499 => 0.0,
            5000..=5299 => 0.0,
            5300..=5349 => 1500.0,
            _ => 700.0 + sway,
        }
    }

    fn raw_chunk(k: usize, force: impl Fn(usize) -> f64) -> Array2<f64> {
        Array2::from_shape_fn((CHUNK, 4), |(r, _)| force(k * CHUNK + r) / 4.0 / N_PER_VOLT)
    }

    fn arrival(k: usize) -> f64 {
        (k + 1) as f64 * 0.1
    }

    /// Feed `chunks` chunks, returning each chunk's events
    fn run(proc: &mut StreamProcessor, chunks: std::ops::Range<usize>) -> Vec<Vec<ProcessorEvent>> {
        chunks
            .map(|k| proc.process_chunk(raw_chunk(k, plate_force).view(), arrival(k)))
            .collect()
    }

    fn find<T>(per_chunk: &[Vec<ProcessorEvent>], pick: impl Fn(&ProcessorEvent) -> Option<T>) -> Vec<(usize, T)> {
        per_chunk
            .iter()
            .enumerate()
            .flat_map(|(k, evs)| evs.iter().filter_map(|e| pick(e)).map(move |v| (k, v)).collect::<Vec<_>>())
            .collect()
    }

    fn results(per_chunk: &[Vec<ProcessorEvent>]) -> Vec<(usize, JumpResult)> {
        find(per_chunk, |e| match e {
            ProcessorEvent::JumpResult(r) => Some(r.clone()),
            _ => None,
        })
    }

    fn braking(per_chunk: &[Vec<ProcessorEvent>]) -> Vec<(usize, (u32, f64))> {
        find(per_chunk, |e| match e {
            ProcessorEvent::BrakingPeak { jump_number, peak_braking_force_n } => {
                Some((*jump_number, *peak_braking_force_n))
            }
            _ => None,
        })
    }

    fn markers(per_chunk: &[Vec<ProcessorEvent>]) -> Vec<(usize, EventMarkers)> {
        find(per_chunk, |e| match e {
            ProcessorEvent::EventMarkers(m) => Some(m.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_timestamps_span_arrivals() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        let events = proc.process_chunk(raw_chunk(0, |_| 0.0).view(), 0.1);
        let ProcessorEvent::ForceData { time, forces } = &events[0] else {
            panic!("first event must be force data");
        };
        assert_eq!(time.len(), CHUNK);
        assert_eq!(forces.dim(), (CHUNK, 4));
        assert_abs_diff_eq!(time[0], 0.001, epsilon = 1e-12);
        assert_abs_diff_eq!(time[99], 0.1, epsilon = 1e-12);

        // a late chunk stretches, an early one is clamped to the previous arrival
        let events = proc.process_chunk(raw_chunk(1, |_| 0.0).view(), 0.25);
        let ProcessorEvent::ForceData { time, .. } = &events[0] else { panic!() };
        assert_abs_diff_eq!(time[0], 0.1015, epsilon = 1e-12);
        assert_eq!(proc.stats().jitter_events, 1);

        let events = proc.process_chunk(raw_chunk(2, |_| 0.0).view(), 0.2);
        let ProcessorEvent::ForceData { time, .. } = &events[0] else { panic!() };
        assert!(time.iter().all(|&t| t == 0.25));
    }

    #[test]
    fn test_wall_clock_chunk_ends_at_arrival() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        let before = current_timestamp();
        let events = proc.process_chunk_now(raw_chunk(0, |_| 0.0).view());
        let after = current_timestamp();
        let ProcessorEvent::ForceData { time, .. } = &events[0] else { panic!() };
        let last = *time.last().unwrap();
        assert!(last >= before - 1e-9 && last <= after + 1e-9);
        assert_abs_diff_eq!(time[0], last - 0.099, epsilon = 1e-6);
    }

    #[test]
    fn test_full_session_two_stage_results() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        let per_chunk = run(&mut proc, 0..70);

        let complete = find(&per_chunk, |e| match e {
            ProcessorEvent::CalibrationComplete { body_weight_n } => Some(*body_weight_n),
            _ => None,
        });
        assert_eq!(complete.len(), 1);
        assert_abs_diff_eq!(complete[0].1, 700.0, epsilon = 1e-6);

        let res = results(&per_chunk);
        assert_eq!(res.len(), 1);
        let (result_chunk, r) = &res[0];
        assert_eq!(r.jump_number, 1);
        assert_eq!(r.peak_braking_force_n, Some(0.0));
        assert_abs_diff_eq!(r.flight_time_s.unwrap(), 0.299, epsilon = 1e-3);
        assert_abs_diff_eq!(r.jump_height_flight_m.unwrap(), 0.110, epsilon = 0.002);
        assert!(r.error.is_none());

        let m = markers(&per_chunk);
        assert_eq!(m.len(), 1);
        assert_abs_diff_eq!(m[0].1.takeoff_time, 5.001, epsilon = 2e-3);

        let patches = braking(&per_chunk);
        assert_eq!(patches.len(), 1);
        let (patch_chunk, (jn, peak)) = patches[0];
        assert_eq!(jn, 1);
        assert_abs_diff_eq!(peak, 1500.0, epsilon = 1e-6);
        assert!(patch_chunk > *result_chunk);
        // not before 300 ms of data after landing has been buffered
        assert!(arrival(patch_chunk) >= m[0].1.landing_time + 0.3 - 2e-3);

        assert_eq!(proc.calibration_phase(), CalibrationPhase::Completed);
        assert!(proc.pending_tasks().is_empty());
        assert_eq!(proc.stats().braking_patches, 1);
    }

    #[test]
    fn test_deterministic_replay() {
        let mut a = StreamProcessor::new(&config()).unwrap();
        let mut b = StreamProcessor::new(&config()).unwrap();
        let ea = run(&mut a, 0..70);
        let eb = run(&mut b, 0..70);
        assert_eq!(results(&ea), results(&eb));
        assert_eq!(markers(&ea), markers(&eb));
        assert_eq!(braking(&ea), braking(&eb));
    }

    #[test]
    fn test_stop_cancels_pending_patch() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        let per_chunk = run(&mut proc, 0..54);
        assert_eq!(results(&per_chunk).len(), 1);
        assert_eq!(proc.pending_tasks().len(), 1);

        let events = proc.stop();
        assert!(matches!(&events[0], ProcessorEvent::Status(m) if m.contains("1 pending")));
        assert!(proc.pending_tasks().is_empty());

        let later = run(&mut proc, 54..70);
        assert!(braking(&later).is_empty());
        assert_eq!(proc.stats().braking_cancelled, 1);
    }

    #[test]
    fn test_bad_chunk_is_rejected_and_stream_continues() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        run(&mut proc, 0..3);
        let bad = Array2::<f64>::zeros((CHUNK, 3));
        let events = proc.process_chunk(bad.view(), arrival(3));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProcessorEvent::Status(m) if m == "Invalid raw data chunk received. Shape: (100, 3)"
        ));
        assert_eq!(proc.buffered_samples(), 300);
        assert_eq!(proc.stats().chunks_rejected, 1);

        let events = proc.process_chunk(raw_chunk(3, plate_force).view(), arrival(3));
        assert!(matches!(events[0], ProcessorEvent::ForceData { .. }));
        assert_eq!(proc.buffered_samples(), 400);
    }

    #[test]
    fn test_zero_offset_and_tare() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        let events = proc.set_zero_offset(&[0.1, 0.2]);
        assert!(matches!(&events[0], ProcessorEvent::Status(m) if m.starts_with("Invalid offset")));

        let unloaded = Array2::from_shape_fn((CHUNK, 4), |(_, c)| 0.01 * (c + 1) as f64);
        let events = proc.tare(unloaded.view());
        assert!(matches!(
            &events[0],
            ProcessorEvent::Status(m) if m == "Zero offset updated: [0.010, 0.020, 0.030, 0.040] V"
        ));

        let mut loaded = unloaded.clone();
        loaded += 1.0;
        let events = proc.process_chunk(loaded.view(), 0.1);
        let ProcessorEvent::ForceData { forces, .. } = &events[0] else { panic!() };
        for v in forces.iter() {
            assert_abs_diff_eq!(*v, N_PER_VOLT, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_reset_clears_session() {
        let mut proc = StreamProcessor::new(&config()).unwrap();
        run(&mut proc, 0..54);
        let events = proc.reset();
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::CalibrationStatus { message, countdown_s: 0 } if message == "Step on the force plate"
        )));
        assert_eq!(proc.buffered_samples(), 0);
        assert!(proc.pending_tasks().is_empty());
        assert_eq!(proc.calibration_phase(), CalibrationPhase::Waiting);
        assert_eq!(proc.jump_count(), 0);
        assert!(proc.get_full_data().is_none());
    }

    #[test]
    fn test_evicted_takeoff_falls_back_to_retained_data() {
        let mut cfg = config();
        cfg.acquisition.buffer_max_duration_s = 0.2;
        let mut proc = StreamProcessor::new(&cfg).unwrap();
        let per_chunk = run(&mut proc, 0..70);

        let res = results(&per_chunk);
        assert_eq!(res.len(), 1);
        let note = res[0].1.note().unwrap();
        assert!(note.contains("Searching manually"), "{}", note);
        // landing is gone by the time the patch is due
        assert!(braking(&per_chunk).is_empty());
        let unavailable = find(&per_chunk, |e| match e {
            ProcessorEvent::Status(m) if m.contains("unavailable") => Some(()),
            _ => None,
        });
        assert_eq!(unavailable.len(), 1);
        assert!(proc.pending_tasks().is_empty());
    }

    #[test]
    fn test_small_buffer_still_analyzes() {
        let mut cfg = config();
        cfg.acquisition.buffer_max_duration_s = 2.0;
        let mut proc = StreamProcessor::new(&cfg).unwrap();
        let per_chunk = run(&mut proc, 0..70);
        assert!(proc.buffered_samples() <= 2000);

        let res = results(&per_chunk);
        assert_eq!(res.len(), 1);
        assert_abs_diff_eq!(res[0].1.flight_time_s.unwrap(), 0.299, epsilon = 1e-3);
        assert_eq!(braking(&per_chunk).len(), 1);
    }
}
