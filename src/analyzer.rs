use crate::calibration::CalibrationSnapshot;
use crate::config::PlateConfig;
use crate::error::{PlateError, PlateResult};
use crate::filters::ButterworthFilter;
use crate::types::{max_of, nearest_index, trapezoid, whole_samples, EventMarkers, JumpResult};
use log::{debug, warn};

/// A threshold crossing, with its sub-sample position when one could be interpolated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub index: usize,
    pub precise: f64,
    pub interpolated: bool,
}

impl Crossing {
    fn at(index: usize) -> Self {
        Crossing {
            index,
            precise: index as f64,
            interpolated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FlightSearch {
    NoTakeoff,
    TakeoffOnly(Crossing),
    Complete { takeoff: Crossing, landing: Crossing },
}

/// Output of one segment analysis
#[derive(Debug, Clone)]
pub struct JumpAnalysis {
    pub result: JumpResult,
    /// Present only when a full flight (takeoff and landing) was located
    pub markers: Option<EventMarkers>,
    /// Segment-relative landing sample, when found
    pub landing_offset: Option<usize>,
}

/// Post-jump metrics over a bounded segment of timestamps and summed force
pub struct JumpAnalyzer {
    config: PlateConfig,
    filter: ButterworthFilter,
}

impl JumpAnalyzer {
    pub fn new(config: &PlateConfig) -> PlateResult<Self> {
        let rate = config.acquisition.sample_rate_hz;
        let cutoff = config.analysis.filter_cutoff_hz.min(0.99 * rate / 2.0);
        let filter = ButterworthFilter::lowpass(config.analysis.filter_order, cutoff, rate)?;
        Ok(JumpAnalyzer {
            config: config.clone(),
            filter,
        })
    }

    /// Analyze one jump. Never fails: problems end up as notes or in `result.error`.
    pub fn analyze(
        &self,
        jump_number: u32,
        time: &[f64],
        force: &[f64],
        calibration: &CalibrationSnapshot,
    ) -> JumpAnalysis {
        let det = &self.config.detection;
        if time.len() < det.min_contact_samples + det.min_flight_samples {
            return JumpAnalysis {
                result: JumpResult::note_only(jump_number, "Not enough data for analysis."),
                markers: None,
                landing_offset: None,
            };
        }

        let mut result = JumpResult::zeroed(jump_number);
        let outcome = self.analyze_segment(time, force, calibration, &mut result);
        let (markers, landing_offset) = match outcome {
            Ok(found) => found,
            Err(e) => {
                warn!("[analyzer] jump #{} failed: {}", jump_number, e);
                result.error = Some(e.to_string());
                (None, None)
            }
        };

        let note = result.note();
        result.notes = note.into_iter().collect();
        JumpAnalysis {
            result,
            markers,
            landing_offset,
        }
    }

    fn analyze_segment(
        &self,
        time: &[f64],
        force: &[f64],
        calibration: &CalibrationSnapshot,
        result: &mut JumpResult,
    ) -> PlateResult<(Option<EventMarkers>, Option<usize>)> {
        if time.len() != force.len() {
            return Err(PlateError::InsufficientData(format!(
                "{} timestamps for {} force samples",
                time.len(),
                force.len()
            )));
        }
        if force.iter().chain(time.iter()).any(|v| !v.is_finite()) {
            return Err(PlateError::AnalysisFailure("non-finite sample in segment".into()));
        }
        let bw = calibration.body_weight_n;
        if !bw.is_finite() {
            return Err(PlateError::AnalysisFailure("body weight is not finite".into()));
        }

        let ana = &self.config.analysis;
        let filtered = self.filter.filtfilt(force);
        result.body_weight_n = Some(bw);

        let search = self.find_flight_phases(force, &filtered);
        let (takeoff, landing, manual) = match search {
            FlightSearch::Complete { takeoff, landing } => (takeoff, landing, false),
            other => {
                result.notes.push("Incomplete/No flight phase. Searching manually...".into());
                let threshold = self
                    .config
                    .detection
                    .flight_threshold_n
                    .max(bw * ana.fallback_threshold_fraction);
                match manual_flight_detection(&filtered, threshold, self.config.detection.min_flight_samples) {
                    Some((takeoff, landing)) => {
                        debug!("[analyzer] manual flight detection successful");
                        (takeoff, landing, true)
                    }
                    None => {
                        if matches!(other, FlightSearch::TakeoffOnly(_)) {
                            result.notes.push("Takeoff no landing.".into());
                        }
                        return Ok((None, None));
                    }
                }
            }
        };

        result.peak_propulsive_force_n = Some(max_of(&force[..takeoff.index]).unwrap_or(0.0));
        let braking_window = whole_samples(ana.braking_window_s, effective_rate(time, self.rate()));
        let braking_end = (landing.index + braking_window).min(force.len());
        result.peak_braking_force_n = Some(
            force
                .get(landing.index..braking_end)
                .and_then(max_of)
                .unwrap_or(0.0),
        );

        let takeoff_time = crossing_time(&takeoff, time)?;
        let landing_time = crossing_time(&landing, time)?;
        let flight_time = landing_time - takeoff_time;
        if flight_time < self.config.detection.min_flight_time_s || flight_time > ana.max_flight_time_s {
            warn!("[analyzer] flight time {:.3}s outside expected range", flight_time);
            result.notes.push("Flight time outside typical range.".into());
        }
        result.flight_time_s = Some(flight_time);
        result.jump_height_flight_m = Some(ana.gravity * flight_time.powi(2) / 8.0);

        let onset = self.find_movement_start(&filtered, takeoff.index, calibration, time);
        self.impulse_metrics(&filtered, time, onset, takeoff.index, bw, result);

        // crossings from the flight search sit on the threshold by construction
        let threshold = self.config.detection.flight_threshold_n;
        let marker_force = |c: &Crossing| if manual { filtered[c.index] } else { threshold };
        let markers = EventMarkers {
            jump_number: result.jump_number,
            onset_time: time[onset],
            onset_force_n: filtered[onset],
            takeoff_time,
            takeoff_force_n: marker_force(&takeoff),
            landing_time,
            landing_force_n: marker_force(&landing),
        };
        Ok((Some(markers), Some(landing.index)))
    }

    /// Takeoff on the raw signal, landing anchored on the filtered one then
    /// refined back onto the raw threshold crossing
    fn find_flight_phases(&self, raw: &[f64], filtered: &[f64]) -> FlightSearch {
        let threshold = self.config.detection.flight_threshold_n;
        let anchor_level = self.config.analysis.landing_anchor_threshold_n;

        let Some(takeoff_idx) = (1..raw.len()).find(|&i| raw[i - 1] >= threshold && raw[i] < threshold) else {
            return FlightSearch::NoTakeoff;
        };
        let takeoff = interpolate_down(raw, takeoff_idx, threshold);

        let Some(anchor) = (takeoff_idx + 1..filtered.len())
            .find(|&i| filtered[i - 1] < anchor_level && filtered[i] >= anchor_level)
        else {
            return FlightSearch::TakeoffOnly(takeoff);
        };

        let window = whole_samples(self.config.analysis.landing_search_window_s, self.rate())
            .min(anchor - takeoff_idx);
        let min_gap = whole_samples(self.config.analysis.landing_min_gap_s, self.rate());
        let search_start = (takeoff_idx + min_gap).max(anchor - window);
        let rises = |i: usize| i > 0 && i < raw.len() && raw[i - 1] < threshold && raw[i] >= threshold;

        let found = (search_start + 1..=anchor)
            .rev()
            .find(|&i| rises(i))
            .or_else(|| (anchor + 1..=(anchor + window).min(raw.len() - 1)).find(|&i| rises(i)));

        let landing = match found {
            Some(i) => interpolate_up(raw, i, threshold),
            None => Crossing::at(anchor),
        };
        FlightSearch::Complete { takeoff, landing }
    }

    /// Start of the countermovement: first departure below `BW - k·SD`, walked
    /// back to the nearest body-weight crossing
    fn find_movement_start(
        &self,
        filtered: &[f64],
        takeoff_idx: usize,
        calibration: &CalibrationSnapshot,
        time: &[f64],
    ) -> usize {
        if takeoff_idx < 10 {
            return 0;
        }
        let ana = &self.config.analysis;
        let search = &filtered[..takeoff_idx];
        let bw = calibration.body_weight_n;

        let mut search_start = search.len() / 10;
        if let Some(calib_time) = calibration.completion_time {
            if calib_time - time[0] > 0.0 {
                let calib_idx = nearest_index(time, calib_time).unwrap_or(0);
                let guard = whole_samples(ana.onset_search_guard_s, effective_rate(time, self.rate()));
                search_start = (calib_idx + guard).min(search.len() - 1);
            } else {
                search_start = 0;
            }
        }

        let sd = calibration.std_n.unwrap_or(ana.onset_fallback_std_n);
        let level = bw - ana.onset_sd_multiplier * sd;

        let Some(onset) = (search_start..search.len()).find(|&i| search[i] <= level) else {
            return search_start;
        };
        (search_start + 1..=onset)
            .rev()
            .find(|&i| {
                (search[i] <= bw && search[i - 1] > bw) || (search[i] >= bw && search[i - 1] < bw)
            })
            .unwrap_or(onset)
    }

    fn impulse_metrics(
        &self,
        filtered: &[f64],
        time: &[f64],
        onset: usize,
        takeoff_idx: usize,
        bw: f64,
        result: &mut JumpResult,
    ) {
        if takeoff_idx < 10 || onset >= takeoff_idx {
            return;
        }
        let force = &filtered[onset..takeoff_idx];
        let t = &time[onset..takeoff_idx];
        if t.len() <= 10 || bw <= 0.0 {
            return;
        }

        let g = self.config.analysis.gravity;
        let net: Vec<f64> = force.iter().map(|f| f - bw).collect();
        let impulse = trapezoid(&net, t);
        let velocity = impulse / (bw / g);

        if impulse < 0.0 {
            result.notes.push("Negative net impulse.".into());
        }
        result.net_impulse_ns = Some(impulse);
        result.takeoff_velocity_ms = Some(velocity);
        result.jump_height_impulse_m = Some(velocity.powi(2) / (2.0 * g));
    }

    fn rate(&self) -> f64 {
        self.config.acquisition.sample_rate_hz
    }
}

/// Longest region of at least `min_len` samples below `threshold` that ends inside the data
fn manual_flight_detection(
    filtered: &[f64],
    threshold: f64,
    min_len: usize,
) -> Option<(Crossing, Crossing)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;

    for (i, &v) in filtered.iter().enumerate() {
        match (start, v < threshold) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                if i - s >= min_len && best.map_or(true, |(bs, be)| i - s > be - bs) {
                    best = Some((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }
    best.map(|(s, e)| (Crossing::at(s), Crossing::at(e)))
}

/// Downward crossing between `idx - 1` and `idx`
fn interpolate_down(raw: &[f64], idx: usize, threshold: f64) -> Crossing {
    if idx == 0 || idx >= raw.len() || raw[idx - 1] == raw[idx] {
        return Crossing::at(idx);
    }
    let (before, after) = (raw[idx - 1], raw[idx]);
    Crossing {
        index: idx,
        precise: (idx - 1) as f64 + (before - threshold) / (before - after),
        interpolated: true,
    }
}

/// Upward crossing between `idx - 1` and `idx`
fn interpolate_up(raw: &[f64], idx: usize, threshold: f64) -> Crossing {
    if idx == 0 || idx >= raw.len() || raw[idx - 1] == raw[idx] {
        return Crossing::at(idx);
    }
    let (before, after) = (raw[idx - 1], raw[idx]);
    Crossing {
        index: idx,
        precise: (idx - 1) as f64 + (threshold - before) / (after - before),
        interpolated: true,
    }
}

/// Wall-clock time of a fractional sample position, linear between neighbours
pub fn interpolated_time(position: f64, time: &[f64]) -> Option<f64> {
    if time.is_empty() || position < 0.0 || position >= time.len() as f64 {
        return None;
    }
    let floor = position.floor() as usize;
    if floor >= time.len() - 1 {
        return time.last().copied();
    }
    let frac = position - floor as f64;
    Some(time[floor] + frac * (time[floor + 1] - time[floor]))
}

fn crossing_time(crossing: &Crossing, time: &[f64]) -> PlateResult<f64> {
    interpolated_time(crossing.precise, time)
        .or_else(|| time.get(crossing.index).copied())
        .ok_or_else(|| {
            PlateError::AnalysisFailure(format!("crossing index {} outside segment", crossing.index))
        })
}

/// Samples per second actually observed over the segment
fn effective_rate(time: &[f64], nominal: f64) -> f64 {
    match (time.first(), time.last()) {
        (Some(&first), Some(&last)) if time.len() >= 2 && last > first => {
            time.len() as f64 / (last - first)
        }
        _ => nominal,
    }
}
