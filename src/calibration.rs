use crate::config::CalibrationConfig;
use crate::types::{mean, std_dev, CalibrationPhase, ProcessorEvent};
use log::{info, warn};
use std::collections::VecDeque;

/// Snapshot of the calibration results handed to analysis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSnapshot {
    pub body_weight_n: f64,
    pub std_n: Option<f64>,
    pub completion_time: Option<f64>,
}

/// Body-weight calibration state machine.
///
/// WAITING → WAITING_FOR_STABILITY → CALIBRATING → READY → (jump) → COMPLETED → WAITING
pub struct CalibrationManager {
    config: CalibrationConfig,
    phase: CalibrationPhase,
    start_time: Option<f64>,
    /// Recent chunks seen while waiting for the subject to settle
    stability_chunks: VecDeque<Vec<f64>>,
    /// Every chunk of the running countdown
    calibration_chunks: Vec<Vec<f64>>,
    body_weight_n: Option<f64>,
    body_weight_std_n: Option<f64>,
    completion_time: Option<f64>,
    completion_index: Option<usize>,
}

impl CalibrationManager {
    pub fn new(config: &CalibrationConfig) -> Self {
        CalibrationManager {
            config: config.clone(),
            phase: CalibrationPhase::Waiting,
            start_time: None,
            stability_chunks: VecDeque::with_capacity(config.stability_window_chunks),
            calibration_chunks: Vec::new(),
            body_weight_n: None,
            body_weight_std_n: None,
            completion_time: None,
            completion_index: None,
        }
    }

    /// Back to WAITING with all results cleared
    pub fn reset(&mut self, events: &mut Vec<ProcessorEvent>) {
        self.phase = CalibrationPhase::Waiting;
        self.start_time = None;
        self.stability_chunks.clear();
        self.calibration_chunks.clear();
        self.body_weight_n = None;
        self.body_weight_std_n = None;
        self.completion_time = None;
        self.completion_index = None;

        events.push(countdown("Step on the force plate", 0));
    }

    /// Feed one chunk of summed force. `total_samples` is the absolute sample
    /// count after this chunk was buffered. Returns true on a phase change.
    pub fn process_chunk(
        &mut self,
        time: &[f64],
        summed: &[f64],
        total_samples: usize,
        events: &mut Vec<ProcessorEvent>,
    ) -> bool {
        let (Some(mean_force), Some(&last_time)) = (mean(summed), time.last()) else {
            return false;
        };
        let present = self.config.person_present_threshold_n;

        match self.phase {
            CalibrationPhase::Waiting => {
                if mean_force > present {
                    self.phase = CalibrationPhase::WaitingForStability;
                    self.stability_chunks.clear();
                    self.stability_chunks.push_back(summed.to_vec());
                    info!("[calibration] person detected ({:.1} N)", mean_force);
                    events.push(status("Person detected on force plate. Please stand still."));
                    events.push(countdown("Stand still to begin calibration", 0));
                    return true;
                }
                false
            }

            CalibrationPhase::WaitingForStability => {
                if mean_force < present {
                    self.phase = CalibrationPhase::Waiting;
                    self.stability_chunks.clear();
                    events.push(status("Person stepped off. Step on the plate to begin."));
                    events.push(countdown("Step on force plate to begin test", 0));
                    return true;
                }

                self.stability_chunks.push_back(summed.to_vec());
                while self.stability_chunks.len() > self.config.stability_window_chunks {
                    self.stability_chunks.pop_front();
                }
                if self.stability_chunks.len() < self.config.stability_min_chunks {
                    return false;
                }

                let sd = recent_std(self.stability_chunks.iter(), self.config.stability_window_chunks);
                if sd <= self.config.stability_std_threshold_n {
                    self.phase = CalibrationPhase::Calibrating;
                    self.start_time = Some(last_time);
                    self.calibration_chunks.clear();
                    info!("[calibration] stable (sd {:.2} N), countdown started", sd);
                    events.push(status("Stability detected. Starting bodyweight calibration."));
                    events.push(countdown("Stand still for calibration", self.duration_whole_s()));
                    true
                } else {
                    events.push(countdown("Stand still to begin calibration", 0));
                    false
                }
            }

            CalibrationPhase::Calibrating => {
                self.calibration_chunks.push(summed.to_vec());
                let start = *self.start_time.get_or_insert(last_time);
                let elapsed = last_time - start;
                let remaining = (self.config.calibration_duration_s - elapsed).max(0.0);
                let seconds_left = remaining as u32 + 1;

                if self.calibration_chunks.len() > 1 {
                    let sd = recent_std(
                        self.calibration_chunks.iter(),
                        self.config.stability_window_chunks,
                    );
                    if sd > self.config.stability_std_threshold_n {
                        self.start_time = Some(last_time);
                        self.calibration_chunks.clear();
                        self.calibration_chunks.push(summed.to_vec());
                        warn!("[calibration] movement during countdown (sd {:.2} N), restarting", sd);
                        events.push(status("Please stand still for accurate bodyweight measurement"));
                        events.push(countdown(
                            "Stand still! Restarting calibration",
                            self.duration_whole_s(),
                        ));
                        return false;
                    }
                }

                if seconds_left as f64 <= self.config.calibration_duration_s {
                    events.push(countdown("Stand still for calibration", seconds_left));
                }

                if elapsed >= self.config.calibration_duration_s {
                    self.complete(last_time, total_samples, events);
                    return true;
                }
                false
            }

            // jump detection runs elsewhere while READY
            CalibrationPhase::Ready => false,

            CalibrationPhase::Completed => {
                if mean_force < present {
                    self.phase = CalibrationPhase::Waiting;
                    events.push(status("Ready for next person. Step on the plate to begin."));
                    events.push(countdown("Step on force plate to begin test", 0));
                    return true;
                }
                false
            }
        }
    }

    fn complete(&mut self, last_time: f64, total_samples: usize, events: &mut Vec<ProcessorEvent>) {
        let all: Vec<f64> = self.calibration_chunks.iter().flatten().copied().collect();
        let (Some(bw), Some(sd)) = (mean(&all), std_dev(&all)) else {
            return;
        };
        self.body_weight_n = Some(bw);
        self.body_weight_std_n = Some(sd);

        if bw < self.config.low_body_weight_warning_n {
            warn!("[calibration] low body weight estimate {:.1} N", bw);
            events.push(status(&format!("Warning: Low bodyweight estimate ({:.1}N)", bw)));
        }

        self.completion_time = Some(last_time);
        self.completion_index = total_samples.checked_sub(1);
        self.phase = CalibrationPhase::Ready;

        info!("[calibration] complete: {:.1} N (sd {:.2} N)", bw, sd);
        events.push(status(&format!("Bodyweight calibration complete: {:.1}N", bw)));
        events.push(countdown("Ready to jump!", 0));
        events.push(ProcessorEvent::CalibrationComplete { body_weight_n: bw });
        events.push(status("Ready for jump. Perform your jump now!"));
    }

    pub fn is_ready_for_jump(&self) -> bool {
        self.phase == CalibrationPhase::Ready
            && self
                .body_weight_n
                .map_or(false, |bw| bw > self.config.ready_body_weight_n)
    }

    /// Mark the test as done after a jump
    pub fn set_completed(&mut self) {
        self.phase = CalibrationPhase::Completed;
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn body_weight(&self) -> Option<f64> {
        self.body_weight_n
    }

    pub fn calibration_std(&self) -> Option<f64> {
        self.body_weight_std_n
    }

    pub fn completion_time(&self) -> Option<f64> {
        self.completion_time
    }

    pub fn completion_index(&self) -> Option<usize> {
        self.completion_index
    }

    pub fn snapshot(&self) -> Option<CalibrationSnapshot> {
        self.body_weight_n.map(|bw| CalibrationSnapshot {
            body_weight_n: bw,
            std_n: self.body_weight_std_n,
            completion_time: self.completion_time,
        })
    }

    fn duration_whole_s(&self) -> u32 {
        self.config.calibration_duration_s.ceil() as u32
    }
}

fn recent_std<'a, I>(chunks: I, window: usize) -> f64
where
    I: DoubleEndedIterator<Item = &'a Vec<f64>>,
{
    let recent: Vec<f64> = chunks.rev().take(window).flatten().copied().collect();
    std_dev(&recent).unwrap_or(0.0)
}

fn status(msg: &str) -> ProcessorEvent {
    ProcessorEvent::Status(msg.to_string())
}

fn countdown(msg: &str, countdown_s: u32) -> ProcessorEvent {
    ProcessorEvent::CalibrationStatus {
        message: msg.to_string(),
        countdown_s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CHUNK: usize = 100;
    const DT: f64 = 0.001;

    /// Feeds `chunks` chunks of a constant force with ±noise alternating per sample
    fn feed(
        cal: &mut CalibrationManager,
        t0: &mut f64,
        total: &mut usize,
        chunks: usize,
        force: f64,
        noise: f64,
        events: &mut Vec<ProcessorEvent>,
    ) {
        for _ in 0..chunks {
            let time: Vec<f64> = (0..CHUNK).map(|i| *t0 + (i + 1) as f64 * DT).collect();
            let summed: Vec<f64> = (0..CHUNK)
                .map(|i| if i % 2 == 0 { force + noise } else { force - noise })
                .collect();
            *t0 += CHUNK as f64 * DT;
            *total += CHUNK;
            cal.process_chunk(&time, &summed, *total, events);
        }
    }

    fn has_complete(events: &[ProcessorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ProcessorEvent::CalibrationComplete { .. }))
            .count()
    }

    #[test]
    fn test_converges_on_steady_subject() {
        let mut cal = CalibrationManager::new(&CalibrationConfig::default());
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 5, 0.0, 0.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Waiting);

        feed(&mut cal, &mut t, &mut total, 40, 700.0, 2.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Ready);
        assert!(cal.is_ready_for_jump());
        assert_abs_diff_eq!(cal.body_weight().unwrap(), 700.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cal.calibration_std().unwrap(), 2.0, epsilon = 1e-9);
        assert_eq!(has_complete(&events), 1);

        let idx = cal.completion_index().unwrap();
        assert!(idx < total);
        assert!(cal.completion_time().unwrap() > 3.0);

        // staying on the plate never re-completes
        feed(&mut cal, &mut t, &mut total, 20, 700.0, 2.0, &mut events);
        assert_eq!(has_complete(&events), 1);
    }

    #[test]
    fn test_step_off_before_stability() {
        let mut cal = CalibrationManager::new(&CalibrationConfig::default());
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 1, 700.0, 2.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::WaitingForStability);
        feed(&mut cal, &mut t, &mut total, 1, 50.0, 0.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Waiting);
        assert!(cal.body_weight().is_none());
    }

    #[test]
    fn test_unstable_subject_never_calibrates() {
        let mut cal = CalibrationManager::new(&CalibrationConfig::default());
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 30, 700.0, 40.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::WaitingForStability);
        assert!(!cal.is_ready_for_jump());
    }

    #[test]
    fn test_movement_restarts_countdown() {
        let mut cal = CalibrationManager::new(&CalibrationConfig::default());
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 5, 700.0, 2.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Calibrating);
        feed(&mut cal, &mut t, &mut total, 1, 700.0, 60.0, &mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::CalibrationStatus { message, .. } if message.contains("Restarting")
        )));

        // a restart pushes completion out past the original 3 s
        feed(&mut cal, &mut t, &mut total, 25, 700.0, 2.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Calibrating);
    }

    #[test]
    fn test_low_weight_warns_but_completes() {
        let mut config = CalibrationConfig::default();
        config.person_present_threshold_n = 150.0;
        let mut cal = CalibrationManager::new(&config);
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 40, 180.0, 1.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Ready);
        assert!(cal.is_ready_for_jump());
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::Status(msg) if msg.starts_with("Warning: Low bodyweight")
        )));
    }

    #[test]
    fn test_completed_rearms_on_step_off() {
        let mut cal = CalibrationManager::new(&CalibrationConfig::default());
        let mut events = Vec::new();
        let (mut t, mut total) = (0.0, 0);

        feed(&mut cal, &mut t, &mut total, 40, 700.0, 2.0, &mut events);
        cal.set_completed();
        feed(&mut cal, &mut t, &mut total, 2, 700.0, 2.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Completed);
        feed(&mut cal, &mut t, &mut total, 1, 0.0, 0.0, &mut events);
        assert_eq!(cal.phase(), CalibrationPhase::Waiting);
    }
}
