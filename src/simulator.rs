//! Simulated force plate: a subject stepping on, standing, performing a
//! countermovement jump, settling and stepping off, repeated.
//! Output is raw per-channel voltage, the same shape a DAQ delivers.

use crate::config::AcquisitionConfig;
use log::{debug, info};
use ndarray::Array2;
use std::f64::consts::PI;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

/// Shape of one countermovement jump, forces relative to body weight
#[derive(Debug, Clone)]
pub struct CmjProfile {
    pub body_weight_n: f64,
    /// From start of unweighting to settled after landing
    pub jump_s: f64,
    pub flight_s: f64,
    pub unweight_factor: f64,
    pub braking_peak_factor: f64,
    pub landing_peak_factor: f64,
}

impl Default for CmjProfile {
    fn default() -> Self {
        Self {
            body_weight_n: 700.0,
            jump_s: 1.5,
            flight_s: 0.3,
            unweight_factor: 0.35,
            braking_peak_factor: 2.25,
            landing_peak_factor: 3.0,
        }
    }
}

impl CmjProfile {
    /// Vertical force `t_rel` seconds after the countermovement starts.
    /// Body weight outside the jump.
    pub fn jump_force(&self, t_rel: f64) -> f64 {
        let bw = self.body_weight_n;
        if t_rel < 0.0 || t_rel >= self.jump_s {
            return bw;
        }

        let active = self.jump_s - self.flight_s;
        let unweight_end = active * 0.15;
        let brake_peak = active * 0.40;
        let takeoff = active * 0.75;
        let flight_end = takeoff + self.flight_s;
        let land_peak = flight_end + active * 0.05;
        let settle_end = flight_end + active * 0.25;

        let unweight = bw * self.unweight_factor;
        let brake = bw * self.braking_peak_factor;
        let landing = bw * self.landing_peak_factor;
        let ease = |from: f64, to: f64, progress: f64| from + (to - from) * (progress * PI / 2.0).sin();

        if t_rel < unweight_end {
            ease(bw, unweight, t_rel / unweight_end)
        } else if t_rel < brake_peak {
            ease(unweight, brake, (t_rel - unweight_end) / (brake_peak - unweight_end))
        } else if t_rel < takeoff {
            brake * (1.0 - (t_rel - brake_peak) / (takeoff - brake_peak))
        } else if t_rel < flight_end {
            0.0
        } else if t_rel < land_peak {
            ease(0.0, landing, (t_rel - flight_end) / (land_peak - flight_end))
        } else if t_rel < settle_end {
            ease(landing, bw, (t_rel - land_peak) / (settle_end - land_peak))
        } else {
            bw
        }
    }
}

/// Session timing around each jump
#[derive(Debug, Clone)]
pub struct SessionScript {
    pub off_plate_s: f64,
    pub quiet_stance_s: f64,
    pub settle_s: f64,
    /// Peak amplitude of the sway/electrical ripple added to the force
    pub ripple_n: f64,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            off_plate_s: 1.0,
            quiet_stance_s: 5.0,
            settle_s: 1.0,
            ripple_n: 1.5,
        }
    }
}

pub struct SimulatedPlate {
    sample_rate: f64,
    num_channels: usize,
    chunk_size: usize,
    n_per_volt: f64,
    profile: CmjProfile,
    script: SessionScript,
    zero_offset_v: Vec<f64>,
    sample_index: u64,
}

impl SimulatedPlate {
    pub fn new(config: &AcquisitionConfig, profile: CmjProfile, script: SessionScript) -> Self {
        let zero_offset_v = (0..config.num_channels)
            .map(|c| 0.012 * (c as f64 + 1.0))
            .collect();
        SimulatedPlate {
            sample_rate: config.sample_rate_hz,
            num_channels: config.num_channels,
            chunk_size: config.chunk_size,
            n_per_volt: config.n_per_volt,
            profile,
            script,
            zero_offset_v,
            sample_index: 0,
        }
    }

    /// Per-channel voltage with nobody on the plate
    pub fn zero_offset_v(&self) -> &[f64] {
        &self.zero_offset_v
    }

    pub fn cycle_s(&self) -> f64 {
        self.script.off_plate_s + self.script.quiet_stance_s + self.profile.jump_s + self.script.settle_s
    }

    /// Scripted vertical force at session time `t`
    pub fn force_at(&self, t: f64) -> f64 {
        let t_cycle = t.rem_euclid(self.cycle_s());
        if t_cycle < self.script.off_plate_s {
            return 0.0;
        }
        let jump_start = self.script.off_plate_s + self.script.quiet_stance_s;
        let ripple = self.script.ripple_n
            * (0.7 * (2.0 * PI * 7.0 * t).sin() + 0.3 * (2.0 * PI * 31.0 * t).sin());
        let force = self.profile.jump_force(t_cycle - jump_start);
        if force > 0.0 {
            force + ripple
        } else {
            0.0
        }
    }

    /// Next DAQ block: `(chunk_size, channels)` raw volts
    pub fn next_chunk(&mut self) -> Array2<f64> {
        let start = self.sample_index;
        self.sample_index += self.chunk_size as u64;
        self.voltage_block(start, |t| self.force_at(t))
    }

    /// An unloaded block for taring; does not advance the session clock
    pub fn tare_chunk(&self) -> Array2<f64> {
        self.voltage_block(0, |_| 0.0)
    }

    fn voltage_block<F: Fn(f64) -> f64>(&self, start: u64, force: F) -> Array2<f64> {
        let per_channel = self.n_per_volt * self.num_channels as f64;
        Array2::from_shape_fn((self.chunk_size, self.num_channels), |(r, c)| {
            let t = (start + r as u64) as f64 / self.sample_rate;
            force(t) / per_channel + self.zero_offset_v[c]
        })
    }
}

/// Deliver simulated chunks at the plate's real-time pace until the receiver goes away.
pub async fn acquisition_loop(tx: Sender<Array2<f64>>, mut plate: SimulatedPlate) {
    let period = Duration::from_secs_f64(plate.chunk_size as f64 / plate.sample_rate);
    let mut interval = interval(period);
    let mut chunk_count = 0u64;

    loop {
        interval.tick().await;
        let chunk = plate.next_chunk();

        // a dropped block would tear a hole in the time base, so wait for room
        if tx.send(chunk).await.is_err() {
            info!("[daq] channel closed after {} chunks", chunk_count);
            break;
        }
        chunk_count += 1;
        if chunk_count % 20 == 0 {
            debug!("[daq] {} chunks", chunk_count);
        }
    }
}
