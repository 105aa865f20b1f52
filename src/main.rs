use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use crossbeam::channel::{self, Receiver, Sender};
use force_plate_rs::simulator::{acquisition_loop, CmjProfile, SessionScript, SimulatedPlate};
use force_plate_rs::{EventMarkers, JumpResult, PlateConfig, ProcessorEvent, SessionStatus, StreamProcessor};
use log::{info, warn};
use ndarray::Array2;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::pending;
use std::thread;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "force_plate")]
#[command(about = "Force plate jump analysis - live calibration, jump detection and metrics", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file; missing fields use defaults
    #[arg(long)]
    config: Option<String>,

    /// Output directory
    #[arg(long, default_value = "force_plate_sessions")]
    output_dir: String,

    /// Seconds between live status writes
    #[arg(long, default_value = "2")]
    status_interval: u64,

    /// Body weight of the simulated subject (N)
    #[arg(long, default_value = "700")]
    body_weight: f64,

    /// Samples per DAQ chunk (overrides the config)
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[derive(Serialize, Clone)]
struct BrakingPatch {
    jump_number: u32,
    peak_braking_force_n: f64,
}

/// Everything the presenter collected over the session
#[derive(Default)]
struct Collected {
    results: Vec<JumpResult>,
    braking: Vec<BrakingPatch>,
    markers: Vec<EventMarkers>,
    force_chunks: u64,
}

#[derive(Serialize)]
struct SessionReport {
    saved_at: String,
    config: PlateConfig,
    jumps: Vec<Map<String, Value>>,
    braking_patches: Vec<BrakingPatch>,
    markers: Vec<EventMarkers>,
    status: SessionStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PlateConfig::from_json_file(path)?,
        None => PlateConfig::default(),
    };
    if let Some(chunk_size) = args.chunk_size {
        config.acquisition.chunk_size = chunk_size;
    }
    config.validate()?;

    println!("[{}] Force Plate RS Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!(
        "  DAQ: {} ch @ {:.0} Hz, {} samples/chunk",
        config.acquisition.num_channels, config.acquisition.sample_rate_hz, config.acquisition.chunk_size
    );
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;

    let profile = CmjProfile {
        body_weight_n: args.body_weight,
        ..Default::default()
    };
    let plate = SimulatedPlate::new(&config.acquisition, profile, SessionScript::default());
    let mut processor = StreamProcessor::new(&config)?;

    let (event_tx, event_rx) = channel::unbounded::<ProcessorEvent>();
    let presenter = thread::spawn(move || present(event_rx));

    forward(&event_tx, processor.reset());
    forward(&event_tx, processor.tare(plate.tare_chunk().view()));

    let (daq_tx, mut daq_rx) = mpsc::channel::<Array2<f64>>(8);
    let daq_handle = tokio::spawn(acquisition_loop(daq_tx, plate));

    let started = Instant::now();
    let mut status = SessionStatus::new();
    let status_path = format!("{}/live_status.json", args.output_dir);
    let mut status_tick = interval(Duration::from_secs(args.status_interval.max(1)));

    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration));
    let stop_at = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(stop_at);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("[{}] Starting data collection...", ts_now());

    loop {
        tokio::select! {
            chunk = daq_rx.recv() => match chunk {
                Some(chunk) => forward(&event_tx, processor.process_chunk_now(chunk.view())),
                None => {
                    warn!("acquisition loop ended unexpectedly");
                    break;
                }
            },
            _ = status_tick.tick() => {
                status.update(&processor, started.elapsed().as_secs());
                if let Err(e) = status.save(&status_path) {
                    warn!("could not write {}: {}", status_path, e);
                }
            }
            _ = &mut stop_at => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = &mut ctrl_c => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
        }
    }

    drop(daq_rx);
    if let Err(e) = daq_handle.await {
        warn!("acquisition task failed: {}", e);
    }
    forward(&event_tx, processor.stop());

    status.update(&processor, started.elapsed().as_secs());
    let final_status_path = format!("{}/live_status_final.json", args.output_dir);
    if let Err(e) = status.save(&final_status_path) {
        warn!("could not write {}: {}", final_status_path, e);
    }

    drop(event_tx);
    let collected = presenter
        .join()
        .map_err(|_| anyhow!("presenter thread panicked"))?;

    let report = SessionReport {
        saved_at: Utc::now().to_rfc3339(),
        config,
        jumps: collected.results.iter().map(JumpResult::to_report).collect(),
        braking_patches: collected.braking.clone(),
        markers: collected.markers.clone(),
        status: status.clone(),
    };
    let filename = format!("{}/session_{}.json", args.output_dir, ts_now_clean());
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&filename, json)?;
    println!("[{}] Saved {} jump(s) to {}", ts_now(), collected.results.len(), filename);

    println!("\n=== Final Stats ===");
    println!("Chunks processed: {}", status.chunks_processed);
    println!("Chunks rejected: {}", status.chunks_rejected);
    println!("Timing jitter events: {}", status.jitter_events);
    println!("Force data chunks shown: {}", collected.force_chunks);
    if let Some(bw) = status.body_weight_n {
        println!("Body weight: {:.1} N", bw);
    }
    println!("Jumps detected: {}", status.jumps_detected);

    Ok(())
}

fn forward(tx: &Sender<ProcessorEvent>, events: Vec<ProcessorEvent>) {
    for event in events {
        if tx.send(event).is_err() {
            warn!("presenter gone, dropping events");
            return;
        }
    }
}

/// Presentation side: prints events and applies braking patches to the
/// results already shown.
fn present(rx: Receiver<ProcessorEvent>) -> Collected {
    let mut collected = Collected::default();

    for event in rx {
        match event {
            ProcessorEvent::ForceData { .. } => collected.force_chunks += 1,
            ProcessorEvent::Status(message) => println!("[{}] {}", ts_now(), message),
            ProcessorEvent::CalibrationStatus { message, countdown_s } => {
                if countdown_s > 0 {
                    println!("[{}] {} ({} s)", ts_now(), message, countdown_s);
                } else {
                    println!("[{}] {}", ts_now(), message);
                }
            }
            ProcessorEvent::CalibrationComplete { body_weight_n } => {
                println!("[{}] Calibration complete: {:.1} N", ts_now(), body_weight_n);
            }
            ProcessorEvent::JumpResult(result) => {
                println!("[{}] --- Jump #{} ---", ts_now(), result.jump_number);
                for (label, value) in result.to_report() {
                    println!("  {}: {}", label, value);
                }
                collected.results.push(result);
            }
            ProcessorEvent::BrakingPeak {
                jump_number,
                peak_braking_force_n,
            } => {
                match collected.results.iter_mut().find(|r| r.jump_number == jump_number) {
                    Some(result) => result.peak_braking_force_n = Some(peak_braking_force_n),
                    None => warn!("braking peak for unknown jump #{}", jump_number),
                }
                println!(
                    "[{}] Jump #{} Peak Braking Force: {:.2} N",
                    ts_now(),
                    jump_number,
                    peak_braking_force_n
                );
                collected.braking.push(BrakingPatch {
                    jump_number,
                    peak_braking_force_n,
                });
            }
            ProcessorEvent::EventMarkers(markers) => {
                info!(
                    "jump #{} markers: onset {:.3} s, takeoff {:.3} s, landing {:.3} s",
                    markers.jump_number, markers.onset_time, markers.takeoff_time, markers.landing_time
                );
                collected.markers.push(markers);
            }
        }
    }
    collected
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
