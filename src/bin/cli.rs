//! Tile Calibration - mirror array calibration against a simulated rig
//!
//! This is the CLI entry point for the tile-calibrate tool.
//! Run with: cargo run --bin tile-calibrate [-- --step] [-- --save-settings]

use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tile_calibration::calibration::RunProgress;
use tile_calibration::{
    CalibrationRunner, CalibrationRunnerState, CalibrationSettings, RunMode, RunnerPhase,
    SimulatedRig, Tile,
};
use tracing_subscriber::EnvFilter;

/// Parse an environment variable, keeping `current` when unset or malformed.
fn env_or<T: FromStr>(name: &str, current: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(current)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    let step_mode = args.iter().any(|arg| arg == "--step");
    let save_settings = args.iter().any(|arg| arg == "--save-settings");

    // Stored settings, overridden by the environment
    let mut settings = CalibrationSettings::load();
    settings.grid_rows = env_or("GRID_ROWS", settings.grid_rows);
    settings.grid_cols = env_or("GRID_COLS", settings.grid_cols);
    settings.image_width = env_or("IMAGE_WIDTH", settings.image_width);
    settings.image_height = env_or("IMAGE_HEIGHT", settings.image_height);
    settings.delta_steps = env_or("DELTA_STEPS", settings.delta_steps);
    settings.rotation_degrees = env_or("ROTATION_DEGREES", settings.rotation_degrees);
    settings.gap_ratio = env_or("GAP_RATIO", settings.gap_ratio);
    settings.alignment_iterations = env_or("ALIGNMENT_ITERATIONS", settings.alignment_iterations);
    settings.mode = env_or("CALIBRATION_MODE", settings.mode);
    settings.summary_path = env_or("SUMMARY_PATH", settings.summary_path);
    if step_mode {
        settings.mode = "step".to_string();
    }

    if save_settings {
        let path = settings.save()?;
        println!("Settings saved to {}", path.display());
    }

    // Simulation knobs
    let latency_ms: u64 = env_or("SIM_LATENCY_MS", 20);
    let failing_tiles: Vec<Tile> = env::var("SIM_FAIL_TILES")
        .unwrap_or_default()
        .split(';')
        .filter(|key| !key.trim().is_empty())
        .map(Tile::parse_key)
        .collect::<Result<_, _>>()?;

    let config = settings.to_runner_config();

    println!("🪞 Tile Calibration - Mirror Array Step-Test Calibration");
    println!("================================================");
    println!("Grid: {}x{}", settings.grid_rows, settings.grid_cols);
    println!("Camera: {}x{} px", settings.image_width, settings.image_height);
    println!("Mode: {:?}", config.mode);
    println!(
        "Step test: {} steps, rotation {}°",
        settings.delta_steps, settings.rotation_degrees
    );
    println!(
        "Retry: capture {}x, motor {}x, {}ms delay",
        settings.capture_attempts, settings.motor_attempts, settings.retry_delay_ms
    );
    if settings.alignment_iterations > 0 {
        println!(
            "Alignment: up to {} iterations, tolerance {}",
            settings.alignment_iterations, settings.alignment_tolerance
        );
    }
    println!("================================================\n");

    let (rig, grid) = SimulatedRig::grid(
        settings.grid_rows,
        settings.grid_cols,
        settings.image_width,
        settings.image_height,
    );
    let rig = rig.with_latency(Duration::from_millis(latency_ms));
    for tile in &failing_tiles {
        println!("⚠️  Simulating capture failure on tile {}", tile.key());
        rig.fail_capture_for(*tile);
    }
    let rig = Arc::new(rig);

    // Track last progress to avoid duplicate prints
    let last_progress: Arc<Mutex<Option<RunProgress>>> = Arc::new(Mutex::new(None));
    let last_progress_clone = last_progress.clone();

    let runner = CalibrationRunner::new(grid, config, rig.clone(), rig)?.with_state_callback(
        move |state| {
            let mut last = last_progress_clone
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if last.as_ref() != Some(&state.progress) {
                let p = state.progress;
                println!(
                    "📡 Progress: {}/{} resolved ({} completed, {} failed, {} skipped)",
                    p.resolved(),
                    p.total,
                    p.completed,
                    p.failed,
                    p.skipped
                );
                *last = Some(p);
            }
        },
    );

    let state = match settings.run_mode() {
        RunMode::Auto => runner.run().await,
        RunMode::Step => run_step_mode(runner).await?,
    };

    report(&state, Path::new(&settings.summary_path))
}

/// Run interactively, pausing after each tile phase.
async fn run_step_mode(runner: CalibrationRunner) -> anyhow::Result<CalibrationRunnerState> {
    println!("Step mode. Press Enter to advance, type 'abort' to stop.\n");

    let (handle, join) = runner.spawn();
    let mut rx = handle.subscribe();
    let mut seen = 0;
    let stdin = io::stdin();

    loop {
        let state = rx
            .wait_for(|s| s.is_terminal() || (s.awaiting_advance && s.checkpoints > seen))
            .await
            .map(|s| s.clone())?;
        if state.is_terminal() {
            break;
        }
        seen = state.checkpoints;

        let active = state.active_tile.clone().unwrap_or_default();
        let phase = state.tile(&active).and_then(|t| t.phase);
        print!("⏸️  Tile {} finished {:?}: ", active, phase);
        io::stdout().flush()?;

        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        match line.trim() {
            "abort" | "quit" | "exit" => {
                println!("Aborting...");
                handle.abort();
                break;
            }
            _ => handle.advance_step().await?,
        }
    }

    Ok(join.await?)
}

/// Print the outcome and write the summary.
fn report(state: &CalibrationRunnerState, summary_path: &Path) -> anyhow::Result<()> {
    println!("\n================================================");
    println!("Calibration {:?}", state.phase);
    for tile in &state.tiles {
        match &tile.error {
            Some(error) => println!("  {} {:?}: {}", tile.key, tile.status, error),
            None => println!("  {} {:?}", tile.key, tile.status),
        }
    }

    if let Some(summary) = &state.summary {
        let json = summary.to_json()?;
        std::fs::write(summary_path, &json)?;
        println!("\n✅ Summary written to {}", summary_path.display());
        if let Some(analysis) = &summary.outlier_analysis {
            if !analysis.outlier_keys.is_empty() {
                println!("⚠️  Size outliers: {}", analysis.outlier_keys.join(", "));
            }
        }
    }

    match state.phase {
        RunnerPhase::Error => anyhow::bail!(
            "Calibration failed: {}",
            state.error.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(()),
    }
}
