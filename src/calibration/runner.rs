//! Calibration runner: drives every tile through home, baseline and step
//! tests, then derives the grid blueprint and optionally aligns the tiles.

use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::config::{RunMode, RunnerConfig};
use super::state::{
    AxisSteps, CalibrationRunnerState, RunProgress, RunnerPhase, TileMetrics, TilePhase,
    TileRunState, TileStatus,
};
use super::summary::{CalibrationRunSummary, OutlierAnalysis};
use crate::coords::{Axis, Point2, Transformer};
use crate::grid::{ConfigError, GridBlueprint, GridConfig, MotorRef, TileAssignment};
use crate::hardware::{
    dispatch_moves, CaptureSource, Completion, HardwareError, MotorController, MoveCommand,
};
use crate::measurement::BlobMeasurement;
use crate::stats::{compute_median, detect_outliers_with_keys};
use crate::step_test::{
    axis_sign, combine_step_test_results, compute_alignment_target_steps,
    compute_axis_step_test_result, get_axis_step_delta, AxisStepTestResult,
};

/// Capacity of the control channel.
const CONTROL_CHANNEL_SIZE: usize = 16;

/// Callback invoked with every published state snapshot.
pub type StateCallback = Box<dyn Fn(&CalibrationRunnerState) + Send + Sync>;

/// Errors from controlling a runner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Runner control channel closed")]
    ChannelClosed,
}

/// Control commands for a running calibration.
#[derive(Debug, Clone)]
enum ControlCommand {
    Advance,
    Abort,
}

/// Why a tile stopped early.
enum Interrupt {
    Aborted,
    Failed {
        phase: TilePhase,
        error: HardwareError,
    },
}

fn failed(phase: TilePhase) -> impl Fn(HardwareError) -> Interrupt {
    move |error| Interrupt::Failed { phase, error }
}

enum AlignOutcome {
    Converged { steps: AxisSteps, residual: Point2 },
    MaxIterations { steps: AxisSteps, residual: Point2 },
    Unreachable(Axis),
}

/// Handle for observing and controlling a runner from outside.
#[derive(Clone)]
pub struct RunnerHandle {
    /// Channel for control commands.
    control_tx: Option<mpsc::Sender<ControlCommand>>,
    /// Abort flag shared with the runner.
    aborted: Arc<AtomicBool>,
    /// Latest published state.
    state_rx: watch::Receiver<CalibrationRunnerState>,
}

impl RunnerHandle {
    /// Release a step-mode runner waiting after a phase.
    pub async fn advance_step(&self) -> Result<(), RunnerError> {
        let tx = self.control_tx.as_ref().ok_or(RunnerError::ChannelClosed)?;
        tx.send(ControlCommand::Advance)
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    /// Request an abort. The current hardware call finishes; nothing new is issued.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.control_tx {
            // A full or closed channel is fine, the flag is what the runner checks.
            let _ = tx.try_send(ControlCommand::Abort);
        }
    }

    /// Stop the run and release this handle.
    pub fn dispose(self) {
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> CalibrationRunnerState {
        self.state_rx.borrow().clone()
    }

    pub fn progress(&self) -> RunProgress {
        self.state_rx.borrow().progress
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<CalibrationRunnerState> {
        self.state_rx.clone()
    }

    /// Wait until the runner reaches a terminal phase.
    pub async fn wait_until_finished(&self) -> CalibrationRunnerState {
        let mut rx = self.state_rx.clone();
        let finished = rx.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
        finished.unwrap_or_else(|_| rx.borrow().clone())
    }
}

/// Runs one calibration over a validated grid.
///
/// A runner is single-use: `run` consumes it. Observers follow progress
/// through [`RunnerHandle::subscribe`] or a state callback.
pub struct CalibrationRunner {
    /// Grid being calibrated.
    grid: GridConfig,
    /// Runner configuration.
    config: RunnerConfig,
    /// Conversion context for every capture.
    transformer: Transformer,
    /// Blob source.
    source: Arc<dyn CaptureSource>,
    /// Motor transport.
    motors: Arc<dyn MotorController>,
    /// Authoritative state; observers only ever see clones.
    state: CalibrationRunnerState,
    /// Publishes state snapshots.
    state_tx: watch::Sender<CalibrationRunnerState>,
    /// Kept until `run` so handles can be created.
    control_tx: Option<mpsc::Sender<ControlCommand>>,
    /// Control commands from handles.
    control_rx: mpsc::Receiver<ControlCommand>,
    /// Abort flag.
    aborted: Arc<AtomicBool>,
    /// Optional state callback.
    state_callback: Option<StateCallback>,
}

impl CalibrationRunner {
    /// Create a runner, validating the grid before any hardware is touched.
    pub fn new(
        grid: GridConfig,
        config: RunnerConfig,
        source: Arc<dyn CaptureSource>,
        motors: Arc<dyn MotorController>,
    ) -> Result<Self, ConfigError> {
        let assignments = grid.validate()?;
        let tiles: Vec<TileRunState> = assignments
            .into_iter()
            .map(|(tile, assignment)| TileRunState::new(tile, assignment))
            .collect();

        let state = CalibrationRunnerState {
            mode: config.mode,
            progress: RunProgress::from_tiles(&tiles),
            tiles,
            ..Default::default()
        };
        let (state_tx, _) = watch::channel(state.clone());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);

        Ok(Self {
            grid,
            transformer: Transformer::new(config.context),
            config,
            source,
            motors,
            state,
            state_tx,
            control_tx: Some(control_tx),
            control_rx,
            aborted: Arc::new(AtomicBool::new(false)),
            state_callback: None,
        })
    }

    /// Set a callback invoked with every state change.
    pub fn with_state_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CalibrationRunnerState) + Send + Sync + 'static,
    {
        self.state_callback = Some(Box::new(callback));
        self
    }

    /// Create a handle for external control.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            control_tx: self.control_tx.clone(),
            aborted: self.aborted.clone(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CalibrationRunnerState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> &CalibrationRunnerState {
        &self.state
    }

    /// Spawn the run on the tokio runtime.
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<CalibrationRunnerState>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Run the calibration to completion and return the final state.
    ///
    /// In step mode the runner needs a live [`RunnerHandle`]; once every
    /// handle is dropped a waiting runner aborts.
    pub async fn run(mut self) -> CalibrationRunnerState {
        // Only handles keep the control channel open from here on.
        self.control_tx = None;

        info!(
            "Starting calibration of {}x{} grid ({:?} mode)",
            self.grid.rows, self.grid.cols, self.config.mode
        );
        self.state.phase = RunnerPhase::Running;
        self.state.started_at = Some(Utc::now());
        self.publish();

        // Each tile homes its own actuators again, so a controller that
        // fails here only costs the tiles it drives.
        if self.config.home_all_on_start {
            let macs = self.grid.macs();
            let homed =
                with_timeout(self.config.motor_timeout_ms, self.motors.home_all(&macs)).await;
            match homed {
                Ok(done) => debug!("Homed {} motors on {} controllers", done.len(), macs.len()),
                Err(e) => warn!("Failed to home controllers, continuing per tile: {}", e),
            }
        }

        for tile in self.grid.tiles() {
            if self.is_aborted() {
                break;
            }
            self.calibrate_tile(&tile.key()).await;
        }

        if self.is_aborted() {
            return self.finish(RunnerPhase::Aborted, None);
        }

        self.finalize().await
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Recompute progress and push a snapshot to observers.
    fn publish(&mut self) {
        self.state.progress = RunProgress::from_tiles(&self.state.tiles);
        if let Some(callback) = &self.state_callback {
            callback(&self.state);
        }
        self.state_tx.send_replace(self.state.clone());
    }

    fn update_tile(&mut self, key: &str, update: impl FnOnce(&mut TileRunState)) {
        if let Some(tile) = self.state.tile_mut(key) {
            update(tile);
        }
        self.publish();
    }

    fn enter_phase(&mut self, key: &str, phase: TilePhase) {
        debug!("Tile {} entering {:?}", key, phase);
        self.update_tile(key, |t| t.phase = Some(phase));
    }

    /// Abort check plus the step-mode gate. Called after every phase.
    async fn checkpoint(&mut self) -> Result<(), Interrupt> {
        if self.is_aborted() {
            return Err(Interrupt::Aborted);
        }
        if self.config.mode == RunMode::Auto {
            return Ok(());
        }

        // Advances sent before this pause belong to earlier ones.
        while let Ok(stale) = self.control_rx.try_recv() {
            if let ControlCommand::Abort = stale {
                self.aborted.store(true, Ordering::SeqCst);
                return Err(Interrupt::Aborted);
            }
            debug!("Dropping stale advance");
        }

        self.state.awaiting_advance = true;
        self.state.checkpoints += 1;
        self.publish();
        let command = self.control_rx.recv().await;
        self.state.awaiting_advance = false;
        self.publish();

        match command {
            Some(ControlCommand::Advance) if !self.is_aborted() => Ok(()),
            Some(ControlCommand::Advance) | Some(ControlCommand::Abort) | None => {
                self.aborted.store(true, Ordering::SeqCst);
                Err(Interrupt::Aborted)
            }
        }
    }

    async fn calibrate_tile(&mut self, key: &str) {
        let Some(assignment) = self.state.tile(key).map(|t| t.assignment.clone()) else {
            return;
        };

        info!("Calibrating tile {}", key);
        self.state.active_tile = Some(key.to_string());
        self.update_tile(key, |t| {
            t.status = TileStatus::InProgress;
            t.error = None;
        });

        match self.measure_tile(key, &assignment).await {
            Ok(metrics) => {
                let status = if metrics.step_to_displacement.is_usable() {
                    TileStatus::Completed
                } else {
                    TileStatus::Partial
                };
                info!(
                    "Tile {} {:?}: sensitivity x={:?} y={:?}",
                    key, status, metrics.step_to_displacement.x, metrics.step_to_displacement.y
                );
                self.update_tile(key, |t| {
                    t.status = status;
                    t.phase = None;
                    t.metrics = Some(metrics);
                });
            }
            Err(Interrupt::Aborted) => {
                info!("Tile {} abandoned by abort", key);
                self.update_tile(key, |t| {
                    t.status = TileStatus::Skipped;
                    t.phase = None;
                    t.metrics = None;
                });
            }
            Err(Interrupt::Failed { phase, error }) => {
                warn!("Tile {} failed during {:?}: {}", key, phase, error);
                self.update_tile(key, |t| {
                    t.status = TileStatus::Error;
                    t.phase = None;
                    t.error = Some(error.to_string());
                });
                self.park(&assignment).await;
            }
        }

        self.state.active_tile = None;
        self.publish();
    }

    /// Home, baseline capture and both step tests for one tile.
    async fn measure_tile(
        &mut self,
        key: &str,
        assignment: &TileAssignment,
    ) -> Result<TileMetrics, Interrupt> {
        let home_steps = self.config.step_test.limits.center();

        self.enter_phase(key, TilePhase::Home);
        self.move_axes(assignment, home_steps, home_steps)
            .await
            .map_err(failed(TilePhase::Home))?;
        self.checkpoint().await?;

        self.enter_phase(key, TilePhase::Baseline);
        let home = self.capture().await.map_err(failed(TilePhase::Baseline))?;
        debug!("Tile {} home at ({:.4}, {:.4}) size {:.4}", key, home.x, home.y, home.size);
        let mut metrics = TileMetrics {
            home: Some(home.clone()),
            ..Default::default()
        };
        self.update_tile(key, |t| t.metrics = Some(metrics.clone()));
        self.checkpoint().await?;

        let x = self
            .run_step_test(key, assignment, Axis::X, &home, &mut metrics)
            .await?;
        let y = self
            .run_step_test(key, assignment, Axis::Y, &home, &mut metrics)
            .await?;

        let combined = combine_step_test_results(x.as_ref(), y.as_ref());
        metrics.step_to_displacement = combined.step_to_displacement;
        metrics.size_delta_at_step_test = combined.size_delta_at_step_test;
        Ok(metrics)
    }

    async fn run_step_test(
        &mut self,
        key: &str,
        assignment: &TileAssignment,
        axis: Axis,
        home: &BlobMeasurement,
        metrics: &mut TileMetrics,
    ) -> Result<Option<AxisStepTestResult>, Interrupt> {
        let phase = match axis {
            Axis::X => TilePhase::StepX,
            Axis::Y => TilePhase::StepY,
        };
        self.enter_phase(key, phase);
        let result = self
            .step_test_axis(assignment, axis, home)
            .await
            .map_err(failed(phase))?;
        if let Some(result) = result {
            metrics.step_tests.push(result);
            self.update_tile(key, |t| t.metrics = Some(metrics.clone()));
        }
        self.checkpoint().await?;
        Ok(result)
    }

    /// Perturb one axis, capture, and restore the actuator.
    async fn step_test_axis(
        &self,
        assignment: &TileAssignment,
        axis: Axis,
        home: &BlobMeasurement,
    ) -> Result<Option<AxisStepTestResult>, HardwareError> {
        let settings = self.config.step_test;
        let Some(delta) = get_axis_step_delta(
            axis,
            settings.delta_steps,
            settings.rotation_degrees,
            &settings.limits,
        ) else {
            return Ok(None);
        };
        if delta == 0 {
            warn!("No room to step-test axis {:?} within actuator limits", axis);
            return Ok(None);
        }

        let motor = assignment.motor(axis);
        let home_steps = settings.limits.center();
        self.move_to(motor, home_steps.saturating_add(delta)).await?;
        let captured = self.capture().await;
        // Restore even when the capture failed.
        let restored = self.move_to(motor, home_steps).await;
        let step = captured?;
        restored?;

        let result = compute_axis_step_test_result(home, &step, axis, delta.abs());
        debug!(
            "Step test {:?} on {}: {} steps moved {:.5}",
            axis, motor, delta, result.displacement
        );
        Ok(Some(result))
    }

    /// Capture one blob, normalized to pattern space.
    async fn capture(&self) -> Result<BlobMeasurement, HardwareError> {
        let retry = self.config.retry;
        let timeout_ms = self.config.capture_timeout_ms;
        with_retries(
            retry.capture_attempts,
            retry.retry_delay_ms,
            "Capture",
            move || async move {
                let blob = with_timeout(timeout_ms, self.source.capture_measurement())
                    .await?
                    .ok_or(HardwareError::NoBlob)?;
                if !self.transformer.contains(blob.position()) {
                    return Err(HardwareError::CaptureFailed(format!(
                        "blob at ({:.3}, {:.3}) lies outside the region of interest",
                        blob.x, blob.y
                    )));
                }
                Ok(blob.to_pattern(&self.transformer))
            },
        )
        .await
    }

    async fn move_to(
        &self,
        motor: &MotorRef,
        position_steps: i32,
    ) -> Result<Completion, HardwareError> {
        let retry = self.config.retry;
        with_retries(retry.motor_attempts, retry.retry_delay_ms, "Move", move || {
            let cmd =
                MoveCommand::to(motor, position_steps).with_speed(self.config.move_speed_sps);
            with_timeout(self.config.motor_timeout_ms, self.motors.move_motor(cmd))
        })
        .await
    }

    /// Move both actuators of a tile concurrently.
    async fn move_axes(
        &self,
        assignment: &TileAssignment,
        x_steps: i32,
        y_steps: i32,
    ) -> Result<(), HardwareError> {
        let retry = self.config.retry;
        with_retries(retry.motor_attempts, retry.retry_delay_ms, "Move", move || async move {
            let speed = self.config.move_speed_sps;
            let commands = vec![
                MoveCommand::to(&assignment.x, x_steps).with_speed(speed),
                MoveCommand::to(&assignment.y, y_steps).with_speed(speed),
            ];
            let results = with_timeout(self.config.motor_timeout_ms, async {
                Ok::<_, HardwareError>(dispatch_moves(self.motors.as_ref(), commands).await)
            })
            .await?;
            results.into_iter().try_for_each(|r| r.map(|_| ()))
        })
        .await
    }

    /// Relative moves are never retried: a timed-out nudge may still have landed.
    async fn nudge_axes(
        &self,
        assignment: &TileAssignment,
        delta: AxisSteps,
    ) -> Result<(), HardwareError> {
        let timeout_ms = self.config.motor_timeout_ms;
        let nudges = [(&assignment.x, delta.x), (&assignment.y, delta.y)]
            .into_iter()
            .filter(|(_, steps)| *steps != 0)
            .map(move |(motor, steps)| {
                with_timeout(
                    timeout_ms,
                    self.motors.nudge_motor(&motor.mac, motor.motor_index, steps),
                )
            });
        for result in join_all(nudges).await {
            result?;
        }
        Ok(())
    }

    /// Best-effort return of a failed tile's actuators.
    async fn park(&self, assignment: &TileAssignment) {
        for motor in [&assignment.x, &assignment.y] {
            let homed = with_timeout(
                self.config.motor_timeout_ms,
                self.motors.home_motor(&motor.mac, motor.motor_index),
            )
            .await;
            if let Err(e) = homed {
                warn!("Failed to return {} home: {}", motor, e);
            }
        }
    }

    fn skip_remaining(&mut self) {
        for tile in self.state.tiles.iter_mut().filter(|t| !t.status.is_terminal()) {
            tile.status = TileStatus::Skipped;
            tile.phase = None;
        }
    }

    /// Outlier analysis, blueprint and ideal targets over the measured tiles.
    async fn finalize(mut self) -> CalibrationRunnerState {
        let sizes: Vec<(String, f64)> = self
            .state
            .tiles
            .iter()
            .filter(|t| t.status.is_measured())
            .filter_map(|t| {
                let home = t.metrics.as_ref()?.home.as_ref()?;
                Some((t.key.clone(), home.size))
            })
            .collect();
        if sizes.is_empty() {
            warn!("No tile produced a measurement");
            return self.finish(
                RunnerPhase::Error,
                Some("No tile produced a measurement".to_string()),
            );
        }

        let options = self.config.outliers;
        let result = detect_outliers_with_keys(&sizes, |entry| entry.1, &options);
        let analysis = OutlierAnalysis::from_result(&result, &options);
        if !analysis.outlier_keys.is_empty() {
            warn!(
                "Blob size outliers excluded from the blueprint: {}",
                analysis.outlier_keys.join(", ")
            );
        }

        let inliers = if result.inliers.is_empty() {
            &sizes
        } else {
            &result.inliers
        };
        let homes: Vec<Point2> = inliers
            .iter()
            .filter_map(|(key, _)| {
                let tile = self.state.tile(key)?;
                Some(tile.metrics.as_ref()?.home.as_ref()?.position())
            })
            .collect();
        let sizes: Vec<f64> = inliers.iter().map(|(_, size)| *size).collect();
        let tile_size = compute_median(&sizes);
        let center = Point2::pattern(
            compute_median(&homes.iter().map(|p| p.x).collect::<Vec<_>>()),
            compute_median(&homes.iter().map(|p| p.y).collect::<Vec<_>>()),
        );
        let blueprint = GridBlueprint::derive(
            self.grid.rows,
            self.grid.cols,
            tile_size,
            center,
            self.config.gap_ratio,
            &self.transformer,
        );
        info!(
            "Blueprint: tile size {:.4}, footprint {:.4}x{:.4}, origin ({:.4}, {:.4})",
            blueprint.computed_tile_size,
            blueprint.adjusted_tile_footprint.width,
            blueprint.adjusted_tile_footprint.height,
            blueprint.grid_origin.x,
            blueprint.grid_origin.y
        );

        for tile in self.state.tiles.iter_mut().filter(|t| t.status.is_measured()) {
            let ideal = blueprint.ideal_target(tile.tile);
            if let Some(metrics) = tile.metrics.as_mut() {
                metrics.ideal_target = Some(ideal);
                metrics.home_offset =
                    metrics.home.as_ref().map(|h| h.position().offset_from(&ideal));
            }
        }
        self.publish();

        if self.config.alignment.max_iterations > 0 {
            self.align_tiles().await;
        }

        self.state.summary = Some(CalibrationRunSummary::build(
            &self.state.tiles,
            blueprint,
            self.config.step_test,
            Some(analysis),
        ));

        if self.is_aborted() {
            return self.finish(RunnerPhase::Aborted, None);
        }
        self.finish(RunnerPhase::Completed, None)
    }

    /// Drive every fully measured tile toward its ideal target.
    async fn align_tiles(&mut self) {
        let keys: Vec<String> = self
            .state
            .tiles
            .iter()
            .filter(|t| t.status == TileStatus::Completed)
            .map(|t| t.key.clone())
            .collect();

        for key in keys {
            if self.is_aborted() {
                break;
            }
            let Some(tile) = self.state.tile(&key).cloned() else {
                continue;
            };

            self.state.active_tile = Some(key.clone());
            let outcome = self.align_tile(&tile).await;
            match outcome {
                Ok(AlignOutcome::Converged { steps, residual }) => {
                    info!("Tile {} aligned with offsets ({}, {})", key, steps.x, steps.y);
                    self.record_alignment(&key, steps, residual, TileStatus::Completed);
                }
                Ok(AlignOutcome::MaxIterations { steps, residual }) => {
                    warn!(
                        "Tile {} did not converge, residual ({:.4}, {:.4})",
                        key, residual.x, residual.y
                    );
                    self.record_alignment(&key, steps, residual, TileStatus::MaxIterations);
                }
                Ok(AlignOutcome::Unreachable(axis)) => {
                    warn!("Tile {} target unreachable on axis {:?}", key, axis);
                    self.update_tile(&key, |t| {
                        t.status = TileStatus::Partial;
                        t.phase = None;
                    });
                }
                Err(Interrupt::Aborted) => {
                    self.update_tile(&key, |t| t.phase = None);
                    break;
                }
                Err(Interrupt::Failed { phase, error }) => {
                    // Home, sensitivities and target were measured before
                    // this pass; only the alignment is lost.
                    warn!("Tile {} alignment failed during {:?}: {}", key, phase, error);
                    self.update_tile(&key, |t| {
                        t.status = TileStatus::Partial;
                        t.phase = None;
                        t.error = Some(error.to_string());
                        if let Some(metrics) = t.metrics.as_mut() {
                            metrics.alignment_error = Some(error.to_string());
                        }
                    });
                    self.park(&tile.assignment).await;
                }
            }
        }

        self.state.active_tile = None;
        self.publish();
    }

    fn record_alignment(
        &mut self,
        key: &str,
        steps: AxisSteps,
        residual: Point2,
        status: TileStatus,
    ) {
        self.update_tile(key, |t| {
            t.status = status;
            t.phase = None;
            if let Some(metrics) = t.metrics.as_mut() {
                metrics.alignment_steps = Some(steps);
                metrics.alignment_residual = Some(residual);
            }
        });
    }

    async fn align_tile(&mut self, tile: &TileRunState) -> Result<AlignOutcome, Interrupt> {
        let Some(metrics) = tile.metrics.clone() else {
            return Ok(AlignOutcome::Unreachable(Axis::X));
        };
        let (Some(home), Some(ideal)) = (metrics.home, metrics.ideal_target) else {
            return Ok(AlignOutcome::Unreachable(Axis::X));
        };
        let sensitivity = metrics.step_to_displacement;
        let settings = self.config.step_test;
        let limits = settings.limits;
        let alignment = self.config.alignment;
        let within =
            |r: &Point2| r.x.abs() <= alignment.tolerance && r.y.abs() <= alignment.tolerance;

        self.enter_phase(&tile.key, TilePhase::Align);
        let mut position = home.position();
        let mut steps = AxisSteps::default();

        for iteration in 1..=alignment.max_iterations {
            let residual = position.offset_from(&ideal);
            if within(&residual) {
                return Ok(AlignOutcome::Converged { steps, residual });
            }

            let mut next = steps;
            for axis in Axis::BOTH {
                let Some(logical) = compute_alignment_target_steps(
                    -residual.get(axis),
                    sensitivity.get(axis),
                    &limits,
                ) else {
                    return Ok(AlignOutcome::Unreachable(axis));
                };
                let offset = match axis {
                    Axis::X => &mut next.x,
                    Axis::Y => &mut next.y,
                };
                let sign = axis_sign(axis, settings.rotation_degrees);
                let motor_steps = sign.saturating_mul(logical);
                *offset = offset.saturating_add(motor_steps);
                if !limits.contains(limits.center().saturating_add(*offset)) {
                    return Ok(AlignOutcome::Unreachable(axis));
                }
            }

            let delta = AxisSteps {
                x: next.x.saturating_sub(steps.x),
                y: next.y.saturating_sub(steps.y),
            };
            self.nudge_axes(&tile.assignment, delta)
                .await
                .map_err(failed(TilePhase::Align))?;
            steps = next;
            position = self
                .capture()
                .await
                .map_err(failed(TilePhase::Align))?
                .position();
            debug!(
                "Tile {} alignment iteration {}: ({:.4}, {:.4})",
                tile.key, iteration, position.x, position.y
            );
            self.checkpoint().await?;
        }

        let residual = position.offset_from(&ideal);
        if within(&residual) {
            Ok(AlignOutcome::Converged { steps, residual })
        } else {
            Ok(AlignOutcome::MaxIterations { steps, residual })
        }
    }

    fn finish(mut self, phase: RunnerPhase, error: Option<String>) -> CalibrationRunnerState {
        self.skip_remaining();
        self.state.phase = phase;
        self.state.error = error;
        self.state.active_tile = None;
        self.state.awaiting_advance = false;
        self.state.finished_at = Some(Utc::now());
        self.publish();

        let progress = self.state.progress;
        info!(
            "Calibration {:?}: {} completed, {} failed, {} skipped of {}",
            phase, progress.completed, progress.failed, progress.skipped, progress.total
        );
        self.state
    }
}

/// Bound a hardware call by `timeout_ms`. Zero disables the bound.
async fn with_timeout<T, F>(timeout_ms: u64, fut: F) -> Result<T, HardwareError>
where
    F: Future<Output = Result<T, HardwareError>>,
{
    if timeout_ms == 0 {
        return fut.await;
    }
    tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
        .await
        .map_err(|_| HardwareError::Timeout(timeout_ms))?
}

/// Run `op` up to `attempts` times, sleeping `delay_ms` between failures.
async fn with_retries<T, F, Fut>(
    attempts: u32,
    delay_ms: u64,
    what: &str,
    mut op: F,
) -> Result<T, HardwareError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HardwareError>>,
{
    let max_attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < max_attempts {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, max_attempts, e);
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| HardwareError::CommandFailed(format!("{} never attempted", what))))
}
