//! The EM driver: the state machine that owns one segmentation run.
//!
//! The driver validates the configuration, allocates and initializes
//! the context, runs the unconditional pilot sampler pass, then
//! iterates the EM loop until convergence, exhaustion, cancellation,
//! or failure. Cancellation is cooperative: a shared token polled at
//! EM-iteration and sampler-pass boundaries. Progress callbacks are
//! fire-and-forget; the driver never blocks on a listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::context::SegmentationContext;
use crate::diagnostics::{EmIterationDiagnostics, SegmentationDiagnostics};
use crate::init::Initializer;
use crate::types::{InitMode, Outcome, SegmentationConfig, SegmentationError, SegmentationResult};
use crate::{curvature, mpm, stats};

/// Offset separating the sampler's draw stream from the label-map
/// initializer, which is seeded with the raw configuration seed.
const DRAW_STREAM_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

/// Shared cancellation flag for one or more runs.
///
/// Clones observe the same flag. Cancellation is sticky; create a new
/// token for a fresh run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Observed at the next poll point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Where a driver currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No run started yet.
    Uninitialized,
    /// Context allocated and initialized.
    Initialized,
    /// The unconditional warm-start sampler run.
    PilotMpm,
    /// Inside the EM loop.
    EmIterating,
    /// Terminal: the stopping threshold was met.
    Converged,
    /// Terminal: the iteration budget ran out.
    Exhausted,
    /// Terminal: cancellation was observed.
    Cancelled,
    /// Terminal: an error stopped the run.
    Failed,
    /// The final label conversion has been performed.
    Finalized,
}

/// Snapshot emitted at the top of each EM iteration.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Zero-based EM iteration about to run.
    pub iteration: usize,
    /// Configured EM iteration budget.
    pub total_iterations: usize,
    /// Run progress in `[0, 100]`.
    pub progress: f64,
    /// Mean-squared statistics drift measured by the previous
    /// iteration (0.0 before the first).
    pub mse: f64,
    /// Live class count.
    pub classes: usize,
    /// Current annealed inverse temperature.
    pub kappa: f64,
}

type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send>;

/// Drives one segmentation run to a terminal state.
pub struct EmDriver {
    config: SegmentationConfig,
    cancel: CancelToken,
    on_progress: Option<ProgressCallback>,
    state: DriverState,
}

impl std::fmt::Debug for EmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmDriver")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EmDriver {
    /// A driver for the given configuration with a fresh cancellation
    /// token and no progress listener.
    #[must_use]
    pub fn new(config: SegmentationConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            on_progress: None,
            state: DriverState::Uninitialized,
        }
    }

    /// Replace the cancellation token, e.g. to share one across runs.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Install a fire-and-forget progress listener.
    #[must_use]
    pub fn on_progress<F: Fn(&ProgressEvent) + Send + 'static>(mut self, callback: F) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// A clone of the driver's cancellation token, for handing to
    /// another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> DriverState {
        self.state
    }

    fn emit_progress(&self, ctx: &SegmentationContext) {
        if let Some(callback) = &self.on_progress {
            callback(&ProgressEvent {
                iteration: ctx.current_em_loop,
                total_iterations: self.config.em_iterations,
                progress: ctx.progress,
                mse: ctx.current_mse,
                classes: ctx.classes(),
                kappa: ctx.working_kappa,
            });
        }
    }

    /// Run the full EM/MPM segmentation over a single-channel image.
    ///
    /// Returns the result even when cancelled (the label map is then
    /// partially converged and the outcome says so).
    ///
    /// # Errors
    ///
    /// Configuration, allocation, initialization, and degenerate-model
    /// errors stop the run and leave the driver in
    /// [`DriverState::Failed`].
    #[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
    pub fn run(
        &mut self,
        input: &[u8],
        rows: usize,
        columns: usize,
    ) -> Result<SegmentationResult, SegmentationError> {
        let total_start = Instant::now();
        self.state = DriverState::Uninitialized;
        self.config.validate(rows, columns, input.len()).map_err(|e| {
            self.state = DriverState::Failed;
            e
        })?;

        let mut ctx = SegmentationContext::new(rows, columns, &self.config);
        let mut diagnostics = SegmentationDiagnostics::default();
        let outcome = match self.run_loop(&mut ctx, input, &mut diagnostics) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = DriverState::Failed;
                return Err(e);
            }
        };

        stats::convert_labels_to_output(&mut ctx, self.config.gray_table.as_deref());
        self.state = DriverState::Finalized;
        ctx.progress = 100.0;

        diagnostics.total_duration = total_start.elapsed();
        info!(
            "run finished: {outcome:?}, {} classes, {} EM iterations, {:.1?}",
            ctx.classes(),
            diagnostics.iterations.len(),
            diagnostics.total_duration,
        );

        let live = ctx.classes() * ctx.dims;
        Ok(SegmentationResult {
            rows,
            columns,
            classes: ctx.classes(),
            labels: std::mem::take(&mut ctx.xt),
            mean: ctx.mean[..live].to_vec(),
            variance: ctx.variance[..live].to_vec(),
            output: std::mem::take(&mut ctx.output),
            histograms: ctx.histograms[..live * 256].to_vec(),
            outcome,
            diagnostics,
        })
    }

    /// Initialization, pilot, and the EM loop. Split out so every
    /// error path funnels through one `Failed` transition in `run`.
    fn run_loop(
        &mut self,
        ctx: &mut SegmentationContext,
        input: &[u8],
        diagnostics: &mut SegmentationDiagnostics,
    ) -> Result<Outcome, SegmentationError> {
        ctx.allocate(input, self.config.min_variance, self.config.gamma)?;
        ctx.recompute_coupling(self.config.beta, &self.config.coupling_overrides);

        match &self.config.init {
            InitMode::Basic => Initializer::Basic.initialize(ctx)?,
            InitMode::UserArea(areas) => Initializer::UserArea(areas).initialize(ctx)?,
            InitMode::Manual(seeds) => Initializer::Manual(seeds).initialize(ctx)?,
        }
        Initializer::LabelMap {
            seed: self.config.seed,
        }
        .initialize(ctx)?;
        if self.config.use_gradient_penalty {
            Initializer::GradientPenalty {
                beta_e: self.config.beta_e,
            }
            .initialize(ctx)?;
        }
        if self.config.use_curvature_penalty {
            Initializer::Curvature.initialize(ctx)?;
        }
        self.state = DriverState::Initialized;
        debug!(
            "initialized: {}x{}, {} classes, seed {}",
            ctx.rows,
            ctx.columns,
            ctx.classes(),
            self.config.seed,
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(DRAW_STREAM_OFFSET));

        // Warm start: curvature cost and one unconditional sampler run
        // before any EM bookkeeping.
        self.state = DriverState::PilotMpm;
        let pilot_start = Instant::now();
        if self.config.use_curvature_penalty {
            curvature::compute_curvature_cost(ctx)?;
        }
        let completed = mpm::run(ctx, self.config.mpm_iterations, &mut rng, &self.cancel)?;
        diagnostics.pilot_duration = pilot_start.elapsed();
        if !completed {
            self.state = DriverState::Cancelled;
            return Ok(Outcome::Cancelled);
        }

        self.state = DriverState::EmIterating;
        for k in 0..self.config.em_iterations {
            if self.cancel.is_cancelled() {
                self.state = DriverState::Cancelled;
                return Ok(Outcome::Cancelled);
            }
            let iteration_start = Instant::now();
            ctx.current_em_loop = k;
            #[allow(clippy::cast_precision_loss)]
            {
                ctx.progress = k as f64 / self.config.em_iterations as f64 * 100.0;
            }
            self.emit_progress(ctx);
            stats::convert_labels_to_output(ctx, self.config.gray_table.as_deref());

            if stats::convergence_check(ctx) {
                debug!(
                    "converged at iteration {k}: mse {:.4e} < {:.4e}",
                    ctx.current_mse, ctx.stopping_threshold,
                );
                self.state = DriverState::Converged;
                return Ok(Outcome::Converged);
            }

            stats::save_previous_stats(ctx);
            stats::reset_mean_variance(ctx);
            stats::update_means_and_variances(ctx);
            let before = ctx.classes();
            stats::eliminate_zero_probability_classes(ctx)?;
            if ctx.classes() < before {
                info!(
                    "iteration {k}: eliminated {} empty class(es), {} remain",
                    before - ctx.classes(),
                    ctx.classes(),
                );
            }

            if self.config.simulated_annealing && self.config.em_iterations > 1 {
                #[allow(clippy::cast_precision_loss)]
                let t = k as f64 / (self.config.em_iterations - 1) as f64;
                ctx.working_kappa = self.config.initial_kappa * (1.0 + 9.0 * t.powi(8));
            }
            if self.config.use_curvature_penalty && k >= self.config.ccost_loop_delay {
                curvature::compute_curvature_cost(ctx)?;
            }

            let completed = mpm::run(ctx, self.config.mpm_iterations, &mut rng, &self.cancel)?;
            diagnostics.iterations.push(EmIterationDiagnostics {
                duration: iteration_start.elapsed(),
                mse: ctx.current_mse,
                classes: ctx.classes(),
                kappa: ctx.working_kappa,
            });
            if !completed {
                self.state = DriverState::Cancelled;
                return Ok(Outcome::Cancelled);
            }
        }

        self.state = DriverState::Exhausted;
        Ok(Outcome::Exhausted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::ClassSeed;

    fn two_band_image(rows: usize, columns: usize) -> Vec<u8> {
        let mut input = vec![30u8; rows * columns];
        for r in 0..rows {
            for c in columns / 2..columns {
                input[r * columns + c] = 210;
            }
        }
        input
    }

    #[test]
    fn constant_image_with_no_em_iterations_finishes() {
        // Scenario: likelihood-only labeling, no re-estimation.
        let config = SegmentationConfig {
            em_iterations: 0,
            mpm_iterations: 1,
            ..SegmentationConfig::default()
        };
        let input = vec![100u8; 16];
        let mut driver = EmDriver::new(config);
        let result = driver.run(&input, 4, 4).unwrap();
        assert_eq!(driver.state(), DriverState::Finalized);
        assert_eq!(result.outcome, Outcome::Exhausted);
        assert_eq!(result.labels.len(), 16);
        assert!(result.labels.iter().all(|&l| l < 2));
        // A constant image has zero global deviation, so both class
        // means collapse onto the intensity itself.
        assert!((result.mean[0] - 100.0).abs() < 1e-9);
        assert!((result.mean[1] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn unsampled_class_is_eliminated() {
        // Two well-separated bands, three configured classes; the
        // middle class sits far from both bands with a tiny variance,
        // so its posterior underflows and it is never sampled.
        let config = SegmentationConfig {
            classes: 3,
            em_iterations: 3,
            mpm_iterations: 2,
            init: InitMode::Manual(vec![
                ClassSeed {
                    mean: 30.0,
                    variance: 20.0,
                },
                ClassSeed {
                    mean: 120.0,
                    variance: 0.01,
                },
                ClassSeed {
                    mean: 210.0,
                    variance: 20.0,
                },
            ]),
            ..SegmentationConfig::default()
        };
        let input = two_band_image(8, 8);
        let mut driver = EmDriver::new(config);
        let result = driver.run(&input, 8, 8).unwrap();
        assert_eq!(result.classes, 2);
        assert!(result.labels.iter().all(|&l| l < 2));
        assert_eq!(result.mean.len(), 2);
        assert_eq!(result.histograms.len(), 2 * 256);
    }

    #[test]
    fn high_stopping_threshold_converges_immediately() {
        let config = SegmentationConfig {
            em_iterations: 5,
            mpm_iterations: 1,
            use_stopping_threshold: true,
            stopping_threshold: 1.0e6,
            ..SegmentationConfig::default()
        };
        let input = two_band_image(6, 6);
        let mut driver = EmDriver::new(config);
        let result = driver.run(&input, 6, 6).unwrap();
        assert_eq!(result.outcome, Outcome::Converged);
        // Converged at the top of the first iteration, before any
        // iteration record was written.
        assert!(result.diagnostics.iterations.is_empty());
    }

    #[test]
    fn cancellation_before_the_run_yields_a_cancelled_outcome() {
        let config = SegmentationConfig::default();
        let input = two_band_image(6, 6);
        let mut driver = EmDriver::new(config);
        driver.cancel_token().cancel();
        let result = driver.run(&input, 6, 6).unwrap();
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(driver.state(), DriverState::Finalized);
        assert_eq!(result.labels.len(), 36);
    }

    #[test]
    fn invalid_configuration_fails_the_driver() {
        let config = SegmentationConfig {
            classes: 1,
            ..SegmentationConfig::default()
        };
        let mut driver = EmDriver::new(config);
        let result = driver.run(&[0u8; 4], 2, 2);
        assert!(matches!(
            result,
            Err(SegmentationError::ClassCountOutOfRange { .. }),
        ));
        assert_eq!(driver.state(), DriverState::Failed);
    }

    #[test]
    fn progress_events_cover_every_iteration() {
        use std::sync::Mutex;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let config = SegmentationConfig {
            em_iterations: 3,
            mpm_iterations: 1,
            ..SegmentationConfig::default()
        };
        let input = two_band_image(6, 6);
        let mut driver = EmDriver::new(config).on_progress(move |event| {
            sink.lock().unwrap().push((event.iteration, event.progress));
        });
        driver.run(&input, 6, 6).unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, 0);
        assert!(events[0].1.abs() < f64::EPSILON);
        assert!(events[2].1 > events[1].1);
    }

    #[test]
    fn identical_configurations_reproduce_identical_results() {
        let config = SegmentationConfig {
            em_iterations: 2,
            mpm_iterations: 2,
            seed: 123,
            ..SegmentationConfig::default()
        };
        let input = two_band_image(8, 8);
        let a = EmDriver::new(config.clone()).run(&input, 8, 8).unwrap();
        let b = EmDriver::new(config).run(&input, 8, 8).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.mean, b.mean);
        assert_eq!(a.variance, b.variance);
    }

    #[test]
    fn annealing_raises_kappa_across_iterations() {
        let config = SegmentationConfig {
            em_iterations: 4,
            mpm_iterations: 1,
            simulated_annealing: true,
            ..SegmentationConfig::default()
        };
        let input = two_band_image(6, 6);
        let mut driver = EmDriver::new(config);
        let result = driver.run(&input, 6, 6).unwrap();
        let kappas: Vec<f64> = result.diagnostics.iterations.iter().map(|i| i.kappa).collect();
        assert_eq!(kappas.len(), 4);
        assert!((kappas[0] - 1.0).abs() < 1e-12);
        assert!((kappas[3] - 10.0).abs() < 1e-12);
        assert!(kappas.windows(2).all(|w| w[0] <= w[1]));
    }
}
