//! The per-run segmentation context: every buffer and scalar one
//! EM/MPM run touches, owned in one place.
//!
//! The context itself has no algorithmic behavior — it allocates,
//! resets, and maintains indexing invariants. The operational modules
//! ([`crate::init`], [`crate::mpm`], [`crate::stats`],
//! [`crate::curvature`]) are pure functions over this struct.
//!
//! # Buffer layout
//!
//! All rasters are flat row-major vectors. Two layouts coexist:
//!
//! - `probs` is **pixel-major** (`probs[pixel * alloc_classes + class]`)
//!   so that one label-map row and its posterior slots form disjoint
//!   mutable chunks for the parallel sampler.
//! - `ccost` and `loglike` are **class-major**
//!   (`buf[class * pixels + pixel]`): they are read-only during a
//!   sampler pass and written one whole class plane at a time.
//!
//! `alloc_classes` freezes the physical class count at allocation time.
//! Zero-probability class elimination shrinks only the logical
//! `classes`; no buffer is ever resized mid-run.

use crate::types::{CouplingOverride, SegmentationConfig, SegmentationError};

/// Allocate a zero-filled vector, reporting failure as a structured
/// error naming the buffer instead of aborting.
pub(crate) fn try_vec<T: Clone + Default>(
    len: usize,
    buffer: &'static str,
) -> Result<Vec<T>, SegmentationError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|source| SegmentationError::Allocation { buffer, source })?;
    v.resize(len, T::default());
    Ok(v)
}

/// Shared mutable state of one segmentation run.
///
/// Created once per run, allocated in a single explicit step after all
/// scalar parameters are set, and exclusively owned by the driver for
/// the duration of the run.
#[derive(Debug, Clone)]
pub struct SegmentationContext {
    /// Image rows.
    pub(crate) rows: usize,
    /// Image columns.
    pub(crate) columns: usize,
    /// Vector components per pixel (forced to 1 by validation).
    pub(crate) dims: usize,
    /// Live class count. Shrinks on elimination, never grows.
    pub(crate) classes: usize,
    /// Physical class count frozen at allocation. Also the off-image
    /// sentinel index in the coupling matrix.
    pub(crate) alloc_classes: usize,

    /// Working copy of the input image bytes.
    pub(crate) y: Vec<u8>,
    /// Label map, one byte per pixel, each value `< classes`.
    pub(crate) xt: Vec<u8>,

    /// Per-class means, `alloc_classes * dims`.
    pub(crate) mean: Vec<f64>,
    /// Per-class variances, `alloc_classes * dims`.
    pub(crate) variance: Vec<f64>,
    /// Means saved before the current statistics update.
    pub(crate) prev_mean: Vec<f64>,
    /// Variances saved before the current statistics update.
    pub(crate) prev_variance: Vec<f64>,
    /// Soft pixel counts per class.
    pub(crate) n: Vec<f64>,
    /// Per-class variance floors.
    pub(crate) min_variance: Vec<f64>,
    /// Per-class log-prior biases.
    pub(crate) w_gamma: Vec<f64>,

    /// Posterior accumulator, pixel-major (`pixel * alloc_classes + class`).
    pub(crate) probs: Vec<f64>,
    /// Symmetric class-coupling matrix of side `alloc_classes + 1`.
    pub(crate) coupling: Vec<f64>,

    /// Vertical edge weights, `(rows - 1) * columns`.
    pub(crate) ns: Vec<f64>,
    /// Horizontal edge weights, `rows * (columns - 1)`.
    pub(crate) ew: Vec<f64>,
    /// Anti-diagonal edge weights, `(rows - 1) * (columns - 1)`.
    pub(crate) sw: Vec<f64>,
    /// Main-diagonal edge weights, `(rows - 1) * (columns - 1)`.
    pub(crate) nw: Vec<f64>,

    /// Curvature mismatch cost, class-major.
    pub(crate) ccost: Vec<f64>,
    /// Per-class log-likelihood cache, class-major. Rebuilt once per
    /// sampler run.
    pub(crate) loglike: Vec<f64>,

    /// Gray-mapped preview buffer, one byte per pixel.
    pub(crate) output: Vec<u8>,
    /// Per-class Gaussian histogram table, `alloc_classes * dims * 256`.
    pub(crate) histograms: Vec<f64>,
    /// Hard pixel counts per class, refreshed by output conversion.
    pub(crate) class_counts: Vec<u64>,

    /// Current annealed inverse temperature.
    pub(crate) working_kappa: f64,
    /// Current outer EM iteration.
    pub(crate) current_em_loop: usize,
    /// Current sampler pass within the active run.
    pub(crate) current_mpm_loop: usize,
    /// Mean-squared mean/variance drift from the last convergence check.
    pub(crate) current_mse: f64,
    /// Run progress in `[0, 100]`.
    pub(crate) progress: f64,

    /// Copied from the configuration so the sampler and penalty
    /// engines need no config access.
    pub(crate) use_gradient_penalty: bool,
    pub(crate) use_curvature_penalty: bool,
    pub(crate) beta_c: f64,
    pub(crate) r_max: f64,
    pub(crate) use_stopping_threshold: bool,
    pub(crate) stopping_threshold: f64,

    allocated: bool,
}

impl SegmentationContext {
    /// Create an unallocated context from validated scalar parameters.
    ///
    /// No buffer is touched here; call [`allocate`](Self::allocate)
    /// before any sampler or statistics operation.
    #[must_use]
    pub fn new(rows: usize, columns: usize, config: &SegmentationConfig) -> Self {
        Self {
            rows,
            columns,
            dims: config.dims,
            classes: config.classes,
            alloc_classes: config.classes,
            y: Vec::new(),
            xt: Vec::new(),
            mean: Vec::new(),
            variance: Vec::new(),
            prev_mean: Vec::new(),
            prev_variance: Vec::new(),
            n: Vec::new(),
            min_variance: Vec::new(),
            w_gamma: Vec::new(),
            probs: Vec::new(),
            coupling: Vec::new(),
            ns: Vec::new(),
            ew: Vec::new(),
            sw: Vec::new(),
            nw: Vec::new(),
            ccost: Vec::new(),
            loglike: Vec::new(),
            output: Vec::new(),
            histograms: Vec::new(),
            class_counts: Vec::new(),
            working_kappa: config.initial_kappa,
            current_em_loop: 0,
            current_mpm_loop: 0,
            current_mse: 0.0,
            progress: 0.0,
            use_gradient_penalty: config.use_gradient_penalty,
            use_curvature_penalty: config.use_curvature_penalty,
            beta_c: config.beta_c,
            r_max: config.r_max,
            use_stopping_threshold: config.use_stopping_threshold,
            stopping_threshold: config.stopping_threshold,
            allocated: false,
        }
    }

    /// Allocate every sized buffer from the current geometry and copy
    /// the input image into the working buffer.
    ///
    /// Idempotent: a second call on an already-allocated context is a
    /// no-op, so existing buffers are never leaked or reallocated.
    ///
    /// The floors passed at construction seed `min_variance` and
    /// `w_gamma` uniformly; callers may adjust individual entries
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentationError::InputSizeMismatch`] when the input
    /// length disagrees with `rows * columns * dims`, and
    /// [`SegmentationError::Allocation`] naming the first buffer whose
    /// reservation failed. The context is then partially allocated and
    /// must not be used (drop it or [`reset`](Self::reset) it).
    pub fn allocate(
        &mut self,
        input: &[u8],
        min_variance: f64,
        gamma: f64,
    ) -> Result<(), SegmentationError> {
        let expected = self.rows * self.columns * self.dims;
        if input.len() != expected {
            return Err(SegmentationError::InputSizeMismatch {
                expected,
                got: input.len(),
            });
        }
        if self.allocated {
            return Ok(());
        }
        let pixels = self.rows * self.columns;
        let cd = self.alloc_classes * self.dims;
        let side = self.alloc_classes + 1;

        self.y = try_vec(pixels * self.dims, "working image")?;
        self.y.copy_from_slice(input);
        self.xt = try_vec(pixels, "label map")?;
        self.mean = try_vec(cd, "mean")?;
        self.variance = try_vec(cd, "variance")?;
        self.prev_mean = try_vec(cd, "previous mean")?;
        self.prev_variance = try_vec(cd, "previous variance")?;
        self.n = try_vec(self.alloc_classes, "class counts")?;
        self.min_variance = try_vec(self.alloc_classes, "variance floors")?;
        self.min_variance.fill(min_variance);
        self.w_gamma = try_vec(self.alloc_classes, "class bias")?;
        self.w_gamma.fill(gamma);
        self.probs = try_vec(pixels * self.alloc_classes, "posterior accumulator")?;
        self.coupling = try_vec(side * side, "coupling matrix")?;
        self.ns = try_vec(self.rows.saturating_sub(1) * self.columns, "ns edges")?;
        self.ew = try_vec(self.rows * self.columns.saturating_sub(1), "ew edges")?;
        let diagonal = self.rows.saturating_sub(1) * self.columns.saturating_sub(1);
        self.sw = try_vec(diagonal, "sw edges")?;
        self.nw = try_vec(diagonal, "nw edges")?;
        self.ccost = try_vec(self.alloc_classes * pixels, "curvature cost")?;
        self.loglike = try_vec(self.alloc_classes * pixels, "log-likelihood")?;
        self.output = try_vec(pixels, "output image")?;
        self.histograms = try_vec(cd * 256, "histograms")?;
        self.class_counts = try_vec(self.alloc_classes, "pixel counts")?;

        self.allocated = true;
        Ok(())
    }

    /// Return the context to its documented empty state: all buffers
    /// released, all counters and flags zeroed, class count restored to
    /// the allocation-time value.
    ///
    /// Required before reconfiguring a context for reuse.
    pub fn reset(&mut self) {
        self.classes = self.alloc_classes;
        self.y = Vec::new();
        self.xt = Vec::new();
        self.mean = Vec::new();
        self.variance = Vec::new();
        self.prev_mean = Vec::new();
        self.prev_variance = Vec::new();
        self.n = Vec::new();
        self.min_variance = Vec::new();
        self.w_gamma = Vec::new();
        self.probs = Vec::new();
        self.coupling = Vec::new();
        self.ns = Vec::new();
        self.ew = Vec::new();
        self.sw = Vec::new();
        self.nw = Vec::new();
        self.ccost = Vec::new();
        self.loglike = Vec::new();
        self.output = Vec::new();
        self.histograms = Vec::new();
        self.class_counts = Vec::new();
        self.current_em_loop = 0;
        self.current_mpm_loop = 0;
        self.current_mse = 0.0;
        self.progress = 0.0;
        self.allocated = false;
    }

    /// Rebuild the coupling matrix from a default beta plus explicit
    /// per-pair overrides. O(classes²).
    ///
    /// Invariants after every call: symmetric, zero diagonal, zero
    /// row/column for the off-image sentinel index.
    pub fn recompute_coupling(&mut self, default_beta: f64, overrides: &[CouplingOverride]) {
        let side = self.alloc_classes + 1;
        for a in 0..side {
            for b in 0..side {
                let weight = if a == b || a == self.alloc_classes || b == self.alloc_classes {
                    0.0
                } else {
                    default_beta
                };
                self.coupling[a * side + b] = weight;
            }
        }
        for o in overrides {
            if o.class_a < self.alloc_classes && o.class_b < self.alloc_classes {
                self.coupling[o.class_a * side + o.class_b] = o.beta;
                self.coupling[o.class_b * side + o.class_a] = o.beta;
            }
        }
    }

    /// Total pixel count.
    #[inline]
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.rows * self.columns
    }

    /// Off-image sentinel class index (zero coupling by construction).
    #[inline]
    #[must_use]
    pub const fn sentinel(&self) -> usize {
        self.alloc_classes
    }

    /// Coupling weight between two class indices (sentinel allowed).
    #[inline]
    #[must_use]
    pub fn coupling_at(&self, a: usize, b: usize) -> f64 {
        self.coupling[a * (self.alloc_classes + 1) + b]
    }

    /// Whether [`allocate`](Self::allocate) has completed.
    #[inline]
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Live class count.
    #[inline]
    #[must_use]
    pub const fn classes(&self) -> usize {
        self.classes
    }

    /// The current label map.
    #[must_use]
    pub fn labels(&self) -> &[u8] {
        &self.xt
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SegmentationConfig;

    fn small_context() -> SegmentationContext {
        let config = SegmentationConfig {
            classes: 3,
            ..SegmentationConfig::default()
        };
        let mut ctx = SegmentationContext::new(4, 5, &config);
        let input = vec![7u8; 20];
        ctx.allocate(&input, config.min_variance, config.gamma)
            .unwrap();
        ctx
    }

    #[test]
    fn allocate_sizes_every_buffer() {
        let ctx = small_context();
        assert_eq!(ctx.y.len(), 20);
        assert_eq!(ctx.xt.len(), 20);
        assert_eq!(ctx.mean.len(), 3);
        assert_eq!(ctx.variance.len(), 3);
        assert_eq!(ctx.prev_mean.len(), 3);
        assert_eq!(ctx.prev_variance.len(), 3);
        assert_eq!(ctx.n.len(), 3);
        assert_eq!(ctx.min_variance.len(), 3);
        assert_eq!(ctx.w_gamma.len(), 3);
        assert_eq!(ctx.probs.len(), 60);
        assert_eq!(ctx.coupling.len(), 16);
        assert_eq!(ctx.ns.len(), 15);
        assert_eq!(ctx.ew.len(), 16);
        assert_eq!(ctx.sw.len(), 12);
        assert_eq!(ctx.nw.len(), 12);
        assert_eq!(ctx.ccost.len(), 60);
        assert_eq!(ctx.loglike.len(), 60);
        assert_eq!(ctx.output.len(), 20);
        assert_eq!(ctx.histograms.len(), 3 * 256);
        assert!(ctx.is_allocated());
    }

    #[test]
    fn allocate_rejects_mismatched_input_length() {
        let config = SegmentationConfig {
            classes: 3,
            ..SegmentationConfig::default()
        };
        let mut ctx = SegmentationContext::new(4, 4, &config);
        let input = vec![0u8; 15];
        assert!(matches!(
            ctx.allocate(&input, config.min_variance, config.gamma),
            Err(SegmentationError::InputSizeMismatch {
                expected: 16,
                got: 15,
            }),
        ));
        assert!(!ctx.is_allocated());
    }

    #[test]
    fn allocate_copies_input_into_working_buffer() {
        let ctx = small_context();
        assert!(ctx.y.iter().all(|&b| b == 7));
    }

    #[test]
    fn allocate_fills_floors_and_bias() {
        let ctx = small_context();
        assert!(ctx.min_variance.iter().all(|&v| (v - 4.5).abs() < 1e-12));
        assert!(ctx.w_gamma.iter().all(|&g| g.abs() < 1e-12));
    }

    #[test]
    fn double_allocate_is_idempotent() {
        let mut ctx = small_context();
        // Mutate a buffer, re-allocate, and confirm nothing was reset.
        ctx.xt[0] = 2;
        let input = vec![7u8; 20];
        ctx.allocate(&input, 4.5, 0.0).unwrap();
        assert_eq!(ctx.xt[0], 2);
        assert_eq!(ctx.xt.len(), 20);
    }

    #[test]
    fn reset_releases_buffers_and_zeroes_state() {
        let mut ctx = small_context();
        ctx.current_em_loop = 3;
        ctx.progress = 55.0;
        ctx.reset();
        assert!(!ctx.is_allocated());
        assert!(ctx.y.is_empty());
        assert!(ctx.probs.is_empty());
        assert_eq!(ctx.current_em_loop, 0);
        assert!(ctx.progress.abs() < f64::EPSILON);
        assert_eq!(ctx.classes, 3);
    }

    #[test]
    fn coupling_is_symmetric_with_overrides() {
        let mut ctx = small_context();
        ctx.recompute_coupling(
            1.0,
            &[crate::types::CouplingOverride {
                class_a: 0,
                class_b: 2,
                beta: 3.5,
            }],
        );
        for a in 0..=ctx.alloc_classes {
            for b in 0..=ctx.alloc_classes {
                assert!(
                    (ctx.coupling_at(a, b) - ctx.coupling_at(b, a)).abs() < f64::EPSILON,
                    "asymmetric at ({a}, {b})",
                );
            }
        }
        assert!((ctx.coupling_at(0, 2) - 3.5).abs() < f64::EPSILON);
        assert!((ctx.coupling_at(0, 1) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn coupling_diagonal_and_sentinel_are_zero() {
        let mut ctx = small_context();
        ctx.recompute_coupling(2.0, &[]);
        let sentinel = ctx.sentinel();
        for a in 0..=ctx.alloc_classes {
            assert!(ctx.coupling_at(a, a).abs() < f64::EPSILON);
            assert!(ctx.coupling_at(a, sentinel).abs() < f64::EPSILON);
            assert!(ctx.coupling_at(sentinel, a).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn try_vec_reports_buffer_name_on_failure() {
        // An absurd length must fail to reserve rather than abort.
        let result: Result<Vec<f64>, _> = try_vec(usize::MAX / 2, "huge");
        assert!(matches!(
            result,
            Err(SegmentationError::Allocation { buffer: "huge", .. }),
        ));
    }
}
