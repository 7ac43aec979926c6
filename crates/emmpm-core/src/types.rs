//! Shared types for the EM/MPM segmentation engine.

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference label and
/// preview rasters without depending on `image` directly.
pub use image::GrayImage;

use crate::diagnostics::SegmentationDiagnostics;

/// Minimum supported class count.
pub const MIN_CLASSES: usize = 2;

/// Maximum supported class count.
///
/// Labels and the off-image sentinel must fit in a `u8`, and the
/// per-pixel posterior is accumulated on the stack, so the ceiling is
/// deliberately small.
pub const MAX_CLASSES: usize = 15;

/// How the per-class means and variances are seeded before the first
/// EM iteration.
///
/// The random label map is *not* part of this choice — it is always
/// generated from the configured seed regardless of which mean/variance
/// initializer runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum InitMode {
    /// Spread class means symmetrically around the global image mean at
    /// multiples of half the global standard deviation. Deterministic
    /// given the image.
    #[default]
    Basic,

    /// Average the intensity inside one user-supplied rectangle per
    /// class. Requires a single-channel image.
    UserArea(Vec<SeedArea>),

    /// Use explicit per-class mean/variance pairs, typically the final
    /// statistics of a previous run on a related image.
    Manual(Vec<ClassSeed>),
}

/// Inclusive pixel rectangle seeding one class in [`InitMode::UserArea`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedArea {
    /// Left column (inclusive).
    pub x1: usize,
    /// Top row (inclusive).
    pub y1: usize,
    /// Right column (inclusive).
    pub x2: usize,
    /// Bottom row (inclusive).
    pub y2: usize,
}

/// Explicit mean/variance seed for one class in [`InitMode::Manual`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassSeed {
    /// Initial class mean (intensity units).
    pub mean: f64,
    /// Initial class variance. Must be positive.
    pub variance: f64,
}

/// Overrides the default pairwise coupling weight for one class pair.
///
/// The coupling matrix stays symmetric: an override of `(a, b)` applies
/// to `(b, a)` as well.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingOverride {
    /// First class of the pair.
    pub class_a: usize,
    /// Second class of the pair.
    pub class_b: usize,
    /// Coupling weight replacing the default beta for this pair.
    pub beta: f64,
}

/// Configuration for one segmentation run.
///
/// All parameters have defaults matching the classic EM/MPM setup: two
/// classes, uniform coupling, no edge or shape penalties, no annealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Number of statistical classes, in `[2, 15]`. Class elimination
    /// may shrink the count during the run; it never grows.
    pub classes: usize,

    /// Vector components per pixel. The shipped algorithm is
    /// single-channel; any other value is rejected at validation.
    pub dims: usize,

    /// Default pairwise coupling weight (exchange energy) between
    /// distinct classes.
    pub beta: f64,

    /// Per-class log-prior bias, applied uniformly to every class.
    pub gamma: f64,

    /// Outer EM iterations. Zero is allowed: the pilot sampler run still
    /// executes and produces a label map.
    pub em_iterations: usize,

    /// Stochastic relaxation passes per sampler run. Must be at least
    /// one: the statistics update re-estimates from the posterior the
    /// passes accumulate.
    pub mpm_iterations: usize,

    /// Ramp the inverse temperature over the EM loop, sharpening the
    /// posterior in later iterations.
    pub simulated_annealing: bool,

    /// Base inverse temperature. With annealing enabled the working
    /// value ramps from here toward ten times here.
    pub initial_kappa: f64,

    /// Penalize label changes across low-gradient edges.
    pub use_gradient_penalty: bool,

    /// Gradient penalty weight. Only used when `use_gradient_penalty`.
    pub beta_e: f64,

    /// Penalize labelings that disagree with their own morphological
    /// opening at multiple scales.
    pub use_curvature_penalty: bool,

    /// Curvature penalty weight. Only used when `use_curvature_penalty`.
    pub beta_c: f64,

    /// Largest structuring-element radius for the curvature filter.
    pub r_max: f64,

    /// EM iterations to wait before recomputing the curvature cost
    /// inside the loop.
    pub ccost_loop_delay: usize,

    /// Stop the EM loop early once the mean/variance drift falls below
    /// `stopping_threshold`.
    pub use_stopping_threshold: bool,

    /// Mean-squared drift threshold. Only used when
    /// `use_stopping_threshold`.
    pub stopping_threshold: f64,

    /// Per-class variance floor applied after every statistics update.
    pub min_variance: f64,

    /// Seed for the label-map initializer and the sampler's uniform
    /// draws. Identical seed + config + input reproduces a run exactly.
    pub seed: u64,

    /// Mean/variance initialization strategy.
    pub init: InitMode,

    /// Per-pair coupling weight overrides, in original class indices.
    pub coupling_overrides: Vec<CouplingOverride>,

    /// Gray value per class for the output preview. `None` spreads the
    /// classes evenly over `[0, 255]`. Length must equal `classes`.
    pub gray_table: Option<Vec<u8>>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            classes: 2,
            dims: 1,
            beta: 1.0,
            gamma: 0.0,
            em_iterations: 5,
            mpm_iterations: 5,
            simulated_annealing: false,
            initial_kappa: 1.0,
            use_gradient_penalty: false,
            beta_e: 1.0,
            use_curvature_penalty: false,
            beta_c: 1.0,
            r_max: 8.0,
            ccost_loop_delay: 1,
            use_stopping_threshold: false,
            stopping_threshold: 0.0,
            min_variance: 4.5,
            seed: 0,
            init: InitMode::Basic,
            coupling_overrides: Vec::new(),
            gray_table: None,
        }
    }
}

impl SegmentationConfig {
    /// Validate this configuration against the input geometry.
    ///
    /// Runs before any buffer is allocated, so a rejected configuration
    /// never leaves a partially-built context behind.
    ///
    /// # Errors
    ///
    /// Returns a structured [`SegmentationError`] describing the first
    /// problem found: class count out of range, empty or mis-sized
    /// input, unsupported channel count, bad per-class seeds, or an
    /// out-of-range coupling override.
    pub fn validate(
        &self,
        rows: usize,
        columns: usize,
        input_len: usize,
    ) -> Result<(), SegmentationError> {
        if !(MIN_CLASSES..=MAX_CLASSES).contains(&self.classes) {
            return Err(SegmentationError::ClassCountOutOfRange { got: self.classes });
        }
        if self.mpm_iterations == 0 {
            return Err(SegmentationError::InvalidConfig(
                "mpm_iterations must be at least 1".to_owned(),
            ));
        }
        if rows == 0 || columns == 0 || input_len == 0 {
            return Err(SegmentationError::EmptyInput);
        }
        if self.dims != 1 {
            return Err(SegmentationError::UnsupportedDims { dims: self.dims });
        }
        let expected = rows * columns * self.dims;
        if input_len != expected {
            return Err(SegmentationError::InputSizeMismatch {
                expected,
                got: input_len,
            });
        }
        match &self.init {
            InitMode::Basic => {}
            InitMode::UserArea(areas) => {
                if areas.len() != self.classes {
                    return Err(SegmentationError::SeedCountMismatch {
                        expected: self.classes,
                        got: areas.len(),
                    });
                }
                for (class, area) in areas.iter().enumerate() {
                    if area.x2 < area.x1
                        || area.y2 < area.y1
                        || area.x2 >= columns
                        || area.y2 >= rows
                    {
                        return Err(SegmentationError::InvalidSeedArea {
                            class,
                            rows,
                            columns,
                        });
                    }
                }
            }
            InitMode::Manual(seeds) => {
                if seeds.len() != self.classes {
                    return Err(SegmentationError::SeedCountMismatch {
                        expected: self.classes,
                        got: seeds.len(),
                    });
                }
                for (class, seed) in seeds.iter().enumerate() {
                    if !(seed.variance > 0.0) {
                        return Err(SegmentationError::InvalidSeedVariance {
                            class,
                            variance: seed.variance,
                        });
                    }
                }
            }
        }
        for o in &self.coupling_overrides {
            if o.class_a >= self.classes || o.class_b >= self.classes || o.class_a == o.class_b {
                return Err(SegmentationError::InvalidCouplingOverride {
                    class_a: o.class_a,
                    class_b: o.class_b,
                    classes: self.classes,
                });
            }
        }
        if let Some(table) = &self.gray_table {
            if table.len() != self.classes {
                return Err(SegmentationError::InvalidConfig(format!(
                    "gray table has {} entries for {} classes",
                    table.len(),
                    self.classes,
                )));
            }
        }
        Ok(())
    }
}

/// Errors that can occur while configuring or running a segmentation.
///
/// Cancellation is *not* an error — a cancelled run still returns a
/// [`SegmentationResult`] with [`Outcome::Cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum SegmentationError {
    /// Class count outside `[MIN_CLASSES, MAX_CLASSES]`.
    #[error("class count must be in [{MIN_CLASSES}, {MAX_CLASSES}], got {got}")]
    ClassCountOutOfRange {
        /// The rejected class count.
        got: usize,
    },

    /// The input buffer or geometry is empty.
    #[error("input image buffer is empty")]
    EmptyInput,

    /// The input buffer length disagrees with `rows * columns * dims`.
    #[error("input buffer holds {got} bytes but rows * columns * dims = {expected}")]
    InputSizeMismatch {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        got: usize,
    },

    /// Multi-channel input on a single-channel engine.
    #[error("{dims}-channel input is not supported, the engine is single-channel")]
    UnsupportedDims {
        /// The rejected channel count.
        dims: usize,
    },

    /// Initialization requires exactly one seed per class.
    #[error("initialization requires one seed per class ({expected}), got {got}")]
    SeedCountMismatch {
        /// Configured class count.
        expected: usize,
        /// Seeds supplied.
        got: usize,
    },

    /// A user-area rectangle is inverted or extends past the image.
    #[error("seed area for class {class} is inverted or outside the {rows}x{columns} image")]
    InvalidSeedArea {
        /// Class whose rectangle was rejected.
        class: usize,
        /// Image rows.
        rows: usize,
        /// Image columns.
        columns: usize,
    },

    /// A manual seed carries a non-positive variance.
    #[error("seed variance for class {class} must be positive, got {variance}")]
    InvalidSeedVariance {
        /// Class whose seed was rejected.
        class: usize,
        /// The rejected variance.
        variance: f64,
    },

    /// A coupling override names a missing class or a diagonal entry.
    #[error("coupling override ({class_a}, {class_b}) must name two distinct classes below {classes}")]
    InvalidCouplingOverride {
        /// First class of the override.
        class_a: usize,
        /// Second class of the override.
        class_b: usize,
        /// Configured class count.
        classes: usize,
    },

    /// A buffer allocation failed. The context must not be used.
    #[error("failed to allocate the {buffer} buffer")]
    Allocation {
        /// Name of the buffer that could not be allocated.
        buffer: &'static str,
        /// Underlying reservation failure.
        #[source]
        source: std::collections::TryReserveError,
    },

    /// Class elimination left fewer than two live classes.
    #[error("class elimination left {remaining} live class(es), need at least {MIN_CLASSES}")]
    DegenerateModel {
        /// Live classes remaining after elimination.
        remaining: usize,
    },

    /// Catch-all for configuration problems with no dedicated variant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// How a run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The stopping threshold was met before the iteration budget.
    Converged,
    /// All configured EM iterations ran without meeting the threshold.
    Exhausted,
    /// The run was cancelled; the label map is partially converged.
    Cancelled,
}

/// Everything a completed (or cancelled) run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationResult {
    /// Image rows.
    pub rows: usize,
    /// Image columns.
    pub columns: usize,
    /// Live class count at the end of the run (elimination may have
    /// shrunk it below the configured value).
    pub classes: usize,
    /// Final label map, one byte per pixel, each value `< classes`.
    pub labels: Vec<u8>,
    /// Final per-class means, `classes * dims` entries. Usable as the
    /// manual seed for a follow-up run on a related image.
    pub mean: Vec<f64>,
    /// Final per-class variances, `classes * dims` entries.
    pub variance: Vec<f64>,
    /// Gray-mapped preview buffer, one byte per pixel.
    pub output: Vec<u8>,
    /// Per-class 256-bin Gaussian curves weighted by class area
    /// fraction, `classes * dims * 256` entries.
    pub histograms: Vec<f64>,
    /// Terminal outcome of the run.
    pub outcome: Outcome,
    /// Timing and convergence metrics.
    pub diagnostics: SegmentationDiagnostics,
}

impl SegmentationResult {
    /// The preview buffer as a [`GrayImage`], or `None` if the buffer
    /// size disagrees with the stored geometry (which a well-formed
    /// result never does).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn output_image(&self) -> Option<GrayImage> {
        GrayImage::from_raw(self.columns as u32, self.rows as u32, self.output.clone())
    }

    /// The 256-bin histogram for one class and dimension, or `None`
    /// when the class or dimension is out of range.
    ///
    /// Histograms are laid out `[(class * dims + dim) * 256 ..]`.
    #[must_use]
    pub fn histogram(&self, class: usize, dim: usize) -> Option<&[f64]> {
        let dims = self.mean.len() / self.classes.max(1);
        if class >= self.classes || dim >= dims {
            return None;
        }
        let offset = (class * dims + dim) * 256;
        self.histograms.get(offset..offset + 256)
    }
}
