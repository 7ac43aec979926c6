//! Initialization strategies: everything that seeds the context before
//! the first sampler pass.
//!
//! Each strategy is a variant of [`Initializer`], dispatched through a
//! single [`initialize`](Initializer::initialize) call. The label-map
//! initializer always runs in addition to whichever mean/variance
//! strategy was selected; the penalty initializers run only when their
//! feature flag is set.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::context::SegmentationContext;
use crate::types::{ClassSeed, SeedArea, SegmentationError};

/// Variance every non-manual initializer assigns to each class.
pub const INITIAL_VARIANCE: f64 = 20.0;

/// One initialization behavior over the shared context.
#[derive(Debug, Clone)]
pub enum Initializer<'a> {
    /// Symmetric mean layout around the global image mean.
    Basic,
    /// Per-class means averaged over user-supplied rectangles.
    UserArea(&'a [SeedArea]),
    /// Per-class mean/variance pairs copied verbatim, typically the
    /// final statistics of a previous run on a related image.
    Manual(&'a [ClassSeed]),
    /// Uniformly random label per pixel from a seeded generator.
    LabelMap {
        /// Seed for the label generator.
        seed: u64,
    },
    /// Precomputed directional edge weights for the gradient penalty.
    GradientPenalty {
        /// Edge-weight scale.
        beta_e: f64,
    },
    /// Zeroed curvature cost buffer.
    Curvature,
}

impl Initializer<'_> {
    /// Apply this strategy to an allocated context.
    ///
    /// # Errors
    ///
    /// [`UserArea`](Self::UserArea) returns
    /// [`SegmentationError::UnsupportedDims`] on a multi-channel
    /// context and [`SegmentationError::InvalidSeedArea`] when a
    /// rectangle falls outside the image or is inverted. The other
    /// strategies cannot fail.
    pub fn initialize(&self, ctx: &mut SegmentationContext) -> Result<(), SegmentationError> {
        match *self {
            Self::Basic => {
                basic(ctx);
                Ok(())
            }
            Self::UserArea(areas) => user_area(ctx, areas),
            Self::Manual(seeds) => {
                manual(ctx, seeds);
                Ok(())
            }
            Self::LabelMap { seed } => {
                label_map(ctx, seed);
                Ok(())
            }
            Self::GradientPenalty { beta_e } => {
                gradient_penalty(ctx, beta_e);
                Ok(())
            }
            Self::Curvature => {
                ctx.ccost.fill(0.0);
                Ok(())
            }
        }
    }
}

/// Symmetric mean layout: class means spaced `σ/2` apart around the
/// global image mean, class 0 lowest. With an odd class count the
/// middle class sits exactly on the global mean. Deterministic given
/// the image.
#[allow(clippy::cast_precision_loss)]
fn basic(ctx: &mut SegmentationContext) {
    let pixels = ctx.pixel_count();
    for d in 0..ctx.dims {
        let mut sum = 0.0;
        for p in 0..pixels {
            sum += f64::from(ctx.y[p * ctx.dims + d]);
        }
        let global_mean = sum / pixels as f64;

        let mut sq = 0.0;
        for p in 0..pixels {
            let diff = f64::from(ctx.y[p * ctx.dims + d]) - global_mean;
            sq += diff * diff;
        }
        let sigma = (sq / pixels as f64).sqrt();

        let half = ctx.classes / 2;
        if ctx.classes % 2 == 0 {
            for k in 0..half {
                let offset = (k + 1) as f64 * sigma / 2.0;
                ctx.mean[(half + k) * ctx.dims + d] = global_mean + offset;
                ctx.mean[(half - 1 - k) * ctx.dims + d] = global_mean - offset;
            }
        } else {
            ctx.mean[half * ctx.dims + d] = global_mean;
            for k in 0..half {
                let offset = (k + 1) as f64 * sigma / 2.0;
                ctx.mean[(half + 1 + k) * ctx.dims + d] = global_mean + offset;
                ctx.mean[(half - 1 - k) * ctx.dims + d] = global_mean - offset;
            }
        }
    }
    ctx.variance[..ctx.classes * ctx.dims].fill(INITIAL_VARIANCE);
}

/// Per-class rectangle averages. Rectangles are inclusive on both
/// corners, `x` indexing columns and `y` indexing rows.
#[allow(clippy::cast_precision_loss)]
fn user_area(ctx: &mut SegmentationContext, areas: &[SeedArea]) -> Result<(), SegmentationError> {
    if ctx.dims != 1 {
        return Err(SegmentationError::UnsupportedDims { dims: ctx.dims });
    }
    if areas.len() != ctx.classes {
        return Err(SegmentationError::SeedCountMismatch {
            expected: ctx.classes,
            got: areas.len(),
        });
    }
    for (class, area) in areas.iter().enumerate() {
        if area.x2 < area.x1
            || area.y2 < area.y1
            || area.x2 >= ctx.columns
            || area.y2 >= ctx.rows
        {
            return Err(SegmentationError::InvalidSeedArea {
                class,
                rows: ctx.rows,
                columns: ctx.columns,
            });
        }
        let mut sum = 0.0;
        for r in area.y1..=area.y2 {
            for c in area.x1..=area.x2 {
                sum += f64::from(ctx.y[r * ctx.columns + c]);
            }
        }
        let count = ((area.y2 - area.y1 + 1) * (area.x2 - area.x1 + 1)) as f64;
        ctx.mean[class] = sum / count;
        ctx.variance[class] = INITIAL_VARIANCE;
    }
    Ok(())
}

/// Copy explicit per-class seeds into the context. Seed count and
/// variance positivity were checked during configuration validation.
fn manual(ctx: &mut SegmentationContext, seeds: &[ClassSeed]) {
    for (class, seed) in seeds.iter().enumerate().take(ctx.classes) {
        for d in 0..ctx.dims {
            ctx.mean[class * ctx.dims + d] = seed.mean;
            ctx.variance[class * ctx.dims + d] = seed.variance;
        }
    }
}

/// Uniformly random class per pixel. Runs once before the first
/// sampler pass regardless of the mean/variance strategy.
#[allow(clippy::cast_possible_truncation)]
fn label_map(ctx: &mut SegmentationContext, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let classes = ctx.classes;
    for label in &mut ctx.xt {
        *label = rng.random_range(0..classes) as u8;
    }
}

/// `beta_e · atan((10 − |Δ|) / 5)` for one edge, where `dsq` is the
/// squared per-dim intensity difference (already halved for diagonal
/// edges).
fn edge_weight(dsq: f64, beta_e: f64) -> f64 {
    beta_e * ((10.0 - dsq.sqrt()) / 5.0).atan()
}

/// Squared intensity difference between two pixels across all dims.
fn pixel_diff_sq(ctx: &SegmentationContext, a: usize, b: usize) -> f64 {
    let mut dsq = 0.0;
    for d in 0..ctx.dims {
        let diff = f64::from(ctx.y[a * ctx.dims + d]) - f64::from(ctx.y[b * ctx.dims + d]);
        dsq += diff * diff;
    }
    dsq
}

/// Fill the four directional edge-weight buffers from intensity
/// differences. Vertical edges pair `(r, c)` with `(r+1, c)`;
/// horizontal pair `(r, c)` with `(r, c+1)`; the main diagonal (`nw`)
/// pairs `(r, c)` with `(r+1, c+1)` and the anti-diagonal (`sw`) pairs
/// `(r, c+1)` with `(r+1, c)`. Diagonal differences are halved before
/// the square root.
fn gradient_penalty(ctx: &mut SegmentationContext, beta_e: f64) {
    let rows = ctx.rows;
    let cols = ctx.columns;
    for r in 0..rows.saturating_sub(1) {
        for c in 0..cols {
            let dsq = pixel_diff_sq(ctx, r * cols + c, (r + 1) * cols + c);
            ctx.ns[r * cols + c] = edge_weight(dsq, beta_e);
        }
    }
    for r in 0..rows {
        for c in 0..cols.saturating_sub(1) {
            let dsq = pixel_diff_sq(ctx, r * cols + c, r * cols + c + 1);
            ctx.ew[r * (cols - 1) + c] = edge_weight(dsq, beta_e);
        }
    }
    for r in 0..rows.saturating_sub(1) {
        for c in 0..cols.saturating_sub(1) {
            let nw_dsq = 0.5 * pixel_diff_sq(ctx, r * cols + c, (r + 1) * cols + c + 1);
            ctx.nw[r * (cols - 1) + c] = edge_weight(nw_dsq, beta_e);
            let sw_dsq = 0.5 * pixel_diff_sq(ctx, r * cols + c + 1, (r + 1) * cols + c);
            ctx.sw[r * (cols - 1) + c] = edge_weight(sw_dsq, beta_e);
        }
    }
}
