//! The MPM sampler: synchronous Gibbs sweeps over the label map.
//!
//! One sampler run covers one EM iteration: the per-class
//! log-likelihood cache is rebuilt once, then the label map is swept
//! `passes` times. Within a pass every pixel is updated independently
//! against the labels frozen at pass start, so the per-pixel body is a
//! data-parallel map over rows. The pre-generated uniform draws are
//! the only randomness entering the parallel section.

use rand::Rng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::context::{SegmentationContext, try_vec};
use crate::driver::CancelToken;
use crate::types::{MAX_CLASSES, SegmentationError};

use std::f64::consts::PI;

/// Rebuild the class-major log-likelihood cache
/// `Σ_d −log(√(2π·var)) − (y − mean)² / (2·var)`.
pub fn compute_log_likelihood(ctx: &mut SegmentationContext) {
    let pixels = ctx.pixel_count();
    let dims = ctx.dims;
    let y = &ctx.y;
    let mean = &ctx.mean;
    let variance = &ctx.variance;
    ctx.loglike
        .par_chunks_mut(pixels)
        .take(ctx.classes)
        .enumerate()
        .for_each(|(class, plane)| {
            for (p, slot) in plane.iter_mut().enumerate() {
                let mut acc = 0.0;
                for d in 0..dims {
                    let var = variance[class * dims + d];
                    let diff = f64::from(y[p * dims + d]) - mean[class * dims + d];
                    acc += -(2.0 * PI * var).sqrt().ln() - diff * diff / (2.0 * var);
                }
                *slot = acc;
            }
        });
}

/// Read-only per-pass state shared by every worker.
struct SweepView<'a> {
    rows: usize,
    columns: usize,
    classes: usize,
    alloc_classes: usize,
    prev: &'a [u8],
    loglike: &'a [f64],
    coupling: &'a [f64],
    w_gamma: &'a [f64],
    ns: &'a [f64],
    ew: &'a [f64],
    sw: &'a [f64],
    nw: &'a [f64],
    ccost: &'a [f64],
    kappa: f64,
    beta_c: f64,
    use_gradient_penalty: bool,
    use_curvature_penalty: bool,
}

impl SweepView<'_> {
    /// Frozen class of the neighbor at `(nr, nc)`, or the sentinel for
    /// off-image coordinates.
    #[inline]
    fn neighbor_class(&self, nr: isize, nc: isize) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        if nr < 0 || nc < 0 || nr >= self.rows as isize || nc >= self.columns as isize {
            self.alloc_classes
        } else {
            #[allow(clippy::cast_sign_loss)]
            usize::from(self.prev[nr as usize * self.columns + nc as usize])
        }
    }

    /// Gradient edge weight between `(r, c)` and its in-bounds neighbor
    /// `(nr, nc)`.
    #[inline]
    fn edge_weight(&self, r: usize, c: usize, nr: usize, nc: usize) -> f64 {
        let row = r.min(nr);
        let col = c.min(nc);
        if nc == c {
            self.ns[row * self.columns + c]
        } else if nr == r {
            self.ew[r * (self.columns - 1) + col]
        } else if (nr > r) == (nc > c) {
            self.nw[row * (self.columns - 1) + col]
        } else {
            self.sw[row * (self.columns - 1) + col]
        }
    }
}

const NEIGHBOR_OFFSETS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Resample one pixel from its clique posterior.
///
/// `prob_slot` is the pixel's contiguous per-class accumulator slice.
/// A posterior that underflows to zero everywhere keeps the previous
/// label.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn sample_pixel(view: &SweepView<'_>, r: usize, c: usize, draw: f64) -> u8 {
    let pixels = view.rows * view.columns;
    let pixel = r * view.columns + c;
    let mut posterior = [0.0_f64; MAX_CLASSES];
    let mut sum = 0.0;

    for l in 0..view.classes {
        let mut prior = 0.0;
        let mut edge = 0.0;
        for &(dy, dx) in &NEIGHBOR_OFFSETS {
            let nr = r as isize + dy;
            let nc = c as isize + dx;
            let neighbor = view.neighbor_class(nr, nc);
            prior += view.coupling[l * (view.alloc_classes + 1) + neighbor];
            if view.use_gradient_penalty && neighbor != view.alloc_classes && neighbor != l {
                #[allow(clippy::cast_sign_loss)]
                {
                    edge += view.edge_weight(r, c, nr as usize, nc as usize);
                }
            }
        }
        let curvature = if view.use_curvature_penalty {
            view.beta_c * view.ccost[l * pixels + pixel]
        } else {
            0.0
        };
        let arg = view.kappa
            * (view.loglike[l * pixels + pixel] - prior - edge - curvature - view.w_gamma[l]);
        posterior[l] = arg.exp();
        sum += posterior[l];
    }

    if sum <= 0.0 {
        return view.prev[pixel];
    }
    let target = draw * sum;
    let mut cumulative = 0.0;
    for (l, &p) in posterior.iter().enumerate().take(view.classes) {
        cumulative += p;
        if target < cumulative {
            return l as u8;
        }
    }
    (view.classes - 1) as u8
}

/// One synchronous full-image sweep against `prev`, updating `xt` and
/// incrementing `probs` for each sampled class.
fn run_pass(ctx: &mut SegmentationContext, prev: &[u8], draws: &[f64]) {
    let columns = ctx.columns;
    let alloc_classes = ctx.alloc_classes;
    let view = SweepView {
        rows: ctx.rows,
        columns,
        classes: ctx.classes,
        alloc_classes,
        prev,
        loglike: &ctx.loglike,
        coupling: &ctx.coupling,
        w_gamma: &ctx.w_gamma,
        ns: &ctx.ns,
        ew: &ctx.ew,
        sw: &ctx.sw,
        nw: &ctx.nw,
        ccost: &ctx.ccost,
        kappa: ctx.working_kappa,
        beta_c: ctx.beta_c,
        use_gradient_penalty: ctx.use_gradient_penalty,
        use_curvature_penalty: ctx.use_curvature_penalty,
    };

    ctx.xt
        .par_chunks_mut(columns)
        .zip(ctx.probs.par_chunks_mut(columns * alloc_classes))
        .zip(draws.par_chunks(columns))
        .enumerate()
        .for_each(|(r, ((label_row, prob_row), draw_row))| {
            for c in 0..columns {
                let label = sample_pixel(&view, r, c, draw_row[c]);
                label_row[c] = label;
                prob_row[c * alloc_classes + usize::from(label)] += 1.0;
            }
        });
}

/// Run `passes` sampler sweeps over the context.
///
/// Zeroes `probs`, rebuilds the log-likelihood cache, then sweeps. The
/// cancellation token is polled at the top of every pass; on
/// cancellation the remaining passes are skipped and `probs` is left
/// un-normalized, reported by an `Ok(false)` return. After a complete
/// run `probs` holds the time-averaged per-class posterior.
///
/// # Errors
///
/// Returns [`SegmentationError::Allocation`] when the frozen-label or
/// draw scratch buffers cannot be reserved.
#[allow(clippy::cast_precision_loss)]
pub fn run(
    ctx: &mut SegmentationContext,
    passes: usize,
    rng: &mut StdRng,
    cancel: &CancelToken,
) -> Result<bool, SegmentationError> {
    let pixels = ctx.pixel_count();
    ctx.probs.fill(0.0);
    compute_log_likelihood(ctx);

    let mut prev: Vec<u8> = try_vec(pixels, "frozen label scratch")?;
    let mut draws: Vec<f64> = try_vec(pixels, "random draw buffer")?;

    for pass in 0..passes {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        ctx.current_mpm_loop = pass;
        prev.copy_from_slice(&ctx.xt);
        for draw in &mut draws {
            *draw = rng.random::<f64>();
        }
        run_pass(ctx, &prev, &draws);
    }

    if passes > 0 {
        let scale = 1.0 / passes as f64;
        for p in &mut ctx.probs {
            *p *= scale;
        }
    }
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::init::Initializer;
    use crate::types::{ClassSeed, SegmentationConfig};
    use rand::SeedableRng;

    fn two_band_context() -> SegmentationContext {
        // Left half dark, right half bright.
        let rows = 8;
        let columns = 8;
        let mut input = vec![20u8; rows * columns];
        for r in 0..rows {
            for c in columns / 2..columns {
                input[r * columns + c] = 220;
            }
        }
        let config = SegmentationConfig::default();
        let mut ctx = SegmentationContext::new(rows, columns, &config);
        ctx.allocate(&input, config.min_variance, config.gamma)
            .unwrap();
        ctx.recompute_coupling(config.beta, &[]);
        let seeds = [
            ClassSeed {
                mean: 20.0,
                variance: 20.0,
            },
            ClassSeed {
                mean: 220.0,
                variance: 20.0,
            },
        ];
        Initializer::Manual(&seeds).initialize(&mut ctx).unwrap();
        Initializer::LabelMap { seed: 3 }.initialize(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn log_likelihood_prefers_the_matching_class() {
        let mut ctx = two_band_context();
        compute_log_likelihood(&mut ctx);
        let pixels = ctx.pixel_count();
        // Dark pixel 0: class 0 must dominate. Bright pixel at the
        // right edge: class 1 must dominate.
        assert!(ctx.loglike[0] > ctx.loglike[pixels]);
        let bright = 7;
        assert!(ctx.loglike[pixels + bright] > ctx.loglike[bright]);
    }

    #[test]
    fn run_recovers_well_separated_bands() {
        let mut ctx = two_band_context();
        let mut rng = StdRng::seed_from_u64(42);
        let done = run(&mut ctx, 3, &mut rng, &CancelToken::new()).unwrap();
        assert!(done);
        // 200 gray levels apart at variance 20: the likelihood term
        // dwarfs the prior, so every label lands on its band.
        for r in 0..8 {
            for c in 0..8 {
                let expected = u8::from(c >= 4);
                assert_eq!(ctx.xt[r * 8 + c], expected, "pixel ({r}, {c})");
            }
        }
    }

    #[test]
    fn probs_sum_to_one_per_pixel_after_a_run() {
        let mut ctx = two_band_context();
        let mut rng = StdRng::seed_from_u64(7);
        run(&mut ctx, 4, &mut rng, &CancelToken::new()).unwrap();
        for pixel in 0..ctx.pixel_count() {
            let sum: f64 = ctx.probs[pixel * 2..pixel * 2 + 2].iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "pixel {pixel}: {sum}");
        }
    }

    #[test]
    fn identical_seeds_give_bit_identical_results() {
        let mut a = two_band_context();
        let mut b = two_band_context();
        let mut rng_a = StdRng::seed_from_u64(99);
        let mut rng_b = StdRng::seed_from_u64(99);
        run(&mut a, 2, &mut rng_a, &CancelToken::new()).unwrap();
        run(&mut b, 2, &mut rng_b, &CancelToken::new()).unwrap();
        assert_eq!(a.xt, b.xt);
        assert_eq!(a.probs, b.probs);
    }

    #[test]
    fn cancellation_skips_normalization() {
        let mut ctx = two_band_context();
        let mut rng = StdRng::seed_from_u64(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let done = run(&mut ctx, 3, &mut rng, &cancel).unwrap();
        assert!(!done);
        assert!(ctx.probs.iter().all(|&p| p.abs() < f64::EPSILON));
    }

    #[test]
    fn penalized_run_still_recovers_separated_bands() {
        // The penalty terms are bounded by a few units while the
        // likelihood gap between the bands is on the order of a
        // thousand, so enabling both penalties must not move a label.
        let mut ctx = two_band_context();
        ctx.use_gradient_penalty = true;
        Initializer::GradientPenalty { beta_e: 1.0 }
            .initialize(&mut ctx)
            .unwrap();
        ctx.use_curvature_penalty = true;
        Initializer::Curvature.initialize(&mut ctx).unwrap();
        crate::curvature::compute_curvature_cost(&mut ctx).unwrap();

        let mut rng = StdRng::seed_from_u64(21);
        let done = run(&mut ctx, 3, &mut rng, &CancelToken::new()).unwrap();
        assert!(done);
        for r in 0..8 {
            for c in 0..8 {
                let expected = u8::from(c >= 4);
                assert_eq!(ctx.xt[r * 8 + c], expected, "pixel ({r}, {c})");
            }
        }
    }

    #[test]
    fn edge_weights_index_the_matching_directional_buffer() {
        // 3x3 grid, center pixel: each of the eight neighbors must
        // resolve to its own directional buffer and slot.
        let ns = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let ew = [20.0, 21.0, 22.0, 23.0, 24.0, 25.0];
        let sw = [30.0, 31.0, 32.0, 33.0];
        let nw = [40.0, 41.0, 42.0, 43.0];
        let view = SweepView {
            rows: 3,
            columns: 3,
            classes: 2,
            alloc_classes: 2,
            prev: &[0; 9],
            loglike: &[0.0; 18],
            coupling: &[0.0; 9],
            w_gamma: &[0.0, 0.0],
            ns: &ns,
            ew: &ew,
            sw: &sw,
            nw: &nw,
            ccost: &[0.0; 18],
            kappa: 1.0,
            beta_c: 0.0,
            use_gradient_penalty: true,
            use_curvature_penalty: false,
        };
        let cases = [
            ((0, 1), 11.0), // north -> vertical buffer
            ((2, 1), 14.0), // south
            ((1, 0), 22.0), // west -> horizontal buffer
            ((1, 2), 23.0), // east
            ((0, 0), 40.0), // northwest -> main diagonal
            ((2, 2), 43.0), // southeast
            ((0, 2), 31.0), // northeast -> anti-diagonal
            ((2, 0), 32.0), // southwest
        ];
        for ((nr, nc), expected) in cases {
            let weight = view.edge_weight(1, 1, nr, nc);
            assert!(
                (weight - expected).abs() < f64::EPSILON,
                "neighbor ({nr}, {nc}): got {weight}, expected {expected}",
            );
        }
    }

    #[test]
    fn gradient_penalty_discourages_label_changes_on_smooth_edges() {
        // Equal likelihoods and zero coupling isolate the edge term: a
        // candidate class differing from every frozen neighbor pays
        // eight positive smooth-edge weights.
        let weight = (10.0_f64 / 5.0).atan();
        let ns = [weight; 6];
        let ew = [weight; 6];
        let sw = [weight; 4];
        let nw = [weight; 4];
        let mut view = SweepView {
            rows: 3,
            columns: 3,
            classes: 2,
            alloc_classes: 2,
            prev: &[0; 9],
            loglike: &[0.0; 18],
            coupling: &[0.0; 9],
            w_gamma: &[0.0, 0.0],
            ns: &ns,
            ew: &ew,
            sw: &sw,
            nw: &nw,
            ccost: &[0.0; 18],
            kappa: 1.0,
            beta_c: 0.0,
            use_gradient_penalty: false,
            use_curvature_penalty: false,
        };
        // Without the penalty the classes tie and a high draw lands on
        // class 1; with it the eight-edge cost shuts class 1 out.
        assert_eq!(sample_pixel(&view, 1, 1, 0.9), 1);
        view.use_gradient_penalty = true;
        assert_eq!(sample_pixel(&view, 1, 1, 0.9), 0);
    }

    #[test]
    fn curvature_cost_penalizes_the_charged_class() {
        // Single pixel, so ccost is one slot per class. Class 1
        // carries a full mismatch charge.
        let mut view = SweepView {
            rows: 1,
            columns: 1,
            classes: 2,
            alloc_classes: 2,
            prev: &[0],
            loglike: &[0.0, 0.0],
            coupling: &[0.0; 9],
            w_gamma: &[0.0, 0.0],
            ns: &[],
            ew: &[],
            sw: &[],
            nw: &[],
            ccost: &[0.0, 1.0],
            kappa: 1.0,
            beta_c: 20.0,
            use_gradient_penalty: false,
            use_curvature_penalty: false,
        };
        assert_eq!(sample_pixel(&view, 0, 0, 0.9), 1);
        view.use_curvature_penalty = true;
        assert_eq!(sample_pixel(&view, 0, 0, 0.9), 0);
    }

    #[test]
    fn zero_posterior_keeps_the_previous_label() {
        let view = SweepView {
            rows: 1,
            columns: 1,
            classes: 2,
            alloc_classes: 2,
            prev: &[1],
            // Log-likelihoods so negative that exp underflows for both
            // classes.
            loglike: &[-1.0e6, -1.0e6],
            coupling: &[0.0; 9],
            w_gamma: &[0.0, 0.0],
            ns: &[],
            ew: &[],
            sw: &[],
            nw: &[],
            ccost: &[0.0, 0.0],
            kappa: 1.0,
            beta_c: 0.0,
            use_gradient_penalty: false,
            use_curvature_penalty: false,
        };
        assert_eq!(sample_pixel(&view, 0, 0, 0.3), 1);
    }
}
