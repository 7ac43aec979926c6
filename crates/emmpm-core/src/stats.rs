//! Class statistics: the EM re-estimation half of the algorithm.
//!
//! Pure functions over the context buffers: reset and re-estimate the
//! Gaussian mixture from the time-averaged posterior, drop classes the
//! posterior abandoned, test convergence, and render the label map
//! into the display buffer with per-class histograms.

use rayon::prelude::*;

use std::f64::consts::PI;

use crate::context::SegmentationContext;
use crate::types::{MIN_CLASSES, SegmentationError};

/// Zero `mean`, `variance`, and the soft counts for every class.
pub fn reset_mean_variance(ctx: &mut SegmentationContext) {
    ctx.mean.fill(0.0);
    ctx.variance.fill(0.0);
    ctx.n.fill(0.0);
}

/// Re-estimate the mixture from the normalized posterior.
///
/// Two weighted passes per class: counts and means first, variances
/// against the fresh means second. A class with a zero count keeps
/// zero mean and variance (and is removed by the next elimination
/// call). Every variance is then clamped up to its floor. Classes are
/// independent, so the reduction runs one parallel task per class.
pub fn update_means_and_variances(ctx: &mut SegmentationContext) {
    let pixels = ctx.pixel_count();
    let dims = ctx.dims;
    let alloc_classes = ctx.alloc_classes;
    let y = &ctx.y;
    let probs = &ctx.probs;

    let per_class: Vec<(f64, Vec<f64>, Vec<f64>)> = (0..ctx.classes)
        .into_par_iter()
        .map(|l| {
            let mut count = 0.0;
            let mut mean = vec![0.0; dims];
            for p in 0..pixels {
                let weight = probs[p * alloc_classes + l];
                count += weight;
                for (d, m) in mean.iter_mut().enumerate() {
                    *m += f64::from(y[p * dims + d]) * weight;
                }
            }
            if count > 0.0 {
                for m in &mut mean {
                    *m /= count;
                }
            }
            let mut variance = vec![0.0; dims];
            if count > 0.0 {
                for p in 0..pixels {
                    let weight = probs[p * alloc_classes + l];
                    for (d, v) in variance.iter_mut().enumerate() {
                        let diff = f64::from(y[p * dims + d]) - mean[d];
                        *v += diff * diff * weight;
                    }
                }
                for v in &mut variance {
                    *v /= count;
                }
            }
            (count, mean, variance)
        })
        .collect();

    for (l, (count, mean, variance)) in per_class.into_iter().enumerate() {
        ctx.n[l] = count;
        for d in 0..dims {
            ctx.mean[l * dims + d] = mean[d];
            ctx.variance[l * dims + d] = variance[d].max(ctx.min_variance[l]);
        }
    }
}

/// Remove every class whose soft count reached zero.
///
/// Removal shifts all higher-indexed per-class slots down by one
/// (including the saved previous statistics, so the next convergence
/// check compares like with like), decrements the logical class count,
/// and relabels every pixel above the removed index. Cascades when
/// several classes die in the same call.
///
/// # Errors
///
/// Returns [`SegmentationError::DegenerateModel`] when fewer than two
/// live classes remain. The context still reflects the compacted
/// state.
#[allow(clippy::float_cmp)]
pub fn eliminate_zero_probability_classes(
    ctx: &mut SegmentationContext,
) -> Result<(), SegmentationError> {
    let dims = ctx.dims;
    let mut kk = 0;
    while kk < ctx.classes {
        if ctx.n[kk] == 0.0 {
            for l in kk + 1..ctx.classes {
                ctx.n[l - 1] = ctx.n[l];
                ctx.min_variance[l - 1] = ctx.min_variance[l];
                ctx.w_gamma[l - 1] = ctx.w_gamma[l];
                for d in 0..dims {
                    ctx.mean[(l - 1) * dims + d] = ctx.mean[l * dims + d];
                    ctx.variance[(l - 1) * dims + d] = ctx.variance[l * dims + d];
                    ctx.prev_mean[(l - 1) * dims + d] = ctx.prev_mean[l * dims + d];
                    ctx.prev_variance[(l - 1) * dims + d] = ctx.prev_variance[l * dims + d];
                }
            }
            ctx.classes -= 1;
            #[allow(clippy::cast_possible_truncation)]
            let removed = kk as u8;
            for label in &mut ctx.xt {
                if *label > removed {
                    *label -= 1;
                }
            }
        } else {
            kk += 1;
        }
    }
    if ctx.classes < MIN_CLASSES {
        return Err(SegmentationError::DegenerateModel {
            remaining: ctx.classes,
        });
    }
    Ok(())
}

/// Copy the current statistics into the previous-iteration slots.
pub fn save_previous_stats(ctx: &mut SegmentationContext) {
    ctx.prev_mean.copy_from_slice(&ctx.mean);
    ctx.prev_variance.copy_from_slice(&ctx.variance);
}

/// Mean-squared drift of means and variances since the last saved
/// statistics, stored in `current_mse`. Signals stop only when the
/// stopping threshold is enabled and undershot.
pub fn convergence_check(ctx: &mut SegmentationContext) -> bool {
    let live = ctx.classes * ctx.dims;
    let mut mse = 0.0;
    for i in 0..live {
        let dm = ctx.mean[i] - ctx.prev_mean[i];
        let dv = ctx.variance[i] - ctx.prev_variance[i];
        mse += dm * dm + dv * dv;
    }
    ctx.current_mse = mse;
    ctx.use_stopping_threshold && mse < ctx.stopping_threshold
}

/// Render the label map into the display buffer.
///
/// Each label is mapped through the gray table (evenly spaced levels
/// when the caller supplies none), per-class pixel counts are tallied,
/// and the 256-bin Gaussian histogram of every live class is
/// regenerated, weighted by that class's area fraction. Idempotent:
/// the output depends only on the label map and statistics.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn convert_labels_to_output(ctx: &mut SegmentationContext, gray_table: Option<&[u8]>) {
    let pixels = ctx.pixel_count();
    let dims = ctx.dims;

    ctx.class_counts.fill(0);
    for (p, &label) in ctx.xt.iter().enumerate() {
        let l = usize::from(label);
        let gray = gray_table.map_or_else(
            || ((l * 255) / (ctx.classes - 1).max(1)) as u8,
            |table| table[l],
        );
        ctx.output[p] = gray;
        ctx.class_counts[l] += 1;
    }

    ctx.histograms.fill(0.0);
    for l in 0..ctx.classes {
        let fraction = ctx.class_counts[l] as f64 / pixels as f64;
        for d in 0..dims {
            let mean = ctx.mean[l * dims + d];
            let variance = ctx.variance[l * dims + d];
            if variance <= 0.0 {
                continue;
            }
            let norm = fraction / (2.0 * PI * variance).sqrt();
            let base = (l * dims + d) * 256;
            for bin in 0..256 {
                let diff = bin as f64 - mean;
                ctx.histograms[base + bin] = norm * (-diff * diff / (2.0 * variance)).exp();
            }
        }
    }
}
