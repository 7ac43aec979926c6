//! Curvature penalty: multi-scale morphological-opening mismatch cost.
//!
//! The label map is compared against itself opened with disk
//! structuring elements at eight decreasing radii. A pixel whose label
//! does not survive the opening at a given scale contributes `1/8` to
//! its own class's cost entry, so `ccost` rises toward 1.0 the more
//! scales disagree with the raw labeling. The sampler reads the result
//! as an additive penalty `beta_c · ccost[class][pixel]`.

use rayon::prelude::*;

use crate::context::{SegmentationContext, try_vec};
use crate::types::SegmentationError;

/// Number of structuring-element scales. Radius at scale `k` is
/// `r_max / (k + 1)`.
pub const SCALE_COUNT: usize = 8;

/// All offsets within a disk of the given radius, center included.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn disk_offsets(radius: f64) -> Vec<(isize, isize)> {
    let reach = radius.floor() as isize;
    let radius_sq = radius * radius;
    let mut offsets = Vec::new();
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if ((dy * dy + dx * dx) as f64) <= radius_sq {
                offsets.push((dy, dx));
            }
        }
    }
    offsets
}

/// Recompute `ccost` from the current label map.
///
/// Per scale: erosion marks a pixel with the off-image sentinel unless
/// every in-bounds neighbor within the disk shares its label; dilation
/// then propagates surviving labels back through every disk offset.
/// Pixels the opened map leaves at the sentinel are mismatches and add
/// `1/8` to `ccost` at the pixel's current class. Loops clamp at the
/// image border, so an off-image offset neither erodes nor dilates.
///
/// # Errors
///
/// Returns [`SegmentationError::Allocation`] when a scratch buffer
/// cannot be reserved. The run must then fail; `ccost` contents are
/// unspecified.
#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
pub fn compute_curvature_cost(ctx: &mut SegmentationContext) -> Result<(), SegmentationError> {
    let rows = ctx.rows;
    let cols = ctx.columns;
    let pixels = rows * cols;
    #[allow(clippy::cast_possible_truncation)]
    let sentinel = ctx.sentinel() as u8;

    let mut eroded: Vec<u8> = try_vec(pixels, "curvature erosion scratch")?;
    let mut curve: Vec<u8> = try_vec(pixels, "curvature dilation scratch")?;
    ctx.ccost.fill(0.0);

    for scale in 0..SCALE_COUNT {
        let radius = ctx.r_max / (scale as f64 + 1.0);
        let offsets = disk_offsets(radius);

        let xt = &ctx.xt;
        eroded
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(r, out_row)| {
                for (c, out) in out_row.iter_mut().enumerate() {
                    let label = xt[r * cols + c];
                    let survives = offsets.iter().all(|&(dy, dx)| {
                        let nr = r as isize + dy;
                        let nc = c as isize + dx;
                        if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                            true
                        } else {
                            #[allow(clippy::cast_sign_loss)]
                            let neighbor = xt[nr as usize * cols + nc as usize];
                            neighbor == label
                        }
                    });
                    *out = if survives { label } else { sentinel };
                }
            });

        let eroded_ref = &eroded;
        curve
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(r, out_row)| {
                for (c, out) in out_row.iter_mut().enumerate() {
                    let mut value = sentinel;
                    for &(dy, dx) in &offsets {
                        let nr = r as isize + dy;
                        let nc = c as isize + dx;
                        if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                            continue;
                        }
                        #[allow(clippy::cast_sign_loss)]
                        let survivor = eroded_ref[nr as usize * cols + nc as usize];
                        if survivor != sentinel {
                            value = survivor;
                            break;
                        }
                    }
                    *out = value;
                }
            });

        for (p, &opened) in curve.iter().enumerate() {
            if opened == sentinel {
                let class = usize::from(ctx.xt[p]);
                ctx.ccost[class * pixels + p] += 1.0 / SCALE_COUNT as f64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SegmentationConfig;

    fn context(classes: usize, rows: usize, columns: usize, r_max: f64) -> SegmentationContext {
        let config = SegmentationConfig {
            classes,
            r_max,
            use_curvature_penalty: true,
            ..SegmentationConfig::default()
        };
        let input = vec![0u8; rows * columns];
        let mut ctx = SegmentationContext::new(rows, columns, &config);
        ctx.allocate(&input, config.min_variance, config.gamma)
            .unwrap();
        ctx
    }

    #[test]
    fn disk_offsets_radius_one_is_the_plus_shape() {
        let mut offsets = disk_offsets(1.0);
        offsets.sort_unstable();
        assert_eq!(offsets, vec![(-1, 0), (0, -1), (0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn sub_unit_radius_keeps_only_the_center() {
        assert_eq!(disk_offsets(0.5), vec![(0, 0)]);
    }

    #[test]
    fn uniform_labels_cost_nothing() {
        let mut ctx = context(2, 6, 6, 8.0);
        compute_curvature_cost(&mut ctx).unwrap();
        assert!(ctx.ccost.iter().all(|&c| c.abs() < f64::EPSILON));
    }

    #[test]
    fn recompute_clears_previous_cost() {
        let mut ctx = context(2, 6, 6, 8.0);
        ctx.ccost.fill(0.9);
        compute_curvature_cost(&mut ctx).unwrap();
        assert!(ctx.ccost.iter().all(|&c| c.abs() < f64::EPSILON));
    }

    #[test]
    fn isolated_pixel_is_penalized_at_its_own_class() {
        // A lone class-1 pixel in a class-0 field vanishes under
        // opening at radii 2 and 1 but not at the six sub-unit radii,
        // so its cost is exactly 2/8.
        let mut ctx = context(2, 11, 11, 2.0);
        let pixels = ctx.pixel_count();
        let defect = 5 * 11 + 5;
        ctx.xt[defect] = 1;
        compute_curvature_cost(&mut ctx).unwrap();

        assert!((ctx.ccost[pixels + defect] - 0.25).abs() < 1e-12);
        // The defect's class-0 entry stays zero, as does everything
        // around it.
        assert!(ctx.ccost[defect].abs() < f64::EPSILON);
        let neighbor = 5 * 11 + 6;
        assert!(ctx.ccost[neighbor].abs() < f64::EPSILON);
        assert!(ctx.ccost[pixels + neighbor].abs() < f64::EPSILON);
    }
}
