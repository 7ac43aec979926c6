//! emmpm-core: EM/MPM Bayesian image segmentation (sans-IO).
//!
//! Segments single-channel 8-bit images into 2..=15 classes by
//! alternating expectation-maximization re-estimation of a Gaussian
//! mixture with maximization-of-posterior-marginals stochastic
//! relaxation over a Markov-random-field smoothness prior. Optional
//! gradient and curvature penalties shape the class boundaries.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and returns structured data. File decoding and the
//! command line live in `emmpm-cli`.

pub mod context;
pub mod curvature;
pub mod diagnostics;
pub mod driver;
pub mod init;
pub mod mpm;
pub mod stats;
pub mod types;

pub use context::SegmentationContext;
pub use diagnostics::{EmIterationDiagnostics, SegmentationDiagnostics};
pub use driver::{CancelToken, DriverState, EmDriver, ProgressEvent};
pub use init::Initializer;
pub use types::{
    ClassSeed, CouplingOverride, GrayImage, InitMode, MAX_CLASSES, MIN_CLASSES, Outcome, SeedArea,
    SegmentationConfig, SegmentationError, SegmentationResult,
};

/// Run a full segmentation over a raw single-channel buffer.
///
/// `input` holds `rows * columns` bytes in row-major order. The
/// configuration selects the class count, initialization mode,
/// penalties, iteration budgets, and seed; the result carries the
/// final label map, per-class statistics, preview buffer, histograms,
/// and diagnostics.
///
/// For cancellation or progress reporting, build an
/// [`EmDriver`] directly.
///
/// # Errors
///
/// Returns [`SegmentationError`] for invalid configurations,
/// allocation failures, or a model degenerating below two classes.
pub fn segment(
    input: &[u8],
    rows: usize,
    columns: usize,
    config: SegmentationConfig,
) -> Result<SegmentationResult, SegmentationError> {
    EmDriver::new(config).run(input, rows, columns)
}

/// [`segment`] over a decoded [`GrayImage`].
///
/// # Errors
///
/// Same as [`segment`].
pub fn segment_image(
    image: &GrayImage,
    config: SegmentationConfig,
) -> Result<SegmentationResult, SegmentationError> {
    segment(
        image.as_raw(),
        image.height() as usize,
        image.width() as usize,
        config,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn segment_image_matches_the_raw_buffer_entry_point() {
        let mut image = GrayImage::new(6, 4);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            pixel.0[0] = if x < 3 { 40 } else { 190 };
        }
        let config = SegmentationConfig {
            em_iterations: 2,
            mpm_iterations: 2,
            seed: 5,
            ..SegmentationConfig::default()
        };
        let from_image = segment_image(&image, config.clone()).unwrap();
        let from_buffer = segment(image.as_raw(), 4, 6, config).unwrap();
        assert_eq!(from_image.labels, from_buffer.labels);
        assert_eq!(from_image.rows, 4);
        assert_eq!(from_image.columns, 6);
    }

    #[test]
    fn preview_image_round_trips_geometry() {
        let input = vec![128u8; 30];
        let result = segment(&input, 5, 6, SegmentationConfig::default()).unwrap();
        let preview = result.output_image().unwrap();
        assert_eq!(preview.width(), 6);
        assert_eq!(preview.height(), 5);
    }
}
