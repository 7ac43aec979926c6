//! Segment a grayscale image with the EM/MPM engine: decode, run,
//! write the label image plus optional preview and JSON diagnostics.

use std::path::PathBuf;

use clap::Parser;
use emmpm_core::{
    ClassSeed, CouplingOverride, EmDriver, GrayImage, InitMode, SeedArea, SegmentationConfig,
};

/// Bayesian EM/MPM image segmentation.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Input image path (PNG, JPEG, BMP, or TIFF).
    input: PathBuf,

    /// Output label image path. Labels are 0-based gray values unless
    /// --one-based is set.
    #[arg(short, long)]
    output: PathBuf,

    /// Write a gray-mapped preview image here.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Write final statistics, histograms, and timing as JSON here.
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Number of segmentation classes (2-15).
    #[arg(short = 'n', long, default_value_t = 2)]
    classes: usize,

    /// Default pairwise coupling strength of the MRF prior.
    #[arg(short, long, default_value_t = 1.0)]
    beta: f64,

    /// Per-class log-prior bias.
    #[arg(short, long, default_value_t = 0.0)]
    gamma: f64,

    /// Outer EM iterations.
    #[arg(long, default_value_t = 5)]
    em_loops: usize,

    /// MPM sampler passes per EM iteration.
    #[arg(long, default_value_t = 5)]
    mpm_loops: usize,

    /// Anneal the inverse temperature over the EM loop.
    #[arg(long)]
    simulated_annealing: bool,

    /// Enable the gradient penalty with this edge weight.
    #[arg(long, value_name = "BETA_E")]
    gradient: Option<f64>,

    /// Enable the curvature penalty with this weight.
    #[arg(long, value_name = "BETA_C")]
    curvature: Option<f64>,

    /// Largest structuring-element radius for the curvature penalty.
    #[arg(long, default_value_t = 8.0)]
    r_max: f64,

    /// EM iterations to wait before recomputing the curvature cost.
    #[arg(long, default_value_t = 1)]
    ccost_delay: usize,

    /// Stop early when the statistics drift falls below this MSE.
    #[arg(long, value_name = "MSE")]
    stopping_threshold: Option<f64>,

    /// Seed for the label map and sampler draws.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Seed one class from a pixel rectangle, as "CLASS:X1,Y1,X2,Y2"
    /// (inclusive corners). Repeat once per class.
    #[arg(long = "init-area", value_name = "C:X1,Y1,X2,Y2")]
    init_areas: Vec<String>,

    /// Seed one class with an explicit mean and variance, as
    /// "CLASS:MEAN,VARIANCE". Repeat once per class.
    #[arg(long = "init-mv", value_name = "C:MEAN,VAR", conflicts_with = "init_areas")]
    init_mv: Vec<String>,

    /// Override the coupling weight for one class pair, as "A,B:BETA".
    /// Repeatable.
    #[arg(long = "coupling", value_name = "A,B:BETA")]
    couplings: Vec<String>,

    /// Comma-separated gray value per class for the preview, e.g.
    /// "0,128,255".
    #[arg(long, value_name = "V0,V1,...")]
    gray_table: Option<String>,

    /// Shift output labels to 1-based.
    #[arg(long)]
    one_based: bool,

    /// Per-iteration progress on stderr.
    #[arg(short, long)]
    verbose: bool,
}

/// Parse "CLASS:X1,Y1,X2,Y2" into a class index and its rectangle.
fn parse_init_area(s: &str) -> Result<(usize, SeedArea), String> {
    let (class_str, rect_str) = s
        .split_once(':')
        .ok_or_else(|| format!("init-area must be 'CLASS:X1,Y1,X2,Y2', got: '{s}'"))?;
    let class: usize = class_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid init-area class '{class_str}': {e}"))?;
    let coords: Vec<&str> = rect_str.split(',').collect();
    if coords.len() != 4 {
        return Err(format!(
            "init-area needs four coordinates X1,Y1,X2,Y2, got {} in '{rect_str}'",
            coords.len(),
        ));
    }
    let mut parsed = [0_usize; 4];
    for (slot, coord) in parsed.iter_mut().zip(&coords) {
        *slot = coord
            .trim()
            .parse()
            .map_err(|e| format!("invalid init-area coordinate '{coord}': {e}"))?;
    }
    Ok((
        class,
        SeedArea {
            x1: parsed[0],
            y1: parsed[1],
            x2: parsed[2],
            y2: parsed[3],
        },
    ))
}

/// Parse "CLASS:MEAN,VARIANCE" into a class index and its seed.
fn parse_init_mv(s: &str) -> Result<(usize, ClassSeed), String> {
    let (class_str, mv_str) = s
        .split_once(':')
        .ok_or_else(|| format!("init-mv must be 'CLASS:MEAN,VAR', got: '{s}'"))?;
    let class: usize = class_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid init-mv class '{class_str}': {e}"))?;
    let (mean_str, var_str) = mv_str
        .split_once(',')
        .ok_or_else(|| format!("init-mv needs 'MEAN,VAR', got: '{mv_str}'"))?;
    let mean: f64 = mean_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid init-mv mean '{mean_str}': {e}"))?;
    let variance: f64 = var_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid init-mv variance '{var_str}': {e}"))?;
    Ok((class, ClassSeed { mean, variance }))
}

/// Parse "A,B:BETA" into a coupling override.
fn parse_coupling(s: &str) -> Result<CouplingOverride, String> {
    let (pair_str, beta_str) = s
        .split_once(':')
        .ok_or_else(|| format!("coupling must be 'A,B:BETA', got: '{s}'"))?;
    let (a_str, b_str) = pair_str
        .split_once(',')
        .ok_or_else(|| format!("coupling pair must be 'A,B', got: '{pair_str}'"))?;
    let class_a: usize = a_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid coupling class '{a_str}': {e}"))?;
    let class_b: usize = b_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid coupling class '{b_str}': {e}"))?;
    let beta: f64 = beta_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid coupling weight '{beta_str}': {e}"))?;
    Ok(CouplingOverride {
        class_a,
        class_b,
        beta,
    })
}

/// Parse a comma-separated gray table, one value per class.
fn parse_gray_table(s: &str, classes: usize) -> Result<Vec<u8>, String> {
    let values: Result<Vec<u8>, String> = s
        .split(',')
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| format!("invalid gray value '{v}': {e}"))
        })
        .collect();
    let values = values?;
    if values.len() != classes {
        return Err(format!(
            "gray table needs one value per class ({classes}), got {}",
            values.len(),
        ));
    }
    Ok(values)
}

/// Collect per-class "CLASS:..." entries into a dense 0..classes list.
fn collect_per_class<T>(entries: Vec<(usize, T)>, classes: usize, flag: &str) -> Result<Vec<T>, String> {
    let mut slots: Vec<Option<T>> = (0..classes).map(|_| None).collect();
    for (class, value) in entries {
        let slot = slots
            .get_mut(class)
            .ok_or_else(|| format!("{flag}: class {class} is out of range for {classes} classes"))?;
        if slot.is_some() {
            return Err(format!("{flag}: class {class} specified twice"));
        }
        *slot = Some(value);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(class, slot)| slot.ok_or_else(|| format!("{flag}: class {class} is missing")))
        .collect()
}

/// Translate parsed flags into the engine configuration.
fn build_config(args: &Args) -> Result<SegmentationConfig, String> {
    let init = if !args.init_areas.is_empty() {
        let entries: Result<Vec<_>, String> =
            args.init_areas.iter().map(|s| parse_init_area(s)).collect();
        InitMode::UserArea(collect_per_class(entries?, args.classes, "--init-area")?)
    } else if !args.init_mv.is_empty() {
        let entries: Result<Vec<_>, String> =
            args.init_mv.iter().map(|s| parse_init_mv(s)).collect();
        InitMode::Manual(collect_per_class(entries?, args.classes, "--init-mv")?)
    } else {
        InitMode::Basic
    };

    let coupling_overrides: Result<Vec<_>, String> =
        args.couplings.iter().map(|s| parse_coupling(s)).collect();

    let gray_table = args
        .gray_table
        .as_deref()
        .map(|s| parse_gray_table(s, args.classes))
        .transpose()?;

    Ok(SegmentationConfig {
        classes: args.classes,
        beta: args.beta,
        gamma: args.gamma,
        em_iterations: args.em_loops,
        mpm_iterations: args.mpm_loops,
        simulated_annealing: args.simulated_annealing,
        use_gradient_penalty: args.gradient.is_some(),
        beta_e: args.gradient.unwrap_or(1.0),
        use_curvature_penalty: args.curvature.is_some(),
        beta_c: args.curvature.unwrap_or(1.0),
        r_max: args.r_max,
        ccost_loop_delay: args.ccost_delay,
        use_stopping_threshold: args.stopping_threshold.is_some(),
        stopping_threshold: args.stopping_threshold.unwrap_or(0.0),
        seed: args.seed,
        init,
        coupling_overrides: coupling_overrides?,
        gray_table,
        ..SegmentationConfig::default()
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let config = build_config(&args)?;

    eprintln!("Reading image from {}", args.input.display());
    let image = image::open(&args.input)?.to_luma8();
    let rows = image.height() as usize;
    let columns = image.width() as usize;
    eprintln!(
        "Segmenting {columns}x{rows} into {} classes ({} EM x {} MPM)",
        args.classes, args.em_loops, args.mpm_loops,
    );

    let mut driver = EmDriver::new(config);
    if args.verbose {
        driver = driver.on_progress(|event| {
            eprintln!(
                "EM {}/{}: {:.0}% done, {} classes, mse {:.4e}, kappa {:.3}",
                event.iteration + 1,
                event.total_iterations,
                event.progress,
                event.classes,
                event.mse,
                event.kappa,
            );
        });
    }
    let result = driver.run(image.as_raw(), rows, columns)?;
    eprintln!(
        "Finished: {:?} with {} classes in {:.3}s",
        result.outcome,
        result.classes,
        result.diagnostics.total_duration.as_secs_f64(),
    );

    let labels: Vec<u8> = if args.one_based {
        result.labels.iter().map(|&l| l + 1).collect()
    } else {
        result.labels.clone()
    };
    #[allow(clippy::cast_possible_truncation)]
    let label_image = GrayImage::from_raw(columns as u32, rows as u32, labels)
        .ok_or("label buffer does not match the image geometry")?;
    label_image.save(&args.output)?;
    eprintln!("Labels written to {}", args.output.display());

    if let Some(path) = &args.preview {
        let preview = result
            .output_image()
            .ok_or("preview buffer does not match the image geometry")?;
        preview.save(path)?;
        eprintln!("Preview written to {}", path.display());
    }

    if let Some(path) = &args.diagnostics {
        let report = serde_json::json!({
            "outcome": result.outcome,
            "classes": result.classes,
            "mean": result.mean,
            "variance": result.variance,
            "histograms": result.histograms,
            "diagnostics": result.diagnostics,
        });
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        eprintln!("Diagnostics written to {}", path.display());
    }

    Ok(())
}
