use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use roi_forensics::{
    batch, BatchItem, BatchOutcome, BatchReport, BlendWeights, Detection, Detector,
    DetectorConfig, DirectoryStore, EnergyMethod, HeuristicClassifier, Label, PipelineError,
};

#[derive(Parser)]
#[command(
    name = "roi-forensics",
    about = "Detect synthetic images and render heatmaps of the deciding region",
    version,
    after_help = "Simple usage: roi-forensics <image>\n\n\
                  INPUT may be a single image, a directory of images or a .zip archive.\n\
                  Heatmaps are written for images classified as fake."
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Input image, directory or zip archive
    input: PathBuf,

    /// Directory heatmap overlays are written to
    #[arg(short, long, default_value = "heatmaps")]
    output: PathBuf,

    /// Side of the square patch sent to the classifier
    #[arg(long, default_value_t = 256)]
    patch_size: u32,

    /// Maximum number of images in one batch
    #[arg(long, default_value_t = 50)]
    max_batch: usize,

    /// Heatmap weight in the overlay blend (0.0-1.0)
    #[arg(long, default_value_t = 0.4)]
    heatmap_weight: f32,

    /// Use gradient energy instead of wavelet energy for ROI search
    #[arg(long)]
    gradient_energy: bool,

    /// Print the full result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if !(0.0..=1.0).contains(&cli.heatmap_weight) {
        eprintln!("Error: Heatmap weight must be between 0.0 and 1.0");
        process::exit(1);
    }

    let config = DetectorConfig {
        patch_size: cli.patch_size,
        energy_method: if cli.gradient_energy {
            EnergyMethod::Gradient
        } else {
            EnergyMethod::Wavelet
        },
        blend: BlendWeights::with_heatmap(cli.heatmap_weight),
        max_batch_size: cli.max_batch,
        ..DetectorConfig::default()
    };

    let detector = match Detector::new(
        config,
        HeuristicClassifier::new(),
        DirectoryStore::new(&cli.output),
    ) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Fatal: Failed to initialize detector: {e}");
            process::exit(1);
        }
    };

    if !cli.input.exists() {
        eprintln!("Error: Input path does not exist: {}", cli.input.display());
        process::exit(1);
    }

    let failed = if cli.input.is_dir() || is_zip(&cli.input) {
        run_batch(&detector, &cli)
    } else {
        run_single(&detector, &cli)
    };

    if failed {
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: logging already initialized");
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

type Engine = Detector<HeuristicClassifier, DirectoryStore>;

/// Returns whether the image failed.
fn run_single(detector: &Engine, cli: &Cli) -> bool {
    let item = match BatchItem::from_path(&cli.input) {
        Ok(item) => item,
        Err(e) => {
            eprintln!("[FAIL] {}: {e}", cli.input.display());
            return true;
        }
    };
    let result = detector.detect_bytes(&item.bytes);

    if cli.json {
        let json = match &result {
            Ok(detection) => serde_json::to_string_pretty(detection),
            Err(e) => serde_json::to_string_pretty(&serde_json::json!({
                "stage": e.stage,
                "kind": e.kind(),
                "error": e.source.to_string(),
            })),
        };
        print_json(json);
    } else {
        print_result(&item.name, &result, detector, cli);
    }
    result.is_err()
}

/// Returns whether any item failed.
fn run_batch(detector: &Engine, cli: &Cli) -> bool {
    let loaded = if cli.input.is_dir() {
        batch::load_directory(&cli.input)
    } else {
        std::fs::read(&cli.input)
            .map_err(roi_forensics::Error::from)
            .and_then(|bytes| batch::load_archive(&bytes))
    };
    let items = match loaded {
        Ok(items) => items,
        Err(e) => {
            eprintln!("Error: Failed to read {}: {e}", cli.input.display());
            return true;
        }
    };

    let name = cli.input.file_stem().map(|s| s.to_string_lossy().to_string());
    let report = match detector.detect_batch(&items, name.as_deref()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return true;
        }
    };

    if cli.json {
        print_json(serde_json::to_string_pretty(&report));
    } else {
        for outcome in &report.items {
            let result = match outcome {
                BatchOutcome::Success { detection, .. } => Ok(detection),
                BatchOutcome::Failure { stage, error, .. } => Err(format!("{stage}: {error}")),
            };
            print_outcome(outcome.name(), result, detector, cli);
        }
        print_summary(&report, cli);
    }
    report.summary.failed > 0
}

fn print_json(json: serde_json::Result<String>) {
    match json {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Error: Failed to serialize result: {e}"),
    }
}

fn print_result(
    name: &str,
    result: &Result<Detection, PipelineError>,
    detector: &Engine,
    cli: &Cli,
) {
    let result = result.as_ref().map_err(ToString::to_string);
    print_outcome(name, result, detector, cli);
}

fn print_outcome(name: &str, result: Result<&Detection, String>, detector: &Engine, cli: &Cli) {
    let detection = match result {
        Ok(d) => d,
        Err(message) => {
            eprintln!("[FAIL] {name}: {message}");
            return;
        }
    };
    if cli.quiet {
        return;
    }

    let tag = match detection.label {
        Label::Real => "REAL",
        Label::Fake => "FAKE",
    };
    eprintln!(
        "[{tag}] {name} ({:.0}% confidence)",
        detection.confidence * 100.0
    );
    if let Some(id) = &detection.heatmap_id {
        eprintln!("  -> heatmap: {}", detector.store().path_of(id).display());
    }
    if let Some(err) = &detection.heatmap_error {
        eprintln!("  -> heatmap not saved: {err}");
    }
    if cli.verbose {
        let roi = &detection.roi;
        eprintln!(
            "  -> roi: {},{} {}x{}, energy: {:?}, {:.1} ms",
            roi.x,
            roi.y,
            roi.width,
            roi.height,
            detection.energy_method,
            detection.latency.as_secs_f64() * 1000.0
        );
    }
}

fn print_summary(report: &BatchReport, cli: &Cli) {
    if cli.quiet {
        return;
    }
    let s = &report.summary;
    eprintln!();
    eprint!("[Summary] {}: Real: {}, Fake: {}", report.name, s.real, s.fake);
    if s.failed > 0 {
        eprint!(", Failed: {}", s.failed);
    }
    eprintln!(" (Total: {})", s.total);
}
