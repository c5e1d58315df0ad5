//! Classify a single image and write its heatmap overlay.
//!
//! Usage:
//! ```sh
//! cargo run --example detect_image -- input.jpg heatmaps/
//! ```

use std::env;
use std::process;

use roi_forensics::{Detector, DetectorConfig, DirectoryStore, HeuristicClassifier};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input> <heatmap-dir>", args[0]);
        process::exit(1);
    }

    let detector = Detector::new(
        DetectorConfig::default(),
        HeuristicClassifier::new(),
        DirectoryStore::new(&args[2]),
    )
    .expect("default configuration is valid");

    let bytes = match std::fs::read(&args[1]) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    match detector.detect_bytes(&bytes) {
        Ok(detection) => {
            println!(
                "{}: {} ({:.0}%)",
                args[1],
                detection.label,
                detection.confidence * 100.0
            );
            if let Some(id) = &detection.heatmap_id {
                println!("Heatmap: {}", detector.store().path_of(id).display());
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
