use argh::FromArgs;
use std::path::PathBuf;

use kornia_detector::{Detector, DetectorConfig, ModelSize};

#[derive(FromArgs)]
/// Cached YOLO detection application arguments
struct Args {
    /// path to an input image
    #[argh(option)]
    image_path: PathBuf,

    /// the confidence threshold for the detections
    #[argh(option, default = "0.4")]
    threshold: f32,

    /// the size of the model to use: n, s, m, l, x
    #[argh(option, default = "\"n\".to_string()")]
    size: String,

    /// where the model weights are cached
    #[argh(option, default = "PathBuf::from(\"saved_model\")")]
    cache_path: PathBuf,

    /// the nms threshold for the model
    #[argh(option, default = "0.45")]
    nms_threshold: f32,

    /// number of untimed forward passes before the timed one
    #[argh(option, default = "0")]
    warmup_passes: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Args = argh::from_env();

    let config = DetectorConfig {
        size: ModelSize::try_from(args.size)?,
        cache_path: args.cache_path,
        nms_threshold: args.nms_threshold,
        warmup_passes: args.warmup_passes,
        ..Default::default()
    };

    let detector = Detector::new(config)?;

    let detections = detector.detect(&args.image_path, args.threshold)?;

    for detection in detections {
        let b = detection.bbox;
        println!(
            "{:>14} {:.2} [{:.1}, {:.1}, {:.1}, {:.1}]",
            detection.label, b.confidence, b.xmin, b.ymin, b.xmax, b.ymax
        );
    }

    Ok(())
}
