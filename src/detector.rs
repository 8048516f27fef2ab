use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{
    bounding_box::{BoundingBox, non_maximum_suppression},
    cache::{HubFetcher, ModelCache, WeightsFetcher},
    coco::{COCO_CLASSES, class_name},
    model::{Multiples, YoloV8 as YoloV8Model},
    preprocess,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use kornia_image::Image;
use serde::Serialize;

/// Detector error enum.
#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    /// The model could not be read from the cache, fetched or deserialized.
    #[error("Not able to init the model: {0}")]
    ModelInitError(String),

    /// The input image could not be read or decoded.
    #[error("Not able to load image from {}: {reason}", path.display())]
    ImageLoadError {
        /// Path of the image.
        path: PathBuf,
        /// Underlying decoder error.
        reason: String,
    },

    /// Confidence threshold outside of [0, 1].
    #[error("Invalid confidence threshold: {0}")]
    InvalidThreshold(f32),

    /// Invalid detector configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),
}

/// YOLOv8 model size enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    /// N model size.
    N,
    /// S model size.
    S,
    /// M model size.
    M,
    /// L model size.
    L,
    /// X model size.
    X,
}

impl ModelSize {
    fn multiples(self) -> Multiples {
        match self {
            ModelSize::N => Multiples::n(),
            ModelSize::S => Multiples::s(),
            ModelSize::M => Multiples::m(),
            ModelSize::L => Multiples::l(),
            ModelSize::X => Multiples::x(),
        }
    }

    /// Output channels of the first backbone convolution.
    pub(crate) fn stem_channels(self) -> usize {
        match self {
            ModelSize::N => 16,
            ModelSize::S => 32,
            ModelSize::M => 48,
            ModelSize::L => 64,
            ModelSize::X => 80,
        }
    }

    pub(crate) fn from_stem_channels(channels: usize) -> Option<Self> {
        [ModelSize::N, ModelSize::S, ModelSize::M, ModelSize::L, ModelSize::X]
            .into_iter()
            .find(|s| s.stem_channels() == channels)
    }
}

impl TryFrom<String> for ModelSize {
    type Error = DetectorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(match s.as_str() {
            "n" => ModelSize::N,
            "s" => ModelSize::S,
            "m" => ModelSize::M,
            "l" => ModelSize::L,
            "x" => ModelSize::X,
            _ => return Err(DetectorError::InvalidConfig(format!("Invalid size: {s}"))),
        })
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ModelSize::N => "n",
                ModelSize::S => "s",
                ModelSize::M => "m",
                ModelSize::L => "l",
                ModelSize::X => "x",
            }
        )
    }
}

/// Detector configuration struct.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// The size of the model to use: n, s, m, l, x
    pub size: ModelSize,
    /// Where the model weights are cached between runs
    pub cache_path: PathBuf,
    /// Side of the square network input, a multiple of 32
    pub input_size: usize,
    /// The non-maximum suppression IoU threshold
    pub nms_threshold: f32,
    /// Throwaway forward passes run before the timed one
    pub warmup_passes: usize,
    /// Whether to use the CPU or GPU
    pub use_cpu: bool,
}

/// Default configuration for the detector.
impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            size: ModelSize::N,
            cache_path: PathBuf::from("saved_model"),
            input_size: 608,
            nms_threshold: 0.45,
            warmup_passes: 0,
            use_cpu: true,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), DetectorError> {
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(DetectorError::InvalidConfig(format!(
                "input size {} is not a positive multiple of 32",
                self.input_size
            )));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(DetectorError::InvalidConfig(format!(
                "nms threshold {} is outside [0, 1]",
                self.nms_threshold
            )));
        }
        Ok(())
    }
}

/// A labeled object found in an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    /// COCO label of the predicted class.
    pub label: &'static str,
    /// Box in original image pixels, with class index and confidence.
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

/// YOLO detector backed by a locally cached pretrained model.
pub struct Detector {
    config: DetectorConfig,
    device: Device,
    model: YoloV8Model,
}

impl Detector {
    /// Create a detector, downloading the pretrained weights on a cache miss.
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        let fetcher = HubFetcher::new(config.size);
        Self::with_fetcher(config, &fetcher)
    }

    /// Create a detector that fills an empty cache from `fetcher`.
    pub fn with_fetcher(
        config: DetectorConfig,
        fetcher: &dyn WeightsFetcher,
    ) -> Result<Self, DetectorError> {
        config.validate()?;
        let device = if config.use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)
                .map_err(|_| DetectorError::ModelInitError("cuda:0 error".to_string()))?
        };

        let weights = ModelCache::new(&config.cache_path, config.size).resolve(fetcher)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, &device) }
            .map_err(|e| {
                DetectorError::ModelInitError(format!("read {}: {e}", weights.display()))
            })?;

        Self::from_var_builder(config, device, vb)
    }

    fn from_var_builder(
        config: DetectorConfig,
        device: Device,
        vb: VarBuilder,
    ) -> Result<Self, DetectorError> {
        let model = YoloV8Model::load(vb, config.size.multiples(), COCO_CLASSES.len())
            .map_err(|e| DetectorError::ModelInitError(e.to_string()))?;
        tracing::info!(
            "loaded yolov8{} with {} classes",
            config.size,
            model.num_classes()
        );
        Ok(Self {
            config,
            device,
            model,
        })
    }

    /// The configuration the detector was built with.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect objects in an image file, keeping those scoring above `threshold`.
    ///
    /// The comparison is strict: a score equal to `threshold` is dropped, so a
    /// threshold of 1.0 always yields no detections.
    pub fn detect(
        &self,
        image_path: impl AsRef<Path>,
        threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        check_threshold(threshold)?;
        let image = preprocess::read_image(image_path.as_ref())?;
        self.detect_image(&image, threshold)
    }

    /// Detect objects in an rgb8 image, keeping those scoring strictly above `threshold`.
    pub fn detect_image(
        &self,
        image: &Image<u8, 3>,
        threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        check_threshold(threshold)?;

        let size = self.config.input_size;
        let (canvas, letterbox) = preprocess::letterbox(image, size)?;
        let image_t = preprocess::to_tensor(canvas, size, &self.device)?;

        for _ in 0..self.config.warmup_passes {
            self.model.forward(&image_t)?;
        }

        let start = Instant::now();
        let pred = self.model.forward(&image_t)?.squeeze(0)?;
        tracing::info!("simple forward took {:?}", start.elapsed());

        let bboxes = decode_predictions(&pred, threshold, self.config.nms_threshold)?;

        let mut detections = Vec::with_capacity(bboxes.len());
        for bbox in bboxes {
            let Some(label) = class_name(bbox.class) else {
                tracing::warn!("dropping detection with unknown class {}", bbox.class);
                continue;
            };
            tracing::info!("{label}");
            detections.push(Detection {
                label,
                bbox: letterbox.unmap(bbox),
            });
        }
        Ok(detections)
    }
}

fn check_threshold(threshold: f32) -> Result<(), DetectorError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(DetectorError::InvalidThreshold(threshold))
    }
}

/// Turn the `(4 + classes, anchors)` head output into scored boxes.
///
/// Boxes stay in network input coordinates, sorted by decreasing confidence.
fn decode_predictions(
    pred: &Tensor,
    threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<BoundingBox>, DetectorError> {
    let (pred_size, _npreds) = pred.dims2()?;
    if pred_size <= 4 {
        return Err(DetectorError::CandleError(candle_core::Error::Msg(format!(
            "unexpected prediction size {pred_size}"
        ))));
    }
    let nclasses = pred_size - 4;
    let mut bboxes: Vec<Vec<BoundingBox>> = (0..nclasses).map(|_| Vec::new()).collect();
    for pred in pred.t()?.contiguous()?.to_vec2::<f32>()? {
        let mut class_index = 0;
        for i in 1..nclasses {
            if pred[4 + i] > pred[4 + class_index] {
                class_index = i;
            }
        }
        let confidence = pred[4 + class_index];
        if confidence > threshold {
            bboxes[class_index].push(BoundingBox::from_center(
                pred[0],
                pred[1],
                pred[2],
                pred[3],
                confidence,
                class_index as u32,
            ));
        }
    }

    non_maximum_suppression(&mut bboxes, nms_threshold);

    let mut bboxes: Vec<BoundingBox> = bboxes.into_iter().flatten().collect();
    bboxes.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
    Ok(bboxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{LocalFetcher, write_stem};
    use candle_nn::VarMap;

    const NUM_CLASSES: usize = 80;

    /// Head output for the given `(cx, cy, w, h, class, score)` anchors.
    fn head_output(anchors: &[(f32, f32, f32, f32, usize, f32)]) -> candle_core::Result<Tensor> {
        let rows = 4 + NUM_CLASSES;
        let mut data = vec![0f32; rows * anchors.len()];
        for (j, &(cx, cy, w, h, class, score)) in anchors.iter().enumerate() {
            for (i, v) in [cx, cy, w, h].into_iter().enumerate() {
                data[i * anchors.len() + j] = v;
            }
            data[(4 + class) * anchors.len() + j] = score;
        }
        Tensor::from_vec(data, (rows, anchors.len()), &Device::Cpu)
    }

    fn sample_predictions() -> candle_core::Result<Tensor> {
        head_output(&[
            (100.0, 100.0, 50.0, 80.0, 0, 0.92),
            // overlaps the first person, weaker
            (102.0, 101.0, 50.0, 80.0, 0, 0.55),
            // same place, different class
            (100.0, 100.0, 50.0, 80.0, 1, 0.40),
            (400.0, 300.0, 60.0, 30.0, 2, 0.71),
            (500.0, 500.0, 20.0, 20.0, 16, 0.12),
        ])
    }

    fn zero_detector(input_size: usize) -> Result<Detector, DetectorError> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = DetectorConfig {
            input_size,
            ..Default::default()
        };
        Detector::from_var_builder(config, device, vb)
    }

    fn test_image() -> Result<Image<u8, 3>, kornia_image::ImageError> {
        let size = kornia_image::ImageSize {
            width: 48,
            height: 32,
        };
        Image::new(size, vec![127u8; 48 * 32 * 3])
    }

    #[test]
    fn test_model_size() -> Result<(), DetectorError> {
        for s in ["n", "s", "m", "l", "x"] {
            assert_eq!(ModelSize::try_from(s.to_string())?.to_string(), s);
        }
        assert!(matches!(
            ModelSize::try_from("q".to_string()),
            Err(DetectorError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(DetectorConfig::default().validate().is_ok());
        let odd = DetectorConfig {
            input_size: 600,
            ..Default::default()
        };
        assert!(matches!(odd.validate(), Err(DetectorError::InvalidConfig(_))));
        let nms = DetectorConfig {
            nms_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(nms.validate(), Err(DetectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_decode_predictions() -> Result<(), Box<dyn std::error::Error>> {
        let bboxes = decode_predictions(&sample_predictions()?, 0.25, 0.45)?;

        let summary: Vec<(u32, f32)> = bboxes.iter().map(|b| (b.class, b.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.92), (2, 0.71), (1, 0.40)]);
        assert_eq!(bboxes[0].xmin, 75.0);
        assert_eq!(bboxes[0].ymin, 60.0);
        assert_eq!(bboxes[0].xmax, 125.0);
        assert_eq!(bboxes[0].ymax, 140.0);
        Ok(())
    }

    #[test]
    fn test_decode_predictions_is_monotonic() -> Result<(), Box<dyn std::error::Error>> {
        let pred = sample_predictions()?;
        let thresholds = [0.0, 0.1, 0.3, 0.5, 0.6, 0.8, 0.95];
        for pair in thresholds.windows(2) {
            let low = decode_predictions(&pred, pair[0], 0.45)?;
            let high = decode_predictions(&pred, pair[1], 0.45)?;
            assert!(high.len() <= low.len());
            for b in &high {
                assert!(low.contains(b), "{b:?} missing at threshold {}", pair[0]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_decode_predictions_threshold_one() -> Result<(), Box<dyn std::error::Error>> {
        let pred = head_output(&[(10.0, 10.0, 5.0, 5.0, 3, 1.0)])?;
        assert!(decode_predictions(&pred, 1.0, 0.45)?.is_empty());
        assert_eq!(decode_predictions(&pred, 0.99, 0.45)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_decode_predictions_drops_score_equal_to_threshold()
    -> Result<(), Box<dyn std::error::Error>> {
        let pred = head_output(&[(10.0, 10.0, 5.0, 5.0, 3, 0.5)])?;
        assert!(decode_predictions(&pred, 0.5, 0.45)?.is_empty());
        assert_eq!(decode_predictions(&pred, 0.49, 0.45)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_threshold() -> Result<(), Box<dyn std::error::Error>> {
        let detector = zero_detector(64)?;
        let image = test_image()?;
        for threshold in [-0.1, 1.1, f32::NAN] {
            assert!(matches!(
                detector.detect_image(&image, threshold),
                Err(DetectorError::InvalidThreshold(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_detect_image_labels_and_thresholds() -> Result<(), Box<dyn std::error::Error>> {
        // a zero initialized head scores every class at sigmoid(0) = 0.5
        let detector = zero_detector(64)?;
        let image = test_image()?;

        let low = detector.detect_image(&image, 0.25)?;
        assert!(!low.is_empty());
        for d in &low {
            assert!(COCO_CLASSES.contains(&d.label));
            assert_eq!(d.bbox.confidence, 0.5);
            assert!(d.bbox.xmin >= 0.0 && d.bbox.xmax <= 48.0);
            assert!(d.bbox.ymin >= 0.0 && d.bbox.ymax <= 32.0);
        }

        let high = detector.detect_image(&image, 0.4)?;
        for d in &high {
            assert!(low.contains(d));
        }

        assert!(detector.detect_image(&image, 0.5)?.is_empty());
        assert!(detector.detect_image(&image, 1.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_warmup_passes_do_not_change_output() -> Result<(), Box<dyn std::error::Error>> {
        let device = Device::Cpu;
        let config = DetectorConfig {
            input_size: 64,
            warmup_passes: 2,
            ..Default::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &device);
        let warmed = Detector::from_var_builder(config, device.clone(), vb)?;
        let cold = zero_detector(64)?;
        let image = test_image()?;
        assert_eq!(
            warmed.detect_image(&image, 0.25)?,
            cold.detect_image(&image, 0.25)?
        );
        Ok(())
    }

    #[test]
    fn test_detect_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("frame.png");
        image::RgbImage::from_pixel(48, 32, image::Rgb([10, 200, 30])).save(&path)?;

        let detector = zero_detector(64)?;
        let detections = detector.detect(&path, 0.25)?;
        assert!(!detections.is_empty());
        Ok(())
    }

    #[test]
    fn test_detect_corrupt_image() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("corrupt.jpg");
        std::fs::write(&path, b"definitely not a jpeg")?;

        let detector = zero_detector(64)?;
        assert!(matches!(
            detector.detect(&path, 0.25),
            Err(DetectorError::ImageLoadError { .. })
        ));
        assert!(matches!(
            detector.detect(dir.path().join("missing.png"), 0.25),
            Err(DetectorError::ImageLoadError { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_default_input_shape() -> Result<(), Box<dyn std::error::Error>> {
        let detector = zero_detector(608)?;
        let input = Tensor::zeros((1, 3, 608, 608), DType::F32, &Device::Cpu)?;
        let pred = detector.model.forward(&input)?;
        // 76x76 + 38x38 + 19x19 anchors
        assert_eq!(pred.dims3()?, (1, 4 + NUM_CLASSES, 7581));
        assert_eq!(detector.model.num_classes(), NUM_CLASSES);
        Ok(())
    }

    #[test]
    fn test_stem_channels_match_multiples() -> Result<(), Box<dyn std::error::Error>> {
        for size in [ModelSize::N, ModelSize::S, ModelSize::M, ModelSize::L, ModelSize::X] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            YoloV8Model::load(vb, size.multiples(), NUM_CLASSES)?;
            let vars = varmap.data().lock().map_err(|e| e.to_string())?;
            let stem = vars
                .get(crate::cache::STEM_TENSOR)
                .ok_or("stem tensor missing")?;
            assert_eq!(stem.elem_count(), size.stem_channels());
            assert_eq!(ModelSize::from_stem_channels(size.stem_channels()), Some(size));
        }
        Ok(())
    }

    #[test]
    fn test_valid_cache_builds_without_fetch() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache_path = dir.path().join("saved_model");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        YoloV8Model::load(vb, ModelSize::N.multiples(), NUM_CLASSES)?;
        varmap.save(&cache_path)?;
        let fetcher = LocalFetcher::new(dir.path().join("remote"));
        let config = DetectorConfig {
            cache_path,
            input_size: 64,
            ..Default::default()
        };

        let detector = Detector::with_fetcher(config, &fetcher)?;

        assert_eq!(fetcher.calls.get(), 0);
        assert!(detector.detect_image(&test_image()?, 1.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_cache_of_other_size_is_model_init_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache_path = dir.path().join("saved_model");
        write_stem(&cache_path, ModelSize::N)?;
        let fetcher = LocalFetcher::new(dir.path().join("remote"));
        let config = DetectorConfig {
            size: ModelSize::S,
            cache_path,
            ..Default::default()
        };

        let result = Detector::with_fetcher(config, &fetcher);

        match result {
            Err(DetectorError::ModelInitError(msg)) => assert!(msg.contains("yolov8n"), "{msg}"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("a yolov8n cache must not build a yolov8s detector"),
        }
        assert_eq!(fetcher.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_is_model_init_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache_path = dir.path().join("saved_model");
        std::fs::write(&cache_path, b"not safetensors")?;
        let fetcher = LocalFetcher::new(dir.path().join("remote"));
        let config = DetectorConfig {
            cache_path,
            ..Default::default()
        };

        let result = Detector::with_fetcher(config, &fetcher);

        assert!(matches!(result, Err(DetectorError::ModelInitError(_))));
        assert_eq!(fetcher.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_pretrained_is_model_init_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let fetcher = LocalFetcher::new(dir.path().join("remote"));
        let config = DetectorConfig {
            cache_path: dir.path().join("saved_model"),
            ..Default::default()
        };

        let result = Detector::with_fetcher(config, &fetcher);

        assert!(matches!(result, Err(DetectorError::ModelInitError(_))));
        assert_eq!(fetcher.calls.get(), 1);
        Ok(())
    }

    #[test]
    #[ignore = "downloads the pretrained weights"]
    fn test_pretrained_download_fills_cache() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let config = DetectorConfig {
            cache_path: dir.path().join("saved_model"),
            ..Default::default()
        };
        let cache_path = config.cache_path.clone();

        let detector = Detector::new(config)?;

        assert!(cache_path.is_file());
        assert!(detector.detect_image(&test_image()?, 1.0)?.is_empty());
        Ok(())
    }
}
