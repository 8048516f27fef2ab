#![deny(missing_docs)]

//! Cached YOLO object detection in Rust
//!
//! This crate loads a pretrained YOLOv8 network from a local cache file,
//! downloading and caching it on first use, and detects the 80 COCO object
//! categories in single images.
//!
//! # Examples
//!
//! ```no_run
//! use kornia_detector::{Detector, DetectorConfig};
//!
//! // weights are read from `saved_model`, or downloaded there on first use
//! let detector = Detector::new(DetectorConfig::default()).expect("Failed to init the model");
//!
//! let detections = detector
//!     .detect("path/to/image.jpg", 0.4)
//!     .expect("Failed to run detection");
//! for detection in detections {
//!     println!("{}: {:?}", detection.label, detection.bbox);
//! }
//! ```

/// Bounding box module with non-maximum suppression
mod bounding_box;

/// Model weights cache
mod cache;

/// COCO label table
mod coco;

/// Detector high level interface
mod detector;

/// YOLOv8 model definition in candle
mod model;

/// Image decoding and letterboxing
mod preprocess;

pub use bounding_box::{BoundingBox, non_maximum_suppression};
pub use cache::{HubFetcher, WeightsFetcher};
pub use coco::{COCO_CLASSES, class_name};
pub use detector::{Detection, Detector, DetectorConfig, DetectorError, ModelSize};
