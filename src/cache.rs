use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::detector::{DetectorError, ModelSize};

/// Hugging Face repository hosting the converted YOLOv8 weights.
const HUB_REPO: &str = "lmz/candle-yolo-v8";

/// First backbone tensor; its length is the stem width of the stored variant.
pub(crate) const STEM_TENSOR: &str = "net.b1.0.bn.running_mean";

/// Source of pretrained weights used when the local cache is empty.
pub trait WeightsFetcher {
    /// Fetch the weights and return the path of a local safetensors file.
    fn fetch(&self) -> Result<PathBuf, DetectorError>;
}

/// Fetch pretrained weights from the Hugging Face hub.
pub struct HubFetcher {
    size: ModelSize,
}

impl HubFetcher {
    /// Create a fetcher for the given model size.
    pub fn new(size: ModelSize) -> Self {
        Self { size }
    }
}

impl WeightsFetcher for HubFetcher {
    fn fetch(&self) -> Result<PathBuf, DetectorError> {
        let file = format!("yolov8{}.safetensors", self.size);
        tracing::info!("fetching {file} from {HUB_REPO}");
        hf_hub::api::sync::Api::new()
            .and_then(|api| api.model(HUB_REPO.to_string()).get(&file))
            .map_err(|e| DetectorError::ModelInitError(format!("fetch {file}: {e}")))
    }
}

/// Local copy of the weights of one model size at a fixed path.
#[derive(Debug, Clone)]
pub(crate) struct ModelCache {
    path: PathBuf,
    size: ModelSize,
}

impl ModelCache {
    pub(crate) fn new(path: impl Into<PathBuf>, size: ModelSize) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Return the cached weights, fetching and persisting them first on a miss.
    ///
    /// A cache holding the weights of another model size is an error: the
    /// file is left untouched and never silently replaced.
    pub(crate) fn resolve(&self, fetcher: &dyn WeightsFetcher) -> Result<PathBuf, DetectorError> {
        if self.path.is_file() {
            tracing::info!("cached model exists at {}", self.path.display());
            self.check_size()?;
            return Ok(self.path.clone());
        }

        tracing::info!("cached model does not exist at {}", self.path.display());
        let fetched = fetcher.fetch()?;
        self.persist(&fetched).map_err(|e| {
            DetectorError::ModelInitError(format!(
                "cache {} to {}: {e}",
                fetched.display(),
                self.path.display()
            ))
        })?;
        Ok(self.path.clone())
    }

    /// Compare the stem width stored in the cache with the requested size.
    fn check_size(&self) -> Result<(), DetectorError> {
        let stored = unsafe { candle_core::safetensors::MmapedSafetensors::new(&self.path) }
            .map_err(|e| {
                DetectorError::ModelInitError(format!("read {}: {e}", self.path.display()))
            })?;
        // unknown layouts are left to the model loader to reject
        let Ok(stem) = stored.load(STEM_TENSOR, &Device::Cpu) else {
            return Ok(());
        };
        let channels = stem.elem_count();
        if channels == self.size.stem_channels() {
            return Ok(());
        }

        let found = ModelSize::from_stem_channels(channels)
            .map(|s| format!("yolov8{s}"))
            .unwrap_or_else(|| format!("a {channels}-channel stem"));
        Err(DetectorError::ModelInitError(format!(
            "cache {} holds {found} weights but yolov8{} was requested; \
             delete or move the file, or choose another cache path",
            self.path.display(),
            self.size
        )))
    }

    /// Copy next to the destination, then rename, so readers never see a partial file.
    fn persist(&self, src: &Path) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        let result = std::fs::copy(src, &tmp).and_then(|_| std::fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }
}
