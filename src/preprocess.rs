use std::path::Path;

use candle_core::{Device, Tensor};
use kornia_image::{Image, ImageSize};
use kornia_imgproc::{interpolation::InterpolationMode, resize::resize_fast};

use crate::{bounding_box::BoundingBox, detector::DetectorError};

/// Grey level of the letterbox border, in [0, 1].
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Geometry of fitting an image into the square network input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
    scale: f32,
    pad_x: usize,
    pad_y: usize,
    resized: ImageSize,
    original: ImageSize,
}

impl Letterbox {
    pub(crate) fn new(original: ImageSize, target: usize) -> Self {
        let scale = f32::min(
            target as f32 / original.width as f32,
            target as f32 / original.height as f32,
        );
        let resized = ImageSize {
            width: ((original.width as f32 * scale).round() as usize).clamp(1, target),
            height: ((original.height as f32 * scale).round() as usize).clamp(1, target),
        };
        Self {
            scale,
            pad_x: (target - resized.width) / 2,
            pad_y: (target - resized.height) / 2,
            resized,
            original,
        }
    }

    /// Map a box from network input coordinates back onto the original image.
    pub(crate) fn unmap(&self, bbox: BoundingBox) -> BoundingBox {
        let max_x = self.original.width as f32;
        let max_y = self.original.height as f32;
        let x = |v: f32| ((v - self.pad_x as f32) / self.scale).clamp(0.0, max_x);
        let y = |v: f32| ((v - self.pad_y as f32) / self.scale).clamp(0.0, max_y);
        BoundingBox {
            xmin: x(bbox.xmin),
            ymin: y(bbox.ymin),
            xmax: x(bbox.xmax),
            ymax: y(bbox.ymax),
            ..bbox
        }
    }
}

/// Decode an image file as rgb8.
pub(crate) fn read_image(path: &Path) -> Result<Image<u8, 3>, DetectorError> {
    kornia_io::functional::read_image_any(path).map_err(|e| DetectorError::ImageLoadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Resize keeping the aspect ratio and pad to a `target` x `target` canvas.
///
/// Returns the canvas as interleaved rgb f32 values in [0, 1] together with
/// the geometry needed to undo the transform.
pub(crate) fn letterbox(
    image: &Image<u8, 3>,
    target: usize,
) -> Result<(Vec<f32>, Letterbox), DetectorError> {
    let geometry = Letterbox::new(image.size(), target);
    tracing::debug!(
        "letterbox {}x{} -> {}x{} (scale {:.3}, pad {}x{})",
        image.width(),
        image.height(),
        geometry.resized.width,
        geometry.resized.height,
        geometry.scale,
        geometry.pad_x,
        geometry.pad_y
    );

    let mut resized = Image::from_size_val(geometry.resized, 0u8)?;
    resize_fast(image, &mut resized, InterpolationMode::Bilinear)?;

    let mut canvas = vec![PAD_VALUE; target * target * 3];
    let row_len = geometry.resized.width * 3;
    for (row, src) in resized.as_slice().chunks_exact(row_len).enumerate() {
        let start = ((row + geometry.pad_y) * target + geometry.pad_x) * 3;
        for (dst, &px) in canvas[start..start + row_len].iter_mut().zip(src) {
            *dst = px as f32 / 255.0;
        }
    }

    Ok((canvas, geometry))
}

/// Interleaved `target` x `target` rgb values to a `(1, 3, target, target)` tensor.
pub(crate) fn to_tensor(
    canvas: Vec<f32>,
    target: usize,
    device: &Device,
) -> Result<Tensor, DetectorError> {
    Ok(Tensor::from_vec(canvas, (target, target, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?)
}
