use serde::Serialize;

/// Bounding box of a detected object, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Minimum x coordinate of the bounding box.
    pub xmin: f32,
    /// Minimum y coordinate of the bounding box.
    pub ymin: f32,
    /// Maximum x coordinate of the bounding box.
    pub xmax: f32,
    /// Maximum y coordinate of the bounding box.
    pub ymax: f32,
    /// Confidence score of the bounding box.
    pub confidence: f32,
    /// Class index of the bounding box.
    pub class: u32,
}

impl BoundingBox {
    /// Build a box from its center and size, as emitted by the detection head.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, confidence: f32, class: u32) -> Self {
        Self {
            xmin: cx - w / 2.0,
            ymin: cy - h / 2.0,
            xmax: cx + w / 2.0,
            ymax: cy + h / 2.0,
            confidence,
            class,
        }
    }

    /// Width of the box.
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    /// Height of the box.
    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// Intersection over union of two bounding boxes.
fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let b1_area = (b1.xmax - b1.xmin + 1.) * (b1.ymax - b1.ymin + 1.);
    let b2_area = (b2.xmax - b2.xmin + 1.) * (b2.ymax - b2.ymin + 1.);
    let i_xmin = b1.xmin.max(b2.xmin);
    let i_xmax = b1.xmax.min(b2.xmax);
    let i_ymin = b1.ymin.max(b2.ymin);
    let i_ymax = b1.ymax.min(b2.ymax);
    let i_area = (i_xmax - i_xmin + 1.).max(0.) * (i_ymax - i_ymin + 1.).max(0.);
    i_area / (b1_area + b2_area - i_area)
}

/// Greedy non-maximum suppression, run independently for every class.
///
/// Each inner vector holds the candidates of one class. After the call it holds
/// the survivors sorted by decreasing confidence. A box is dropped when it
/// overlaps an already kept box of the same class with an IoU above `threshold`.
///
/// Only higher scored boxes can suppress a lower scored one, so removing the
/// weakest candidates beforehand never changes the fate of the stronger ones.
pub fn non_maximum_suppression(bboxes: &mut [Vec<BoundingBox>], threshold: f32) {
    for bboxes_for_class in bboxes.iter_mut() {
        // stable sort: equal scores keep their anchor order
        bboxes_for_class.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        let mut kept = 0;
        for index in 0..bboxes_for_class.len() {
            let candidate = bboxes_for_class[index];
            let suppressed = bboxes_for_class[..kept]
                .iter()
                .any(|prev| iou(prev, &candidate) > threshold);
            if !suppressed {
                bboxes_for_class.swap(kept, index);
                kept += 1;
            }
        }
        bboxes_for_class.truncate(kept);
    }
}
