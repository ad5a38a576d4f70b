//! Neural network module.
//!
use std::cmp::Ordering;
use std::path::Path;

use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::s;
use smallvec::SmallVec;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type NnOut = SmallVec<[TValue; 4]>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Bounding box as `[x_tl, y_tl, x_br, y_br]`, normalized to `0..1`.
pub type Bbox = [f32; 4];

/// Single detected object.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: Bbox,
    pub class_id: usize,
    pub confidence: f32,
}

impl Detection {
    /// Human-readable class label.
    pub fn label(&self) -> &'static str {
        COCO_CLASSES.get(self.class_id).copied().unwrap_or("object")
    }
}

/// Object detector seam between the model and the pipeline.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// YOLOv8-style single-stage detector running on tract.
pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    max_iou: f32,
    min_confidence: f32,
}

impl YoloModel {
    /// Load an ONNX model with a fixed square input of `input_size` pixels.
    ///
    /// `min_confidence` and `max_iou` tune the detection/suppression
    /// thresholds; `input_size` trades accuracy against inference cost.
    pub fn load(
        path: impl AsRef<Path>,
        input_size: u32,
        min_confidence: f32,
        max_iou: f32,
    ) -> Result<Self> {
        let size = input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            input_size,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.input_size,
            self.input_size,
            image::imageops::FilterType::Triangle,
        );

        let size = self.input_size as usize;
        // YOLO expects plain 0..1 scaling, no mean/std normalization
        let tensor: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                resized[(x as _, y as _)][c] as f32 / 255.0
            })
            .into();

        tensor
    }

}

impl Detector for YoloModel {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let valid_input = tvec!(self.preproc(frame).into());
        let raw_nn_out = self.model.run(valid_input)?;
        decode_output(
            raw_nn_out,
            self.input_size,
            self.min_confidence,
            self.max_iou,
        )
    }
}

/// Decode the raw `(1, 4 + num_classes, num_anchors)` output into suppressed
/// detections with normalized corner-point boxes.
fn decode_output(
    raw_nn_out: NnOut,
    input_size: u32,
    min_confidence: f32,
    max_iou: f32,
) -> Result<Vec<Detection>> {
    let view = raw_nn_out[0].to_array_view::<f32>()?;
    let out = view.slice(s![0, .., ..]);

    let (rows, anchors) = (out.shape()[0], out.shape()[1]);
    if rows < 5 {
        bail!("unexpected model output shape {:?}", view.shape());
    }
    let num_classes = rows - 4;
    let size = input_size as f32;

    let mut candidates: Vec<(f32, Bbox, usize)> = Vec::new();
    for anchor in 0..anchors {
        let (mut class_id, mut confidence) = (0, 0_f32);
        for class in 0..num_classes {
            let score = out[[4 + class, anchor]];
            if score > confidence {
                class_id = class;
                confidence = score;
            }
        }
        if confidence < min_confidence {
            continue;
        }

        // Box center and extent in input pixels, converted to normalized
        // top-left/bottom-right corners
        let (cx, cy) = (out[[0, anchor]], out[[1, anchor]]);
        let (w, h) = (out[[2, anchor]], out[[3, anchor]]);
        let bbox = [
            (cx - w / 2.0) / size,
            (cy - h / 2.0) / size,
            (cx + w / 2.0) / size,
            (cy + h / 2.0) / size,
        ];

        candidates.push((confidence, bbox, class_id));
    }

    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    Ok(non_maximum_suppression(candidates, max_iou))
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident box and iterate over all other boxes in the
/// order of sinking confidence. Grow the vector of selected detections by
/// adding only those candidates which do not overlap an already chosen box
/// with an IoU above `max_iou`.
fn non_maximum_suppression(
    mut sorted_candidates: Vec<(f32, Bbox, usize)>,
    max_iou: f32,
) -> Vec<Detection> {
    let mut selected: Vec<Detection> = vec![];
    'candidates: loop {
        // Next most confident candidate comes from the back of the
        // ascending-sorted vector
        match sorted_candidates.pop() {
            Some((confidence, bbox, class_id)) => {
                for chosen in selected.iter() {
                    match iou(&bbox, &chosen.bbox) {
                        x if x > max_iou => continue 'candidates,
                        _ => (),
                    }
                }

                selected.push(Detection {
                    bbox,
                    class_id,
                    confidence,
                })
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // Corner points of the overlap box. If the boxes do not overlap, the
    // corners are ill-defined and the area below evaluates to zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The box is passed as `[x_top_left, y_top_left, x_bottom_right,
/// y_bottom_right]`. An ill-defined box with its bottom-right corner
/// above or to the left of the top-left corner has zero area.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

/// Class labels of the 80 COCO categories, in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
