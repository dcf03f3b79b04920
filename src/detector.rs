use anyhow::{bail, Context, Result};
use opencv::{
    core::{self, Point, Rect, Scalar, Size},
    dnn::{self, Net},
    imgproc,
    prelude::*,
};
use std::cmp::Ordering;
use std::path::Path;

use crate::config::DetectorSettings;
use crate::metadata::ClassNames;

/// Represents a single detected object
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: Rect,
}

/// Per-frame inference backend.
pub trait Detector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>>;
}

/// YOLO (v8 layout) ONNX export running on OpenCV DNN.
pub struct YoloDetector {
    net: Net,
    num_classes: usize,
    settings: DetectorSettings,
}

impl YoloDetector {
    /// Initialize the Neural Network
    pub fn new(weights: &Path, num_classes: usize, settings: DetectorSettings) -> Result<Self> {
        let path = weights
            .to_str()
            .context("Model weights path is not valid UTF-8")?;
        let mut net = dnn::read_net_from_onnx(path)
            .with_context(|| format!("Failed to load model weights {}", weights.display()))?;
        net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)?;
        net.set_preferable_target(dnn::DNN_TARGET_CPU)?;

        Ok(Self {
            net,
            num_classes,
            settings,
        })
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let size = self.settings.input_size;
        let blob = dnn::blob_from_image(
            frame,
            1.0 / 255.0,
            Size::new(size, size),
            Scalar::default(),
            true,
            false,
            core::CV_32F,
        )?;
        self.net.set_input(&blob, "", 1.0, Scalar::default())?;
        let output = self.net.forward_single("")?;
        let data = output
            .data_typed::<f32>()
            .context("Model output is not a continuous f32 tensor")?;

        let candidates = decode_predictions(
            data,
            self.num_classes,
            (frame.cols(), frame.rows()),
            size,
            self.settings.confidence,
        )?;
        Ok(non_max_suppression(candidates, self.settings.nms_iou))
    }
}

/// Parse a `[1, 4 + classes, anchors]` prediction tensor: each anchor column
/// holds `cx, cy, w, h` in input pixels followed by one score per class.
pub fn decode_predictions(
    data: &[f32],
    num_classes: usize,
    frame_size: (i32, i32),
    input_size: i32,
    conf_threshold: f32,
) -> Result<Vec<Detection>> {
    let rows = 4 + num_classes;
    if num_classes == 0 || data.len() % rows != 0 {
        bail!(
            "Model output of {} values does not match {} classes",
            data.len(),
            num_classes
        );
    }
    let anchors = data.len() / rows;
    let x_factor = frame_size.0 as f32 / input_size as f32;
    let y_factor = frame_size.1 as f32 / input_size as f32;

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let at = |row: usize| data[row * anchors + anchor];

        let (class_id, score) = (0..num_classes)
            .map(|c| (c, at(4 + c)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .unwrap_or((0, 0.0));
        if score < conf_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0), at(1), at(2), at(3));
        let bbox = Rect::new(
            ((cx - w / 2.0) * x_factor) as i32,
            ((cy - h / 2.0) * y_factor) as i32,
            (w * x_factor) as i32,
            (h * y_factor) as i32,
        );
        detections.push(Detection {
            class_id,
            confidence: score,
            bbox,
        });
    }
    Ok(detections)
}

fn rect_area(rect: Rect) -> f32 {
    let area = rect.width.max(0) * rect.height.max(0);
    area as f32
}

fn rect_iou(a: Rect, b: Rect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0) as f32;
    let inter_h = (y2 - y1).max(0) as f32;
    let inter_area = inter_w * inter_h;

    let union = rect_area(a) + rect_area(b) - inter_area;
    if union <= 0.0 {
        0.0
    } else {
        inter_area / union
    }
}

/// Greedy per-class NMS, highest confidence first. A helmet box inside a
/// person box must survive, so classes never suppress each other.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep
            .iter()
            .filter(|kept| kept.class_id == det.class_id)
            .all(|kept| rect_iou(det.bbox, kept.bbox) <= iou_threshold)
        {
            keep.push(det);
        }
    }
    keep
}

fn class_color(class_id: usize) -> Scalar {
    const PALETTE: [(f64, f64, f64); 8] = [
        (56.0, 56.0, 255.0),
        (151.0, 157.0, 255.0),
        (31.0, 112.0, 255.0),
        (29.0, 178.0, 255.0),
        (49.0, 210.0, 207.0),
        (10.0, 249.0, 72.0),
        (23.0, 204.0, 146.0),
        (134.0, 219.0, 61.0),
    ];
    let (b, g, r) = PALETTE[class_id % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}

/// Draw labelled boxes onto `frame`.
pub fn draw_detections(frame: &mut Mat, detections: &[Detection], names: &ClassNames) -> Result<()> {
    for det in detections {
        let color = class_color(det.class_id);
        imgproc::rectangle(frame, det.bbox, color, 2, imgproc::LINE_8, 0)?;

        let label = names.get(det.class_id).unwrap_or("?");
        let text = format!("{} {:.2}", label, det.confidence);
        let origin = Point::new(det.bbox.x, (det.bbox.y - 6).max(12));
        imgproc::put_text(
            frame,
            &text,
            origin,
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}
