use anyhow::Result;
use nalgebra::SVector;
use opencv::{
    core::{self, Mat, Scalar, Size, CV_32F},
    imgproc,
    prelude::*,
};
use std::path::Path;
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::error::PotholeError;
use crate::utils;

/// Label used when the model reports a class outside the configured names.
pub const FALLBACK_CLASS: &str = "pothole";
/// Ultralytics `max_det` default.
pub const DEFAULT_MAX_DET: usize = 300;

/// A single detection result, in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub tlwh: SVector<f32, 4>,
    pub confidence: f32,
    pub class_id: i32,
}

impl Detection {
    pub fn new(tlwh: SVector<f32, 4>, confidence: f32, class_id: i32) -> Self {
        Self {
            tlwh,
            confidence,
            class_id,
        }
    }

    /// Corners truncated to whole pixels, as `(x1, y1, x2, y2)`.
    pub fn xyxy_i32(&self) -> (i32, i32, i32, i32) {
        let x1 = self.tlwh[0] as i32;
        let y1 = self.tlwh[1] as i32;
        let x2 = (self.tlwh[0] + self.tlwh[2]) as i32;
        let y2 = (self.tlwh[1] + self.tlwh[3]) as i32;
        (x1, y1, x2, y2)
    }
}

/// Mapping between a frame and the square, padded model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub frame_w: f32,
    pub frame_h: f32,
}

impl Letterbox {
    pub fn new(frame_w: i32, frame_h: i32, input_size: i64) -> Self {
        let s = input_size as f32;
        let scale = (s / frame_w as f32).min(s / frame_h as f32);
        let new_w = (frame_w as f32 * scale).round();
        let new_h = (frame_h as f32 * scale).round();
        Self {
            scale,
            pad_x: ((s - new_w) / 2.0).floor(),
            pad_y: ((s - new_h) / 2.0).floor(),
            frame_w: frame_w as f32,
            frame_h: frame_h as f32,
        }
    }

    fn resized_size(&self) -> Size {
        Size::new(
            (self.frame_w * self.scale).round() as i32,
            (self.frame_h * self.scale).round() as i32,
        )
    }

    /// Convert a model-space cx,cy,w,h box into a clipped frame-space tlwh box.
    pub fn to_frame(&self, cx: f32, cy: f32, w: f32, h: f32) -> SVector<f32, 4> {
        let x1 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.frame_w);
        let y1 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.frame_h);
        let x2 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.frame_w);
        let y2 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.frame_h);
        SVector::<f32, 4>::new(x1, y1, x2 - x1, y2 - y1)
    }
}

/// Decode a YOLOv8/YOLO11 head laid out as `[num_attrs, num_anchors]`
/// (row-major, batch dimension already stripped). The first four attributes
/// are cx, cy, w, h and the rest are per-class scores.
pub fn decode_predictions(
    raw: &[f32],
    num_attrs: usize,
    num_anchors: usize,
    letterbox: &Letterbox,
    conf_threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    if num_attrs <= 4 || raw.len() < num_attrs * num_anchors {
        return detections;
    }
    let at = |attr: usize, anchor: usize| raw[attr * num_anchors + anchor];

    for anchor in 0..num_anchors {
        let (class_id, score) = (4..num_attrs)
            .map(|a| (a - 4, at(a, anchor)))
            .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if score < conf_threshold {
            continue;
        }

        let tlwh = letterbox.to_frame(
            at(0, anchor),
            at(1, anchor),
            at(2, anchor),
            at(3, anchor),
        );
        if tlwh[2] <= 0.0 || tlwh[3] <= 0.0 {
            continue;
        }
        detections.push(Detection::new(tlwh, score, class_id as i32));
    }
    detections
}

/// NMS run separately for each class id. At most `max_det` boxes survive,
/// highest confidence first.
pub fn class_aware_nms(detections: Vec<Detection>, iou_thresh: f32, max_det: usize) -> Vec<Detection> {
    let mut class_ids: Vec<i32> = detections.iter().map(|d| d.class_id).collect();
    class_ids.sort_unstable();
    class_ids.dedup();

    let mut kept = Vec::with_capacity(detections.len());
    for cls in class_ids {
        let group: Vec<&Detection> = detections.iter().filter(|d| d.class_id == cls).collect();
        let boxes: Vec<[f32; 4]> = group
            .iter()
            .map(|d| [d.tlwh[0], d.tlwh[1], d.tlwh[2], d.tlwh[3]])
            .collect();
        let scores: Vec<f32> = group.iter().map(|d| d.confidence).collect();
        for idx in utils::nms(&boxes, &scores, iou_thresh) {
            kept.push(group[idx].clone());
        }
    }
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept.truncate(max_det);
    kept
}

/// Wraps a TorchScript export of the trained YOLO model.
pub struct Detector {
    model: tch::CModule,
    device: Device,
    input_size: i64,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub max_det: usize,
    class_names: Vec<String>,
}

/// Resolve "auto" / "cuda" / "cpu" into a tch device.
pub fn resolve_device(device: &str) -> Device {
    match device {
        "cpu" => Device::Cpu,
        _ if tch::Cuda::is_available() => Device::Cuda(0),
        _ => Device::Cpu,
    }
}

impl Detector {
    pub fn new(
        model_path: &Path,
        device: &str,
        input_size: i64,
        conf_threshold: f32,
        nms_threshold: f32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let device = resolve_device(device);
        let model = tch::CModule::load_on_device(model_path, device)?;
        info!("Model loaded from: {} ({:?})", model_path.display(), device);

        Ok(Detector {
            model,
            device,
            input_size,
            conf_threshold,
            nms_threshold,
            max_det: DEFAULT_MAX_DET,
            class_names,
        })
    }

    pub fn from_config(cfg: &crate::Config) -> Result<Self> {
        let mut detector = Self::new(
            &cfg.model.path,
            &cfg.model.device,
            cfg.detection.input_size,
            cfg.detection.conf_threshold,
            cfg.detection.nms_threshold,
            cfg.detection.class_names.clone(),
        )?;
        detector.max_det = cfg.detection.max_det;
        Ok(detector)
    }

    pub fn class_name(&self, class_id: i32) -> &str {
        usize::try_from(class_id)
            .ok()
            .and_then(|i| self.class_names.get(i))
            .map(String::as_str)
            .unwrap_or(FALLBACK_CLASS)
    }

    /// Letterbox the BGR frame into a `[1, 3, S, S]` RGB float tensor.
    fn preprocess(&self, frame: &Mat, letterbox: &Letterbox) -> Result<Tensor> {
        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            letterbox.resized_size(),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let s = self.input_size as i32;
        let size = letterbox.resized_size();
        let top = letterbox.pad_y as i32;
        let left = letterbox.pad_x as i32;
        let mut padded = Mat::default();
        core::copy_make_border(
            &resized,
            &mut padded,
            top,
            s - size.height - top,
            left,
            s - size.width - left,
            core::BORDER_CONSTANT,
            Scalar::all(114.0),
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let mut float_mat = Mat::default();
        rgb.convert_to(&mut float_mat, CV_32F, 1.0 / 255.0, 0.0)?;

        let tensor = Tensor::from_data_size(
            float_mat.data_bytes()?,
            &[1, s as i64, s as i64, 3],
            Kind::Float,
        )
        .permute([0, 3, 1, 2])
        .contiguous()
        .to_device(self.device);

        Ok(tensor)
    }

    fn postprocess(&self, output: &Tensor, letterbox: &Letterbox) -> Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(PotholeError::ModelOutput(shape).into());
        }
        let (num_attrs, num_anchors) = (shape[1] as usize, shape[2] as usize);

        let flat = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .view([-1]);
        let raw = Vec::<f32>::try_from(&flat)?;

        let candidates =
            decode_predictions(&raw, num_attrs, num_anchors, letterbox, self.conf_threshold);
        let found = candidates.len();
        let detections = class_aware_nms(candidates, self.nms_threshold, self.max_det);
        debug!("{} candidates, {} after NMS", found, detections.len());
        Ok(detections)
    }

    /// Detect objects in a BGR frame.
    pub fn detect(&self, frame: &Mat) -> Result<Vec<Detection>> {
        let letterbox = Letterbox::new(frame.cols(), frame.rows(), self.input_size);
        let input = self.preprocess(frame, &letterbox)?;
        let output = tch::no_grad(|| self.model.forward_ts(&[input]))?;
        self.postprocess(&output, &letterbox)
    }
}
