// 该文件是 Shijian （视检） 项目的一部分。
// src/detection.rs - 检测数据模型与工位适配层
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

/// 像素坐标下的包围框，约定 `x1 < x2, y1 < y2`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BBox {
  pub fn x_center(&self) -> i32 {
    ((self.x1 + self.x2) / 2.0).round() as i32
  }

  pub fn y_center(&self) -> i32 {
    ((self.y1 + self.y2) / 2.0).round() as i32
  }

  pub fn is_well_formed(&self) -> bool {
    self.x1 < self.x2 && self.y1 < self.y2
  }
}

/// 单条检测结果。每个循环由外部检测模型新鲜产出，循环结束即丢弃。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub bbox: BBox,
}

/// 检测模型适配接口。模型内部结构、预热与标签词表都是适配器的事，
/// 核心只按字符串精确匹配它认识的标签。
pub trait Detector {
  type Frame;
  type Error;

  fn infer(&self, frame: &Self::Frame) -> Result<Vec<Detection>, Self::Error>;
}

/// 帧采集接口。宽高用于 Z 参考回退等基于画面尺寸的计算。
pub trait FrameSource {
  type Frame;
  type Error;

  fn grab(&mut self) -> Result<Self::Frame, Self::Error>;

  fn width(&self) -> u32;

  fn height(&self) -> u32;
}

/// 一次观测的产物：过滤后的检测列表加上画面尺寸。
#[derive(Debug, Clone, Default)]
pub struct Observation {
  pub detections: Vec<Detection>,
  pub frame_width: u32,
  pub frame_height: u32,
}

/// 编排器面向的工位接口：采集一帧并完成推理。
pub trait Observe {
  type Error: std::error::Error + Send + Sync + 'static;

  fn observe(&mut self) -> Result<Observation, Self::Error>;

  /// 以指定置信度下限观测，标定时用低阈值尽量收全参考列。
  /// 默认实现退化为常规观测。
  fn observe_at(&mut self, min_confidence: f32) -> Result<Observation, Self::Error> {
    let _ = min_confidence;
    self.observe()
  }
}

#[derive(Error, Debug)]
pub enum StationError {
  #[error("帧采集失败: {0}")]
  Capture(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("推理失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 一个视觉工位 = 帧源 + 检测器 + 本工位的置信度阈值。
/// 俯视与侧视各持有一个独立实例，配置互不共享。
pub struct Station<S, D> {
  source: S,
  detector: D,
  confidence: f32,
}

impl<S, D> Station<S, D> {
  pub fn new(source: S, detector: D, confidence: f32) -> Self {
    Station {
      source,
      detector,
      confidence,
    }
  }
}

impl<
  F,
  SE: std::error::Error + Sync + Send + 'static,
  DE: std::error::Error + Sync + Send + 'static,
  S: FrameSource<Frame = F, Error = SE>,
  D: Detector<Frame = F, Error = DE>,
> Observe for Station<S, D>
{
  type Error = StationError;

  fn observe(&mut self) -> Result<Observation, StationError> {
    let confidence = self.confidence;
    self.observe_at(confidence)
  }

  fn observe_at(&mut self, min_confidence: f32) -> Result<Observation, StationError> {
    let frame = self
      .source
      .grab()
      .map_err(|e| StationError::Capture(Box::new(e)))?;
    let mut detections = self
      .detector
      .infer(&frame)
      .map_err(|e| StationError::Inference(Box::new(e)))?;
    detections.retain(|d| d.confidence >= min_confidence);
    debug!("观测完成: {} 条检测（阈值 {:.2}）", detections.len(), min_confidence);
    Ok(Observation {
      detections,
      frame_width: self.source.width(),
      frame_height: self.source.height(),
    })
  }
}

/// 回放帧：一帧画面的尺寸与该帧的全部原始检测。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFrame {
  pub width: u32,
  pub height: u32,
  pub detections: Vec<Detection>,
}

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("夹具解析失败 {path}: {source}")]
  ParseError {
    path: String,
    source: serde_json::Error,
  },
  #[error("夹具无效 {path}: {reason}")]
  InvalidFixture { path: String, reason: String },
  #[error("回放帧已耗尽")]
  Exhausted,
}

/// 从 JSON 夹具文件回放帧序列的帧源。
///
/// `replay:///path/to/dir` 按文件名顺序读取目录下的全部 `.json` 文件，
/// `replay:///path/to/file.json` 回放单个文件；加 `?loop` 循环回放。
/// 用于无硬件的仿真运行与测试。
pub struct ReplaySource {
  frames: VecDeque<ReplayFrame>,
  looped: bool,
  last_width: u32,
  last_height: u32,
}

impl FromUrlWithScheme for ReplaySource {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplaySource {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch);
    }
    let looped = url.query_pairs().any(|(k, _)| k == "loop");
    let path = PathBuf::from(url.path());
    ReplaySource::from_path(&path, looped)
  }
}

impl ReplaySource {
  pub fn from_path(path: &Path, looped: bool) -> Result<Self, ReplayError> {
    let mut files = Vec::new();
    if path.is_dir() {
      for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        if p.extension().map(|e| e == "json").unwrap_or(false) {
          files.push(p);
        }
      }
      files.sort();
    } else {
      files.push(path.to_path_buf());
    }

    let mut frames = VecDeque::with_capacity(files.len());
    for file in &files {
      let text = std::fs::read_to_string(file)?;
      let frame: ReplayFrame =
        serde_json::from_str(&text).map_err(|source| ReplayError::ParseError {
          path: file.display().to_string(),
          source,
        })?;
      for det in &frame.detections {
        if !det.bbox.is_well_formed() {
          return Err(ReplayError::InvalidFixture {
            path: file.display().to_string(),
            reason: format!("包围框坐标无效: {:?}", det.bbox),
          });
        }
      }
      frames.push_back(frame);
    }

    info!("回放源就绪: {} 帧（loop={}）", frames.len(), looped);
    Ok(ReplaySource {
      frames,
      looped,
      last_width: 0,
      last_height: 0,
    })
  }

  /// 直接从内存帧构造，测试用。
  pub fn from_frames(frames: Vec<ReplayFrame>, looped: bool) -> Self {
    ReplaySource {
      frames: frames.into(),
      looped,
      last_width: 0,
      last_height: 0,
    }
  }
}

impl FrameSource for ReplaySource {
  type Frame = ReplayFrame;
  type Error = ReplayError;

  fn grab(&mut self) -> Result<ReplayFrame, ReplayError> {
    let frame = self.frames.pop_front().ok_or(ReplayError::Exhausted)?;
    if self.looped {
      self.frames.push_back(frame.clone());
    }
    self.last_width = frame.width;
    self.last_height = frame.height;
    Ok(frame)
  }

  fn width(&self) -> u32 {
    self.last_width
  }

  fn height(&self) -> u32 {
    self.last_height
  }
}

/// 回放帧自带检测结果，检测器只需原样交出；
/// 置信度过滤交给 [`Station`] 统一处理。
pub struct ReplayDetector;

impl Detector for ReplayDetector {
  type Frame = ReplayFrame;
  type Error = ReplayError;

  fn infer(&self, frame: &ReplayFrame) -> Result<Vec<Detection>, ReplayError> {
    Ok(frame.detections.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  pub(crate) fn det(label: &str, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
    Detection {
      label: label.to_string(),
      confidence,
      bbox: BBox { x1, y1, x2, y2 },
    }
  }

  #[test]
  fn bbox_centers_round_to_nearest() {
    let b = BBox {
      x1: 10.0,
      y1: 20.0,
      x2: 21.0,
      y2: 41.0,
    };
    assert_eq!(b.x_center(), 16);
    assert_eq!(b.y_center(), 31);
    assert!(b.is_well_formed());
  }

  #[test]
  fn station_filters_by_confidence() {
    let frame = ReplayFrame {
      width: 640,
      height: 480,
      detections: vec![
        det("posicion_columna", 0.9, 0.0, 0.0, 10.0, 10.0),
        det("posicion_columna", 0.3, 20.0, 0.0, 30.0, 10.0),
      ],
    };
    let source = ReplaySource::from_frames(vec![frame], false);
    let mut station = Station::new(source, ReplayDetector, 0.5);

    let obs = station.observe().unwrap();
    assert_eq!(obs.detections.len(), 1);
    assert_eq!(obs.frame_width, 640);
    assert_eq!(obs.frame_height, 480);

    // 帧耗尽是采集错误，不是崩溃
    assert!(matches!(station.observe(), Err(StationError::Capture(_))));
  }

  #[test]
  fn station_calibration_threshold_overrides() {
    let frame = ReplayFrame {
      width: 640,
      height: 480,
      detections: vec![det("posicion_columna", 0.2, 0.0, 0.0, 10.0, 10.0)],
    };
    let source = ReplaySource::from_frames(vec![frame], false);
    let mut station = Station::new(source, ReplayDetector, 0.6);

    let obs = station.observe_at(0.1).unwrap();
    assert_eq!(obs.detections.len(), 1);
  }

  #[test]
  fn replay_source_loops_when_asked() {
    let frame = ReplayFrame {
      width: 320,
      height: 240,
      detections: vec![],
    };
    let mut source = ReplaySource::from_frames(vec![frame], true);
    for _ in 0..5 {
      assert!(source.grab().is_ok());
    }
  }
}
