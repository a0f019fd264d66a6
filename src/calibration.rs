// 该文件是 Shijian （视检） 项目的一部分。
// src/calibration.rs - 参考列位置标定
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;

use crate::detection::Detection;

#[derive(Error, Debug)]
pub enum CalibrationError {
  #[error("参考列不足: 需要至少 2 个不同的 X 中心，实际 {0} 个")]
  InsufficientReferences(usize),
}

/// 标定结果：N 个理想列中心（槽位 1..=N）与平均列距。
///
/// 系统启动时（或显式重标定时）从俯视首帧一次性建立，
/// 之后只读。由编排器独占持有，计算器按引用取用。
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
  pub ideal_centers: BTreeMap<u32, i32>,
  pub pitch_px: f64,
}

impl CalibrationState {
  /// 找到离给定 X 最近的理想中心，返回 `(槽位, 理想 X, 距离)`。
  pub fn nearest(&self, x: i32) -> Option<(u32, i32, i32)> {
    self
      .ideal_centers
      .iter()
      .map(|(&slot, &ideal_x)| (slot, ideal_x, (x - ideal_x).abs()))
      .min_by_key(|&(_, _, dist)| dist)
  }
}

/// 从一帧俯视检测建立 N 个理想列中心。
///
/// 取占位/空位两类槽位标记的 X 中心，至少要有 2 个互不相同的中心；
/// 升序排序后用相邻差的均值作为列距，再从最小中心向右投影出
/// N 个位置。列距取自可见的标记而不要求 N 个全部在场，
/// 所以标定帧里缺一两个槽位标记也能得到完整的虚拟标尺。
pub fn calibrate(
  detections: &[Detection],
  occupied_label: &str,
  empty_label: &str,
  slot_count: u32,
) -> Result<CalibrationState, CalibrationError> {
  let mut centers: Vec<i32> = detections
    .iter()
    .filter(|d| d.label == occupied_label || d.label == empty_label)
    .map(|d| d.bbox.x_center())
    .collect();
  centers.sort_unstable();
  centers.dedup();

  if centers.len() < 2 {
    return Err(CalibrationError::InsufficientReferences(centers.len()));
  }

  let deltas: Vec<i32> = centers.windows(2).map(|w| w[1] - w[0]).collect();
  let pitch_px = deltas.iter().sum::<i32>() as f64 / deltas.len() as f64;

  let first = centers[0] as f64;
  let ideal_centers = (0..slot_count)
    .map(|i| (i + 1, (first + i as f64 * pitch_px).round() as i32))
    .collect();

  info!("标定成功: 平均列距 {:.2} px, {} 个理想中心", pitch_px, slot_count);
  Ok(CalibrationState {
    ideal_centers,
    pitch_px,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detection::BBox;

  const OCCUPIED: &str = "posicion_columna";
  const EMPTY: &str = "posicion_vacia";

  fn det_at(label: &str, x_center: i32) -> Detection {
    Detection {
      label: label.to_string(),
      confidence: 0.9,
      bbox: BBox {
        x1: (x_center - 5) as f32,
        y1: 0.0,
        x2: (x_center + 5) as f32,
        y2: 10.0,
      },
    }
  }

  #[test]
  fn projects_ideal_centers_from_pitch() {
    let detections = vec![
      det_at(OCCUPIED, 100),
      det_at(OCCUPIED, 200),
      det_at(EMPTY, 300),
    ];
    let state = calibrate(&detections, OCCUPIED, EMPTY, 8).unwrap();
    assert_eq!(state.pitch_px, 100.0);
    assert_eq!(state.ideal_centers.len(), 8);
    for slot in 1..=8u32 {
      assert_eq!(state.ideal_centers[&slot], slot as i32 * 100);
    }
  }

  #[test]
  fn tolerates_a_missing_marker() {
    // 缺第二列，列距从可见标记估计: (150 + 150) / 2 = 150
    let detections = vec![
      det_at(OCCUPIED, 100),
      det_at(OCCUPIED, 250),
      det_at(OCCUPIED, 400),
    ];
    let state = calibrate(&detections, OCCUPIED, EMPTY, 4).unwrap();
    assert_eq!(state.pitch_px, 150.0);
    assert_eq!(state.ideal_centers[&1], 100);
    assert_eq!(state.ideal_centers[&4], 550);
  }

  #[test]
  fn fails_with_single_center() {
    let detections = vec![det_at(OCCUPIED, 100)];
    let err = calibrate(&detections, OCCUPIED, EMPTY, 8).unwrap_err();
    assert!(matches!(err, CalibrationError::InsufficientReferences(1)));
  }

  #[test]
  fn duplicate_centers_do_not_count_twice() {
    // 同一 X 上占位和空位各一条，只算一个中心
    let detections = vec![det_at(OCCUPIED, 100), det_at(EMPTY, 100)];
    let err = calibrate(&detections, OCCUPIED, EMPTY, 8).unwrap_err();
    assert!(matches!(err, CalibrationError::InsufficientReferences(1)));
  }

  #[test]
  fn irrelevant_labels_are_ignored() {
    let detections = vec![
      det_at(OCCUPIED, 100),
      det_at("error_apilado", 180),
      det_at(OCCUPIED, 300),
    ];
    let state = calibrate(&detections, OCCUPIED, EMPTY, 2).unwrap();
    assert_eq!(state.pitch_px, 200.0);
  }

  #[test]
  fn nearest_picks_minimal_distance() {
    let detections = vec![det_at(OCCUPIED, 100), det_at(OCCUPIED, 200)];
    let state = calibrate(&detections, OCCUPIED, EMPTY, 3).unwrap();
    let (slot, ideal_x, dist) = state.nearest(240).unwrap();
    assert_eq!((slot, ideal_x, dist), (2, 200, 40));
    let (slot, _, _) = state.nearest(260).unwrap();
    assert_eq!(slot, 3);
  }
}
