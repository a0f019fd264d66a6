// 该文件是 Shijian （视检） 项目的一部分。
// src/correction.rs - Y/Z 校正计算
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::BTreeMap;

use tracing::debug;

use crate::calibration::CalibrationState;
use crate::detection::Detection;

/// 一个槽位 X 中心上的占用状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
  Occupied,
  Empty,
}

/// 俯视帧的槽位扫描结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotScan {
  /// 工作列：从左到右第一个占位槽的 X 中心。
  pub working_x: Option<i32>,
  /// 剩余行数 = 占位槽计数，钳制在 `[0, N]`。
  pub rows_remaining: u16,
}

/// 把俯视检测按 X 中心归并为槽位占用表并从左到右扫描。
///
/// 同一 X 中心既有占位又有空位标记时，空位恒优先。
pub fn scan_slots(
  detections: &[Detection],
  occupied_label: &str,
  empty_label: &str,
  slot_count: u32,
) -> SlotScan {
  let mut states: BTreeMap<i32, SlotState> = BTreeMap::new();
  for det in detections {
    let x = det.bbox.x_center();
    if det.label == empty_label {
      // 空位覆盖一切
      states.insert(x, SlotState::Empty);
    } else if det.label == occupied_label {
      states.entry(x).or_insert(SlotState::Occupied);
    }
  }

  let mut working_x = None;
  let mut occupied = 0u32;
  for (&x, &state) in &states {
    if state == SlotState::Occupied {
      occupied += 1;
      if working_x.is_none() {
        working_x = Some(x);
      }
    }
  }

  SlotScan {
    working_x,
    rows_remaining: occupied.min(slot_count) as u16,
  }
}

/// Y（横向）校正结果，单位为像素。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YCorrection {
  pub correction_px: i32,
  pub requires_correction: bool,
}

/// 由工作列与标定状态计算 Y 校正。
///
/// 工作列到最近理想中心的距离严格大于容差才触发校正，
/// 校正量为带符号偏移并钳制到 `±max_correction_px`。
/// 没有工作列或没有标定时输出零——这本身不构成质检失败。
pub fn compute_y(
  scan: &SlotScan,
  calibration: Option<&CalibrationState>,
  tolerance_px: i32,
  max_correction_px: i32,
) -> YCorrection {
  let (Some(working_x), Some(calib)) = (scan.working_x, calibration) else {
    return YCorrection::default();
  };
  let Some((slot, ideal_x, dist)) = calib.nearest(working_x) else {
    return YCorrection::default();
  };

  if dist > tolerance_px {
    let correction_px = (working_x - ideal_x).clamp(-max_correction_px, max_correction_px);
    debug!(
      "工作列 X={} 偏离槽位 {} 理想中心 {} 共 {} px, 校正 {} px",
      working_x, slot, ideal_x, dist, correction_px
    );
    YCorrection {
      correction_px,
      requires_correction: true,
    }
  } else {
    YCorrection::default()
  }
}

/// 侧视帧上 Z 计算所需的三个 Y 像素坐标。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZMarkers {
  pub y_reference: Option<i32>,
  pub y_edge: Option<i32>,
  pub y_midpoint: Option<i32>,
}

impl ZMarkers {
  /// 按标签从侧视检测中取各标记的包围框 Y 中心，后出现者覆盖。
  pub fn collect(
    detections: &[Detection],
    reference_label: &str,
    edge_label: &str,
    midpoint_label: &str,
  ) -> Self {
    let mut markers = ZMarkers::default();
    for det in detections {
      let y = det.bbox.y_center();
      if det.label == reference_label {
        markers.y_reference = Some(y);
      } else if det.label == edge_label {
        markers.y_edge = Some(y);
      } else if det.label == midpoint_label {
        markers.y_midpoint = Some(y);
      }
    }
    markers
  }
}

pub const Z_NOTE_MISSING_LABELS: &str = "missing Z labels";
pub const Z_NOTE_DEGENERATE_SCALE: &str = "degenerate scale";

/// Z（高度）校正结果，单位为百分之一毫米（cMM）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZCorrection {
  pub centi_mm: i64,
  /// 为零的原因；`None` 表示正常算出。从不致命，只作诊断上报。
  pub note: Option<&'static str>,
}

/// 由三个标记坐标计算 Z 校正。
///
/// 动态比例 `scale = |y_edge − y_mid| / d_real_mm`，
/// 净误差 `delta = (y_edge − y_ref) − offset_px`，
/// 输出 `round(delta / scale * 10)` 即 cMM。
/// 任一标记缺失或比例退化时输出零并附注原因。
pub fn compute_z(markers: ZMarkers, d_real_mm: f64, offset_px: i32) -> ZCorrection {
  let (Some(y_ref), Some(y_edge), Some(y_mid)) =
    (markers.y_reference, markers.y_edge, markers.y_midpoint)
  else {
    return ZCorrection {
      centi_mm: 0,
      note: Some(Z_NOTE_MISSING_LABELS),
    };
  };

  let scale_px = (y_edge - y_mid).abs();
  if scale_px == 0 || d_real_mm == 0.0 {
    return ZCorrection {
      centi_mm: 0,
      note: Some(Z_NOTE_DEGENERATE_SCALE),
    };
  }

  let scale_px_per_mm = scale_px as f64 / d_real_mm;
  let delta_px = ((y_edge - y_ref) - offset_px) as f64;
  let centi_mm = (delta_px / scale_px_per_mm * 10.0).round() as i64;
  debug!(
    "Z 校正: scale {:.3} px/mm, delta {} px -> {} cMM",
    scale_px_per_mm, delta_px, centi_mm
  );
  ZCorrection {
    centi_mm,
    note: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::calibration::calibrate;
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

  fn det_at_y(label: &str, y_center: i32) -> Detection {
    Detection {
      label: label.to_string(),
      confidence: 0.9,
      bbox: BBox {
        x1: 0.0,
        y1: (y_center - 5) as f32,
        x2: 10.0,
        y2: (y_center + 5) as f32,
      },
    }
  }

  #[test]
  fn empty_wins_over_occupied_at_same_center() {
    let detections = vec![
      det_at(OCCUPIED, 100),
      det_at(EMPTY, 100),
      det_at(OCCUPIED, 200),
    ];
    let scan = scan_slots(&detections, OCCUPIED, EMPTY, 8);
    assert_eq!(scan.working_x, Some(200));
    assert_eq!(scan.rows_remaining, 1);

    // 顺序反过来结论相同
    let detections = vec![
      det_at(EMPTY, 100),
      det_at(OCCUPIED, 100),
      det_at(OCCUPIED, 200),
    ];
    let scan = scan_slots(&detections, OCCUPIED, EMPTY, 8);
    assert_eq!(scan.working_x, Some(200));
    assert_eq!(scan.rows_remaining, 1);
  }

  #[test]
  fn working_slot_is_leftmost_occupied() {
    let detections = vec![
      det_at(EMPTY, 100),
      det_at(OCCUPIED, 300),
      det_at(OCCUPIED, 200),
    ];
    let scan = scan_slots(&detections, OCCUPIED, EMPTY, 8);
    assert_eq!(scan.working_x, Some(200));
    assert_eq!(scan.rows_remaining, 2);
  }

  #[test]
  fn rows_remaining_is_clamped_to_slot_count() {
    let detections: Vec<Detection> = (0..10).map(|i| det_at(OCCUPIED, 100 * (i + 1))).collect();
    let scan = scan_slots(&detections, OCCUPIED, EMPTY, 8);
    assert_eq!(scan.rows_remaining, 8);
  }

  #[test]
  fn all_empty_means_no_working_slot() {
    let detections = vec![det_at(EMPTY, 100), det_at(EMPTY, 200)];
    let scan = scan_slots(&detections, OCCUPIED, EMPTY, 8);
    assert_eq!(scan.working_x, None);
    assert_eq!(scan.rows_remaining, 0);
  }

  fn two_column_calibration() -> CalibrationState {
    calibrate(
      &[det_at(OCCUPIED, 100), det_at(OCCUPIED, 200)],
      OCCUPIED,
      EMPTY,
      8,
    )
    .unwrap()
  }

  #[test]
  fn tolerance_comparison_is_strict() {
    let calib = two_column_calibration();
    // 偏离恰好等于容差: 不触发
    let scan = SlotScan {
      working_x: Some(130),
      rows_remaining: 1,
    };
    let y = compute_y(&scan, Some(&calib), 30, 50);
    assert_eq!(y, YCorrection::default());

    // 超出一个像素: 触发
    let scan = SlotScan {
      working_x: Some(131),
      rows_remaining: 1,
    };
    let y = compute_y(&scan, Some(&calib), 30, 50);
    assert!(y.requires_correction);
    assert_eq!(y.correction_px, 31);
  }

  #[test]
  fn correction_is_clamped_and_signed() {
    let calib = two_column_calibration();
    let scan = SlotScan {
      working_x: Some(40),
      rows_remaining: 1,
    };
    // 100 - 40 = -60, 钳到 -50
    let y = compute_y(&scan, Some(&calib), 30, 50);
    assert!(y.requires_correction);
    assert_eq!(y.correction_px, -50);
  }

  #[test]
  fn no_calibration_or_working_slot_means_zero() {
    let scan = SlotScan {
      working_x: Some(500),
      rows_remaining: 1,
    };
    assert_eq!(compute_y(&scan, None, 30, 50), YCorrection::default());

    let calib = two_column_calibration();
    let scan = SlotScan::default();
    assert_eq!(compute_y(&scan, Some(&calib), 30, 50), YCorrection::default());
  }

  #[test]
  fn z_exact_worked_example() {
    // scale = |300-200| / 100 = 1.0 px/mm, delta = (300-200) - 40 = 60 px
    let markers = ZMarkers {
      y_reference: Some(200),
      y_edge: Some(300),
      y_midpoint: Some(200),
    };
    let z = compute_z(markers, 100.0, 40);
    assert_eq!(z.centi_mm, 600);
    assert_eq!(z.note, None);
  }

  #[test]
  fn z_negative_delta_keeps_sign() {
    let markers = ZMarkers {
      y_reference: Some(300),
      y_edge: Some(280),
      y_midpoint: Some(180),
    };
    // scale = 1.0, delta = (280-300) - 40 = -60
    let z = compute_z(markers, 100.0, 40);
    assert_eq!(z.centi_mm, -600);
  }

  #[test]
  fn z_missing_marker_reports_note() {
    let markers = ZMarkers {
      y_reference: Some(200),
      y_edge: None,
      y_midpoint: Some(250),
    };
    let z = compute_z(markers, 100.0, 40);
    assert_eq!(z.centi_mm, 0);
    assert_eq!(z.note, Some(Z_NOTE_MISSING_LABELS));
  }

  #[test]
  fn z_degenerate_scale_reports_note() {
    let collapsed = ZMarkers {
      y_reference: Some(200),
      y_edge: Some(250),
      y_midpoint: Some(250),
    };
    let z = compute_z(collapsed, 100.0, 40);
    assert_eq!((z.centi_mm, z.note), (0, Some(Z_NOTE_DEGENERATE_SCALE)));

    let markers = ZMarkers {
      y_reference: Some(200),
      y_edge: Some(300),
      y_midpoint: Some(250),
    };
    let z = compute_z(markers, 0.0, 40);
    assert_eq!((z.centi_mm, z.note), (0, Some(Z_NOTE_DEGENERATE_SCALE)));
  }

  #[test]
  fn markers_collect_last_seen_wins() {
    let detections = vec![
      det_at_y("referencia_fija", 100),
      det_at_y("borde_envase", 300),
      det_at_y("referencia_fija", 120),
      det_at_y("otra_cosa", 400),
    ];
    let markers = ZMarkers::collect(&detections, "referencia_fija", "borde_envase", "mitad_envase");
    assert_eq!(markers.y_reference, Some(120));
    assert_eq!(markers.y_edge, Some(300));
    assert_eq!(markers.y_midpoint, None);
  }
}
