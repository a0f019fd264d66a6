// 该文件是 Shijian （视检） 项目的一部分。
// src/config.rs - 系统配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::plc::{HandshakeCodes, RegisterMap};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析失败: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// PLC 连接与协议节奏。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcSection {
  /// 传输地址，如 `sim://?trigger=99`
  pub transport: String,
  pub registers: RegisterMap,
  pub codes: HandshakeCodes,
  /// 空闲轮询间隔
  pub poll_delay_ms: u64,
  /// 一次循环完成后的停顿
  pub post_cycle_delay_ms: u64,
  /// 重连前的退避
  pub reconnect_backoff_ms: u64,
}

impl Default for PlcSection {
  fn default() -> Self {
    PlcSection {
      transport: "sim://?trigger=99".to_string(),
      registers: RegisterMap::default(),
      codes: HandshakeCodes::default(),
      poll_delay_ms: 50,
      post_cycle_delay_ms: 500,
      reconnect_backoff_ms: 1000,
    }
  }
}

/// 俯视工位: 质检、行数与 Y 校正。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperiorSection {
  /// 帧来源地址，如 `replay:///var/lib/shijian/superior?loop`
  pub source: String,
  /// 常规检测置信度，偏高以压制质检误报
  pub confidence: f32,
  /// 标定专用低阈值，尽量收全参考列
  pub calibration_confidence: f32,
  pub occupied_label: String,
  pub empty_label: String,
  pub qc_fault_labels: Vec<String>,
  /// 一层的槽位总数 N
  pub slot_count: u32,
  pub mm_per_px: f64,
  /// 工作列偏离容差（严格大于才校正）
  pub tolerance_px: i32,
  /// Y 校正钳制上限
  pub max_correction_px: i32,
}

impl Default for SuperiorSection {
  fn default() -> Self {
    SuperiorSection {
      source: "replay:///var/lib/shijian/superior?loop".to_string(),
      confidence: 0.60,
      calibration_confidence: 0.10,
      occupied_label: "posicion_columna".to_string(),
      empty_label: "posicion_vacia".to_string(),
      qc_fault_labels: vec!["error_apilado".to_string(), "error_alerta".to_string()],
      slot_count: 8,
      mm_per_px: 0.5,
      tolerance_px: 30,
      max_correction_px: 50,
    }
  }
}

/// 侧视工位: 安全停机与 Z 校正。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LateralSection {
  /// 帧来源地址，如 `replay:///var/lib/shijian/lateral?loop`
  pub source: String,
  /// 偏低以保证 Z 测量标记不漏检
  pub confidence: f32,
  pub critical_labels: Vec<String>,
  pub z_reference_label: String,
  pub z_edge_label: String,
  pub z_midpoint_label: String,
  /// 边缘与中点标记之间的已知真实距离
  pub d_real_mm: f64,
  /// 误差为零时的像素偏置，现场标定
  pub offset_px: i32,
}

impl Default for LateralSection {
  fn default() -> Self {
    LateralSection {
      source: "replay:///var/lib/shijian/lateral?loop".to_string(),
      confidence: 0.05,
      critical_labels: vec!["error_caido".to_string()],
      z_reference_label: "referencia_fija".to_string(),
      z_edge_label: "borde_envase".to_string(),
      z_midpoint_label: "mitad_envase".to_string(),
      d_real_mm: 100.0,
      offset_px: 40,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
  pub plc: PlcSection,
  pub superior: SuperiorSection,
  pub lateral: LateralSection,
}

impl SystemConfig {
  /// 从 JSON 文件加载。文件不存在退回默认配置；
  /// 解析失败或配置不自洽是启动期致命错误，绝不带病进入循环。
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let config = match std::fs::read_to_string(path) {
      Ok(text) => {
        let config: SystemConfig = serde_json::from_str(&text)?;
        info!("配置已加载: {}", path.display());
        config
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!("配置文件 {} 不存在，使用默认配置", path.display());
        SystemConfig::default()
      }
      Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self
      .plc
      .registers
      .validate()
      .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let codes = &self.plc.codes;
    if codes.request == codes.success
      || codes.request == codes.error
      || codes.success == codes.error
    {
      return Err(ConfigError::Invalid("握手码必须两两不同".to_string()));
    }

    if self.superior.slot_count == 0 {
      return Err(ConfigError::Invalid("槽位总数必须大于 0".to_string()));
    }
    for (name, value) in [
      ("superior.confidence", self.superior.confidence),
      (
        "superior.calibration_confidence",
        self.superior.calibration_confidence,
      ),
      ("lateral.confidence", self.lateral.confidence),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid(format!("{name} 必须在 [0, 1] 内")));
      }
    }
    if self.superior.tolerance_px < 0 || self.superior.max_correction_px < 0 {
      return Err(ConfigError::Invalid(
        "容差与校正上限不能为负".to_string(),
      ));
    }
    if self.superior.mm_per_px <= 0.0 {
      return Err(ConfigError::Invalid("mm_per_px 必须大于 0".to_string()));
    }
    if self.lateral.d_real_mm < 0.0 {
      return Err(ConfigError::Invalid("d_real_mm 不能为负".to_string()));
    }
    Ok(())
  }
}
