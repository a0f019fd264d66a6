// 该文件是 Shijian （视检） 项目的一部分。
// src/report.rs - 运行汇总报告
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::fmt;

use chrono::{DateTime, Utc};

use crate::cycle::{CycleVerdict, ResponseCode};

/// 一次运行的累计汇总，由外层循环独占持有并在结束时打印。
/// 各计数只增不减，循环内部不持任何全局状态。
#[derive(Debug, Clone)]
pub struct RunSummary {
  pub started_at: DateTime<Utc>,
  pub cycles: u64,
  pub ok: u64,
  pub qc_fail: u64,
  pub critical_stops: u64,
  pub io_failures: u64,
  pub observation_failures: u64,
}

impl Default for RunSummary {
  fn default() -> Self {
    Self::new()
  }
}

impl RunSummary {
  pub fn new() -> Self {
    RunSummary {
      started_at: Utc::now(),
      cycles: 0,
      ok: 0,
      qc_fail: 0,
      critical_stops: 0,
      io_failures: 0,
      observation_failures: 0,
    }
  }

  pub fn record(&mut self, verdict: &CycleVerdict) {
    self.cycles += 1;
    match verdict.response_code {
      ResponseCode::Ok => self.ok += 1,
      ResponseCode::QcFail => self.qc_fail += 1,
      ResponseCode::CriticalStop => self.critical_stops += 1,
    }
  }

  pub fn record_io_failure(&mut self) {
    self.io_failures += 1;
  }

  pub fn record_observation_failure(&mut self) {
    self.observation_failures += 1;
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let elapsed = Utc::now() - self.started_at;
    writeln!(f, "================================================")?;
    writeln!(f, "检测循环运行报告")?;
    writeln!(f, "------------------------------------------------")?;
    writeln!(f, "起始时间: {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(f, "运行时长: {} s", elapsed.num_seconds())?;
    writeln!(f, "完成循环: {}", self.cycles)?;
    writeln!(f, "  成功: {}", self.ok)?;
    writeln!(f, "  质检失败/需校正: {}", self.qc_fail)?;
    writeln!(f, "  关键停机: {}", self.critical_stops)?;
    writeln!(f, "寄存器 I/O 故障: {}", self.io_failures)?;
    writeln!(f, "观测失败（采集/推理）: {}", self.observation_failures)?;
    write!(f, "================================================")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn verdict(code: ResponseCode) -> CycleVerdict {
    CycleVerdict {
      response_code: code,
      rows_remaining: 0,
      correction_y_px: 0,
      correction_y_mm: 0.0,
      correction_z_centi_mm: 0,
      diagnostics: Vec::new(),
    }
  }

  #[test]
  fn tallies_per_verdict() {
    let mut summary = RunSummary::new();
    summary.record(&verdict(ResponseCode::Ok));
    summary.record(&verdict(ResponseCode::Ok));
    summary.record(&verdict(ResponseCode::QcFail));
    summary.record(&verdict(ResponseCode::CriticalStop));
    summary.record_io_failure();
    summary.record_observation_failure();

    assert_eq!(summary.cycles, 4);
    assert_eq!(summary.ok, 2);
    assert_eq!(summary.qc_fail, 1);
    assert_eq!(summary.critical_stops, 1);
    assert_eq!(summary.io_failures, 1);
    assert_eq!(summary.observation_failures, 1);

    let text = summary.to_string();
    assert!(text.contains("完成循环: 4"));
    assert!(text.contains("关键停机: 1"));
  }
}
