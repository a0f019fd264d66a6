// 该文件是 Shijian （视检） 项目的一部分。
// src/cycle.rs - 检测循环编排与状态机
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::calibration::{self, CalibrationState};
use crate::codec::encode_mm_as_centi;
use crate::config::SystemConfig;
use crate::correction::{self, ZMarkers};
use crate::detection::Observe;
use crate::plc::{HandshakeCodes, PlcError, PlcLink, ResultWrite, WordTransport};
use crate::report::RunSummary;

/// 单个检测循环经过的阶段。`Idle` 既是初态也是每循环的终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
  Idle,
  TriggerSeen,
  LateralEval,
  SuperiorEval,
  CriticalStop,
  ResultWrite,
}

/// 一个循环的最终判定，优先级从下往上递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
  Ok,
  /// 质检异常或需要位置校正
  QcFail,
  /// 侧视关键异常，无条件压过其余一切判定
  CriticalStop,
}

impl ResponseCode {
  /// 落到触发/应答寄存器上的握手码。线上只有成功/异常两种应答，
  /// 停机与质检失败同走异常码，PLC 靠校正与行数寄存器区分语义。
  pub fn ack(self, codes: &HandshakeCodes) -> u16 {
    match self {
      ResponseCode::Ok => codes.success,
      ResponseCode::QcFail | ResponseCode::CriticalStop => codes.error,
    }
  }
}

/// 每循环新建的判定结果，写出后即丢弃。
#[derive(Debug, Clone)]
pub struct CycleVerdict {
  pub response_code: ResponseCode,
  pub rows_remaining: u16,
  pub correction_y_px: i32,
  pub correction_y_mm: f64,
  pub correction_z_centi_mm: i64,
  pub diagnostics: Vec<String>,
}

impl CycleVerdict {
  fn critical_stop(diagnostic: String) -> Self {
    CycleVerdict {
      response_code: ResponseCode::CriticalStop,
      rows_remaining: 0,
      correction_y_px: 0,
      correction_y_mm: 0.0,
      correction_z_centi_mm: 0,
      diagnostics: vec![diagnostic],
    }
  }
}

#[derive(Error, Debug)]
pub enum CycleError {
  #[error("PLC 链路故障: {0}")]
  Plc(#[from] PlcError),
  #[error("{station}工位观测失败: {source}")]
  Observation {
    station: &'static str,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
  #[error("循环状态错误: 当前 {actual:?}, 期望 {expected:?}")]
  BadState {
    expected: CycleState,
    actual: CycleState,
  },
}

/// 检测循环编排器。
///
/// 单线程内驱动 轮询 → 侧视 → 俯视 → 回写 的完整顺序，
/// 同一时刻最多一个循环在途：触发寄存器兼作握手确认，
/// PLC 只有看到应答写入后才会重新拉起请求码。
/// PLC 链路是唯一共享可变资源，读写全部经由状态机串行化。
pub struct Orchestrator<T, L, S> {
  plc: PlcLink<T>,
  lateral: L,
  superior: S,
  config: SystemConfig,
  calibration: Option<CalibrationState>,
  state: CycleState,
}

impl<T, L, S> Orchestrator<T, L, S>
where
  T: WordTransport,
  L: Observe,
  S: Observe,
{
  pub fn new(plc: PlcLink<T>, lateral: L, superior: S, config: SystemConfig) -> Self {
    Orchestrator {
      plc,
      lateral,
      superior,
      config,
      calibration: None,
      state: CycleState::Idle,
    }
  }

  pub fn state(&self) -> CycleState {
    self.state
  }

  pub fn calibration(&self) -> Option<&CalibrationState> {
    self.calibration.as_ref()
  }

  pub fn plc(&self) -> &PlcLink<T> {
    &self.plc
  }

  /// 从俯视工位取一帧建立参考列位置。
  ///
  /// 失败不致命：保留已有标定（若有），后续循环的 Y 校正保持为零，
  /// 直至重标定成功。
  pub fn calibrate(&mut self) {
    let threshold = self.config.superior.calibration_confidence;
    let obs = match self.superior.observe_at(threshold) {
      Ok(obs) => obs,
      Err(e) => {
        warn!("标定帧观测失败: {e}，保留现有标定");
        return;
      }
    };
    match calibration::calibrate(
      &obs.detections,
      &self.config.superior.occupied_label,
      &self.config.superior.empty_label,
      self.config.superior.slot_count,
    ) {
      Ok(state) => {
        self.calibration = Some(state);
      }
      Err(e) => {
        warn!("标定失败: {e}，保留现有标定");
      }
    }
  }

  /// 轮询触发寄存器。只有空闲状态才许轮询——写批次未完成时
  /// 再多的请求码也不会开启第二个循环。
  pub fn poll(&mut self) -> Result<bool, CycleError> {
    if self.state != CycleState::Idle {
      return Ok(false);
    }
    if self.plc.poll_trigger()? {
      self.state = CycleState::TriggerSeen;
      Ok(true)
    } else {
      Ok(false)
    }
  }

  /// 执行一个完整循环: 侧视评估 → （停机 | 俯视评估） → 有序回写。
  ///
  /// 任何寄存器 I/O 或观测失败都中止本循环（绝不续写残批）并
  /// 退回空闲态，由外层在下次轮询前重连。
  pub fn run_cycle(&mut self) -> Result<CycleVerdict, CycleError> {
    if self.state != CycleState::TriggerSeen {
      return Err(CycleError::BadState {
        expected: CycleState::TriggerSeen,
        actual: self.state,
      });
    }

    let verdict = match self.evaluate() {
      Ok(verdict) => verdict,
      Err(e) => {
        self.state = CycleState::Idle;
        return Err(e);
      }
    };

    self.state = CycleState::ResultWrite;
    let result = ResultWrite {
      y_centi_mm: encode_mm_as_centi(verdict.correction_y_mm),
      z_centi_mm: verdict.correction_z_centi_mm,
      rows: verdict.rows_remaining,
      ack: verdict.response_code.ack(self.plc.codes()),
    };
    if let Err(e) = self.plc.write_results(&result) {
      self.state = CycleState::Idle;
      return Err(e.into());
    }

    self.state = CycleState::Idle;
    Ok(verdict)
  }

  /// 侧视优先的评估流程。停机判定短路一切后续计算。
  fn evaluate(&mut self) -> Result<CycleVerdict, CycleError> {
    self.state = CycleState::LateralEval;
    let lateral_obs = self
      .lateral
      .observe()
      .map_err(|e| CycleError::Observation {
        station: "侧视",
        source: Box::new(e),
      })?;

    // 关键异常: 立即停机，Z 已无意义
    if let Some(det) = lateral_obs
      .detections
      .iter()
      .find(|d| self.config.lateral.critical_labels.contains(&d.label))
    {
      warn!("侧视关键异常: {}", det.label);
      self.state = CycleState::CriticalStop;
      return Ok(CycleVerdict::critical_stop(format!(
        "关键异常: {}",
        det.label
      )));
    }

    let mut diagnostics = Vec::new();

    // Z 标记收集，参考标记缺失时回退到画面垂直中点
    let mut markers = ZMarkers::collect(
      &lateral_obs.detections,
      &self.config.lateral.z_reference_label,
      &self.config.lateral.z_edge_label,
      &self.config.lateral.z_midpoint_label,
    );
    if markers.y_reference.is_none() && lateral_obs.frame_height > 0 {
      markers.y_reference = Some((lateral_obs.frame_height / 2) as i32);
      diagnostics.push("参考标记缺失，以画面垂直中点作为 Z 参考（回退）".to_string());
    }
    let z = correction::compute_z(
      markers,
      self.config.lateral.d_real_mm,
      self.config.lateral.offset_px,
    );
    if let Some(note) = z.note {
      diagnostics.push(format!("Z 校正为零: {note}"));
    }

    self.state = CycleState::SuperiorEval;
    let superior_obs = self
      .superior
      .observe()
      .map_err(|e| CycleError::Observation {
        station: "俯视",
        source: Box::new(e),
      })?;

    let qc_hit = superior_obs
      .detections
      .iter()
      .find(|d| self.config.superior.qc_fault_labels.contains(&d.label));
    if let Some(det) = qc_hit {
      diagnostics.push(format!("质检异常: {}", det.label));
    }

    let scan = correction::scan_slots(
      &superior_obs.detections,
      &self.config.superior.occupied_label,
      &self.config.superior.empty_label,
      self.config.superior.slot_count,
    );
    if self.calibration.is_none() {
      diagnostics.push("无标定可用，Y 校正保持为零".to_string());
    }
    let y = correction::compute_y(
      &scan,
      self.calibration.as_ref(),
      self.config.superior.tolerance_px,
      self.config.superior.max_correction_px,
    );

    // 需要位置校正本身就是一次质检例外: PLC 必须先套用偏移再继续
    let response_code = if qc_hit.is_some() || y.requires_correction {
      ResponseCode::QcFail
    } else {
      ResponseCode::Ok
    };

    Ok(CycleVerdict {
      response_code,
      rows_remaining: scan.rows_remaining,
      correction_y_px: y.correction_px,
      correction_y_mm: y.correction_px as f64 * self.config.superior.mm_per_px,
      correction_z_centi_mm: z.centi_mm,
      diagnostics,
    })
  }

  /// 外层主循环: 重连 → 轮询 → 循环 → 停顿，直到中断或达到
  /// 指定循环数。停止请求只在两个循环之间生效，绝不打断在途
  /// 写批次。
  pub fn run(mut self, max_cycles: Option<u64>) -> anyhow::Result<RunSummary> {
    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let mut summary = RunSummary::new();
    let mut handled = 0u64;

    info!("进入主循环，等待 PLC 触发...");
    loop {
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出主循环");
        break;
      }

      if !self.plc.is_connected() {
        if let Err(e) = self.plc.connect() {
          error!("PLC 重连失败: {e}");
          summary.record_io_failure();
          thread::sleep(Duration::from_millis(self.config.plc.reconnect_backoff_ms));
          continue;
        }
      }

      match self.poll() {
        Ok(false) => {
          thread::sleep(Duration::from_millis(self.config.plc.poll_delay_ms));
          continue;
        }
        Err(e) => {
          error!("轮询触发寄存器失败: {e}");
          summary.record_io_failure();
          continue;
        }
        Ok(true) => {
          info!(
            "收到检测请求 (trigger={})",
            self.plc.last_trigger_value()
          );
          match self.run_cycle() {
            Ok(verdict) => {
              for diag in &verdict.diagnostics {
                warn!("诊断: {diag}");
              }
              info!(
                "循环完成: {:?} | 剩余行数 {} | Y {} px ({:.2} mm) | Z {} cMM",
                verdict.response_code,
                verdict.rows_remaining,
                verdict.correction_y_px,
                verdict.correction_y_mm,
                verdict.correction_z_centi_mm
              );
              summary.record(&verdict);
              thread::sleep(Duration::from_millis(self.config.plc.post_cycle_delay_ms));
            }
            Err(e @ CycleError::Plc(_)) => {
              error!("{e}，本循环放弃");
              summary.record_io_failure();
            }
            Err(e) => {
              error!("{e}，本循环放弃");
              summary.record_observation_failure();
            }
          }
          handled += 1;
          if max_cycles.map(|n| handled >= n).unwrap_or(false) {
            info!("达到指定循环数 {handled}, 退出主循环");
            break;
          }
        }
      }
    }

    info!("\n{summary}");
    Ok(summary)
  }
}
