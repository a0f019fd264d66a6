// 该文件是 Shijian （视检） 项目的一部分。
// src/plc.rs - PLC 链路: 传输接口、寄存器映射与握手
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::codec::encode_i32;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("传输未打开")]
  NotOpen,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("链路故障: {0}")]
  LinkError(String),
}

/// 字级读写接口。线缆上的协议（MC、Modbus 等）由具体实现负责，
/// 核心只依赖这份契约：单次读写要么整体成功要么报错，超时视同故障。
pub trait WordTransport {
  fn open(&mut self) -> Result<(), TransportError>;

  fn close(&mut self);

  fn read_words(&mut self, address: u16, count: usize) -> Result<Vec<u16>, TransportError>;

  fn write_words(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError>;
}

/// 各结果字段的字地址。Y/Z 为 32 位，各占相邻两个字。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
  pub trigger: u16,
  pub correction_y: u16,
  pub correction_z: u16,
  pub rows: u16,
}

impl Default for RegisterMap {
  fn default() -> Self {
    RegisterMap {
      trigger: 701,
      correction_y: 710,
      correction_z: 712,
      rows: 714,
    }
  }
}

impl RegisterMap {
  /// 校验各字段占用的字区间互不重叠。映射不合法属于配置错误，
  /// 必须在启动时拦下。
  pub fn validate(&self) -> Result<(), PlcError> {
    let spans = [
      ("trigger", self.trigger, 1u16),
      ("correction_y", self.correction_y, 2),
      ("correction_z", self.correction_z, 2),
      ("rows", self.rows, 1),
    ];
    for (i, &(name_a, start_a, len_a)) in spans.iter().enumerate() {
      for &(name_b, start_b, len_b) in &spans[i + 1..] {
        let overlap = start_a < start_b.saturating_add(len_b) && start_b < start_a.saturating_add(len_a);
        if overlap {
          return Err(PlcError::InvalidRegisterMap(format!(
            "{name_a}@{start_a} 与 {name_b}@{start_b} 重叠"
          )));
        }
      }
    }
    Ok(())
  }
}

/// 触发/应答寄存器上的三态握手码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeCodes {
  /// PLC 请求一次检测
  pub request: u16,
  /// 检测成功应答
  pub success: u16,
  /// 检测异常/停机应答
  pub error: u16,
}

impl Default for HandshakeCodes {
  fn default() -> Self {
    HandshakeCodes {
      request: 99,
      success: 88,
      error: 77,
    }
  }
}

impl HandshakeCodes {
  /// 把触发寄存器的当前值翻译成可读描述，诊断用。
  pub fn describe(&self, code: u16) -> String {
    if code == self.request {
      "检测请求待处理".to_string()
    } else if code == self.success {
      "上次检测: 成功".to_string()
    } else if code == self.error {
      "上次检测: 异常/停机".to_string()
    } else if code == 0 {
      "空闲".to_string()
    } else {
      format!("未知码 ({code})")
    }
  }
}

#[derive(Error, Debug)]
pub enum PlcError {
  #[error("寄存器映射无效: {0}")]
  InvalidRegisterMap(String),
  #[error("PLC 未连接")]
  NotConnected,
  #[error("连接 PLC 失败: {0}")]
  ConnectFailed(#[source] TransportError),
  #[error("读寄存器 {register} 失败: {source}")]
  ReadFailed {
    register: u16,
    #[source]
    source: TransportError,
  },
  #[error("写寄存器 {register} 失败: {source}")]
  WriteFailed {
    register: u16,
    #[source]
    source: TransportError,
  },
}

/// 一个循环要回写的全部结果。构造后按固定顺序落成字批次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultWrite {
  pub y_centi_mm: i64,
  pub z_centi_mm: i64,
  pub rows: u16,
  pub ack: u16,
}

impl ResultWrite {
  /// 展开为有序写批次: Y 两字、Z 两字、行数一字，触发/应答字必须最后。
  /// 应答字兼作握手确认，提前写出会让 PLC 在校正值尚未就位时
  /// 发起下一次请求。
  pub fn to_batch(&self, map: &RegisterMap) -> Vec<(u16, Vec<u16>)> {
    let y = encode_i32(self.y_centi_mm);
    let z = encode_i32(self.z_centi_mm);
    vec![
      (map.correction_y, y.to_vec()),
      (map.correction_z, z.to_vec()),
      (map.rows, vec![self.rows]),
      (map.trigger, vec![self.ack]),
    ]
  }
}

/// PLC 链路状态机：连接生命周期 + 字级读写原语。
///
/// 任何 I/O 失败都把链路标记为断开；重连是显式操作，
/// 由编排器在下次轮询前发起，绝不在读写内部悄悄进行。
pub struct PlcLink<T> {
  transport: T,
  map: RegisterMap,
  codes: HandshakeCodes,
  connected: bool,
  last_trigger_value: u16,
}

impl<T: WordTransport> PlcLink<T> {
  pub fn new(transport: T, map: RegisterMap, codes: HandshakeCodes) -> Result<Self, PlcError> {
    map.validate()?;
    Ok(PlcLink {
      transport,
      map,
      codes,
      connected: false,
      last_trigger_value: 0,
    })
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  pub fn codes(&self) -> &HandshakeCodes {
    &self.codes
  }

  /// 上次轮询读到的触发码，断线重连后保留旧值。
  pub fn last_trigger_value(&self) -> u16 {
    self.last_trigger_value
  }

  pub fn connect(&mut self) -> Result<(), PlcError> {
    match self.transport.open() {
      Ok(()) => {
        self.connected = true;
        info!("PLC 链路已建立");
        Ok(())
      }
      Err(e) => {
        self.connected = false;
        Err(PlcError::ConnectFailed(e))
      }
    }
  }

  pub fn disconnect(&mut self) {
    self.transport.close();
    self.connected = false;
    info!("PLC 链路已断开");
  }

  /// 读一次触发寄存器确认链路仍然可用。失败即标记断开。
  pub fn verify(&mut self) -> bool {
    if !self.connected {
      return false;
    }
    match self.transport.read_words(self.map.trigger, 1) {
      Ok(_) => true,
      Err(e) => {
        warn!("链路校验失败: {e}");
        self.connected = false;
        false
      }
    }
  }

  /// 轮询触发寄存器，返回是否读到检测请求码。
  pub fn poll_trigger(&mut self) -> Result<bool, PlcError> {
    if !self.connected {
      return Err(PlcError::NotConnected);
    }
    let words = self
      .transport
      .read_words(self.map.trigger, 1)
      .map_err(|source| {
        self.connected = false;
        PlcError::ReadFailed {
          register: self.map.trigger,
          source,
        }
      })?;
    let value = words.first().copied().unwrap_or(0);
    self.last_trigger_value = value;
    Ok(value == self.codes.request)
  }

  /// 按固定顺序写出一个循环的全部结果字。
  ///
  /// 任何一次写失败都立即中止整个批次并标记断开，
  /// 残批不续写——下一个循环从头再来。
  pub fn write_results(&mut self, result: &ResultWrite) -> Result<(), PlcError> {
    if !self.connected {
      return Err(PlcError::NotConnected);
    }
    for (register, words) in result.to_batch(&self.map) {
      if let Err(source) = self.transport.write_words(register, &words) {
        error!("写寄存器 {register} 失败，放弃本批次: {source}");
        self.connected = false;
        return Err(PlcError::WriteFailed { register, source });
      }
    }
    info!(
      "结果已写出: Y={} cMM, Z={} cMM, 行数={}, 应答={} ({})",
      result.y_centi_mm,
      result.z_centi_mm,
      result.rows,
      result.ack,
      self.codes.describe(result.ack)
    );
    Ok(())
  }

  /// 测试与诊断时直接访问底层传输。
  pub fn transport(&self) -> &T {
    &self.transport
  }
}

/// 仿真传输: 触发序列按脚本回放，写入全部记录在案，可注入故障。
///
/// `sim://?trigger=99,0,99` 指定触发脚本（耗尽后恒为 0），
/// `&fail_after_writes=N` 在第 N 次成功写之后注入一次写故障，
/// `&fail_connects=N` 让前 N 次连接失败。无真实线缆，现场传输
/// 在部署侧按 [`WordTransport`] 另行实现。
pub struct SimTransport {
  open: bool,
  triggers: VecDeque<u16>,
  writes: Arc<Mutex<Vec<(u16, Vec<u16>)>>>,
  reads: usize,
  fail_after_writes: Option<usize>,
  fail_connects: usize,
  writes_done: usize,
}

impl FromUrlWithScheme for SimTransport {
  const SCHEME: &'static str = "sim";
}

impl FromUrl for SimTransport {
  type Error = TransportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(TransportError::LinkError(format!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut transport = SimTransport::new();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "trigger" => {
          for part in value.split(',').filter(|p| !p.is_empty()) {
            let code = part
              .parse::<u16>()
              .map_err(|e| TransportError::LinkError(format!("触发脚本无效 '{part}': {e}")))?;
            transport.triggers.push_back(code);
          }
        }
        "fail_after_writes" => {
          let n = value
            .parse::<usize>()
            .map_err(|e| TransportError::LinkError(format!("fail_after_writes 无效: {e}")))?;
          transport.fail_after_writes = Some(n);
        }
        "fail_connects" => {
          let n = value
            .parse::<usize>()
            .map_err(|e| TransportError::LinkError(format!("fail_connects 无效: {e}")))?;
          transport.fail_connects = n;
        }
        _ => {}
      }
    }
    Ok(transport)
  }
}

impl Default for SimTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl SimTransport {
  pub fn new() -> Self {
    SimTransport {
      open: false,
      triggers: VecDeque::new(),
      writes: Arc::new(Mutex::new(Vec::new())),
      reads: 0,
      fail_after_writes: None,
      fail_connects: 0,
      writes_done: 0,
    }
  }

  pub fn with_triggers(mut self, triggers: &[u16]) -> Self {
    self.triggers = triggers.iter().copied().collect();
    self
  }

  pub fn with_fail_after_writes(mut self, n: usize) -> Self {
    self.fail_after_writes = Some(n);
    self
  }

  pub fn with_fail_connects(mut self, n: usize) -> Self {
    self.fail_connects = n;
    self
  }

  /// 写入记录的共享句柄，移交给链路之后仍可在外部检查。
  pub fn writes_handle(&self) -> Arc<Mutex<Vec<(u16, Vec<u16>)>>> {
    Arc::clone(&self.writes)
  }

  /// 已处理的读请求数（即触发轮询次数）。
  pub fn reads(&self) -> usize {
    self.reads
  }
}

impl WordTransport for SimTransport {
  fn open(&mut self) -> Result<(), TransportError> {
    if self.fail_connects > 0 {
      self.fail_connects -= 1;
      return Err(TransportError::LinkError("仿真: 连接被拒".to_string()));
    }
    self.open = true;
    Ok(())
  }

  fn close(&mut self) {
    self.open = false;
  }

  fn read_words(&mut self, _address: u16, count: usize) -> Result<Vec<u16>, TransportError> {
    if !self.open {
      return Err(TransportError::NotOpen);
    }
    self.reads += 1;
    // 链路只轮询触发字，脚本逐次弹出，耗尽后保持空闲
    let value = self.triggers.pop_front().unwrap_or(0);
    let mut words = vec![0u16; count];
    if let Some(first) = words.first_mut() {
      *first = value;
    }
    Ok(words)
  }

  fn write_words(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError> {
    if !self.open {
      return Err(TransportError::NotOpen);
    }
    if let Some(limit) = self.fail_after_writes {
      if self.writes_done >= limit {
        return Err(TransportError::LinkError("仿真: 写故障注入".to_string()));
      }
    }
    self.writes_done += 1;
    self
      .writes
      .lock()
      .map_err(|_| TransportError::LinkError("写记录锁中毒".to_string()))?
      .push((address, words.to_vec()));
    Ok(())
  }
}
