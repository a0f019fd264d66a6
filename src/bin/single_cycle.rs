// 该文件是 Shijian （视检） 项目的一部分。
// src/bin/simple_cycle.rs - 单循环调试代码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use url::Url;

use shijian::FromUrl;
use shijian::config::SystemConfig;
use shijian::cycle::Orchestrator;
use shijian::detection::{ReplayDetector, ReplaySource, Station};
use shijian::plc::{PlcLink, SimTransport};

/// 现场调机用: 等待一次 PLC 触发, 跑完一个循环, 打印判定后退出。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径
  #[arg(long, default_value = "shijian.json", value_name = "FILE")]
  pub config: String,

  /// 侧视工位帧来源
  #[arg(long, value_name = "URL")]
  pub lateral: Url,

  /// 俯视工位帧来源
  #[arg(long, value_name = "URL")]
  pub superior: Url,

  /// 等待触发的超时秒数
  #[arg(long, default_value = "30", value_name = "SECONDS")]
  pub timeout: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = SystemConfig::load(std::path::Path::new(&args.config))?;

  let transport = SimTransport::from_url(&Url::parse(&config.plc.transport)?)?;
  let mut plc = PlcLink::new(
    transport,
    config.plc.registers.clone(),
    config.plc.codes.clone(),
  )?;
  plc.connect()?;

  let lateral = Station::new(
    ReplaySource::from_url(&args.lateral)?,
    ReplayDetector,
    config.lateral.confidence,
  );
  let superior = Station::new(
    ReplaySource::from_url(&args.superior)?,
    ReplayDetector,
    config.superior.confidence,
  );

  let poll_delay = Duration::from_millis(config.plc.poll_delay_ms);
  let mut orchestrator = Orchestrator::new(plc, lateral, superior, config);
  orchestrator.calibrate();

  info!("等待 PLC 触发 (超时 {} 秒)...", args.timeout);
  let deadline = Instant::now() + Duration::from_secs(args.timeout);
  while !orchestrator.poll()? {
    if Instant::now() >= deadline {
      bail!("等待触发超时");
    }
    thread::sleep(poll_delay);
  }

  let verdict = orchestrator.run_cycle()?;
  for diag in &verdict.diagnostics {
    info!("诊断: {diag}");
  }
  info!(
    "判定: {:?} | 剩余行数 {} | Y {} px ({:.2} mm) | Z {} cMM",
    verdict.response_code,
    verdict.rows_remaining,
    verdict.correction_y_px,
    verdict.correction_y_mm,
    verdict.correction_z_centi_mm
  );

  Ok(())
}
