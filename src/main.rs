// 该文件是 Shijian （视检） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shijian::FromUrl;
use shijian::config::SystemConfig;
use shijian::cycle::Orchestrator;
use shijian::detection::{ReplayDetector, ReplaySource, Station};
use shijian::plc::{PlcLink, SimTransport};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();
  let mut config = SystemConfig::load(Path::new(&args.config))?;
  if let Some(url) = &args.plc {
    config.plc.transport = url.to_string();
  }

  info!("Shijian 产线视检系统");
  info!("PLC 传输: {}", config.plc.transport);

  let transport = SimTransport::from_url(&Url::parse(&config.plc.transport)?)?;
  let mut plc = PlcLink::new(
    transport,
    config.plc.registers.clone(),
    config.plc.codes.clone(),
  )?;
  plc.connect()?;

  let lateral_url = match &args.lateral {
    Some(url) => url.clone(),
    None => Url::parse(&config.lateral.source)?,
  };
  let superior_url = match &args.superior {
    Some(url) => url.clone(),
    None => Url::parse(&config.superior.source)?,
  };
  info!("侧视来源: {lateral_url}");
  info!("俯视来源: {superior_url}");

  let lateral = Station::new(
    ReplaySource::from_url(&lateral_url)?,
    ReplayDetector,
    config.lateral.confidence,
  );
  let superior = Station::new(
    ReplaySource::from_url(&superior_url)?,
    ReplayDetector,
    config.superior.confidence,
  );

  let mut orchestrator = Orchestrator::new(plc, lateral, superior, config);
  if args.skip_calibration {
    info!("按参数跳过标定, Y 校正保持为零");
  } else {
    orchestrator.calibrate();
  }

  let max_cycles = (args.max_cycles > 0).then_some(args.max_cycles);
  orchestrator.run(max_cycles)?;

  Ok(())
}
