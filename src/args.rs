// 该文件是 Shijian （视检） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use url::Url;

/// Shijian 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径（JSON，缺失时使用内置默认值）
  #[arg(long, default_value = "shijian.json", value_name = "FILE")]
  pub config: String,

  /// PLC 传输层地址，覆盖配置文件
  /// 支持格式:
  /// - 仿真: sim://?trigger=99,0,99
  #[arg(long, value_name = "URL")]
  pub plc: Option<Url>,

  /// 侧视工位帧来源，覆盖配置文件
  /// 支持格式:
  /// - 回放: replay:///path/to/dir 或 replay:///frame.json（加 ?loop 循环）
  #[arg(long, value_name = "URL")]
  pub lateral: Option<Url>,

  /// 俯视工位帧来源，覆盖配置文件
  #[arg(long, value_name = "URL")]
  pub superior: Option<Url>,

  /// 启动时跳过标定（Y 校正将保持为零）
  #[arg(long)]
  pub skip_calibration: bool,

  /// 最大循环数（0 表示无限制）
  #[arg(long, default_value = "0", value_name = "COUNT")]
  pub max_cycles: u64,
}
