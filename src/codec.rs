// 该文件是 Shijian （视检） 项目的一部分。
// src/codec.rs - PLC 寄存器字编码
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 物理量与 PLC 寄存器字之间的纯函数转换。
//!
//! PLC 侧以 16 位字为单位寻址，带符号量按 32 位补码拆成两个字
//! （低字在前），线性量统一使用百分之一毫米（cMM）。

/// 把整数钳制到有符号 32 位范围后拆成两个 16 位字。
///
/// 负值先加 `2^32` 转为无符号表示再拆分。超出范围的输入不会报错，
/// 而是被钳制到边界值。返回 `[低字, 高字]`。
pub fn encode_i32(value: i64) -> [u16; 2] {
  let clamped = value.clamp(i32::MIN as i64, i32::MAX as i64);
  let unsigned = if clamped < 0 {
    (clamped + (1i64 << 32)) as u64
  } else {
    clamped as u64
  };
  [(unsigned & 0xFFFF) as u16, ((unsigned >> 16) & 0xFFFF) as u16]
}

/// `encode_i32` 的逆运算，两个字还原为有符号 32 位整数。
pub fn decode_i32(words: [u16; 2]) -> i32 {
  let raw = (words[0] as u32) | ((words[1] as u32) << 16);
  raw as i32
}

/// 毫米值转为百分之一毫米（cMM）整数，四舍五入远离零。
///
/// 先在千分之一毫米处取整一次，避免 1.005 这类十进制数
/// 在二进制表示下落在 .5 之下而被错误地舍去。
pub fn encode_mm_as_centi(value_mm: f64) -> i64 {
  let milli = (value_mm * 1000.0).round();
  (milli / 10.0).round() as i64
}

/// 单字字段的解码。行数寄存器为无符号单字，恒等映射。
pub fn decode_word(word: u16) -> u16 {
  word
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_zero_and_small_values() {
    assert_eq!(encode_i32(0), [0, 0]);
    assert_eq!(encode_i32(1), [1, 0]);
    assert_eq!(encode_i32(0x1_0000), [0, 1]);
    assert_eq!(encode_i32(0x12_3456), [0x3456, 0x12]);
  }

  #[test]
  fn encode_negative_uses_twos_complement() {
    assert_eq!(encode_i32(-1), [0xFFFF, 0xFFFF]);
    assert_eq!(encode_i32(-2), [0xFFFE, 0xFFFF]);
    assert_eq!(encode_i32(i32::MIN as i64), [0x0000, 0x8000]);
  }

  #[test]
  fn encode_clamps_out_of_range() {
    assert_eq!(encode_i32(2147483648), encode_i32(2147483647));
    assert_eq!(encode_i32(-2147483649), encode_i32(-2147483648));
    assert_eq!(encode_i32(i64::MAX), encode_i32(i32::MAX as i64));
  }

  #[test]
  fn decode_inverts_encode() {
    for v in [0i64, 1, -1, 12345, -12345, i32::MAX as i64, i32::MIN as i64] {
      assert_eq!(decode_i32(encode_i32(v)) as i64, v);
    }
  }

  #[test]
  fn centi_mm_rounds_half_away_from_zero() {
    assert_eq!(encode_mm_as_centi(1.005), 101);
    assert_eq!(encode_mm_as_centi(-1.005), -101);
    assert_eq!(encode_mm_as_centi(0.004), 0);
    assert_eq!(encode_mm_as_centi(0.005), 1);
    assert_eq!(encode_mm_as_centi(-0.005), -1);
    assert_eq!(encode_mm_as_centi(12.34), 1234);
    assert_eq!(encode_mm_as_centi(0.0), 0);
  }

  #[test]
  fn word_decode_is_identity() {
    assert_eq!(decode_word(0), 0);
    assert_eq!(decode_word(8), 8);
    assert_eq!(decode_word(u16::MAX), u16::MAX);
  }
}
