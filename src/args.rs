// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/args.rs - 单次诊断参数配置
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

use clap::Parser;
use url::Url;

/// Nassa 牛病诊断
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型，例如 onnx:///models/cattle.onnx?threads=4
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入图像，支持 image:// 与 file://，可重复指定
  #[arg(long, value_name = "SOURCE", required = true, num_args = 1..)]
  pub input: Vec<Url>,

  /// 输出：stdout:、json:///path 或 folder:///path
  #[arg(long, value_name = "OUTPUT", default_value = "stdout:")]
  pub output: Url,

  /// 推理线程数，覆盖模型 URI 中的 threads
  #[arg(long, value_name = "THREADS")]
  pub threads: Option<usize>,
}
