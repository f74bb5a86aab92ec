// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/main.rs - 单次诊断主程序
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

mod args;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use nassa::{
  FromUrl,
  acquisition::ImageResolver,
  classify::Classifier,
  model::TractRuntimeBuilder,
  output::{OutputWrapper, Render, Sample},
  task::ClassificationWorker,
};

/// 逐张读取并提交分类，返回读取或分类失败的图像数
fn run_batch(
  worker: &mut ClassificationWorker,
  resolver: &ImageResolver,
  inputs: &[Url],
  output: &OutputWrapper,
) -> Result<usize> {
  let mut failures = 0;
  let mut submitted = Vec::with_capacity(inputs.len());
  for source in inputs {
    let image = match resolver.load(source) {
      Ok(image) => image,
      Err(e) => {
        error!("{} 读取失败: {}", source, e);
        failures += 1;
        continue;
      }
    };
    let pending = worker.submit(image.clone())?;
    submitted.push((source, image, pending));
  }

  for (source, image, pending) in submitted {
    match pending.wait()? {
      Ok(result) => output.render_result(&Sample::new(source, &image), &result)?,
      Err(e) => {
        error!("{} 分类失败: {}", source, e);
        failures += 1;
      }
    }
  }
  Ok(failures)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型: {}", args.model);
  info!("输入: {} 张图像", args.input.len());
  info!("输出: {}", args.output);

  let mut builder = TractRuntimeBuilder::from_url(&args.model)?;
  if let Some(threads) = args.threads {
    builder = builder.threads(threads);
  }
  let classifier = Classifier::new(Arc::new(builder.build()?))?;
  let output = OutputWrapper::from_url(&args.output)?;
  let resolver = ImageResolver::new();

  let mut worker = ClassificationWorker::spawn(classifier)?;
  let failures = run_batch(&mut worker, &resolver, &args.input, &output)?;
  worker.shutdown();

  if failures > 0 {
    anyhow::bail!("{} 张图像处理失败", failures);
  }
  Ok(())
}
