// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  classify::ClassificationResult,
  model::DiseaseLabel,
  output::{ClassificationRecord, Render, Sample},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 按日期分目录保存图像副本与 JSON 记录
///
/// `folder:///var/lib/nassa?only=diseased` 只记录非健康的结果。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: AtomicU16,
  only_diseased: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let only_diseased = uri
      .query_pairs()
      .any(|(k, v)| k == "only" && v == "diseased");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      frame_counter: AtomicU16::new(0),
      only_diseased,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<Sample<'_>, ClassificationResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(
    &self,
    sample: &Sample<'_>,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    if self.only_diseased && result.label() == DiseaseLabel::Healthy {
      return Ok(());
    }

    let path = self.frame_path()?;
    sample.image.to_rgb8().save(&path)?;

    let record = ClassificationRecord::new(sample.source, result);
    std::fs::write(
      path.with_extension("json"),
      serde_json::to_vec_pretty(&record)?,
    )?;
    debug!("记录分类结果: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classify::interpret;
  use crate::frame::OutputScores;
  use image::DynamicImage;
  use url::Url;

  fn files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
      for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          found.push(path);
        }
      }
    }
    found.sort();
    found
  }

  #[test]
  fn writes_image_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let image = DynamicImage::new_rgb8(3, 3);
    let source = Url::parse("image:///cow.png").unwrap();
    let result = interpret(OutputScores::from(vec![0.7, 0.2, 0.1])).unwrap();
    output
      .render_result(&Sample::new(&source, &image), &result)
      .unwrap();

    let written = files(dir.path());
    assert_eq!(written.len(), 2);
    let sidecar = written
      .iter()
      .find(|p| p.extension().is_some_and(|e| e == "json"))
      .unwrap();
    let value: serde_json::Value =
      serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
    assert_eq!(value["label"], "Lumpy Skin Disease");
    assert!(sidecar.with_extension("png").exists());
  }

  #[test]
  fn healthy_results_skipped_when_only_diseased() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}?only=diseased", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let image = DynamicImage::new_rgb8(3, 3);
    let source = Url::parse("image:///cow.png").unwrap();
    let result = interpret(OutputScores::from(vec![0.0, 0.0, 1.0])).unwrap();
    output
      .render_result(&Sample::new(&source, &image), &result)
      .unwrap();

    assert!(files(dir.path()).is_empty());
  }
}
