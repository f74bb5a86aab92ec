// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/output.rs - 分类结果输出
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

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, classify::ClassificationResult, model::DiseaseLabel,
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

/// 被分类的图像及其来源
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
  pub source: &'a Url,
  pub image: &'a DynamicImage,
}

impl<'a> Sample<'a> {
  pub fn new(source: &'a Url, image: &'a DynamicImage) -> Self {
    Self { source, image }
  }
}

/// 一条可序列化的分类记录
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRecord {
  pub source: String,
  pub label: DiseaseLabel,
  pub class_index: usize,
  pub confidence: f32,
  pub scores: Vec<f32>,
  pub timestamp: String,
}

impl ClassificationRecord {
  pub fn new(source: &Url, result: &ClassificationResult) -> Self {
    Self {
      source: source.to_string(),
      label: result.label(),
      class_index: result.class_index(),
      confidence: result.confidence(),
      scores: result.scores().as_slice().to_vec(),
      timestamp: Utc::now().to_rfc3339(),
    }
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("输出文件锁已损坏")]
  Poisoned,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 将结果打印到标准输出
#[derive(Debug, Default)]
pub struct LogOutput;

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "stdout";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogOutput)
  }
}

impl Render<Sample<'_>, ClassificationResult> for LogOutput {
  type Error = OutputError;

  fn render_result(
    &self,
    sample: &Sample<'_>,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    info!("{} -> {}", sample.source, result.label());
    let mut stdout = std::io::stdout().lock();
    writeln!(
      stdout,
      "{}\t{}\t{:.4}",
      sample.source,
      result.label(),
      result.confidence()
    )?;
    Ok(())
  }
}

/// 以 JSON Lines 形式追加写入文件
#[derive(Debug)]
pub struct JsonFileOutput {
  path: PathBuf,
  file: Mutex<File>,
}

impl FromUrlWithScheme for JsonFileOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonFileOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = PathBuf::from(url.path());
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("JSON 输出: {}", path.display());

    Ok(Self {
      path,
      file: Mutex::new(file),
    })
  }
}

impl JsonFileOutput {
  pub fn path(&self) -> &std::path::Path {
    &self.path
  }
}

impl Render<Sample<'_>, ClassificationResult> for JsonFileOutput {
  type Error = OutputError;

  fn render_result(
    &self,
    sample: &Sample<'_>,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    let mut line = serde_json::to_string(&ClassificationRecord::new(sample.source, result))?;
    line.push('\n');

    let mut file = self.file.lock().map_err(|_| OutputError::Poisoned)?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
  }
}

pub enum OutputWrapper {
  LogOutput(LogOutput),
  JsonFileOutput(JsonFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => Ok(OutputWrapper::LogOutput(LogOutput::from_url(url)?)),
      JsonFileOutput::SCHEME => Ok(OutputWrapper::JsonFileOutput(JsonFileOutput::from_url(
        url,
      )?)),
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      scheme => {
        error!("不支持的输出: {}", url);
        Err(OutputError::SchemeMismatch(scheme.to_string()))
      }
    }
  }
}

impl Render<Sample<'_>, ClassificationResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &self,
    sample: &Sample<'_>,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::LogOutput(output) => output.render_result(sample, result),
      OutputWrapper::JsonFileOutput(output) => output.render_result(sample, result),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(sample, result)
        .map_err(OutputError::from),
    }
  }
}
