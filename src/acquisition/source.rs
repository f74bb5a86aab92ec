// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/acquisition/source.rs - 将获取到的 URI 读取为图像
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

use std::path::PathBuf;

use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::ShareProvider;
use crate::preprocess::{self, PreprocessError};

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("URI 无法解析为本地文件: {0}")]
  Unresolved(Url),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像读取错误: {0}")]
  Image(#[from] PreprocessError),
}

const IMAGE_SCHEME: &str = "image";
const FILE_SCHEME: &str = "file";

/// 解析 `image://`、`file://` 与共享提供者发出的 URI
pub struct ImageResolver<'a> {
  provider: Option<&'a dyn ShareProvider>,
}

impl<'a> ImageResolver<'a> {
  pub fn new() -> Self {
    Self { provider: None }
  }

  pub fn with_provider(provider: &'a dyn ShareProvider) -> Self {
    Self {
      provider: Some(provider),
    }
  }

  pub fn resolve(&self, uri: &Url) -> Result<PathBuf, SourceError> {
    match uri.scheme() {
      IMAGE_SCHEME => Ok(PathBuf::from(uri.path())),
      FILE_SCHEME => uri
        .to_file_path()
        .map_err(|_| SourceError::Unresolved(uri.clone())),
      scheme => {
        let provider = self.provider.ok_or_else(|| {
          error!("URI scheme mismatch: '{}' 没有对应的共享提供者", scheme);
          SourceError::SchemeMismatch(scheme.to_string())
        })?;
        provider
          .resolve(uri)
          .ok_or_else(|| SourceError::Unresolved(uri.clone()))
      }
    }
  }

  /// 读取并解码图像
  pub fn load(&self, uri: &Url) -> Result<DynamicImage, SourceError> {
    let path = self.resolve(uri)?;
    debug!("读取图像: {} -> {}", uri, path.display());
    let bytes = std::fs::read(&path)?;
    let image = preprocess::decode(&bytes)?;
    Ok(image)
  }
}

impl Default for ImageResolver<'_> {
  fn default() -> Self {
    Self::new()
  }
}
