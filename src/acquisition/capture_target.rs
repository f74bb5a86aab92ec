// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/acquisition/capture_target.rs - 拍照目标文件与共享 URI
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

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use super::AcquisitionError;

const CAPTURE_FILE_PREFIX: &str = "diagnostic_IMG";
const CAPTURE_FILE_EXTENSION: &str = "jpg";
const CONTENT_SCHEME: &str = "content";
const CACHE_SEGMENT: &str = "cache";

/// 一次拍照使用的目标文件，创建时为空且可写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
  file: PathBuf,
  uri: Url,
  sequence: u64,
}

impl CaptureTarget {
  pub fn file(&self) -> &Path {
    &self.file
  }

  pub fn uri(&self) -> &Url {
    &self.uri
  }

  /// 本会话内的轮换序号
  pub fn sequence(&self) -> u64 {
    self.sequence
  }
}

/// 为应用私有缓存文件生成可共享给相机的 URI，并能反向解析
pub trait ShareProvider {
  fn share(&self, file: &Path) -> Result<Url, AcquisitionError>;
  fn resolve(&self, uri: &Url) -> Option<PathBuf>;
}

/// `content://<authority>/cache/<file name>` 形式的共享 URI
#[derive(Debug, Clone)]
pub struct ContentProvider {
  authority: String,
  root: PathBuf,
}

impl ContentProvider {
  pub fn new(authority: impl Into<String>, root: impl Into<PathBuf>) -> Self {
    Self {
      authority: authority.into(),
      root: root.into(),
    }
  }

  pub fn authority(&self) -> &str {
    &self.authority
  }
}

impl ShareProvider for ContentProvider {
  fn share(&self, file: &Path) -> Result<Url, AcquisitionError> {
    let name = file
      .strip_prefix(&self.root)
      .ok()
      .filter(|rest| rest.components().count() == 1)
      .and_then(|rest| rest.to_str())
      .ok_or_else(|| AcquisitionError::Share(file.to_path_buf()))?;

    let uri = format!(
      "{}://{}/{}/{}",
      CONTENT_SCHEME,
      self.authority,
      CACHE_SEGMENT,
      urlencoding::encode(name)
    );
    Url::parse(&uri).map_err(|_| AcquisitionError::Share(file.to_path_buf()))
  }

  fn resolve(&self, uri: &Url) -> Option<PathBuf> {
    if uri.scheme() != CONTENT_SCHEME || uri.host_str() != Some(self.authority.as_str()) {
      return None;
    }

    let mut segments = uri.path_segments()?;
    if segments.next()? != CACHE_SEGMENT {
      return None;
    }
    let name = urlencoding::decode(segments.next()?).ok()?;
    if segments.next().is_some() || name.is_empty() || name.contains('/') || name == ".." {
      return None;
    }
    Some(self.root.join(name.as_ref()))
  }
}

/// 直接使用 `file://` URI
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProvider;

impl ShareProvider for FileProvider {
  fn share(&self, file: &Path) -> Result<Url, AcquisitionError> {
    Url::from_file_path(file).map_err(|_| AcquisitionError::Share(file.to_path_buf()))
  }

  fn resolve(&self, uri: &Url) -> Option<PathBuf> {
    if uri.scheme() != "file" {
      return None;
    }
    uri.to_file_path().ok()
  }
}

/// 被替换的目标文件如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
  /// 从不删除，交给系统清理缓存
  #[default]
  KeepAll,
  /// 删除从未被写入的（空）目标文件
  DiscardUnused,
}

/// 在缓存目录中分配不重名的拍照目标文件
///
/// 文件名由毫秒时间戳与会话内单调递增的序号组成，
/// 并以独占方式创建，同一毫秒内的连续分配也不会冲突。
#[derive(Debug)]
pub struct CaptureTargetAllocator<P> {
  cache_dir: PathBuf,
  provider: P,
  retention: RetentionPolicy,
  counter: u64,
}

impl<P: ShareProvider> CaptureTargetAllocator<P> {
  pub fn new(cache_dir: impl Into<PathBuf>, provider: P) -> Self {
    Self {
      cache_dir: cache_dir.into(),
      provider,
      retention: RetentionPolicy::default(),
      counter: 0,
    }
  }

  pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
    self.retention = retention;
    self
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  pub fn retention(&self) -> RetentionPolicy {
    self.retention
  }

  fn next_sequence(&mut self) -> u64 {
    self.counter += 1;
    self.counter
  }

  /// 创建新的空白目标文件并生成共享 URI
  pub fn allocate(&mut self) -> Result<CaptureTarget, AcquisitionError> {
    std::fs::create_dir_all(&self.cache_dir).map_err(|source| AcquisitionError::CacheFile {
      path: self.cache_dir.clone(),
      source,
    })?;

    let sequence = self.next_sequence();
    let file = self.cache_dir.join(format!(
      "{}_{}_{:04X}.{}",
      CAPTURE_FILE_PREFIX,
      Utc::now().timestamp_millis(),
      sequence,
      CAPTURE_FILE_EXTENSION
    ));

    OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&file)
      .map_err(|source| AcquisitionError::CacheFile {
        path: file.clone(),
        source,
      })?;

    let uri = match self.provider.share(&file) {
      Ok(uri) => uri,
      Err(e) => {
        let _ = std::fs::remove_file(&file);
        return Err(e);
      }
    };

    debug!("分配拍照目标 #{}: {} -> {}", sequence, file.display(), uri);
    Ok(CaptureTarget {
      file,
      uri,
      sequence,
    })
  }

  /// 分配新目标，并按保留策略处理被替换的旧目标
  pub fn rotate(
    &mut self,
    previous: Option<&CaptureTarget>,
  ) -> Result<CaptureTarget, AcquisitionError> {
    let target = self.allocate()?;
    if let Some(previous) = previous {
      self.discard(previous);
    }
    Ok(target)
  }

  /// 按保留策略处理不再使用的目标
  pub fn discard(&self, target: &CaptureTarget) {
    if self.retention != RetentionPolicy::DiscardUnused {
      return;
    }

    match std::fs::metadata(&target.file) {
      Ok(meta) if meta.len() == 0 => match std::fs::remove_file(&target.file) {
        Ok(()) => info!("删除未使用的拍照目标: {}", target.file.display()),
        Err(e) => warn!("删除拍照目标 {} 失败: {}", target.file.display(), e),
      },
      Ok(_) => debug!("保留已写入的拍照目标: {}", target.file.display()),
      Err(e) => debug!("拍照目标 {} 已不存在: {}", target.file.display(), e),
    }
  }

  pub fn resolve(&self, uri: &Url) -> Option<PathBuf> {
    self.provider.resolve(uri)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::io::Write;

  #[test]
  fn back_to_back_allocations_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let mut allocator = CaptureTargetAllocator::new(dir.path(), FileProvider);
    let targets: Vec<_> = (0..64).map(|_| allocator.allocate().unwrap()).collect();

    let files: HashSet<_> = targets.iter().map(|t| t.file().to_path_buf()).collect();
    let uris: HashSet<_> = targets.iter().map(|t| t.uri().clone()).collect();
    assert_eq!(files.len(), targets.len());
    assert_eq!(uris.len(), targets.len());

    for target in &targets {
      let meta = std::fs::metadata(target.file()).unwrap();
      assert_eq!(meta.len(), 0);
      assert!(!meta.permissions().readonly());
    }
  }

  #[test]
  fn content_uri_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ContentProvider::new("nassa.provider", dir.path());
    let mut allocator = CaptureTargetAllocator::new(dir.path(), provider);
    let target = allocator.allocate().unwrap();

    assert_eq!(target.uri().scheme(), "content");
    assert_eq!(target.uri().host_str(), Some("nassa.provider"));
    assert_eq!(allocator.resolve(target.uri()).as_deref(), Some(target.file()));
  }

  #[test]
  fn content_provider_refuses_foreign_uris() {
    let provider = ContentProvider::new("nassa.provider", "/tmp/cache");
    for uri in [
      "content://other.provider/cache/a.jpg",
      "content://nassa.provider/files/a.jpg",
      "content://nassa.provider/cache/a/b.jpg",
      "content://nassa.provider/cache/..%2Fsecret",
      "file:///tmp/cache/a.jpg",
    ] {
      assert_eq!(provider.resolve(&Url::parse(uri).unwrap()), None, "{}", uri);
    }
  }

  #[test]
  fn content_provider_only_shares_direct_children() {
    let provider = ContentProvider::new("nassa.provider", "/tmp/cache");
    assert!(provider.share(Path::new("/etc/passwd")).is_err());
    assert!(provider.share(Path::new("/tmp/cache/sub/a.jpg")).is_err());
  }

  #[test]
  fn allocation_fails_when_cache_dir_is_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let mut allocator = CaptureTargetAllocator::new(&blocker, FileProvider);
    assert!(matches!(
      allocator.allocate(),
      Err(AcquisitionError::CacheFile { .. })
    ));
  }

  #[test]
  fn discard_unused_keeps_written_targets() {
    let dir = tempfile::tempdir().unwrap();
    let mut allocator = CaptureTargetAllocator::new(dir.path(), FileProvider)
      .with_retention(RetentionPolicy::DiscardUnused);

    let empty = allocator.allocate().unwrap();
    let written = allocator.allocate().unwrap();
    std::fs::File::create(written.file())
      .unwrap()
      .write_all(b"jpeg")
      .unwrap();

    allocator.rotate(Some(&empty)).unwrap();
    allocator.rotate(Some(&written)).unwrap();

    assert!(!empty.file().exists());
    assert!(written.file().exists());
  }

  #[test]
  fn keep_all_never_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let mut allocator = CaptureTargetAllocator::new(dir.path(), FileProvider);
    let first = allocator.allocate().unwrap();
    let second = allocator.rotate(Some(&first)).unwrap();
    assert!(first.file().exists());
    assert!(second.file().exists());
  }
}
