// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/acquisition.rs - 图像获取状态机
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

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

mod capture_target;
pub use self::capture_target::{
  CaptureTarget, CaptureTargetAllocator, ContentProvider, FileProvider, RetentionPolicy,
  ShareProvider,
};

mod source;
pub use self::source::{ImageResolver, SourceError};

#[cfg(feature = "v4l_camera")]
mod v4l_camera;
#[cfg(feature = "v4l_camera")]
pub use self::v4l_camera::V4lCamera;

#[derive(Error, Debug)]
pub enum AcquisitionError {
  #[error("缓存文件创建失败 {}: {source}", .path.display())]
  CacheFile {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法为文件生成共享 URI: {}", .0.display())]
  Share(PathBuf),
  #[error("非法状态转换: 状态 {state} 不接受事件 {event}")]
  InvalidTransition {
    state: &'static str,
    event: &'static str,
  },
  #[error("相机采集失败: {0}")]
  Camera(String),
}

/// 运行时权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
  Camera,
  ReadImages,
}

/// 图像来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
  Camera,
  Gallery,
}

impl Source {
  pub fn permission(&self) -> Permission {
    match self {
      Source::Camera => Permission::Camera,
      Source::Gallery => Permission::ReadImages,
    }
  }
}

/// 平台权限查询
pub trait Platform {
  fn is_granted(&self, permission: Permission) -> bool;
}

/// 相机：将一张照片写入调用方提供的目标文件
pub trait Camera {
  /// 返回 `Ok(false)` 表示用户取消
  fn capture_into(&mut self, target: &CaptureTarget) -> Result<bool, AcquisitionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionState {
  Idle,
  AwaitingPermission(Source),
  ReadyToCapture(CaptureTarget),
  ImageSelected(Url),
}

impl AcquisitionState {
  pub fn name(&self) -> &'static str {
    match self {
      AcquisitionState::Idle => "Idle",
      AcquisitionState::AwaitingPermission(_) => "AwaitingPermission",
      AcquisitionState::ReadyToCapture(_) => "ReadyToCapture",
      AcquisitionState::ImageSelected(_) => "ImageSelected",
    }
  }
}

/// 状态转换附带的副作用，由调用方执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
  RequestPermission(Permission),
  PermissionDenied(Permission),
  LaunchCamera(Url),
  LaunchGallery,
  ImageSelected(Url),
  None,
}

/// 图像获取流程
///
/// 每次启动相机都使用一个新的目标文件；拍照结束（成功或取消）后立即轮换，
/// 分配失败时状态保持不变，也不会发出启动相机的副作用。
#[derive(Debug)]
pub struct AcquisitionMachine<P> {
  state: AcquisitionState,
  allocator: CaptureTargetAllocator<P>,
  /// 已分配但尚未交给相机的目标
  fresh: Option<CaptureTarget>,
}

impl<P: ShareProvider> AcquisitionMachine<P> {
  /// 进入获取流程时即分配第一个目标
  pub fn new(allocator: CaptureTargetAllocator<P>) -> Result<Self, AcquisitionError> {
    let mut machine = Self {
      state: AcquisitionState::Idle,
      allocator,
      fresh: None,
    };
    machine.fresh = Some(machine.allocator.allocate()?);
    info!("图像获取流程已就绪");
    Ok(machine)
  }

  pub fn state(&self) -> &AcquisitionState {
    &self.state
  }

  pub fn allocator(&self) -> &CaptureTargetAllocator<P> {
    &self.allocator
  }

  /// 下一次启动相机将使用的目标
  pub fn fresh_target(&self) -> Option<&CaptureTarget> {
    self.fresh.as_ref()
  }

  pub fn selected(&self) -> Option<&Url> {
    match &self.state {
      AcquisitionState::ImageSelected(uri) => Some(uri),
      _ => None,
    }
  }

  fn invalid(&self, event: &'static str) -> AcquisitionError {
    warn!("状态 {} 不接受事件 {}", self.state.name(), event);
    AcquisitionError::InvalidTransition {
      state: self.state.name(),
      event,
    }
  }

  fn transition(&mut self, next: AcquisitionState) {
    debug!("状态转换: {} -> {}", self.state.name(), next.name());
    self.state = next;
  }

  /// 取出未使用的目标，没有则分配新的
  fn take_fresh(&mut self) -> Result<CaptureTarget, AcquisitionError> {
    match self.fresh.take() {
      Some(target) => Ok(target),
      None => self.allocator.allocate(),
    }
  }

  fn launch_camera(&mut self) -> Result<Effect, AcquisitionError> {
    let target = self.take_fresh()?;
    let uri = target.uri().clone();
    info!("启动相机，目标: {}", uri);
    self.transition(AcquisitionState::ReadyToCapture(target));
    Ok(Effect::LaunchCamera(uri))
  }

  /// 用户请求拍照或从相册选择；任何状态下都会开始新的获取周期
  ///
  /// 被放弃的目标只在新周期成功开始后才处理，失败时状态与文件都保持不变。
  pub fn request(
    &mut self,
    source: Source,
    platform: &impl Platform,
  ) -> Result<Effect, AcquisitionError> {
    let abandoned = match &self.state {
      AcquisitionState::ReadyToCapture(target) => Some(target.clone()),
      _ => None,
    };

    let effect = self.begin(source, platform)?;

    if let Some(abandoned) = abandoned {
      // 已交给相机的目标不再复用
      warn!("上一次拍照未完成，放弃目标: {}", abandoned.uri());
      self.allocator.discard(&abandoned);
    }
    Ok(effect)
  }

  fn begin(&mut self, source: Source, platform: &impl Platform) -> Result<Effect, AcquisitionError> {
    let permission = source.permission();
    if !platform.is_granted(permission) {
      info!("{:?} 权限未授予，请求权限", permission);
      self.transition(AcquisitionState::AwaitingPermission(source));
      return Ok(Effect::RequestPermission(permission));
    }

    match source {
      Source::Camera => self.launch_camera(),
      Source::Gallery => {
        self.transition(AcquisitionState::Idle);
        Ok(Effect::LaunchGallery)
      }
    }
  }

  /// 权限请求的回调结果
  pub fn permission_result(&mut self, granted: bool) -> Result<Effect, AcquisitionError> {
    let AcquisitionState::AwaitingPermission(source) = self.state else {
      return Err(self.invalid("permission_result"));
    };

    if !granted {
      warn!("{:?} 权限被拒绝", source.permission());
      self.transition(AcquisitionState::Idle);
      return Ok(Effect::PermissionDenied(source.permission()));
    }

    match source {
      Source::Camera => self.launch_camera(),
      Source::Gallery => {
        self.transition(AcquisitionState::Idle);
        Ok(Effect::LaunchGallery)
      }
    }
  }

  /// 相机返回；无论成功与否都会轮换目标
  ///
  /// 轮换失败时返回错误且状态不变，已拍摄的文件仍在原目标中。
  pub fn capture_completed(&mut self, success: bool) -> Result<Effect, AcquisitionError> {
    let AcquisitionState::ReadyToCapture(target) = &self.state else {
      return Err(self.invalid("capture_completed"));
    };
    let target = target.clone();

    // 只有取消时旧目标才交给保留策略处理
    let next = self.allocator.rotate((!success).then_some(&target))?;
    self.fresh = Some(next);

    if success {
      info!("拍照完成: {}", target.uri());
      let uri = target.uri().clone();
      self.transition(AcquisitionState::ImageSelected(uri.clone()));
      Ok(Effect::ImageSelected(uri))
    } else {
      info!("拍照已取消");
      self.transition(AcquisitionState::Idle);
      Ok(Effect::None)
    }
  }

  /// 相册返回；`None` 表示用户未选择
  pub fn gallery_picked(&mut self, uri: Option<Url>) -> Result<Effect, AcquisitionError> {
    match self.state {
      AcquisitionState::Idle | AcquisitionState::AwaitingPermission(_) => {}
      _ => return Err(self.invalid("gallery_picked")),
    }

    match uri {
      Some(uri) => {
        info!("从相册选择: {}", uri);
        self.transition(AcquisitionState::ImageSelected(uri.clone()));
        Ok(Effect::ImageSelected(uri))
      }
      None => {
        debug!("相册选择已取消");
        Ok(Effect::None)
      }
    }
  }

  /// 使用相机完成一次完整的拍照
  pub fn capture_with(
    &mut self,
    camera: &mut impl Camera,
    platform: &impl Platform,
  ) -> Result<Effect, AcquisitionError> {
    match self.request(Source::Camera, platform)? {
      Effect::LaunchCamera(_) => {}
      effect => return Ok(effect),
    }

    let AcquisitionState::ReadyToCapture(target) = &self.state else {
      return Err(self.invalid("capture_with"));
    };
    let success = match camera.capture_into(target) {
      Ok(success) => success,
      Err(e) => {
        warn!("相机采集失败: {}", e);
        if let Err(rotate) = self.capture_completed(false) {
          warn!("轮换拍照目标失败: {}", rotate);
        }
        return Err(e);
      }
    };
    self.capture_completed(success)
  }

  /// 结束当前周期，回到 Idle
  pub fn reset(&mut self) {
    if let AcquisitionState::ReadyToCapture(abandoned) = &self.state {
      self.allocator.discard(abandoned);
    }
    self.transition(AcquisitionState::Idle);
  }

  /// 解析本流程发出的 URI 对应的本地文件
  pub fn resolve(&self, uri: &Url) -> Option<PathBuf> {
    self.allocator.resolve(uri)
  }

  /// 关闭流程，按保留策略清理未使用的目标
  pub fn close(mut self) {
    if let Some(fresh) = self.fresh.take() {
      self.allocator.discard(&fresh);
    }
    self.reset();
  }

  pub fn cache_dir(&self) -> &Path {
    self.allocator.cache_dir()
  }
}
