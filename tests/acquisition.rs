//! 图像获取流程：权限、拍照目标轮换与相册选择

use std::collections::HashSet;
use std::io::Write;

use url::Url;

use nassa::acquisition::{
  AcquisitionError, AcquisitionMachine, AcquisitionState, Camera, CaptureTarget,
  CaptureTargetAllocator, ContentProvider, Effect, FileProvider, Permission, Platform,
  RetentionPolicy, Source,
};

#[derive(Default)]
struct Grants(HashSet<Permission>);

impl Platform for Grants {
  fn is_granted(&self, permission: Permission) -> bool {
    self.0.contains(&permission)
  }
}

fn granted(permissions: &[Permission]) -> Grants {
  Grants(permissions.iter().copied().collect())
}

/// 写入固定字节，或模拟用户取消
struct FakeCamera {
  shots: Vec<Option<&'static [u8]>>,
}

impl Camera for FakeCamera {
  fn capture_into(&mut self, target: &CaptureTarget) -> Result<bool, AcquisitionError> {
    match self.shots.remove(0) {
      Some(bytes) => {
        std::fs::File::create(target.file())
          .and_then(|mut f| f.write_all(bytes))
          .map_err(|source| AcquisitionError::CacheFile {
            path: target.file().to_path_buf(),
            source,
          })?;
        Ok(true)
      }
      None => Ok(false),
    }
  }
}

#[test]
fn two_camera_requests_get_two_fresh_files() {
  let cache = tempfile::tempdir().unwrap();
  let provider = ContentProvider::new("nassa.provider", cache.path());
  let mut machine = AcquisitionMachine::new(CaptureTargetAllocator::new(cache.path(), provider))
    .unwrap();
  let platform = granted(&[Permission::Camera]);

  let Effect::LaunchCamera(first) = machine.request(Source::Camera, &platform).unwrap() else {
    panic!("camera was not launched");
  };
  machine.capture_completed(false).unwrap();
  let Effect::LaunchCamera(second) = machine.request(Source::Camera, &platform).unwrap() else {
    panic!("camera was not launched");
  };

  assert_ne!(first, second);
  let first_file = machine.resolve(&first).unwrap();
  let second_file = machine.resolve(&second).unwrap();
  assert_ne!(first_file, second_file);

  let meta = std::fs::metadata(&second_file).unwrap();
  assert_eq!(meta.len(), 0);
  assert!(!meta.permissions().readonly());
}

#[test]
fn permission_round_trip_then_capture() {
  let cache = tempfile::tempdir().unwrap();
  let mut machine =
    AcquisitionMachine::new(CaptureTargetAllocator::new(cache.path(), FileProvider)).unwrap();

  assert_eq!(
    machine.request(Source::Camera, &Grants::default()).unwrap(),
    Effect::RequestPermission(Permission::Camera)
  );
  assert_eq!(
    machine.state(),
    &AcquisitionState::AwaitingPermission(Source::Camera)
  );

  let Effect::LaunchCamera(uri) = machine.permission_result(true).unwrap() else {
    panic!("camera was not launched after grant");
  };
  assert_eq!(machine.capture_completed(true).unwrap(), Effect::ImageSelected(uri.clone()));
  assert_eq!(machine.selected(), Some(&uri));
}

#[test]
fn denied_permission_returns_to_idle() {
  let cache = tempfile::tempdir().unwrap();
  let mut machine =
    AcquisitionMachine::new(CaptureTargetAllocator::new(cache.path(), FileProvider)).unwrap();

  machine.request(Source::Gallery, &Grants::default()).unwrap();
  assert_eq!(
    machine.permission_result(false).unwrap(),
    Effect::PermissionDenied(Permission::ReadImages)
  );
  assert_eq!(machine.state(), &AcquisitionState::Idle);
}

#[test]
fn gallery_selection_and_cancel() {
  let cache = tempfile::tempdir().unwrap();
  let mut machine =
    AcquisitionMachine::new(CaptureTargetAllocator::new(cache.path(), FileProvider)).unwrap();
  let platform = granted(&[Permission::ReadImages]);

  assert_eq!(
    machine.request(Source::Gallery, &platform).unwrap(),
    Effect::LaunchGallery
  );
  assert_eq!(machine.gallery_picked(None).unwrap(), Effect::None);
  assert_eq!(machine.state(), &AcquisitionState::Idle);

  let picked = Url::parse("file:///photos/cow.jpg").unwrap();
  machine.request(Source::Gallery, &platform).unwrap();
  assert_eq!(
    machine.gallery_picked(Some(picked.clone())).unwrap(),
    Effect::ImageSelected(picked.clone())
  );
  assert_eq!(machine.selected(), Some(&picked));
}

#[test]
fn camera_driver_rotates_after_cancel_and_success() {
  let cache = tempfile::tempdir().unwrap();
  let allocator = CaptureTargetAllocator::new(cache.path(), FileProvider)
    .with_retention(RetentionPolicy::DiscardUnused);
  let mut machine = AcquisitionMachine::new(allocator).unwrap();
  let platform = granted(&[Permission::Camera]);
  let mut camera = FakeCamera {
    shots: vec![None, Some(b"jpeg bytes")],
  };

  assert_eq!(machine.capture_with(&mut camera, &platform).unwrap(), Effect::None);
  let Effect::ImageSelected(uri) = machine.capture_with(&mut camera, &platform).unwrap() else {
    panic!("capture did not select an image");
  };

  let file = machine.resolve(&uri).unwrap();
  assert_eq!(std::fs::read(&file).unwrap(), b"jpeg bytes");

  // 被取消的空目标已删除，只剩拍摄的照片和下一次的空目标
  let mut sizes: Vec<u64> = std::fs::read_dir(cache.path())
    .unwrap()
    .map(|e| e.unwrap().metadata().unwrap().len())
    .collect();
  sizes.sort();
  assert_eq!(sizes, vec![0, 10]);
}
