// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/acquisition/v4l_camera.rs - 基于 V4L 的相机
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

use image::{ImageFormat, RgbImage};
use tracing::{debug, error, info};
use url::Url;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use super::{AcquisitionError, Camera, CaptureTarget};
use crate::FromUrl;

const V4L_SCHEME: &str = "v4l";
const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_SKIP_FRAMES: usize = 3;

fn v4l_error(e: std::io::Error) -> AcquisitionError {
  AcquisitionError::Camera(e.to_string())
}

/// 从 V4L 设备抓取一帧写入拍照目标
///
/// `v4l:///dev/video0?skip=3`，`skip` 为丢弃的预热帧数。
#[derive(Debug, Clone)]
pub struct V4lCamera {
  device_path: String,
  skip_frames: usize,
}

impl FromUrl for V4lCamera {
  type Error = AcquisitionError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        V4L_SCHEME,
        url.scheme()
      );
      return Err(AcquisitionError::Camera(format!(
        "unsupported scheme: {}",
        url.scheme()
      )));
    }

    let device_path = match url.path() {
      "" | "/" => DEFAULT_DEVICE.to_string(),
      path => path.to_string(),
    };

    let mut skip_frames = DEFAULT_SKIP_FRAMES;
    for (key, value) in url.query_pairs() {
      if key == "skip" {
        skip_frames = value
          .parse()
          .map_err(|_| AcquisitionError::Camera(format!("invalid skip: {}", value)))?;
      }
    }

    // 打开一次设备以尽早发现路径错误
    let device = v4l::Device::with_path(&device_path).map_err(v4l_error)?;
    let format = device.format().map_err(v4l_error)?;
    info!(
      "V4L 相机 {}: {}x{} {}",
      device_path, format.width, format.height, format.fourcc
    );

    Ok(Self {
      device_path,
      skip_frames,
    })
  }
}

impl V4lCamera {
  pub fn device_path(&self) -> &str {
    &self.device_path
  }
}

impl Camera for V4lCamera {
  fn capture_into(&mut self, target: &CaptureTarget) -> Result<bool, AcquisitionError> {
    let mut device = v4l::Device::with_path(&self.device_path).map_err(v4l_error)?;
    let format = device.format().map_err(v4l_error)?;

    let mut stream =
      v4l::io::mmap::Stream::with_buffers(&mut device, v4l::buffer::Type::VideoCapture, 4)
        .map_err(v4l_error)?;

    for _ in 0..self.skip_frames {
      stream.next().map_err(v4l_error)?;
    }
    let (buf, meta) = stream.next().map_err(v4l_error)?;
    let used = (meta.bytesused as usize).min(buf.len());
    let data = &buf[..used];
    debug!("抓取一帧: {} 字节, 格式 {}", used, format.fourcc);

    let width = format.width;
    let height = format.height;
    let image = match &format.fourcc.repr {
      b"MJPG" => {
        std::fs::write(target.file(), data).map_err(|source| AcquisitionError::CacheFile {
          path: target.file().to_path_buf(),
          source,
        })?;
        return Ok(true);
      }
      b"RGB3" => RgbImage::from_raw(width, height, data.to_vec()),
      b"YUYV" => yuyv_to_rgb(data, width, height),
      _ => {
        return Err(AcquisitionError::Camera(format!(
          "unsupported pixel format: {}",
          format.fourcc
        )));
      }
    }
    .ok_or_else(|| AcquisitionError::Camera("captured buffer size mismatch".to_string()))?;

    image
      .save_with_format(target.file(), ImageFormat::Jpeg)
      .map_err(|e| AcquisitionError::Camera(e.to_string()))?;
    Ok(true)
  }
}

fn clamp(value: f32) -> u8 {
  value.round().clamp(0.0, 255.0) as u8
}

/// YUYV 4:2:2 转 RGB（BT.601）
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
  let pixels = width as usize * height as usize;
  if width % 2 != 0 || data.len() < pixels * 2 {
    return None;
  }

  let mut rgb = Vec::with_capacity(pixels * 3);
  for chunk in data[..pixels * 2].chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      rgb.push(clamp(y + 1.402 * v));
      rgb.push(clamp(y - 0.344_136 * u - 0.714_136 * v));
      rgb.push(clamp(y + 1.772 * u));
    }
  }
  RgbImage::from_raw(width, height, rgb)
}
