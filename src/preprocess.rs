// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/preprocess.rs - 图像预处理
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

use std::io::Cursor;

use image::{DynamicImage, ImageReader, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

use crate::frame::{InputTensor, RGB_CHANNELS, Shape};

/// 像素归一化除数，得到 `[0, 1]` 区间
const NORMALIZE_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
  #[error("图像 I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像尺寸为空: {width}x{height}")]
  EmptyImage { width: u32, height: u32 },
  #[error("不支持的输入形状 {0}, 期望 [1, H, W, 3]")]
  UnsupportedShape(Shape),
}

/// 从内存中的编码数据解码图像，格式由内容推断
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .decode()?;
  debug!("图像解码完成: {}x{}", image.width(), image.height());
  Ok(image)
}

/// 将任意尺寸的图像转换为模型输入张量
///
/// 先统一为 RGBA8，再拉伸缩放到目标尺寸（不保持宽高比），
/// 丢弃 alpha 通道后逐通道除以 255，按 NHWC 顺序写入。
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
  filter: FilterType,
}

impl Default for Preprocessor {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
    }
  }
}

impl Preprocessor {
  pub fn with_filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }

  pub fn preprocess(
    &self,
    image: &DynamicImage,
    target: &Shape,
  ) -> Result<InputTensor, PreprocessError> {
    let (height, width) = target
      .nhwc_spatial()
      .ok_or_else(|| PreprocessError::UnsupportedShape(target.clone()))?;

    if image.width() == 0 || image.height() == 0 {
      return Err(PreprocessError::EmptyImage {
        width: image.width(),
        height: image.height(),
      });
    }

    let rgba = image.to_rgba8();
    let resized = image::imageops::resize(&rgba, width as u32, height as u32, self.filter);
    debug!(
      "图像缩放: {}x{} -> {}x{}",
      image.width(),
      image.height(),
      width,
      height
    );

    let mut data = Vec::with_capacity(height * width * RGB_CHANNELS);
    for pixel in resized.pixels() {
      let [r, g, b, _alpha] = pixel.0;
      data.push(r as f32 / NORMALIZE_SCALE);
      data.push(g as f32 / NORMALIZE_SCALE);
      data.push(b as f32 / NORMALIZE_SCALE);
    }

    Ok(InputTensor::new(target.clone(), data))
  }

  /// 解码并预处理
  pub fn preprocess_bytes(
    &self,
    bytes: &[u8],
    target: &Shape,
  ) -> Result<InputTensor, PreprocessError> {
    let image = decode(bytes)?;
    self.preprocess(&image, target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

  fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
      Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
    }))
  }

  #[test]
  fn produces_declared_volume_for_non_square_input() {
    let shape = Shape::nhwc(256, 256);
    let tensor = Preprocessor::default()
      .preprocess(&gradient(640, 120), &shape)
      .unwrap();
    assert_eq!(tensor.shape(), &shape);
    assert_eq!(tensor.len(), 256 * 256 * 3);
  }

  #[test]
  fn values_stay_in_unit_range() {
    let tensor = Preprocessor::default()
      .preprocess(&gradient(300, 200), &Shape::nhwc(64, 64))
      .unwrap();
    assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
  }

  #[test]
  fn repeated_calls_are_bit_identical() {
    let image = gradient(123, 77);
    let shape = Shape::nhwc(32, 48);
    let first = Preprocessor::default().preprocess(&image, &shape).unwrap();
    let second = Preprocessor::default().preprocess(&image, &shape).unwrap();
    let first_bits: Vec<u32> = first.as_slice().iter().map(|v| v.to_bits()).collect();
    let second_bits: Vec<u32> = second.as_slice().iter().map(|v| v.to_bits()).collect();
    assert_eq!(first_bits, second_bits);
  }

  #[test]
  fn uniform_color_is_divided_by_255_and_alpha_dropped() {
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 30, Rgba([255, 0, 51, 255])));
    let tensor = Preprocessor::default()
      .preprocess(&image, &Shape::nhwc(4, 4))
      .unwrap();
    for pixel in tensor.as_slice().chunks(3) {
      assert_eq!(pixel, &[1.0, 0.0, 51.0 / 255.0]);
    }
  }

  #[test]
  fn layout_is_row_major_channel_interleaved() {
    let image = DynamicImage::ImageRgb8(RgbImage::from_fn(2, 2, |x, y| {
      Rgb([(x * 100) as u8, (y * 100) as u8, 7])
    }));
    let tensor = Preprocessor::default()
      .with_filter(FilterType::Nearest)
      .preprocess(&image, &Shape::nhwc(2, 2))
      .unwrap();
    let expected: Vec<f32> = [
      [0u8, 0, 7],
      [100, 0, 7],
      [0, 100, 7],
      [100, 100, 7],
    ]
    .iter()
    .flatten()
    .map(|v| *v as f32 / 255.0)
    .collect();
    assert_eq!(tensor.as_slice(), expected.as_slice());
  }

  #[test]
  fn corrupt_bytes_are_a_decode_error() {
    let result = Preprocessor::default()
      .preprocess_bytes(b"\x89PNG\r\n\x1a\nnot really", &Shape::nhwc(8, 8));
    assert!(matches!(result, Err(PreprocessError::Decode(_))));
  }

  #[test]
  fn encoded_png_round_trips_through_decode() {
    let mut bytes = Vec::new();
    gradient(16, 9)
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
      .unwrap();
    let tensor = Preprocessor::default()
      .preprocess_bytes(&bytes, &Shape::nhwc(8, 8))
      .unwrap();
    assert_eq!(tensor.len(), 8 * 8 * 3);
  }

  #[test]
  fn empty_image_is_rejected() {
    let image = DynamicImage::new_rgb8(0, 0);
    assert!(matches!(
      Preprocessor::default().preprocess(&image, &Shape::nhwc(8, 8)),
      Err(PreprocessError::EmptyImage { .. })
    ));
  }

  #[test]
  fn non_nhwc_target_is_rejected() {
    assert!(matches!(
      Preprocessor::default().preprocess(&gradient(4, 4), &Shape::new(vec![1, 3, 8, 8])),
      Err(PreprocessError::UnsupportedShape(_))
    ));
  }
}
