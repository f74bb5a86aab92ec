// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/frame.rs - NHWC 输入张量与输出分数定义
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

use std::fmt;

pub const RGB_CHANNELS: usize = 3;

/// 张量形状描述，加载模型时确定，之后不再变化
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
  dims: Box<[usize]>,
}

impl Shape {
  pub fn new(dims: impl Into<Box<[usize]>>) -> Self {
    Self { dims: dims.into() }
  }

  /// `[1, height, width, 3]`
  pub fn nhwc(height: usize, width: usize) -> Self {
    Self::new(vec![1, height, width, RGB_CHANNELS])
  }

  pub fn dims(&self) -> &[usize] {
    &self.dims
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  /// 元素总数
  pub fn volume(&self) -> usize {
    self.dims.iter().product()
  }

  /// 若形状为单批次 RGB NHWC，返回 `(height, width)`
  pub fn nhwc_spatial(&self) -> Option<(usize, usize)> {
    match self.dims() {
      &[1, height, width, RGB_CHANNELS] if height > 0 && width > 0 => Some((height, width)),
      _ => None,
    }
  }
}

impl From<&[usize]> for Shape {
  fn from(dims: &[usize]) -> Self {
    Self::new(dims.to_vec())
  }
}

impl fmt::Display for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, dim) in self.dims.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", dim)?;
    }
    write!(f, "]")
  }
}

/// 模型输入张量：按行优先、通道交错（NHWC）排列的 f32 缓冲区
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  shape: Shape,
  data: Box<[f32]>,
}

impl InputTensor {
  /// 长度与形状不一致属于编程错误，直接 panic
  pub fn new(shape: Shape, data: Vec<f32>) -> Self {
    if data.len() != shape.volume() {
      panic!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        shape.volume(),
        data.len()
      );
    }

    Self {
      shape,
      data: data.into_boxed_slice(),
    }
  }

  pub fn zeros(shape: Shape) -> Self {
    let data = vec![0f32; shape.volume()].into_boxed_slice();
    Self { shape, data }
  }

  pub fn shape(&self) -> &Shape {
    &self.shape
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

impl AsRef<[f32]> for InputTensor {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

/// 模型输出分数，下标与标签表一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScores {
  scores: Box<[f32]>,
}

impl OutputScores {
  pub fn as_slice(&self) -> &[f32] {
    &self.scores
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<f32> {
    self.scores.get(index).copied()
  }
}

impl From<Vec<f32>> for OutputScores {
  fn from(scores: Vec<f32>) -> Self {
    Self {
      scores: scores.into_boxed_slice(),
    }
  }
}

impl AsRef<[f32]> for OutputScores {
  fn as_ref(&self) -> &[f32] {
    &self.scores
  }
}
