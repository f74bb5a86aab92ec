// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/model.rs - 模型
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

use serde::Serialize;
use thiserror::Error;

use crate::frame::{InputTensor, OutputScores, Shape};

/// 已加载模型的推理接口
///
/// 实现者在加载后只读，`infer` 不得修改模型状态。
pub trait Model {
  fn input_shape(&self) -> &Shape;
  fn output_shape(&self) -> &Shape;
  fn infer(&self, input: &InputTensor) -> Result<OutputScores, InferenceError>;
}

impl<M: Model + ?Sized> Model for std::sync::Arc<M> {
  fn input_shape(&self) -> &Shape {
    (**self).input_shape()
  }

  fn output_shape(&self) -> &Shape {
    (**self).output_shape()
  }

  fn infer(&self, input: &InputTensor) -> Result<OutputScores, InferenceError> {
    (**self).infer(input)
  }
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  InvalidModel(anyhow::Error),
  #[error("模型张量形状无法读取: {0}")]
  ShapeUnavailable(String),
  #[error("模型输出类别数 {actual} 与标签表长度 {expected} 不一致")]
  LabelMismatch { expected: usize, actual: usize },
  #[error("推理线程数必须大于 0")]
  InvalidThreads,
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入张量形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch { expected: Shape, actual: Shape },
  #[error("输出张量大小不匹配: 期望 {expected} 个元素, 实际 {actual} 个")]
  OutputMismatch { expected: usize, actual: usize },
  #[error("推理执行失败: {0}")]
  Execution(anyhow::Error),
}

/// 标签表：变体顺序即模型输出下标
///
/// 标签与类别数放在同一个类型里，调整顺序必须同时修改 `ALL`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiseaseLabel {
  #[serde(rename = "Lumpy Skin Disease")]
  LumpySkinDisease,
  #[serde(rename = "Foot and Mouth Disease")]
  FootAndMouthDisease,
  #[serde(rename = "Healthy")]
  Healthy,
}

impl DiseaseLabel {
  pub const ALL: [DiseaseLabel; 3] = [
    DiseaseLabel::LumpySkinDisease,
    DiseaseLabel::FootAndMouthDisease,
    DiseaseLabel::Healthy,
  ];

  /// 模型输出类别数 K
  pub const COUNT: usize = Self::ALL.len();

  pub fn from_index(index: usize) -> Option<Self> {
    Self::ALL.get(index).copied()
  }

  pub fn index(&self) -> usize {
    *self as usize
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      DiseaseLabel::LumpySkinDisease => "Lumpy Skin Disease",
      DiseaseLabel::FootAndMouthDisease => "Foot and Mouth Disease",
      DiseaseLabel::Healthy => "Healthy",
    }
  }
}

impl fmt::Display for DiseaseLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

mod tract_runtime;
pub use self::tract_runtime::{
  DEFAULT_INPUT_SHAPE, DEFAULT_THREADS, RuntimeOptions, TractRuntime, TractRuntimeBuilder,
};
