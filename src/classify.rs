// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/classify.rs - 分类引擎
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

use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  frame::OutputScores,
  model::{DiseaseLabel, InferenceError, LoadError, Model},
  preprocess::{PreprocessError, Preprocessor},
};

#[derive(Error, Debug)]
pub enum ClassificationError {
  #[error("预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("模型输出中没有可比较的分数")]
  NoScores,
  #[error("模型输出 {actual} 个分数, 标签表长度为 {expected}")]
  LabelMismatch { expected: usize, actual: usize },
}

/// 分类结果，生成后不可修改
///
/// `confidence` 为最大下标处的原始分数，未经过 softmax。
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
  label: DiseaseLabel,
  confidence: f32,
  scores: OutputScores,
}

impl ClassificationResult {
  pub fn label(&self) -> DiseaseLabel {
    self.label
  }

  pub fn label_str(&self) -> &'static str {
    self.label.as_str()
  }

  pub fn class_index(&self) -> usize {
    self.label.index()
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  pub fn scores(&self) -> &OutputScores {
    &self.scores
  }
}

/// 第一个最大值所在下标
///
/// 并列时取下标最小者；NaN 永远不会被选中。
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
  let mut best: Option<(usize, f32)> = None;
  for (index, &score) in scores.iter().enumerate() {
    if score.is_nan() {
      continue;
    }
    match best {
      Some((_, max)) if score <= max => {}
      _ => best = Some((index, score)),
    }
  }
  best
}

/// 将原始输出分数映射为带标签的结果
pub fn interpret(scores: OutputScores) -> Result<ClassificationResult, ClassificationError> {
  if scores.len() != DiseaseLabel::COUNT {
    return Err(ClassificationError::LabelMismatch {
      expected: DiseaseLabel::COUNT,
      actual: scores.len(),
    });
  }

  let (index, confidence) = argmax(scores.as_slice()).ok_or(ClassificationError::NoScores)?;
  let label = DiseaseLabel::from_index(index).ok_or(ClassificationError::LabelMismatch {
    expected: DiseaseLabel::COUNT,
    actual: scores.len(),
  })?;

  Ok(ClassificationResult {
    label,
    confidence,
    scores,
  })
}

/// 预处理 + 推理 + 结果解释
pub struct Classifier<M> {
  model: M,
  preprocessor: Preprocessor,
}

impl<M: Model> Classifier<M> {
  /// 模型输出类别数必须与标签表长度一致
  pub fn new(model: M) -> Result<Self, LoadError> {
    let classes = model.output_shape().volume();
    if classes != DiseaseLabel::COUNT {
      error!(
        "模型输出类别数 {} 与标签表长度 {} 不一致",
        classes,
        DiseaseLabel::COUNT
      );
      return Err(LoadError::LabelMismatch {
        expected: DiseaseLabel::COUNT,
        actual: classes,
      });
    }

    Ok(Self {
      model,
      preprocessor: Preprocessor::default(),
    })
  }

  pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
    self.preprocessor = preprocessor;
    self
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn classify(&self, image: &DynamicImage) -> Result<ClassificationResult, ClassificationError> {
    let now = std::time::Instant::now();
    let tensor = self
      .preprocessor
      .preprocess(image, self.model.input_shape())?;
    debug!("预处理完成，耗时: {:.2?}", now.elapsed());

    let scores = self.model.infer(&tensor)?;
    debug!("模型输出分数: {:?}", scores.as_slice());

    let result = interpret(scores)?;
    info!(
      "分类完成: {} ({:.4})，耗时: {:.2?}",
      result.label(),
      result.confidence(),
      now.elapsed()
    );
    Ok(result)
  }

  /// 解码编码后的图像数据再分类
  pub fn classify_bytes(&self, bytes: &[u8]) -> Result<ClassificationResult, ClassificationError> {
    let image = crate::preprocess::decode(bytes)?;
    self.classify(&image)
  }
}
