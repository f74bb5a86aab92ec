// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/model/tract_runtime.rs - 基于 tract 的 ONNX 推理运行时
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
use std::path::PathBuf;

use tracing::{debug, error, info};
use tract_onnx::prelude::multithread::{Executor, multithread_tract_scope};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{InputTensor, OutputScores, Shape},
  model::{InferenceError, LoadError, Model},
};

const RUNTIME_NUM_INPUTS: usize = 1;
const RUNTIME_NUM_OUTPUTS: usize = 1;

pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_INPUT_SHAPE: [usize; 4] = [1, 256, 256, 3];

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// 运行时加载选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
  /// 推理线程数
  pub threads: usize,
  /// 固定输入形状；导出的图中批次维度为符号时需要
  pub input_shape: Option<Shape>,
}

impl Default for RuntimeOptions {
  fn default() -> Self {
    Self {
      threads: DEFAULT_THREADS,
      input_shape: Some(Shape::new(DEFAULT_INPUT_SHAPE.to_vec())),
    }
  }
}

/// 已加载的模型与其执行计划，加载完成后只读
pub struct TractRuntime {
  plan: Plan,
  input_shape: Shape,
  output_shape: Shape,
  threads: usize,
  executor: Executor,
}

impl std::fmt::Debug for TractRuntime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TractRuntime")
      .field("input_shape", &self.input_shape)
      .field("output_shape", &self.output_shape)
      .field("threads", &self.threads)
      .finish_non_exhaustive()
  }
}

fn concrete_shape(fact: TractResult<&TypedFact>, what: &str) -> Result<Shape, LoadError> {
  let fact = fact.map_err(|e| LoadError::ShapeUnavailable(format!("{}张量不存在: {}", what, e)))?;
  if fact.datum_type != f32::datum_type() {
    return Err(LoadError::ShapeUnavailable(format!(
      "{}张量类型为 {:?}, 期望 f32",
      what, fact.datum_type
    )));
  }
  fact
    .shape
    .as_concrete()
    .map(Shape::from)
    .ok_or_else(|| LoadError::ShapeUnavailable(format!("{}张量形状不是常量: {:?}", what, fact.shape)))
}

impl TractRuntime {
  /// 从内存中的模型字节加载
  pub fn load(model_bytes: &[u8], options: &RuntimeOptions) -> Result<Self, LoadError> {
    if options.threads == 0 {
      return Err(LoadError::InvalidThreads);
    }

    info!("解析 ONNX 模型");
    let mut model = tract_onnx::onnx()
      .model_for_read(&mut Cursor::new(model_bytes))
      .map_err(LoadError::InvalidModel)?;

    if let Some(shape) = &options.input_shape {
      debug!("固定模型输入形状: {}", shape);
      model = model
        .with_input_fact(
          0,
          InferenceFact::dt_shape(f32::datum_type(), shape.dims().to_vec()),
        )
        .map_err(LoadError::InvalidModel)?;
    }

    info!("优化模型计算图");
    let typed = model.into_optimized().map_err(LoadError::InvalidModel)?;

    let num_inputs = typed.inputs.len();
    let num_outputs = typed.outputs.len();
    if num_inputs != RUNTIME_NUM_INPUTS || num_outputs != RUNTIME_NUM_OUTPUTS {
      error!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RUNTIME_NUM_INPUTS, RUNTIME_NUM_OUTPUTS, num_inputs, num_outputs
      );
      return Err(LoadError::ShapeUnavailable(format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RUNTIME_NUM_INPUTS, RUNTIME_NUM_OUTPUTS, num_inputs, num_outputs
      )));
    }

    let input_shape = concrete_shape(typed.input_fact(0), "输入")?;
    let output_shape = concrete_shape(typed.output_fact(0), "输出")?;

    if input_shape.nhwc_spatial().is_none() {
      error!("模型输入形状 {} 不是 [1, H, W, 3]", input_shape);
      return Err(LoadError::ShapeUnavailable(format!(
        "输入形状 {} 不是 [1, H, W, 3]",
        input_shape
      )));
    }
    if output_shape.rank() != 2 || output_shape.dims()[0] != 1 {
      error!("模型输出形状 {} 不是 [1, K]", output_shape);
      return Err(LoadError::ShapeUnavailable(format!(
        "输出形状 {} 不是 [1, K]",
        output_shape
      )));
    }

    let plan = typed.into_runnable().map_err(LoadError::InvalidModel)?;
    let executor = match options.threads {
      1 => Executor::SingleThread,
      n => Executor::multithread_with_name(n, "nassa-infer"),
    };

    info!(
      "模型加载完成\n输入形状: {}\n输出形状: {}\n线程数: {}",
      input_shape, output_shape, options.threads
    );

    Ok(TractRuntime {
      plan,
      input_shape,
      output_shape,
      threads: options.threads,
      executor,
    })
  }

  pub fn threads(&self) -> usize {
    self.threads
  }
}

impl Model for TractRuntime {
  fn input_shape(&self) -> &Shape {
    &self.input_shape
  }

  fn output_shape(&self) -> &Shape {
    &self.output_shape
  }

  fn infer(&self, input: &InputTensor) -> Result<OutputScores, InferenceError> {
    if input.shape() != &self.input_shape {
      error!(
        "输入张量形状不匹配: 期望 {}, 实际 {}",
        self.input_shape,
        input.shape()
      );
      return Err(InferenceError::ShapeMismatch {
        expected: self.input_shape.clone(),
        actual: input.shape().clone(),
      });
    }

    debug!("设置模型输入");
    let tensor = Tensor::from_shape(self.input_shape.dims(), input.as_slice())
      .map_err(InferenceError::Execution)?;

    debug!("执行模型推理");
    // 线程池只作用于本次调用
    let outputs = multithread_tract_scope(self.executor.clone(), || {
      self.plan.run(tvec!(tensor.into()))
    })
    .map_err(InferenceError::Execution)?;

    debug!("获取模型输出");
    let output = outputs.first().ok_or(InferenceError::OutputMismatch {
      expected: self.output_shape.volume(),
      actual: 0,
    })?;
    let view = output
      .to_array_view::<f32>()
      .map_err(InferenceError::Execution)?;
    let scores: Vec<f32> = view.iter().copied().collect();

    if scores.len() != self.output_shape.volume() {
      return Err(InferenceError::OutputMismatch {
        expected: self.output_shape.volume(),
        actual: scores.len(),
      });
    }

    Ok(OutputScores::from(scores))
  }
}

/// 从 `onnx:///path/model.onnx?threads=4&shape=1x256x256x3` 构建运行时
#[derive(Debug, Clone)]
pub struct TractRuntimeBuilder {
  model_path: PathBuf,
  options: RuntimeOptions,
}

impl FromUrlWithScheme for TractRuntimeBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_shape(value: &str) -> Result<Shape, LoadError> {
  let dims = value
    .split('x')
    .map(|d| d.trim().parse::<usize>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| LoadError::ModelPathError(format!("无法解析输入形状 '{}': {}", value, e)))?;
  Ok(Shape::new(dims))
}

impl FromUrl for TractRuntimeBuilder {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LoadError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut options = RuntimeOptions::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "threads" => {
          options.threads = value.parse().map_err(|e| {
            LoadError::ModelPathError(format!("无法解析线程数 '{}': {}", value, e))
          })?;
        }
        "shape" if value == "auto" => options.input_shape = None,
        "shape" => options.input_shape = Some(parse_shape(&value)?),
        _ => debug!("忽略未知模型参数: {}={}", key, value),
      }
    }

    Ok(TractRuntimeBuilder {
      model_path: PathBuf::from(url.path()),
      options,
    })
  }
}

impl TractRuntimeBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      options: RuntimeOptions::default(),
    }
  }

  pub fn threads(mut self, threads: usize) -> Self {
    self.options.threads = threads;
    self
  }

  pub fn input_shape(mut self, shape: Option<Shape>) -> Self {
    self.options.input_shape = shape;
    self
  }

  pub fn options(&self) -> &RuntimeOptions {
    &self.options
  }

  pub fn build(self) -> Result<TractRuntime, LoadError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    TractRuntime::load(&model_data, &self.options)
  }
}
