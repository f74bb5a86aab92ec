//! 端到端诊断流程：获取 -> 读取 -> 工作线程分类 -> 输出

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, RgbImage};
use url::Url;

use nassa::{
  FromUrl,
  acquisition::{
    AcquisitionMachine, CaptureTargetAllocator, ContentProvider, Effect, ImageResolver,
    Permission, Platform, Source, SourceError,
  },
  classify::{ClassificationError, Classifier},
  frame::{InputTensor, OutputScores, Shape},
  model::{
    DiseaseLabel, InferenceError, LoadError, Model, RuntimeOptions, TractRuntime,
    TractRuntimeBuilder,
  },
  output::{OutputWrapper, Render, Sample},
  preprocess::PreprocessError,
  task::{ClassificationState, ClassificationWorker},
};

struct ScriptedModel {
  input: Shape,
  output: Shape,
  scores: Vec<f32>,
  calls: AtomicUsize,
}

impl ScriptedModel {
  fn new(scores: &[f32]) -> Self {
    Self {
      input: Shape::nhwc(8, 8),
      output: Shape::new(vec![1, scores.len()]),
      scores: scores.to_vec(),
      calls: AtomicUsize::new(0),
    }
  }
}

impl Model for ScriptedModel {
  fn input_shape(&self) -> &Shape {
    &self.input
  }

  fn output_shape(&self) -> &Shape {
    &self.output
  }

  fn infer(&self, input: &InputTensor) -> Result<OutputScores, InferenceError> {
    if input.shape() != &self.input {
      return Err(InferenceError::ShapeMismatch {
        expected: self.input.clone(),
        actual: input.shape().clone(),
      });
    }
    assert!(input.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    self.calls.fetch_add(1, Ordering::SeqCst);
    Ok(OutputScores::from(self.scores.clone()))
  }
}

struct AllGranted;

impl Platform for AllGranted {
  fn is_granted(&self, _permission: Permission) -> bool {
    true
  }
}

fn photo() -> RgbImage {
  RgbImage::from_fn(32, 24, |x, y| image::Rgb([(x * 8) as u8, (y * 10) as u8, 90]))
}

#[test]
fn captured_photo_is_diagnosed_through_content_uri() {
  let cache = tempfile::tempdir().unwrap();
  let provider = ContentProvider::new("nassa.provider", cache.path());
  let allocator = CaptureTargetAllocator::new(cache.path(), provider);
  let mut machine = AcquisitionMachine::new(allocator).unwrap();

  let Effect::LaunchCamera(uri) = machine.request(Source::Camera, &AllGranted).unwrap() else {
    panic!("camera was not launched");
  };
  assert_eq!(uri.scheme(), "content");

  // 相机写入目标文件
  let file = machine.resolve(&uri).unwrap();
  photo().save_with_format(&file, ImageFormat::Jpeg).unwrap();
  assert_eq!(
    machine.capture_completed(true).unwrap(),
    Effect::ImageSelected(uri.clone())
  );

  let image = ImageResolver::with_provider(machine.allocator().provider())
    .load(machine.selected().unwrap())
    .unwrap();

  let model = Arc::new(ScriptedModel::new(&[0.1, 0.7, 0.2]));
  let mut worker = ClassificationWorker::spawn(Classifier::new(Arc::clone(&model)).unwrap()).unwrap();
  let mut state = ClassificationState::Pending(worker.submit(image).unwrap());
  state.settle();
  worker.shutdown();

  let result = state.result().unwrap();
  assert_eq!(result.label(), DiseaseLabel::FootAndMouthDisease);
  assert_eq!(result.label_str(), "Foot and Mouth Disease");
  assert_eq!(result.confidence(), 0.7);
  assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn tie_resolves_to_first_label_end_to_end() {
  let classifier = Classifier::new(ScriptedModel::new(&[0.5, 0.5, 0.0])).unwrap();
  let mut worker = ClassificationWorker::spawn(classifier).unwrap();
  let completion = worker
    .submit(DynamicImage::ImageRgb8(photo()))
    .unwrap()
    .wait()
    .unwrap();
  assert_eq!(completion.unwrap().label_str(), "Lumpy Skin Disease");
}

#[test]
fn corrupt_gallery_image_fails_before_inference() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("broken.png");
  std::fs::write(&path, b"\x89PNG not really").unwrap();
  let uri = Url::from_file_path(&path).unwrap();

  assert!(matches!(
    ImageResolver::new().load(&uri),
    Err(SourceError::Image(PreprocessError::Decode(_)))
  ));

  let model = Arc::new(ScriptedModel::new(&[0.2, 0.3, 0.5]));
  let classifier = Classifier::new(Arc::clone(&model)).unwrap();
  assert!(matches!(
    classifier.classify_bytes(&std::fs::read(&path).unwrap()),
    Err(ClassificationError::Preprocess(_))
  ));
  assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_classification_is_not_confused_with_not_requested() {
  let mut worker =
    ClassificationWorker::spawn(Classifier::new(ScriptedModel::new(&[1.0, 0.0, 0.0])).unwrap())
      .unwrap();

  let idle = ClassificationState::default();
  assert!(matches!(idle, ClassificationState::NotRequested));

  let mut failed = ClassificationState::Pending(worker.submit(DynamicImage::new_rgb8(0, 4)).unwrap());
  failed.settle();
  assert!(matches!(failed, ClassificationState::Failed(_)));
}

#[test]
fn results_are_written_to_json_output() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("results.jsonl");
  let output = OutputWrapper::from_url(&Url::parse(&format!("json://{}", path.display())).unwrap())
    .unwrap();

  let classifier = Classifier::new(ScriptedModel::new(&[0.05, 0.15, 0.8])).unwrap();
  let image = DynamicImage::ImageRgb8(photo());
  let source = Url::parse("image:///herd/cow-17.jpg").unwrap();
  let result = classifier.classify(&image).unwrap();
  output
    .render_result(&Sample::new(&source, &image), &result)
    .unwrap();

  let line = std::fs::read_to_string(&path).unwrap();
  let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
  assert_eq!(value["label"], "Healthy");
  assert_eq!(value["class_index"], 2);
  assert_eq!(value["source"], "image:///herd/cow-17.jpg");
}

#[test]
fn invalid_model_yields_no_runtime() {
  assert!(matches!(
    TractRuntime::load(b"definitely not onnx", &RuntimeOptions::default()),
    Err(LoadError::InvalidModel(_))
  ));

  let missing = Url::parse("onnx:///nonexistent/nassa/model.onnx").unwrap();
  assert!(matches!(
    TractRuntimeBuilder::from_url(&missing).unwrap().build(),
    Err(LoadError::Io(_))
  ));
}
