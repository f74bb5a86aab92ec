// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/bin/session.rs - 交互式诊断会话
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

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use image::DynamicImage;
use tracing::{error, info, warn};
use url::Url;

use nassa::{
  FromUrl,
  acquisition::{
    AcquisitionMachine, AcquisitionState, CaptureTargetAllocator, ContentProvider, Effect,
    ImageResolver, Permission, Platform, RetentionPolicy, Source,
  },
  classify::Classifier,
  model::TractRuntimeBuilder,
  output::{OutputWrapper, Render, Sample},
  qa::{FaqBook, Transcript},
  task::{ClassificationState, ClassificationWorker},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Retention {
  KeepAll,
  DiscardUnused,
}

impl From<Retention> for RetentionPolicy {
  fn from(value: Retention) -> Self {
    match value {
      Retention::KeepAll => RetentionPolicy::KeepAll,
      Retention::DiscardUnused => RetentionPolicy::DiscardUnused,
    }
  }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
  Camera,
  ReadImages,
}

impl From<Grant> for Permission {
  fn from(value: Grant) -> Self {
    match value {
      Grant::Camera => Permission::Camera,
      Grant::ReadImages => Permission::ReadImages,
    }
  }
}

/// Nassa 交互式诊断会话
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// ONNX 模型，例如 onnx:///models/cattle.onnx?threads=4
  #[arg(long, value_name = "MODEL")]
  model: Url,

  /// 推理线程数，覆盖模型 URI 中的 threads
  #[arg(long, value_name = "THREADS")]
  threads: Option<usize>,

  /// 拍照目标文件所在的缓存目录
  #[arg(long, value_name = "DIR")]
  cache_dir: Option<PathBuf>,

  /// 共享 URI 的 authority
  #[arg(long, value_name = "AUTHORITY", default_value = "nassa.provider")]
  authority: String,

  /// 被替换的拍照目标如何处理
  #[arg(long, value_enum, default_value = "keep-all")]
  retention: Retention,

  /// 启动时已授予的权限
  #[arg(long, value_enum, value_delimiter = ',')]
  grant: Vec<Grant>,

  /// FAQ 数据（JSON）
  #[arg(long, value_name = "FILE")]
  faq: Option<PathBuf>,

  /// 输出：stdout:、json:///path 或 folder:///path
  #[arg(long, value_name = "OUTPUT", default_value = "stdout:")]
  output: Url,

  /// V4L 相机，例如 v4l:///dev/video0
  #[cfg(feature = "v4l_camera")]
  #[arg(long, value_name = "CAMERA")]
  camera: Option<Url>,
}

/// 用户已授予的权限
#[derive(Debug, Default)]
struct Grants(HashSet<Permission>);

impl Platform for Grants {
  fn is_granted(&self, permission: Permission) -> bool {
    self.0.contains(&permission)
  }
}

const HELP: &str = "\
commands:
  camera            拍照
  capture <file>    将 <file> 作为相机拍摄的照片
  cancel            取消拍照
  gallery           从相册选择
  pick <file>       选择相册中的 <file>
  grant | deny      回应权限请求
  analyze           诊断已选择的图像
  wait              等待诊断结果
  ask <question>    查询 FAQ
  status            查看当前状态
  quit";

struct Session {
  machine: AcquisitionMachine<ContentProvider>,
  grants: Grants,
  worker: ClassificationWorker,
  classification: ClassificationState,
  analyzing: Option<(Url, DynamicImage)>,
  output: OutputWrapper,
  faq: FaqBook,
  transcript: Transcript,
  #[cfg(feature = "v4l_camera")]
  camera: Option<nassa::acquisition::V4lCamera>,
}

impl Session {
  fn describe(effect: &Effect) {
    match effect {
      Effect::RequestPermission(permission) => {
        println!("需要 {:?} 权限，输入 grant 或 deny", permission)
      }
      Effect::PermissionDenied(permission) => println!("{:?} 权限被拒绝", permission),
      Effect::LaunchCamera(uri) => println!("相机已启动，目标: {}", uri),
      Effect::LaunchGallery => println!("相册已打开，输入 pick <file>"),
      Effect::ImageSelected(uri) => println!("已选择图像: {}", uri),
      Effect::None => {}
    }
  }

  fn camera(&mut self) -> Result<Effect> {
    #[cfg(feature = "v4l_camera")]
    if let Some(camera) = self.camera.as_mut() {
      return Ok(self.machine.capture_with(camera, &self.grants)?);
    }
    Ok(self.machine.request(Source::Camera, &self.grants)?)
  }

  /// 模拟相机将照片写入目标文件
  fn capture(&mut self, photo: &Path) -> Result<Effect> {
    let AcquisitionState::ReadyToCapture(target) = self.machine.state() else {
      return Err(anyhow!("相机未启动"));
    };
    let written = std::fs::copy(photo, target.file());
    if let Err(e) = written {
      self.machine.capture_completed(false)?;
      return Err(e).with_context(|| format!("无法读取照片 {}", photo.display()));
    }
    Ok(self.machine.capture_completed(true)?)
  }

  fn respond(&mut self, granted: bool) -> Result<Effect> {
    if let AcquisitionState::AwaitingPermission(source) = self.machine.state() {
      if granted {
        self.grants.0.insert(source.permission());
      }
    }
    Ok(self.machine.permission_result(granted)?)
  }

  fn analyze(&mut self) -> Result<()> {
    if self.classification.is_pending() {
      return Err(anyhow!("上一次诊断尚未完成"));
    }
    let uri = self
      .machine
      .selected()
      .cloned()
      .ok_or_else(|| anyhow!("尚未选择图像"))?;

    let image = ImageResolver::with_provider(self.machine.allocator().provider()).load(&uri)?;
    let pending = self.worker.submit(image.clone())?;
    info!("诊断请求 #{} 已提交: {}", pending.id(), uri);
    self.classification = ClassificationState::Pending(pending);
    self.analyzing = Some((uri, image));
    println!("正在诊断...");
    Ok(())
  }

  /// 诊断完成时输出结果
  fn report(&mut self) {
    match &self.classification {
      ClassificationState::Done(result) => {
        if let Some((uri, image)) = self.analyzing.take() {
          if let Err(e) = self
            .output
            .render_result(&Sample::new(&uri, &image), result)
          {
            error!("输出结果失败: {}", e);
          }
        }
        println!("诊断结果: {} ({:.4})", result.label(), result.confidence());
      }
      ClassificationState::Failed(e) => {
        self.analyzing = None;
        println!("诊断失败: {}", e);
      }
      ClassificationState::Aborted(e) => {
        self.analyzing = None;
        println!("诊断中止: {}", e);
      }
      _ => {}
    }
  }

  fn poll(&mut self) {
    if self.classification.poll() {
      self.report();
    }
  }

  fn status(&self) {
    println!("获取状态: {}", self.machine.state().name());
    if let Some(uri) = self.machine.selected() {
      println!("已选择图像: {}", uri);
    }
    let classification = match &self.classification {
      ClassificationState::NotRequested => "未请求".to_string(),
      ClassificationState::Pending(pending) => format!("进行中 #{}", pending.id()),
      ClassificationState::Done(result) => {
        format!("{} ({:.4})", result.label(), result.confidence())
      }
      ClassificationState::Failed(e) => format!("失败: {}", e),
      ClassificationState::Aborted(e) => format!("中止: {}", e),
    };
    println!("诊断状态: {}", classification);
  }

  /// 处理一行命令，返回是否继续
  fn handle(&mut self, line: &str) -> Result<bool> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let effect = match command {
      "" => return Ok(true),
      "camera" => self.camera()?,
      "capture" => self.capture(Path::new(rest))?,
      "cancel" => self.machine.capture_completed(false)?,
      "gallery" => self.machine.request(Source::Gallery, &self.grants)?,
      "pick" => {
        let path = std::fs::canonicalize(rest)
          .with_context(|| format!("无法访问 {}", rest))?;
        let uri = Url::from_file_path(&path).map_err(|_| anyhow!("无效路径 {}", rest))?;
        self.machine.gallery_picked(Some(uri))?
      }
      "grant" => self.respond(true)?,
      "deny" => self.respond(false)?,
      "analyze" => {
        self.analyze()?;
        Effect::None
      }
      "wait" => {
        if self.classification.is_pending() {
          self.classification.settle();
          self.report();
        }
        Effect::None
      }
      "ask" => {
        if let Some(reply) = self.transcript.ask_faq(rest, &self.faq) {
          println!("{}", reply.text);
        }
        Effect::None
      }
      "status" => {
        self.status();
        Effect::None
      }
      "quit" | "exit" => return Ok(false),
      _ => {
        println!("{}", HELP);
        Effect::None
      }
    };
    Self::describe(&effect);
    Ok(true)
  }

  fn close(mut self) {
    if self.classification.is_pending() {
      self.classification.settle();
      self.report();
    }
    self.worker.shutdown();
    self.machine.close();
  }
}

/// 逐行转发输入，读取出错或接收端关闭时停止
fn forward_lines(reader: impl BufRead, tx: &mpsc::Sender<String>) {
  for line in reader.lines() {
    let Ok(line) = line else {
      break;
    };
    if tx.send(line).is_err() {
      break;
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let cache_dir = args
    .cache_dir
    .clone()
    .unwrap_or_else(|| std::env::temp_dir().join("nassa"));
  info!("模型: {}", args.model);
  info!("缓存目录: {}", cache_dir.display());
  info!("输出: {}", args.output);

  let mut builder = TractRuntimeBuilder::from_url(&args.model)?;
  if let Some(threads) = args.threads {
    builder = builder.threads(threads);
  }
  let worker = ClassificationWorker::spawn(Classifier::new(Arc::new(builder.build()?))?)?;

  let provider = ContentProvider::new(args.authority.clone(), cache_dir.clone());
  let allocator = CaptureTargetAllocator::new(cache_dir, provider)
    .with_retention(args.retention.into());
  let machine = AcquisitionMachine::new(allocator)?;

  let faq = match &args.faq {
    Some(path) => FaqBook::load(path)?,
    None => FaqBook::default(),
  };

  let mut session = Session {
    machine,
    grants: Grants(args.grant.iter().map(|&g| g.into()).collect()),
    worker,
    classification: ClassificationState::default(),
    analyzing: None,
    output: OutputWrapper::from_url(&args.output)?,
    faq,
    transcript: Transcript::new(),
    #[cfg(feature = "v4l_camera")]
    camera: args
      .camera
      .as_ref()
      .map(nassa::acquisition::V4lCamera::from_url)
      .transpose()?,
  };

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::SeqCst);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
  }

  let (tx, rx) = mpsc::channel();
  thread::Builder::new()
    .name("nassa-stdin".to_string())
    .spawn(move || forward_lines(std::io::stdin().lock(), &tx))?;

  println!("{}", HELP);
  while !stop.load(Ordering::SeqCst) {
    session.poll();
    match rx.recv_timeout(Duration::from_millis(100)) {
      Ok(line) => match session.handle(&line) {
        Ok(true) => {}
        Ok(false) => break,
        Err(e) => {
          warn!("命令 '{}' 失败: {:#}", line.trim(), e);
          println!("错误: {:#}", e);
        }
      },
      Err(mpsc::RecvTimeoutError::Timeout) => {}
      Err(mpsc::RecvTimeoutError::Disconnected) => break,
    }
  }

  info!("会话结束");
  session.close();
  Ok(())
}
