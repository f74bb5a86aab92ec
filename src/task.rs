// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/task.rs - 分类工作线程
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

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  classify::{ClassificationError, ClassificationResult, Classifier},
  model::Model,
};

pub type Completion = Result<ClassificationResult, ClassificationError>;

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("无法启动分类工作线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("分类工作线程已停止")]
  Stopped,
}

enum Reply {
  Channel(mpsc::Sender<Completion>),
  Callback(Box<dyn FnOnce(Completion) + Send>),
}

struct Job {
  id: u64,
  image: DynamicImage,
  reply: Reply,
}

/// 在独立线程上执行分类
///
/// 请求按提交顺序排队，同一时刻最多只有一个在执行。
pub struct ClassificationWorker {
  sender: Option<mpsc::Sender<Job>>,
  handle: Option<JoinHandle<()>>,
  next_id: u64,
}

impl ClassificationWorker {
  pub fn spawn<M>(classifier: Classifier<M>) -> Result<Self, WorkerError>
  where
    M: Model + Send + 'static,
  {
    let (tx, rx) = mpsc::channel::<Job>();

    let handle = thread::Builder::new()
      .name("nassa-classify".to_string())
      .spawn(move || {
        info!("分类工作线程已启动");
        for job in rx {
          debug!("开始处理分类请求 #{}", job.id);
          let now = std::time::Instant::now();
          let result = classifier.classify(&job.image);
          info!("分类请求 #{} 完成，耗时: {:.2?}", job.id, now.elapsed());

          match job.reply {
            Reply::Channel(tx) => {
              if tx.send(result).is_err() {
                warn!("分类请求 #{} 的接收方已丢弃结果", job.id);
              }
            }
            Reply::Callback(callback) => callback(result),
          }
        }
        info!("分类工作线程退出");
      })?;

    Ok(Self {
      sender: Some(tx),
      handle: Some(handle),
      next_id: 0,
    })
  }

  fn enqueue(&mut self, image: DynamicImage, reply: Reply) -> Result<u64, WorkerError> {
    let sender = self.sender.as_ref().ok_or(WorkerError::Stopped)?;
    self.next_id += 1;
    let id = self.next_id;
    sender
      .send(Job { id, image, reply })
      .map_err(|_| WorkerError::Stopped)?;
    debug!("分类请求 #{} 已入队", id);
    Ok(id)
  }

  /// 提交图像，返回等待结果的句柄
  pub fn submit(&mut self, image: DynamicImage) -> Result<Pending, WorkerError> {
    let (tx, rx) = mpsc::channel();
    let id = self.enqueue(image, Reply::Channel(tx))?;
    Ok(Pending { id, receiver: rx })
  }

  /// 提交图像，完成后在工作线程上调用 `callback`
  pub fn submit_with<F>(&mut self, image: DynamicImage, callback: F) -> Result<u64, WorkerError>
  where
    F: FnOnce(Completion) + Send + 'static,
  {
    self.enqueue(image, Reply::Callback(Box::new(callback)))
  }

  /// 停止接收新请求，等待已排队的请求处理完毕
  pub fn shutdown(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    drop(self.sender.take());
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("分类工作线程异常退出");
      }
    }
  }
}

impl Drop for ClassificationWorker {
  fn drop(&mut self) {
    self.stop();
  }
}

/// 单个分类请求的结果句柄
#[derive(Debug)]
pub struct Pending {
  id: u64,
  receiver: mpsc::Receiver<Completion>,
}

impl Pending {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// 阻塞直到结果可用
  pub fn wait(self) -> Result<Completion, WorkerError> {
    self.receiver.recv().map_err(|_| WorkerError::Stopped)
  }

  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Completion, WorkerError>> {
    match self.receiver.recv_timeout(timeout) {
      Ok(completion) => Some(Ok(completion)),
      Err(mpsc::RecvTimeoutError::Timeout) => None,
      Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(WorkerError::Stopped)),
    }
  }

  /// 非阻塞查询
  pub fn try_result(&self) -> Option<Result<Completion, WorkerError>> {
    match self.receiver.try_recv() {
      Ok(completion) => Some(Ok(completion)),
      Err(mpsc::TryRecvError::Empty) => None,
      Err(mpsc::TryRecvError::Disconnected) => Some(Err(WorkerError::Stopped)),
    }
  }
}

/// 调用方持有的分类状态
///
/// “尚未请求”与“失败”是不同的状态，不能都用空值表示。
#[derive(Debug, Default)]
pub enum ClassificationState {
  #[default]
  NotRequested,
  Pending(Pending),
  Done(ClassificationResult),
  Failed(ClassificationError),
  Aborted(WorkerError),
}

impl ClassificationState {
  /// 若请求已完成，推进到终止状态；返回状态是否发生变化
  pub fn poll(&mut self) -> bool {
    let ClassificationState::Pending(pending) = self else {
      return false;
    };

    let next = match pending.try_result() {
      None => return false,
      Some(Ok(Ok(result))) => ClassificationState::Done(result),
      Some(Ok(Err(e))) => ClassificationState::Failed(e),
      Some(Err(e)) => ClassificationState::Aborted(e),
    };
    *self = next;
    true
  }

  /// 阻塞直到请求完成
  pub fn settle(&mut self) {
    *self = match std::mem::take(self) {
      ClassificationState::Pending(pending) => match pending.wait() {
        Ok(Ok(result)) => ClassificationState::Done(result),
        Ok(Err(e)) => ClassificationState::Failed(e),
        Err(e) => ClassificationState::Aborted(e),
      },
      settled => settled,
    };
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, ClassificationState::Pending(_))
  }

  pub fn result(&self) -> Option<&ClassificationResult> {
    match self {
      ClassificationState::Done(result) => Some(result),
      _ => None,
    }
  }
}
