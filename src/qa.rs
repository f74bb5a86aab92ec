// 该文件是 Nassa （牛病诊断） 项目的一部分。
// src/qa.rs - 常见问题检索与对话记录
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const NO_ANSWER: &str = "Sorry, I couldn't find an answer for that.";
pub const CHAT_FAILURE: &str = "Oops! Something went wrong.";

#[derive(Error, Debug)]
pub enum QaError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("FAQ 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("对话模型错误: {0}")]
  Chat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faq {
  #[serde(rename = "Disease")]
  pub disease: String,
  #[serde(rename = "Question Number")]
  pub question_number: u32,
  #[serde(rename = "Question")]
  pub question: String,
  #[serde(rename = "Answer")]
  pub answer: String,
}

/// 第一个问题中包含 `query`（不区分大小写）的条目的答案
///
/// 空查询匹配第一个条目。
pub fn find_best_answer<'a>(query: &str, faqs: &'a [Faq]) -> &'a str {
  let needle = query.to_lowercase();
  faqs
    .iter()
    .find(|faq| faq.question.to_lowercase().contains(&needle))
    .map(|faq| faq.answer.as_str())
    .unwrap_or(NO_ANSWER)
}

#[derive(Debug, Clone, Default)]
pub struct FaqBook {
  entries: Vec<Faq>,
}

impl FaqBook {
  pub fn parse(json: &str) -> Result<Self, QaError> {
    let entries: Vec<Faq> = serde_json::from_str(json)?;
    Ok(Self { entries })
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, QaError> {
    let path = path.as_ref();
    let book = Self::parse(&std::fs::read_to_string(path)?)?;
    info!("加载 FAQ: {} 条 ({})", book.entries.len(), path.display());
    Ok(book)
  }

  pub fn entries(&self) -> &[Faq] {
    &self.entries
  }

  pub fn answer(&self, query: &str) -> &str {
    find_best_answer(query, &self.entries)
  }
}

impl From<Vec<Faq>> for FaqBook {
  fn from(entries: Vec<Faq>) -> Self {
    Self { entries }
  }
}

/// 托管的文本生成模型
pub trait ChatModel {
  fn generate(&self, prompt: &str) -> Result<String, QaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub text: String,
  pub from_user: bool,
}

impl Message {
  fn user(text: &str) -> Self {
    Self {
      text: text.to_string(),
      from_user: true,
    }
  }

  fn reply(text: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      from_user: false,
    }
  }
}

/// 按时间顺序记录的对话
#[derive(Debug, Clone, Default)]
pub struct Transcript {
  messages: Vec<Message>,
}

impl Transcript {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  /// 空白输入被忽略，返回 `None`
  pub fn ask_faq(&mut self, query: &str, book: &FaqBook) -> Option<&Message> {
    if query.trim().is_empty() {
      return None;
    }
    self.messages.push(Message::user(query));
    let answer = book.answer(query);
    debug!("FAQ 查询 '{}' -> {}", query, answer);
    self.messages.push(Message::reply(answer));
    self.messages.last()
  }

  pub fn ask_chat(&mut self, prompt: &str, model: &impl ChatModel) -> Option<&Message> {
    if prompt.trim().is_empty() {
      return None;
    }
    self.messages.push(Message::user(prompt));
    let reply = match model.generate(prompt) {
      Ok(text) => Message::reply(text.trim()),
      Err(e) => {
        warn!("生成回复失败: {}", e);
        Message::reply(CHAT_FAILURE)
      }
    };
    self.messages.push(reply);
    self.messages.last()
  }
}
