//! 事件构建器模块
//! Event builder module
//!
//! 提供按调度类别注册事件构建器的路由表，支持通配符模式匹配
//! Provides a kind-based routing table for event builders, with wildcard pattern matching
//!
//! ## Pattern Matching / 模式匹配
//!
//! - Exact match / 精确匹配: `"reminder"` 只匹配 "reminder"
//! - Prefix wildcard / 前缀通配符: `"session:*"` 匹配所有以 "session:" 开头的类别
//! - Suffix wildcard / 后缀通配符: `"*:expiry"` 匹配所有以 ":expiry" 结尾的类别
//! - Catch-all / 捕获所有: `"*"` 匹配任意类别

use crate::error::{Error, Result};
use crate::item::ScheduleItem;
use crate::message::OutboundMessage;
use std::collections::HashMap;
use std::sync::Arc;

/// 事件构建器 - 把到期的调度项变成出站消息
/// Event builder - turns a due schedule item into an outbound message
///
/// 构建是纯函数式的：失败意味着数据问题，视为永久错误，调度项会被标记为 FAILED
/// Building is pure: a failure means a data problem, treated as permanent,
/// and the schedule item is marked FAILED
pub trait EventBuilder: Send + Sync {
  /// 为调度项构建出站消息
  /// Build the outbound message for a schedule item
  fn build(&self, item: &ScheduleItem) -> Result<OutboundMessage>;
}

impl std::fmt::Debug for dyn EventBuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("dyn EventBuilder")
  }
}

/// 函数适配器，让闭包可以直接注册为构建器
/// Function adapter so closures can be registered as builders directly
pub struct BuilderFunc<F>(pub F);

impl<F> EventBuilder for BuilderFunc<F>
where
  F: Fn(&ScheduleItem) -> Result<OutboundMessage> + Send + Sync,
{
  fn build(&self, item: &ScheduleItem) -> Result<OutboundMessage> {
    (self.0)(item)
  }
}

/// 检查类别是否匹配模式
/// Check if a kind matches a pattern
///
/// Supports wildcards:
/// - "*" matches any kind
/// - "prefix:*" matches any kind starting with "prefix:"
/// - "*:suffix" matches any kind ending with ":suffix"
/// - "prefix:*:suffix" matches kinds with prefix and suffix
fn pattern_matches(pattern: &str, kind: &str) -> bool {
  if pattern == "*" {
    return true;
  }

  if !pattern.contains('*') {
    return pattern == kind;
  }

  let parts: Vec<&str> = pattern.split('*').collect();

  if parts.len() == 2 {
    let (prefix, suffix) = (parts[0], parts[1]);

    if prefix.is_empty() {
      return kind.ends_with(suffix);
    } else if suffix.is_empty() {
      return kind.starts_with(prefix);
    } else {
      return kind.starts_with(prefix) && kind.ends_with(suffix);
    }
  }

  // Multiple wildcards: anchor on first and last part, then require the
  // middle parts to appear in order
  if let (Some(first), Some(last)) = (parts.first(), parts.last()) {
    if kind.starts_with(first) && kind.ends_with(last) {
      let mut search_start = first.len();
      for part in &parts[1..parts.len() - 1] {
        if let Some(pos) = kind[search_start..].find(part) {
          search_start += pos + part.len();
        } else {
          return false;
        }
      }
      return true;
    }
  }

  false
}

/// 构建器注册表 - 类别模式到构建器的映射
/// Builder registry - maps kind patterns to builders
///
/// 解析顺序：先精确匹配，再尝试通配符模式
/// Resolution order: exact match first, then wildcard patterns
#[derive(Default)]
pub struct BuilderRegistry {
  builders: HashMap<String, Arc<dyn EventBuilder>>,
}

impl BuilderRegistry {
  /// 创建新的注册表
  /// Create a new registry
  pub fn new() -> Self {
    Self {
      builders: HashMap::new(),
    }
  }

  /// 注册构建器
  /// Register a builder
  pub fn register<S: Into<String>>(
    &mut self,
    pattern: S,
    builder: Arc<dyn EventBuilder>,
  ) -> Result<()> {
    let pattern = pattern.into();
    if pattern.is_empty() {
      return Err(Error::InvalidPattern { pattern });
    }
    self.builders.insert(pattern, builder);
    Ok(())
  }

  /// 注册闭包构建器
  /// Register a closure builder
  pub fn register_fn<S, F>(&mut self, pattern: S, func: F) -> Result<()>
  where
    S: Into<String>,
    F: Fn(&ScheduleItem) -> Result<OutboundMessage> + Send + Sync + 'static,
  {
    self.register(pattern, Arc::new(BuilderFunc(func)))
  }

  /// 解析类别对应的构建器
  /// Resolve the builder for a kind
  pub fn resolve(&self, kind: &str) -> Result<Arc<dyn EventBuilder>> {
    if let Some(builder) = self.builders.get(kind) {
      return Ok(Arc::clone(builder));
    }

    for (pattern, builder) in &self.builders {
      if pattern_matches(pattern, kind) {
        return Ok(Arc::clone(builder));
      }
    }

    Err(Error::NoBuilder {
      kind: kind.to_string(),
    })
  }

  /// 列出所有精确注册的类别（不含通配符模式）
  /// List exactly registered kinds (wildcard patterns excluded)
  ///
  /// 引擎用它决定为哪些类别启动调度守护进程
  /// The engine uses this to decide which kinds get a dispatcher daemon
  pub fn exact_kinds(&self) -> Vec<String> {
    let mut kinds: Vec<String> = self
      .builders
      .keys()
      .filter(|k| !k.contains('*'))
      .cloned()
      .collect();
    kinds.sort();
    kinds
  }

  /// 注册表是否为空
  /// Whether the registry is empty
  pub fn is_empty(&self) -> bool {
    self.builders.is_empty()
  }
}
