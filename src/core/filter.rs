//! 路径过滤 - 计算相对路径键并排除状态目录和排除规则命中的路径

use crate::config::STATE_DIR;
use anyhow::Result;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// 路径过滤器（监控、扫描、检测共用）
#[derive(Debug)]
pub struct PathFilter {
    root: PathBuf,
    patterns: Vec<Regex>,
}

impl PathFilter {
    pub fn new(root: &Path, exclude_patterns: &[String]) -> Result<Self> {
        let patterns = exclude_patterns
            .iter()
            .map(|p| Regex::new(&glob_to_regex(p)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            patterns,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 计算相对被监控目录的路径键（统一使用 /）
    ///
    /// 根目录本身、目录之外的路径、以及非 UTF-8 路径返回 None。
    pub fn relative_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }

        if segments.is_empty() {
            return None;
        }
        Some(segments.join("/"))
    }

    /// 检查路径键是否应该被排除
    pub fn is_excluded(&self, key: &str) -> bool {
        if key == STATE_DIR || key.starts_with(&format!("{}/", STATE_DIR)) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(key))
    }

    /// 需要同步的路径返回其键
    pub fn key_for(&self, path: &Path) -> Option<String> {
        self.relative_key(path).filter(|key| !self.is_excluded(key))
    }

    /// 扫描和监控时用于整体跳过（根目录本身不跳过）
    pub fn is_ignored(&self, path: &Path) -> bool {
        if path == self.root {
            return false;
        }
        self.key_for(path).is_none()
    }
}

/// 简单的 glob 转正则：`**` 匹配任意层级，`*` 和 `?` 不跨越 `/`
///
/// 不含 `/` 的规则同时匹配任意层级下的文件名。
fn glob_to_regex(pattern: &str) -> String {
    let pattern = pattern.trim_start_matches('/');
    let mut regex = String::from("(?i)^");

    if !pattern.contains('/') {
        regex.push_str("(?:.*/)?");
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                regex.push_str(".*");
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}
