//! 阶段注册表：StageId → (Schema, 系统提示词) 的分派表
//!
//! 进程启动时由 AppConfig 构建一次，以 Arc 共享给编排器；阶段集合是封闭枚举，
//! 因此未知阶段名只会在解析配置 / 命令行参数时被拒绝，调用时不会出现。

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::AppConfig;
use crate::core::TriageError;
use crate::stage::prompts::default_prompt;
use crate::stage::{StageId, StageSchema};

/// 单个阶段的运行描述
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub prompt: String,
}

impl StageSpec {
    pub fn schema(&self) -> &'static StageSchema {
        self.id.schema()
    }
}

/// 阶段注册表
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<StageId, StageSpec>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        let stages = StageId::ALL
            .into_iter()
            .map(|id| {
                (
                    id,
                    StageSpec {
                        id,
                        prompt: default_prompt(id),
                    },
                )
            })
            .collect();
        Self { stages }
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, TriageError> {
        match &cfg.app.prompts_dir {
            Some(dir) => Self::with_prompts_dir(dir),
            None => Ok(Self::default()),
        }
    }

    /// 用 `<dir>/<stage>.txt` 覆盖默认提示词；文件不存在则保留默认，读取失败视为致命配置错误
    pub fn with_prompts_dir(dir: &Path) -> Result<Self, TriageError> {
        let mut registry = Self::default();
        for id in StageId::ALL {
            let path = dir.join(format!("{}.txt", id.name()));
            if !path.exists() {
                continue;
            }
            let prompt = std::fs::read_to_string(&path).map_err(|e| {
                TriageError::FatalConfiguration(format!(
                    "cannot read prompt override {}: {}",
                    path.display(),
                    e
                ))
            })?;
            tracing::info!("Loaded prompt override for stage {} from {}", id, path.display());
            registry.set_prompt(id, prompt);
        }
        Ok(registry)
    }

    pub fn set_prompt(&mut self, id: StageId, prompt: impl Into<String>) {
        self.stages.insert(
            id,
            StageSpec {
                id,
                prompt: prompt.into(),
            },
        );
    }

    pub fn get(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.get(&id)
    }

    pub fn prompt(&self, id: StageId) -> &str {
        self.stages.get(&id).map(|s| s.prompt.as_str()).unwrap_or_default()
    }

    /// 可用阶段名列表（按声明顺序）
    pub fn services(&self) -> Vec<&'static str> {
        self.stages.keys().map(StageId::name).collect()
    }
}
