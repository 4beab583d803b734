//! 阶段标识：封闭枚举，构造时拒绝未知名称

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 分诊管线中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// 协调者：与用户对话、收集信息、呈现结果
    Coordinator,
    /// 知识库检索（初步查找）
    Lookup,
    /// 根因诊断
    Diagnosis,
    /// 解决方案规划
    Resolution,
    /// 批处理：从已解决工单的卷宗提炼知识记录
    KnowledgeBuilder,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::Coordinator,
        StageId::Lookup,
        StageId::Diagnosis,
        StageId::Resolution,
        StageId::KnowledgeBuilder,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageId::Coordinator => "coordinator",
            StageId::Lookup => "lookup",
            StageId::Diagnosis => "diagnosis",
            StageId::Resolution => "resolution",
            StageId::KnowledgeBuilder => "knowledge_builder",
        }
    }

    /// 历史上的 Agent 名（旧客户端、旧 Prompt 中的路由提示仍会使用）
    pub fn agent_name(&self) -> &'static str {
        match self {
            StageId::Coordinator => "TriageCoordinatorAgent",
            StageId::Lookup => "N1_SupportAgent",
            StageId::Diagnosis => "N2_DiagnosticAgent",
            StageId::Resolution => "N3_ResolutionAgent",
            StageId::KnowledgeBuilder => "batch_knowledge_builder_specialist",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        StageId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(trimmed) || id.agent_name() == trimmed)
            .ok_or_else(|| UnknownStage(trimmed.to_string()))
    }
}
