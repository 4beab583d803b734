//! 各阶段的固定输入 / 输出 Schema（分派表）

use crate::stage::StageId;

/// 阶段期望的输入形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// 会话阶段：自由文本
    Text,
    /// 批处理阶段：卷宗对象的 JSON 数组
    Dossiers,
}

impl InputKind {
    pub fn describe(&self) -> &'static str {
        match self {
            InputKind::Text => "free text",
            InputKind::Dossiers => "a JSON array of dossier objects",
        }
    }
}

/// 列表字段中每个元素的 Schema
#[derive(Debug, Clone, Copy)]
pub struct ItemSchema {
    pub field: &'static str,
    pub required: &'static [&'static str],
    /// 缺失或为 null 时补为空数组
    pub optional_lists: &'static [&'static str],
}

/// 阶段 Schema
#[derive(Debug, Clone, Copy)]
pub struct StageSchema {
    pub input: InputKind,
    /// 必须存在且非 null
    pub required: &'static [&'static str],
    /// 至少存在其一（非空）
    pub any_of: &'static [&'static str],
    /// 缺失或为 null 时补为空数组
    pub optional_lists: &'static [&'static str],
    pub items: Option<ItemSchema>,
}

static COORDINATOR: StageSchema = StageSchema {
    input: InputKind::Text,
    required: &[],
    any_of: &["user_message", "gathered_info"],
    optional_lists: &[],
    items: None,
};

static LOOKUP: StageSchema = StageSchema {
    input: InputKind::Text,
    required: &["status"],
    any_of: &[],
    optional_lists: &[],
    items: None,
};

static DIAGNOSIS: StageSchema = StageSchema {
    input: InputKind::Text,
    required: &[
        "diagnostic_summary",
        "investigation_details_md",
        "next_step_recommendation",
    ],
    any_of: &[],
    optional_lists: &[],
    items: None,
};

static RESOLUTION: StageSchema = StageSchema {
    input: InputKind::Text,
    required: &["action_type", "description"],
    any_of: &[],
    optional_lists: &[],
    items: None,
};

static KNOWLEDGE_BUILDER: StageSchema = StageSchema {
    input: InputKind::Dossiers,
    required: &["records"],
    any_of: &[],
    optional_lists: &[],
    items: Some(ItemSchema {
        field: "records",
        required: &[
            "ticket_id",
            "title",
            "problem_summary",
            "root_cause_analysis",
            "solution_applied",
            "solution_type",
            "tags",
            "ticket_level",
        ],
        optional_lists: &["sql_template"],
    }),
};

impl StageId {
    pub fn schema(&self) -> &'static StageSchema {
        match self {
            StageId::Coordinator => &COORDINATOR,
            StageId::Lookup => &LOOKUP,
            StageId::Diagnosis => &DIAGNOSIS,
            StageId::Resolution => &RESOLUTION,
            StageId::KnowledgeBuilder => &KNOWLEDGE_BUILDER,
        }
    }
}
