//! Triage 批处理入口（运维使用）
//!
//! 从 SQLite 数据库取出未处理的已解决工单，分块送入知识构建阶段，结果写入知识库与任务账本。
//! 用法: triage-batch [--batch-size N] [--max-items N] [--stage NAME] [--db PATH] [--config PATH]
//!       triage-batch --list-stages   列出可用阶段（批处理阶段标注 batch）
//! Ctrl+C / SIGTERM：不再启动新分块，在途分块结束后任务以 INTERRUPTED 收尾。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use triage::batch::{BatchOrchestrator, BatchRequest, SqliteStore};
use triage::config::load_config;
use triage::core::ShutdownManager;
use triage::llm::create_client_from_config;
use triage::stage::InputKind;
use triage::{StageId, StageInvoker, StageRegistry};

#[derive(Default)]
struct CliArgs {
    batch_size: Option<usize>,
    max_items: Option<usize>,
    stage: Option<String>,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    list_stages: bool,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = CliArgs::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = || iter.next().with_context(|| format!("{arg} needs a value"));
        match arg.as_str() {
            "--batch-size" => args.batch_size = Some(value()?.parse().context("--batch-size")?),
            "--max-items" => args.max_items = Some(value()?.parse().context("--max-items")?),
            "--stage" => args.stage = Some(value()?),
            "--db" => args.db = Some(PathBuf::from(value()?)),
            "--config" => args.config = Some(PathBuf::from(value()?)),
            "--list-stages" => args.list_stages = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

async fn run() -> anyhow::Result<bool> {
    let args = parse_args()?;
    let cfg = load_config(args.config).context("Failed to load configuration")?;

    if args.list_stages {
        let registry = StageRegistry::from_config(&cfg).context("Failed to load prompts")?;
        for name in registry.services() {
            let stage: StageId = name.parse()?;
            let kind = if stage.schema().input == InputKind::Dossiers {
                "batch"
            } else {
                "conversation"
            };
            println!("{name}\t{}\t{kind}", stage.agent_name());
        }
        return Ok(true);
    }

    let stage: StageId = args
        .stage
        .as_deref()
        .unwrap_or(cfg.batch.stage.as_str())
        .parse()
        .context("Invalid --stage")?;
    let request = BatchRequest {
        stage_id: stage,
        batch_size: args.batch_size.unwrap_or(cfg.batch.batch_size),
        max_items: args.max_items.or(cfg.batch.max_items),
    };

    // 缺少凭据等致命配置错误在创建任何任务之前终止
    let client = create_client_from_config(&cfg).context("Completion backend is not configured")?;
    let registry = Arc::new(StageRegistry::from_config(&cfg).context("Failed to load prompts")?);

    let db_path = args.db.unwrap_or_else(|| cfg.batch.database_path.clone());
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let orchestrator = BatchOrchestrator::new(
        StageInvoker::new(client, registry),
        store.clone(),
        store.clone(),
        store,
        &cfg,
    )
    .with_shutdown(shutdown.token());

    tracing::info!(
        stage = %request.stage_id,
        batch_size = request.batch_size,
        max_items = ?request.max_items,
        "Starting batch run"
    );
    match orchestrator.run_pending(request).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(!job.status.is_failure())
        }
        None => Ok(true),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    triage::observability::init();
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
