//! Triage - 会话入口
//!
//! 从标准输入逐行读取用户消息，经分诊编排后把回复打印到标准输出。
//! 用法: triage [--stream] [--session <id>] [--config <path>]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use triage::config::load_config;
use triage::llm::create_client_from_config;
use triage::triage::MemorySessionStore;
use triage::{
    ChatRequest, ChatResponse, ConversationOrchestrator, StageInvoker, StageRegistry, TurnEvent,
};

struct CliArgs {
    stream: bool,
    session_id: Option<String>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = CliArgs {
        stream: false,
        session_id: None,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stream" => args.stream = true,
            "--session" => args.session_id = Some(iter.next().context("--session needs a value")?),
            "--config" => {
                args.config = Some(PathBuf::from(iter.next().context("--config needs a value")?))
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    triage::observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config).context("Failed to load configuration")?;

    let client = create_client_from_config(&cfg).context("Completion backend is not configured")?;
    let registry = Arc::new(StageRegistry::from_config(&cfg).context("Failed to load prompts")?);
    let invoker = StageInvoker::new(client, registry);
    let orchestrator = Arc::new(ConversationOrchestrator::new(
        invoker,
        Arc::new(MemorySessionStore::new()),
        &cfg,
    ));

    let mut session_id = args
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(session_id = %session_id, "Conversation started; type a message (Ctrl+D to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let request = ChatRequest {
            message: message.to_string(),
            session_id: session_id.clone(),
            stream: args.stream,
        };
        let reply = match orchestrator.chat(request).await {
            ChatResponse::Complete(reply) => reply,
            ChatResponse::Stream(mut events) => {
                let mut last = None;
                while let Some(event) = events.recv().await {
                    match event {
                        TurnEvent::Progress { message, .. } => println!("  ... {message}"),
                        TurnEvent::Reply(reply) => last = Some(reply),
                    }
                }
                match last {
                    Some(reply) => reply,
                    None => continue,
                }
            }
        };

        println!("{}", serde_json::to_string(&reply)?);
        if reply.is_end() {
            session_id = Uuid::new_v4().to_string();
            tracing::info!(session_id = %session_id, "Conversation concluded; starting a new one");
        }
    }
    Ok(())
}
