use std::fs;
use std::path::PathBuf;

use agentpilot::config::PilotSettings;
use agentpilot::eval::{EvalContext, EvalEngine, EvalRules};
use agentpilot::llm::PricingTable;
use agentpilot::logging::LoggingConfig;
use agentpilot::queue::listen_for_os_signals;
use agentpilot::workflow::{execution_order, WorkflowGraph};
use agentpilot::{PilotError, PilotServices};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "agentpilot", version, about = "AgentPilot CLI", author)]
struct Cli {
    /// JSON 配置文件，缺省时只读环境变量
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 打印工作流的执行顺序
    Sort { graph: PathBuf },
    /// 对一段内容运行评估
    Eval {
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        content: PathBuf,
        #[arg(long)]
        recipient: Option<String>,
    },
    /// 计算一次调用的费用
    Cost {
        #[arg(long)]
        model: String,
        #[arg(long)]
        input: u64,
        #[arg(long)]
        output: u64,
    },
    /// 运行队列 worker 直到收到信号
    Worker {
        #[arg(long)]
        agents: Option<PathBuf>,
        #[arg(long)]
        workflows: Option<PathBuf>,
    },
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<PilotSettings> {
    let settings = match path {
        Some(path) => PilotSettings::from_path(path)?,
        None => PilotSettings::from_env()?,
    };
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Sort { graph } => handle_sort(graph)?,
        Command::Eval {
            rules,
            content,
            recipient,
        } => handle_eval(cli.settings.as_ref(), rules, content, recipient).await?,
        Command::Cost {
            model,
            input,
            output,
        } => handle_cost(cli.settings.as_ref(), &model, input, output)?,
        Command::Worker { agents, workflows } => {
            handle_worker(cli.settings.as_ref(), agents, workflows).await?
        }
    }
    Ok(())
}

fn handle_sort(path: PathBuf) -> anyhow::Result<()> {
    let graph = WorkflowGraph::from_path(&path)?;
    graph.validate()?;
    match execution_order(&graph.nodes, &graph.connections) {
        Ok(order) => {
            for (index, id) in order.iter().enumerate() {
                println!("{:>3}. {id}", index + 1);
            }
            Ok(())
        }
        Err(err @ PilotError::Cycle(_)) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
        Err(err) => Err(err.into()),
    }
}

async fn handle_eval(
    settings: Option<&PathBuf>,
    rules_path: PathBuf,
    content_path: PathBuf,
    recipient: Option<String>,
) -> anyhow::Result<()> {
    let raw_rules = fs::read_to_string(&rules_path)
        .with_context(|| format!("failed to read rules {}", rules_path.display()))?;
    let rules: EvalRules = serde_json::from_str(&raw_rules)?;
    let content = fs::read_to_string(&content_path)
        .with_context(|| format!("failed to read content {}", content_path.display()))?;

    let settings = load_settings(settings)?;
    // 只有配置了后端时才启用 L3 评审
    let engine = if settings.resolved_api_key()?.is_some() {
        PilotServices::builder(settings).build()?.eval
    } else {
        EvalEngine::without_judge()
    };

    let ctx = EvalContext {
        recipient_name: recipient,
        ..EvalContext::default()
    };
    let result = engine.evaluate(content.trim(), &ctx, &rules).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn handle_cost(settings: Option<&PathBuf>, model: &str, input: u64, output: u64) -> anyhow::Result<()> {
    let settings = load_settings(settings)?;
    let pricing = PricingTable::with_models(settings.models);
    let cost = pricing.cost(model, input, output);
    let output = json!({
        "model": model,
        "tier": pricing.models.tier_of(model).map(|tier| tier.to_string()),
        "inputTokens": input,
        "outputTokens": output,
        "costUsd": cost,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn handle_worker(
    settings: Option<&PathBuf>,
    agents: Option<PathBuf>,
    workflows: Option<PathBuf>,
) -> anyhow::Result<()> {
    let settings = load_settings(settings)?;
    let services = PilotServices::builder(settings).build()?;
    if let Some(dir) = agents {
        let loaded = services.agents.load_dir(&dir)?;
        tracing::info!(loaded, dir = %dir.display(), "agents loaded");
    }
    if let Some(dir) = workflows {
        let loaded = services.workflows.load_dir(&dir)?;
        tracing::info!(loaded, dir = %dir.display(), "workflows loaded");
    }

    let worker = services.worker();
    tokio::spawn(listen_for_os_signals(worker.shutdown_signal()));
    let report = worker.run().await?;
    println!("{}", json!({
        "processed": report.processed,
        "completed": report.completed,
        "retried": report.retried,
        "failed": report.failed,
        "aborted": report.aborted,
    }));
    Ok(())
}
