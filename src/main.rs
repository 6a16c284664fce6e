//! Weaver 命令行入口
//!
//! `weaver run <QUERY>`：执行一次请求，输出最终答案（--json 输出完整运行状态）；
//! 得到答案退出码为 0，否则为 2。`weaver tools`：打印公布给模型的工具列表。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use weaver::config::load_config_or_default;
use weaver::core::AgentBuilder;
use weaver::planner::ReplanMode;

const EXIT_UNANSWERED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "weaver", version, about = "Autonomous multi-step problem solver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one request through the planner/replanner loop
    Run(RunArgs),
    /// Print the tool list advertised to the model
    Tools(ToolsArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// The request to solve
    #[arg(value_name = "QUERY")]
    query: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides agent.max_rounds
    #[arg(long)]
    max_rounds: Option<usize>,
    /// per-round | per-task
    #[arg(long)]
    replan: Option<ReplanMode>,
    /// Extra context object passed to the planner every round
    #[arg(long, value_name = "JSON")]
    context: Option<String>,
    /// Print the whole run state as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToolsArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    weaver::observability::init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Tools(args) => {
            let builder = AgentBuilder::new(load_config_or_default(args.config));
            let spec = builder.build_tool_registry().tools_spec();
            println!("{}", serde_json::to_string_pretty(&spec).context("Failed to render tool list")?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = load_config_or_default(args.config);
    if let Some(max_rounds) = args.max_rounds {
        config.agent.max_rounds = max_rounds;
    }
    if let Some(mode) = args.replan {
        config.agent.replan_mode = mode;
    }
    let context = args.context.as_deref().map(parse_context).transpose()?;

    let manager = AgentBuilder::new(config)
        .build()
        .context("Failed to create agent")?;
    let state = manager.run(&args.query, context).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state).context("Failed to serialize run state")?);
    } else if let Some(answer) = state.answer() {
        println!("{answer}");
    } else {
        eprintln!(
            "No final answer (outcome: {}).",
            state
                .outcome
                .map(|o| serde_json::to_string(&o).unwrap_or_default())
                .unwrap_or_else(|| "unknown".to_string())
        );
    }

    let (prompt, completion, total) = manager.planner().token_usage();
    tracing::info!(prompt, completion, total, "token usage");

    Ok(if state.is_answered() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_UNANSWERED)
    })
}

fn parse_context(raw: &str) -> anyhow::Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("--context is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--context must be a JSON object"),
    }
}
