//! chaosnet-agent 命令行入口

use anyhow::{Context, Result};
use chaosnet_agent::config::load_config;
use chaosnet_agent::{load_spec, logging, shutdown_signal, Agent, Target};
use chaosnet_common::{DisruptionLevel, DisruptionSpec};
use clap::{Args, Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chaosnet-agent")]
#[command(version, about = "在目标网络命名空间中注入和清理网络故障", long_about = None)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 注入故障，收到 SIGINT/SIGTERM 后清理
    Inject {
        #[command(flatten)]
        target: TargetArgs,

        /// 故障规格文件（YAML 或 JSON）
        #[arg(long)]
        spec: PathBuf,
    },
    /// 只执行清理
    Clean {
        #[command(flatten)]
        target: TargetArgs,

        /// 故障规格文件；决定是否需要连接 Kubernetes
        #[arg(long)]
        spec: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// 目标进程 PID
    #[arg(long)]
    target_pid: u32,

    /// 故障级别：pod 或 node
    #[arg(long, default_value = "pod")]
    level: DisruptionLevel,

    /// 在 Pod 初始化阶段注入
    #[arg(long)]
    on_init: bool,

    /// 目标所在节点的 IP
    #[arg(long, env = "TARGET_POD_HOST_IP")]
    target_node_ip: Option<Ipv4Addr>,
}

impl From<TargetArgs> for Target {
    fn from(args: TargetArgs) -> Self {
        Target {
            pid: args.target_pid,
            level: args.level,
            on_init: args.on_init,
            node_ip: args.target_node_ip,
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    logging::init(&config.log_level, config.log_format)?;

    match cli.command {
        Command::Inject { target, spec } => {
            let spec = load_spec(&spec)?;
            let mut agent = Agent::new(config, target.into(), spec)
                .await
                .context("创建 Agent 失败")?;
            agent.start_metrics_server()?;
            agent.run(shutdown_signal()).await
        }
        Command::Clean { target, spec } => {
            let spec = match spec {
                Some(path) => load_spec(&path)?,
                None => DisruptionSpec::default(),
            };
            let mut agent = Agent::new(config, target.into(), spec)
                .await
                .context("创建 Agent 失败")?;
            agent.clean().await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {
            info!("chaosnet-agent 正常退出");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("chaosnet-agent 执行失败: {:#}", e);
            eprintln!("chaosnet-agent 执行失败: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
