//! 门诊流程服务器主程序

use anyhow::{Context, Result};
use clap::Parser;
use opd_admin::{FlowMonitor, OpdConfig, StorageBackend, StorageConfig};
use opd_core::SystemClock;
use opd_database::{DatabasePool, PgFlowStore, PoolOptions};
use opd_web::{AppState, WebServer};
use opd_workflow::{
    BroadcastSink, FanoutSink, FlowOrchestrator, FlowStore, MemoryStore, SeedData, TracingSink,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 门诊流程服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "opd-server")]
#[command(about = "门诊患者流程编排服务器")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 监听主机，覆盖配置文件
    #[arg(long)]
    host: Option<String>,

    /// 监听端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 内存后端的种子数据文件，覆盖配置文件
    #[arg(short, long)]
    seed: Option<String>,

    /// 打印合并后的配置并退出
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = OpdConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(seed) = args.seed {
        config.storage.seed_file = Some(seed);
    }

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // 初始化日志
    init_logging(&config)?;

    info!("启动门诊流程服务器...");
    info!("  监听地址: {}:{}", config.server.host, config.server.port);
    info!("  存储后端: {:?}", config.storage.backend);

    let store = open_store(&config.storage).await?;

    // 事件接收端：日志、指标、进程内广播
    let monitor = Arc::new(FlowMonitor::new()?);
    let broadcast = Arc::new(BroadcastSink::new(config.workflow.event_buffer));
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(monitor.clone())
        .with(broadcast.clone());

    let orchestrator = FlowOrchestrator::resume(store, Arc::new(SystemClock))
        .await
        .context("Failed to resume token sequence")?
        .with_events(Arc::new(sink));

    let queued = orchestrator
        .queued_tokens()
        .await
        .context("Failed to count queued tokens")?;
    monitor.set_queued_tokens(queued);
    info!("  排队号码: {}", queued);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    let state = AppState::new(Arc::new(orchestrator))
        .with_monitor(monitor)
        .with_events(broadcast);

    if let Err(e) = WebServer::new(addr, state).run().await {
        error!("服务器启动失败: {}", e);
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &OpdConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("Invalid log level: {}", config.logging.level))?;

    if config.logging.is_json() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn FlowStore>> {
    match storage.backend {
        StorageBackend::Memory => {
            let store = match &storage.seed_file {
                Some(path) => {
                    let content = std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read seed file: {}", path))?;
                    let seed = SeedData::from_json(&content)
                        .with_context(|| format!("Invalid seed file: {}", path))?;
                    info!(
                        "Loaded seed data: {} patients, {} doctors, {} stations",
                        seed.patients.len(),
                        seed.doctors.len(),
                        seed.stations.len()
                    );
                    MemoryStore::with_seed(seed).await?
                }
                None => MemoryStore::new(),
            };
            Ok(Arc::new(store))
        }
        StorageBackend::Postgres => {
            let url = storage
                .database_url
                .as_deref()
                .context("postgres backend requires a database_url")?;
            let options = PoolOptions {
                max_connections: storage.max_connections,
                min_connections: storage.min_connections,
                connect_timeout: storage.connect_timeout(),
            };
            let pool = DatabasePool::connect(url, &options)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PgFlowStore::new(pool);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
