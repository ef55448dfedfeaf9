/// HV Agent
///
/// 计算节点代理程序，运行在宿主机上，负责虚拟机生命周期与迁移编排

use common::ws_rpc::RegisterRequest;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod collaborators;
mod config;
mod driver;
mod events;
mod hypervisor;
mod migration;
mod orchestrator;
mod ws;

use collaborators::local::{LocalConsoleOps, LocalImageCache, LocalSnapshotOps, LocalVolumeOps};
use collaborators::Collaborators;
use driver::{ComputeDriver, HostDriver};
use orchestrator::{InstanceLocks, LifecycleOrchestrator};
use ws::{Notifier, RpcHandlerRegistry, WsClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    // RUST_LOG 优先，其次 LOG_LEVEL
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 HV Agent...");
    info!("✅ 配置加载成功 (后端: {:?})", cfg.hypervisor_backend);

    info!("🔧 连接 hypervisor...");
    let gateway = hypervisor::connect(&cfg)?;
    let orchestrator = Arc::new(LifecycleOrchestrator::new(gateway.clone(), InstanceLocks::new()));

    info!("💾 初始化镜像缓存: {}", cfg.image_cache_dir);
    let collaborators = Collaborators {
        volumes: Arc::new(LocalVolumeOps::new(gateway.clone(), &cfg.node_name, &cfg.node_ip)),
        images: Arc::new(LocalImageCache::new(
            &cfg.image_cache_dir,
            &cfg.instances_dir,
            Duration::from_secs(cfg.image_cache_max_age),
        )),
        snapshots: Arc::new(LocalSnapshotOps::new(gateway.clone(), &cfg.image_cache_dir)),
        consoles: Arc::new(LocalConsoleOps::new(gateway.clone(), &cfg.node_name, &cfg.instances_dir)),
    };

    let driver = Arc::new(HostDriver::new(orchestrator, collaborators, cfg.event_poll_interval()));

    let notifier = Notifier::new();
    driver.init_host(Arc::new(notifier.clone())).await?;

    let handler_registry = Arc::new(RpcHandlerRegistry::new(driver.clone(), notifier));
    info!("✅ RPC 处理器已初始化");

    let ws_client = WsClient::new(
        cfg.server_ws_url.clone(),
        RegisterRequest {
            node_id: cfg.node_id.clone(),
            hostname: cfg.node_name.clone(),
            ip_address: cfg.node_ip.clone(),
        },
        cfg.heartbeat_interval,
        handler_registry,
    );

    info!("🎯 连接到 Server: {}", cfg.server_ws_url);
    info!("📌 节点 ID: {}", cfg.node_id);

    // 运行 WebSocket 客户端（会自动重连）
    tokio::select! {
        result = ws_client.run() => {
            result.map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 收到退出信号");
        }
    }

    driver.cleanup_host().await?;
    Ok(())
}
