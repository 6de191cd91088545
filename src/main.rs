// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # MyST 构建代理
//!
//! 在 Jupyter 工作区中按需构建并托管 MyST 站点：
//! - 按请求路径定位包含 `myst.yml` 的项目目录
//! - 每个项目同一时间只运行一个 `myst build`，其余请求看到“构建中”页面
//! - 构建产物按请求的对外前缀改写后提供静态服务
//! - `?rebuild=1` 删除旧产物并重新构建

use myst_build_proxy::{config::Config, server, AppContext};

use log::{error, info, LevelFilter};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Config as LogConfig, Root},
    encode::pattern::PatternEncoder,
};
use tokio::{net::TcpListener, runtime::Builder};

use std::{
    env,
    error::Error,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

const LOG_CONFIG: &str = "config/log4rs.yaml";
const DEFAULT_CONFIG: &str = "config/development.toml";
const CONFIG_ENV: &str = "MYST_BUILD_PROXY_CONFIG";

fn main() {
    if let Err(e) = init_logging() {
        eprintln!("无法初始化日志系统：{}", e);
    }

    let config = load_config();
    info!("项目根目录：{}", config.project_root().display());
    info!("挂载前缀：{}", config.base_url());
    info!("构建命令：{}", config.build_command().join(" "));

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("无法创建tokio运行时：{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("服务器异常退出：{}", e);
        process::exit(1);
    }
}

/// 优先使用 YAML 配置；文件不存在时退回到控制台输出
fn init_logging() -> Result<(), Box<dyn Error>> {
    if Path::new(LOG_CONFIG).exists() {
        log4rs::init_file(LOG_CONFIG, Default::default())?;
        return Ok(());
    }
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} - {m}{n}",
        )))
        .build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// 配置文件 < 环境变量 < 位置参数
fn load_config() -> Config {
    let path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG));
    let mut config = Config::from_toml(&path);
    config.apply_env(|key| env::var(key).ok());
    let args: Vec<String> = env::args().skip(1).collect();
    config.apply_args(&args);
    config.finalize()
}

async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let port = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let listener = TcpListener::bind(SocketAddrV4::new(address, port)).await?;
    info!("服务端在{}:{}上监听Socket连接", address, port);

    let ctx = Arc::new(AppContext::new(config));
    server::serve(listener, ctx).await?;
    Ok(())
}
