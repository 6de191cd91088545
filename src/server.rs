// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 前端入口
//!
//! 读取并解析 HTTP 请求头，确定挂载前缀，交给路径解析器和构建编排器，
//! 最后把结果渲染成响应。每个连接只处理一个请求，响应后关闭。

use crate::{
    builder::{BuildOutcome, BuildSettings, Orchestrator},
    cache::FileCache,
    config::{normalize_base_url, Config},
    exception::Exception,
    param::{HttpRequestMethod, HTML_INDEX, MAX_REQUEST_HEAD},
    request::Request,
    resolver::{resolve, split_path, DirectoryListing, ProjectPath, Resolution},
    response::Response,
    rewrite::LinkRewriter,
    runner::{BuildRunner, CommandRunner},
    store::BuildStore,
    util::HtmlBuilder,
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// 轮询页面在放弃之前额外等待的时间
const POLL_DEADLINE_SLACK: Duration = Duration::from_secs(60);

/// 所有连接共享的运行时状态
pub struct AppContext {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    cache: Arc<Mutex<FileCache>>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(CommandRunner))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn BuildRunner>) -> Self {
        let cache = Arc::new(Mutex::new(FileCache::from_capacity(config.cache_size())));
        let orchestrator = Orchestrator::new(
            Arc::new(BuildStore::new()),
            runner,
            BuildSettings::from_config(&config),
        )
        .with_cache(Arc::clone(&cache));
        Self {
            config: Arc::new(config),
            orchestrator,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// 接受连接的主循环，每个连接一个 tokio 任务
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) -> io::Result<()> {
    let mut id: u128 = 0;
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("接受连接失败：{}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_connection(&mut stream, id, &ctx).await;
        });
        id += 1;
    }
}

/// 处理单个连接：读请求头、分派、写响应
pub async fn handle_connection<S>(stream: &mut S, id: u128, ctx: &AppContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let buffer = match read_head(stream, id, ctx.config.read_timeout()).await {
        Ok(Some(buffer)) => buffer,
        Ok(None) => return,
        Err(e) => {
            warn!("[ID{}]请求头无法接受：{}", id, e);
            write_response(stream, id, &Response::bare_error(&e)).await;
            discard_pending(stream).await;
            return;
        }
    };
    debug!("[ID{}]HTTP请求接收完毕", id);

    let start_time = Instant::now();
    let request = match Request::try_from(&buffer, id) {
        Ok(req) => req,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败：{}", id, e);
            write_response(stream, id, &Response::bare_error(&e)).await;
            return;
        }
    };

    let response = dispatch(&request, id, ctx).await;
    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );
    info!(
        "[ID{}] {}, {}, {}, {}, {}, {}",
        id,
        request.version(),
        request.method(),
        request.path(),
        response.status_code(),
        response.information(),
        request.user_agent(),
    );
    write_response(stream, id, &response).await;
}

async fn write_response<S>(stream: &mut S, id: u128, response: &Response)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(&response.as_bytes()).await {
        warn!("[ID{}]发送响应失败：{}", id, e);
        return;
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// 关闭前读掉客户端还没发完的数据，否则连接会被重置，响应可能丢失
async fn discard_pending<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut sink = [0u8; 4096];
    let mut total = 0;
    while total < MAX_REQUEST_HEAD * 64 {
        match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut sink)).await {
            Ok(Ok(n)) if n > 0 => total += n,
            _ => break,
        }
    }
}

/// 读取到空行为止。客户端提前关闭或超时返回 `Ok(None)`
async fn read_head<S>(stream: &mut S, id: u128, timeout: Duration) -> Result<Option<Vec<u8>>, Exception>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("[ID{}]读取TCPStream时遇到错误：{}", id, e);
                return Ok(None);
            }
            Err(_) => {
                warn!("[ID{}]{}秒内没有收到完整请求，断开连接", id, timeout.as_secs());
                return Ok(None);
            }
        };
        if n == 0 {
            return Ok(if buffer.is_empty() { None } else { Some(buffer) });
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Some(buffer));
        }
        if buffer.len() > MAX_REQUEST_HEAD {
            return Err(Exception::RequestTooLarge);
        }
    }
}

/// 请求的对外视图：挂载前缀和前缀之后的路径
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    /// 以 `/` 开头和结尾
    pub prefix: String,
    /// 前缀之后的路径，不带开头的 `/`
    pub rest: String,
}

impl Mount {
    /// 请求在浏览器中的完整路径
    pub fn external_path(&self) -> String {
        format!("{}{}", self.prefix, self.rest)
    }
}

/// 确定挂载前缀：`X-Forwarded-Prefix` > 配置的 `base_url` > `/`
pub fn detect_mount(request: &Request, config: &Config) -> Result<Mount, Exception> {
    let path = request.path();
    if let Some(forwarded) = request.forwarded_prefix() {
        return Ok(Mount {
            prefix: normalize_base_url(forwarded),
            rest: path.trim_start_matches('/').to_string(),
        });
    }

    let prefix = config.base_url().to_string();
    if !config.absolute_url() || prefix == "/" {
        return Ok(Mount {
            prefix,
            rest: path.trim_start_matches('/').to_string(),
        });
    }

    // 挂载层转发完整路径，这里剥掉前缀
    if let Some(rest) = path.strip_prefix(prefix.as_str()) {
        return Ok(Mount {
            prefix,
            rest: rest.to_string(),
        });
    }
    if path == prefix.trim_end_matches('/') {
        return Ok(Mount {
            prefix,
            rest: String::new(),
        });
    }
    Err(Exception::NotFound(path.to_string()))
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

/// 请求分派
pub async fn dispatch(request: &Request, id: u128, ctx: &AppContext) -> Response {
    match request.method() {
        HttpRequestMethod::Get | HttpRequestMethod::Head => {}
        HttpRequestMethod::Options => {
            debug!("[ID{}]请求方法为OPTIONS", id);
            return Response::options();
        }
        other => {
            warn!("[ID{}]不支持的请求方法：{}", id, other);
            return Response::method_not_allowed(request, id);
        }
    }

    match route(request, id, ctx).await {
        Ok(response) => response,
        Err(Exception::MissingManifest(dir)) => {
            let name = relative_name(ctx.config.project_root(), &dir);
            let mount = detect_mount(request, &ctx.config)
                .map(|m| m.prefix)
                .unwrap_or_else(|_| "/".to_string());
            warn!("[ID{}]目录{}中没有myst.yml", id, name);
            Response::no_project(&name, &mount, request, id)
        }
        Err(e) => {
            if e.is_client_error() {
                warn!("[ID{}]请求{}无法处理：{}", id, request.path(), e);
            } else {
                error!("[ID{}]处理请求{}时出错：{}", id, request.path(), e);
            }
            Response::from_exception(&e, request, id)
        }
    }
}

async fn route(request: &Request, id: u128, ctx: &AppContext) -> Result<Response, Exception> {
    let mount = detect_mount(request, &ctx.config)?;
    debug!("[ID{}]挂载前缀：{}，剩余路径：{}", id, mount.prefix, mount.rest);
    let segments = split_path(&mount.rest)?;

    let root = ctx.config.project_root().to_path_buf();
    let resolution = tokio::task::spawn_blocking(move || resolve(&root, &segments))
        .await
        .map_err(|e| Exception::NotFound(e.to_string()))??;

    match resolution {
        Resolution::Browse(listing) => Ok(browse(request, id, &mount, &listing)),
        Resolution::Project(project) => serve_project(request, id, ctx, &mount, &project).await,
    }
}

fn browse(request: &Request, id: u128, mount: &Mount, listing: &DirectoryListing) -> Response {
    let prefix = listing.prefix(&mount.prefix);
    if !request.path().ends_with('/') {
        return Response::redirect(301, &with_query(&prefix, request.query()));
    }
    debug!("[ID{}]列出目录{}", id, listing.directory.display());
    if request.wants_json() {
        let value = serde_json::json!({
            "status": "browse",
            "directory": listing.display_name(),
            "entries": listing.entries,
        });
        return Response::from_json(200, &value, request, id);
    }
    Response::from_html(200, HtmlBuilder::from_listing(listing, &prefix).build(), request, id)
}

async fn serve_project(
    request: &Request,
    id: u128,
    ctx: &AppContext,
    mount: &Mount,
    project: &ProjectPath,
) -> Result<Response, Exception> {
    let prefix = project.prefix(&mount.prefix);
    if project.sub_path.is_empty() && !request.path().ends_with('/') {
        return Ok(Response::redirect(301, &with_query(&prefix, request.query())));
    }

    let orchestrator = &ctx.orchestrator;
    if request.rebuild_requested() {
        info!("[ID{}]请求重建项目{}", id, project.directory.display());
        orchestrator
            .ensure_built(&project.directory, &prefix, true)
            .await;
        let location = with_query(&mount.external_path(), request.query_without_rebuild().as_deref());
        return Ok(Response::redirect(303, &location));
    }

    // 轮询请求只观察失败状态；普通请求在失败展示过一次之后才重试
    let observed = match orchestrator.outcome(&project.directory) {
        failed @ BuildOutcome::Failed { .. } if request.wants_json() => Some(failed),
        _ => orchestrator.unreported_failure(&project.directory),
    };
    let outcome = match observed {
        Some(outcome) => outcome,
        None => {
            orchestrator
                .ensure_built(&project.directory, &prefix, false)
                .await
        }
    };

    match outcome {
        BuildOutcome::InProgress { started_at } => {
            let settings = orchestrator.settings();
            let mut response = if request.wants_json() {
                let value = serde_json::json!({
                    "status": "building",
                    "project": project.display_name(),
                    "started_at": started_at.map(|t| t.to_rfc3339()),
                });
                Response::from_json(202, &value, request, id)
            } else {
                let deadline = settings.timeout + POLL_DEADLINE_SLACK;
                let page = HtmlBuilder::building(
                    &project.display_name(),
                    started_at,
                    ctx.config.poll_interval_ms(),
                    ctx.config.poll_max_interval_ms(),
                    deadline.as_millis() as u64,
                );
                Response::from_html(202, page.build(), request, id)
            };
            response
                .set_retry_after(ctx.config.poll_interval_ms().div_ceil(1000).max(1))
                .set_cache_control("no-store");
            Ok(response)
        }
        BuildOutcome::Failed {
            log,
            exit,
            timed_out,
            finished_at,
        } => {
            let error = if timed_out {
                Exception::BuildTimeout(orchestrator.settings().timeout.as_secs())
            } else {
                Exception::BuildFailure(exit.clone())
            };
            warn!("[ID{}]项目{}：{}", id, project.display_name(), error);
            orchestrator.mark_failure_reported(&project.directory);
            let code = error.status_code();
            let mut response = if request.wants_json() {
                let value = serde_json::json!({
                    "status": "failed",
                    "project": project.display_name(),
                    "exit": exit,
                    "timed_out": timed_out,
                    "finished_at": finished_at.map(|t| t.to_rfc3339()),
                    "log": log,
                });
                Response::from_json(code, &value, request, id)
            } else {
                let page = HtmlBuilder::build_failed(
                    &project.display_name(),
                    &log,
                    &exit,
                    timed_out,
                    finished_at,
                );
                Response::from_html(code, page.build(), request, id)
            };
            response.set_cache_control("no-store");
            Ok(response)
        }
        BuildOutcome::Ready {
            output_dir,
            built_base,
        } => serve_built(request, id, ctx, project, &prefix, &output_dir, built_base.as_deref()),
    }
}

/// 从输出目录中找到子路径对应的文件并返回
fn serve_built(
    request: &Request,
    id: u128,
    ctx: &AppContext,
    project: &ProjectPath,
    prefix: &str,
    output_dir: &Path,
    built_base: Option<&str>,
) -> Result<Response, Exception> {
    let sub = project.sub_path_decoded();
    if sub.iter().any(|s| s.starts_with('.')) {
        return Err(Exception::NotFound(request.path().to_string()));
    }

    let candidate = sub.iter().fold(output_dir.to_path_buf(), |acc, s| acc.join(s));
    let file = if candidate.is_dir() {
        if !sub.is_empty() && !request.path().ends_with('/') {
            let raw: Vec<&str> = project.sub_path.iter().map(|s| s.raw.as_str()).collect();
            let location = format!("{}{}/", prefix, raw.join("/"));
            return Ok(Response::redirect(301, &with_query(&location, request.query())));
        }
        candidate.join(HTML_INDEX)
    } else if candidate.is_file() {
        candidate
    } else {
        html_sibling(&candidate).ok_or_else(|| Exception::NotFound(request.path().to_string()))?
    };

    let file = contained_file(output_dir, &file)
        .ok_or_else(|| Exception::NotFound(request.path().to_string()))?;
    debug!("[ID{}]映射物理路径：{}", id, file.display());

    let rewriter = match built_base {
        Some(base) if base == prefix => None,
        Some(base) => Some(LinkRewriter::new(prefix).with_previous_base(base)),
        None => Some(LinkRewriter::new(prefix)),
    };

    Response::from_file(&file, request, id, &ctx.cache, rewriter.as_ref()).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Exception::NotFound(file.display().to_string())
        } else {
            error!("[ID{}]读取文件{}失败：{}", id, file.display(), e);
            Exception::BuildFailure(e.to_string())
        }
    })
}

/// `/intro` 对应 `intro.html` 的情况
fn html_sibling(candidate: &Path) -> Option<PathBuf> {
    let name = candidate.file_name()?.to_str()?;
    let sibling = candidate.with_file_name(format!("{}.html", name));
    sibling.is_file().then_some(sibling)
}

/// 规范化后仍在输出目录内的文件
fn contained_file(output_dir: &Path, file: &Path) -> Option<PathBuf> {
    let root = output_dir.canonicalize().ok()?;
    let canonical = file.canonicalize().ok()?;
    (canonical.starts_with(&root) && canonical.is_file()).then_some(canonical)
}

fn relative_name(root: &Path, dir: &Path) -> String {
    match dir.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => dir.display().to_string(),
    }
}
