// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 构建编排模块
//!
//! 决定某个项目是否需要构建，持有该项目的构建锁运行外部构建工具，
//! 并在成功后对输出目录中的 HTML 做前缀改写。
//!
//! 决策表：
//!
//! | 当前状态 | 请求重建 | 动作 |
//! |---|---|---|
//! | `Unbuilt` | 任意 | 加锁、构建 |
//! | `BuiltOk` | 否 | 直接使用现有输出 |
//! | `BuiltOk` | 是 | 加锁、删除输出目录、构建 |
//! | `BuiltFailed` | 任意 | 加锁、重试 |
//! | `Building` | 任意 | 不构建，返回“构建中” |
//!
//! 构建任务在独立的 tokio 任务里运行，客户端断开连接不会中断构建。

use crate::{
    cache::FileCache,
    config::Config,
    param::{BASE_URL_ENV, HTML_INDEX},
    rewrite::{transform_page, LinkRewriter},
    runner::{BuildInvocation, BuildReport, BuildRunner},
    store::{write_marker, BuildMarker, BuildStatus, BuildStore, ProjectHandle},
};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use tokio::sync::OwnedMutexGuard;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// 编排器的运行参数
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub command: Vec<String>,
    pub timeout: Duration,
    /// 触发构建的请求最多等待多久再返回“构建中”页面
    pub wait: Duration,
    pub rebuild_button: bool,
}

impl BuildSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.build_command().to_vec(),
            timeout: config.build_timeout(),
            wait: config.build_wait(),
            rebuild_button: config.postbuild_rebuild_button(),
        }
    }
}

/// `ensure_built` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// 输出可用。`built_base` 是输出中 HTML 当前对应的前缀
    Ready {
        output_dir: PathBuf,
        built_base: Option<String>,
    },
    /// 正在构建
    InProgress {
        started_at: Option<DateTime<Local>>,
    },
    /// 最近一次构建失败
    Failed {
        log: String,
        exit: String,
        timed_out: bool,
        finished_at: Option<DateTime<Local>>,
    },
}

pub struct Orchestrator {
    store: Arc<BuildStore>,
    runner: Arc<dyn BuildRunner>,
    cache: Option<Arc<Mutex<FileCache>>>,
    settings: BuildSettings,
}

impl Orchestrator {
    pub fn new(store: Arc<BuildStore>, runner: Arc<dyn BuildRunner>, settings: BuildSettings) -> Self {
        Self {
            store,
            runner,
            cache: None,
            settings,
        }
    }

    /// 构建结束后需要清理的文件缓存
    pub fn with_cache(mut self, cache: Arc<Mutex<FileCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<BuildStore> {
        &self.store
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// 保证项目已构建，或者报告构建状态。
    ///
    /// `prefix` 是项目对外可见的完整前缀（以 `/` 结尾）。
    pub async fn ensure_built(&self, project: &Path, prefix: &str, rebuild: bool) -> BuildOutcome {
        let handle = self.store.get_or_create(project);

        // 判断与状态迁移在同一个临界区内完成
        let lock_guard = {
            let mut state = handle.state();
            match (state.status, rebuild) {
                (BuildStatus::Building, _) => {
                    debug!("项目{}正在构建，返回状态页", handle.directory().display());
                    return outcome_from(&handle, &state);
                }
                (BuildStatus::BuiltOk, false) => return outcome_from(&handle, &state),
                _ => {}
            }
            let guard = match handle.try_lock_build() {
                Some(guard) => guard,
                None => {
                    warn!("项目{}的构建锁已被占用", handle.directory().display());
                    return BuildOutcome::InProgress {
                        started_at: state.last_build_started_at,
                    };
                }
            };
            state.status = BuildStatus::Building;
            state.last_build_started_at = Some(Local::now());
            guard
        };

        info!(
            "开始构建项目{}（前缀 {}，重建：{}）",
            handle.directory().display(),
            prefix,
            rebuild
        );

        let mut finished = handle.subscribe();
        let job = BuildJob {
            handle: Arc::clone(&handle),
            lock_guard: Some(lock_guard),
            runner: Arc::clone(&self.runner),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            prefix: prefix.to_string(),
            rebuild,
        };
        tokio::spawn(job.run());

        if !self.settings.wait.is_zero() {
            let _ = tokio::time::timeout(self.settings.wait, finished.changed()).await;
        }
        self.outcome(project)
    }

    /// 当前状态对应的结果，不触发构建
    pub fn outcome(&self, project: &Path) -> BuildOutcome {
        let handle = self.store.get_or_create(project);
        let state = handle.state();
        outcome_from(&handle, &state)
    }

    /// 尚未展示过的失败结果。失败只在用户看到诊断之后才会被普通请求重试
    pub fn unreported_failure(&self, project: &Path) -> Option<BuildOutcome> {
        let handle = self.store.get_or_create(project);
        let state = handle.state();
        match state.status {
            BuildStatus::BuiltFailed if !state.failure_reported => Some(outcome_from(&handle, &state)),
            _ => None,
        }
    }

    /// 记录失败诊断已经返回给客户端
    pub fn mark_failure_reported(&self, project: &Path) {
        let handle = self.store.get_or_create(project);
        let mut state = handle.state();
        if state.status == BuildStatus::BuiltFailed {
            state.failure_reported = true;
        }
    }

    /// 等待项目离开 `Building` 状态，最多等 `timeout`
    pub async fn wait_idle(&self, project: &Path, timeout: Duration) -> BuildOutcome {
        let handle = self.store.get_or_create(project);
        let deadline = Instant::now() + timeout;
        loop {
            let mut finished = handle.subscribe();
            if handle.snapshot().status != BuildStatus::Building {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, finished.changed()).await.is_err()
            {
                break;
            }
        }
        self.outcome(project)
    }
}

fn outcome_from(handle: &ProjectHandle, state: &crate::store::ProjectState) -> BuildOutcome {
    match state.status {
        BuildStatus::Building | BuildStatus::Unbuilt => BuildOutcome::InProgress {
            started_at: state.last_build_started_at,
        },
        BuildStatus::BuiltOk => BuildOutcome::Ready {
            output_dir: handle.output_dir().to_path_buf(),
            built_base: state.built_base.clone(),
        },
        BuildStatus::BuiltFailed => BuildOutcome::Failed {
            log: state.last_build_error.clone().unwrap_or_default(),
            exit: state.last_exit.clone().unwrap_or_default(),
            timed_out: state.last_timed_out,
            finished_at: state.last_build_finished_at,
        },
    }
}

/// 传给构建工具的 `BASE_URL`：去掉末尾的 `/`，MyST 会自行补上
pub fn base_url_for_env(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

/// 一次正在进行的构建。持有构建锁，`Drop` 时保证释放并落定状态。
struct BuildJob {
    handle: Arc<ProjectHandle>,
    lock_guard: Option<OwnedMutexGuard<()>>,
    runner: Arc<dyn BuildRunner>,
    cache: Option<Arc<Mutex<FileCache>>>,
    settings: BuildSettings,
    prefix: String,
    rebuild: bool,
}

enum JobResult {
    Success,
    Failure {
        log: String,
        exit: String,
        timed_out: bool,
    },
}

impl BuildJob {
    async fn run(mut self) {
        let directory = self.handle.directory().to_path_buf();
        let output_dir = self.handle.output_dir().to_path_buf();

        let result = match self.execute(&directory, &output_dir).await {
            Ok(result) => result,
            Err(e) => {
                error!("构建项目{}时发生I/O错误：{}", directory.display(), e);
                JobResult::Failure {
                    log: format!("[myst-build-proxy] {}\n", e),
                    exit: "internal error".to_string(),
                    timed_out: false,
                }
            }
        };
        self.finish(result);
    }

    async fn execute(&self, directory: &Path, output_dir: &Path) -> io::Result<JobResult> {
        if self.rebuild {
            remove_output_dir(directory, output_dir).await?;
        }

        let invocation =
            BuildInvocation::from_command(&self.settings.command, directory.to_path_buf(), self.settings.timeout)
                .env(BASE_URL_ENV, &base_url_for_env(&self.prefix));
        let report = self.runner.run(invocation).await;
        info!(
            "项目{}构建进程结束：{}，用时{}ms",
            directory.display(),
            report.exit,
            report.duration.as_millis()
        );

        if !report.success() {
            return Ok(failure_from(report));
        }
        if !output_dir.join(HTML_INDEX).is_file() {
            let mut log = report.log;
            log.push_str(&format!(
                "\n[myst-build-proxy] the build exited successfully but {} was not produced\n",
                output_dir.join(HTML_INDEX).display()
            ));
            return Ok(JobResult::Failure {
                log,
                exit: "missing output".to_string(),
                timed_out: false,
            });
        }

        let out = output_dir.to_path_buf();
        let prefix = self.prefix.clone();
        let button = self.settings.rebuild_button;
        let rewritten = tokio::task::spawn_blocking(move || postprocess_output(&out, &prefix, button))
            .await
            .map_err(io::Error::other)??;
        debug!("后处理完成，改写了{}个HTML文件", rewritten);

        write_marker(
            output_dir,
            &BuildMarker {
                base_url: self.prefix.clone(),
                built_at: Local::now().to_rfc3339(),
            },
        )?;
        Ok(JobResult::Success)
    }

    fn finish(&mut self, result: JobResult) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
            let evicted = cache.evict_under(self.handle.output_dir());
            debug!("清理了{}条文件缓存", evicted);
        }

        {
            let mut state = self.handle.state();
            state.last_build_finished_at = Some(Local::now());
            match result {
                JobResult::Success => {
                    info!("项目{}构建成功", self.handle.directory().display());
                    state.status = BuildStatus::BuiltOk;
                    state.built_base = Some(self.prefix.clone());
                    state.last_build_error = None;
                    state.last_exit = None;
                    state.last_timed_out = false;
                }
                JobResult::Failure {
                    log,
                    exit,
                    timed_out,
                } => {
                    warn!("项目{}构建失败：{}", self.handle.directory().display(), exit);
                    state.status = BuildStatus::BuiltFailed;
                    state.built_base = None;
                    state.last_build_error = Some(log);
                    state.last_exit = Some(exit);
                    state.last_timed_out = timed_out;
                    state.failure_reported = false;
                }
            }
            // 在状态锁内释放构建锁，新请求看到的状态与锁始终一致
            self.lock_guard.take();
        }
        self.handle.notify_finished();
    }
}

impl Drop for BuildJob {
    fn drop(&mut self) {
        if self.lock_guard.is_some() {
            error!(
                "项目{}的构建任务意外终止",
                self.handle.directory().display()
            );
            self.finish(JobResult::Failure {
                log: "[myst-build-proxy] the build task was aborted unexpectedly\n".to_string(),
                exit: "aborted".to_string(),
                timed_out: false,
            });
        }
    }
}

fn failure_from(report: BuildReport) -> JobResult {
    JobResult::Failure {
        timed_out: report.timed_out(),
        exit: report.exit.to_string(),
        log: report.log,
    }
}

/// 删除输出目录。只允许删除项目目录之下的严格子目录
async fn remove_output_dir(directory: &Path, output_dir: &Path) -> io::Result<()> {
    if !output_dir.starts_with(directory) || output_dir == directory {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to delete {}", output_dir.display()),
        ));
    }
    match tokio::fs::remove_dir_all(output_dir).await {
        Ok(()) => {
            info!("已删除旧的输出目录{}", output_dir.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// 改写输出目录中所有 HTML 文件，返回实际改动的文件数
pub fn postprocess_output(output_dir: &Path, prefix: &str, rebuild_button: bool) -> io::Result<usize> {
    let rewriter = LinkRewriter::new(prefix);
    let mut changed = 0;
    let mut pending = vec![output_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_html(&path) {
                let original = fs::read(&path)?;
                let transformed = transform_page(&original, &rewriter, rebuild_button);
                if transformed != original {
                    fs::write(&path, transformed)?;
                    changed += 1;
                }
            }
        }
    }
    Ok(changed)
}

fn is_html(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("html") | Some("htm")
    )
}
