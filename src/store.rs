//! # 构建状态表
//!
//! 进程内唯一的 `项目目录 -> (构建锁, 状态)` 映射。状态不落盘：
//! 每个目录第一次被访问时，根据磁盘上的输出目录推断初始状态。

use crate::param::{BUILD_MARKER_FILE, BUILD_OUTPUT_DIR};

use chrono::{DateTime, Local};
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Unbuilt,
    Building,
    BuiltOk,
    BuiltFailed,
}

#[derive(Debug, Clone)]
pub struct ProjectState {
    pub status: BuildStatus,
    pub last_build_started_at: Option<DateTime<Local>>,
    pub last_build_finished_at: Option<DateTime<Local>>,
    /// 最近一次失败时保留的构建日志
    pub last_build_error: Option<String>,
    /// 最近一次失败的退出描述
    pub last_exit: Option<String>,
    pub last_timed_out: bool,
    /// 输出目录中的 HTML 当前对应的前缀
    pub built_base: Option<String>,
    /// 最近一次失败是否已经展示给用户。未展示的失败不会被普通请求重试
    pub failure_reported: bool,
}

impl ProjectState {
    fn from_disk(output_dir: &Path) -> Self {
        let built = dir_has_content(output_dir);
        let marker = if built { read_marker(output_dir) } else { None };
        Self {
            status: if built {
                BuildStatus::BuiltOk
            } else {
                BuildStatus::Unbuilt
            },
            last_build_started_at: None,
            last_build_finished_at: None,
            last_build_error: None,
            last_exit: None,
            last_timed_out: false,
            built_base: marker.map(|m| m.base_url),
            failure_reported: false,
        }
    }
}

/// 每次成功构建后写入输出目录的标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMarker {
    pub base_url: String,
    pub built_at: String,
}

pub fn read_marker(output_dir: &Path) -> Option<BuildMarker> {
    let text = fs::read_to_string(output_dir.join(BUILD_MARKER_FILE)).ok()?;
    match serde_json::from_str(&text) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!("构建标记{}无法解析：{}", output_dir.display(), e);
            None
        }
    }
}

pub fn write_marker(output_dir: &Path, marker: &BuildMarker) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(marker)?;
    fs::write(output_dir.join(BUILD_MARKER_FILE), text)
}

fn dir_has_content(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// 项目输出目录：`<project>/_build/html`
pub fn output_dir_of(project: &Path) -> PathBuf {
    BUILD_OUTPUT_DIR
        .iter()
        .fold(project.to_path_buf(), |acc, part| acc.join(part))
}

/// 某个项目目录在本进程中的唯一句柄
pub struct ProjectHandle {
    directory: PathBuf,
    output_dir: PathBuf,
    build_lock: Arc<AsyncMutex<()>>,
    state: Mutex<ProjectState>,
    finished: watch::Sender<u64>,
}

impl ProjectHandle {
    fn new(directory: PathBuf) -> Self {
        let output_dir = output_dir_of(&directory);
        let state = ProjectState::from_disk(&output_dir);
        debug!("项目{}初始状态：{:?}", directory.display(), state.status);
        let (finished, _) = watch::channel(0);
        Self {
            directory,
            output_dir,
            build_lock: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(state),
            finished,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 锁住状态单元，读写都要经过它
    pub fn state(&self) -> MutexGuard<'_, ProjectState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("项目{}的状态锁被污染，恢复并继续", self.directory.display());
            poisoned.into_inner()
        })
    }

    pub fn snapshot(&self) -> ProjectState {
        self.state().clone()
    }

    /// 非阻塞地获取构建锁，已被占用时返回 `None`
    pub fn try_lock_build(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.build_lock).try_lock_owned().ok()
    }

    pub fn is_build_locked(&self) -> bool {
        self.build_lock.try_lock().is_err()
    }

    /// 订阅构建完成事件
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.finished.subscribe()
    }

    pub fn notify_finished(&self) {
        self.finished.send_modify(|generation| *generation += 1);
    }
}

/// 进程级构建状态表，显式注入编排器
#[derive(Default)]
pub struct BuildStore {
    projects: Mutex<HashMap<PathBuf, Arc<ProjectHandle>>>,
}

impl BuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一个规范路径永远返回同一个句柄
    pub fn get_or_create(&self, project_dir: &Path) -> Arc<ProjectHandle> {
        let key = project_dir
            .canonicalize()
            .unwrap_or_else(|_| project_dir.to_path_buf());
        let mut projects = self.projects.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            projects
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ProjectHandle::new(key))),
        )
    }

    pub fn len(&self) -> usize {
        self.projects.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
