use serde_derive::{Deserialize, Serialize};

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 运行参数。
///
/// 来源优先级：命令行位置参数 > 环境变量 > TOML 配置文件 > 默认值。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    project_root: PathBuf,
    port: u16,
    local: bool,
    worker_threads: usize,
    base_url: String,
    absolute_url: bool,
    build_command: Vec<String>,
    build_timeout_secs: u64,
    build_wait_ms: u64,
    poll_interval_ms: u64,
    poll_max_interval_ms: u64,
    postbuild_rebuild_button: bool,
    cache_size: usize,
    read_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            port: 7878,
            local: true,
            worker_threads: 0,
            base_url: "/".to_string(),
            absolute_url: false,
            build_command: ["myst", "build", "--html", "--ci"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            build_timeout_secs: 600,
            build_wait_ms: 1500,
            poll_interval_ms: 1000,
            poll_max_interval_ms: 10000,
            postbuild_rebuild_button: false,
            cache_size: 64,
            read_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// 读取配置文件；文件缺失或格式错误时给出警告并使用默认配置。
    pub fn from_toml(filename: &Path) -> Self {
        let text = match fs::read_to_string(filename) {
            Ok(t) => t,
            Err(e) => {
                warn!("无法读取配置文件{}：{}，使用默认配置", filename.display(), e);
                return Self::new();
            }
        };
        match Self::from_toml_str(&text) {
            Ok(c) => {
                info!("配置文件{}已载入", filename.display());
                c
            }
            Err(e) => {
                warn!("无法从配置文件{}构建配置对象：{}，使用默认配置", filename.display(), e);
                Self::new()
            }
        }
    }

    /// 用环境变量覆盖配置。`lookup` 在生产环境中就是 `std::env::var`。
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("JUPYTER_MYST_BUILD_PROXY_DIR").filter(|d| !d.is_empty()) {
            self.project_root = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("JUPYTER_MYST_BUILD_PROXY_POSTBUILD") {
            self.postbuild_rebuild_button = parse_flag(&flag);
        }
        if let Some(base) = lookup("MYST_BUILD_PROXY_BASE_URL").filter(|b| !b.is_empty()) {
            self.base_url = base;
        }
        if let Some(port) = lookup("MYST_BUILD_PROXY_PORT") {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => warn!("MYST_BUILD_PROXY_PORT={}不是合法端口，忽略", port),
            }
        }
        if let Some(secs) = lookup("MYST_BUILD_PROXY_TIMEOUT") {
            match secs.parse() {
                Ok(s) => self.build_timeout_secs = s,
                Err(_) => warn!("MYST_BUILD_PROXY_TIMEOUT={}不是合法秒数，忽略", secs),
            }
        }
    }

    /// 位置参数：`[port] [project_root] [base_url]`，与启动器的调用方式一致。
    pub fn apply_args(&mut self, args: &[String]) {
        if let Some(port) = args.first() {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => warn!("端口参数{}不合法，忽略", port),
            }
        }
        if let Some(root) = args.get(1) {
            self.project_root = PathBuf::from(root);
        }
        if let Some(base) = args.get(2) {
            self.base_url = base.clone();
        }
    }

    /// 补全派生值：工作线程数、绝对根目录、规范化的挂载前缀。
    pub fn finalize(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if self.project_root.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                self.project_root = cwd.join(&self.project_root);
            }
        }
        if let Ok(canonical) = self.project_root.canonicalize() {
            self.project_root = canonical;
        }
        self.base_url = normalize_base_url(&self.base_url);
        if self.build_command.is_empty() {
            warn!("build_command为空，恢复为默认的myst命令");
            self.build_command = Self::default().build_command;
        }
        if self.cache_size == 0 {
            warn!("cache_size被设置为0，该值将被改为1");
            self.cache_size = 1;
        }
        if self.poll_max_interval_ms < self.poll_interval_ms {
            self.poll_max_interval_ms = self.poll_interval_ms;
        }
        self
    }
}

/// 把挂载前缀统一成以 `/` 开头、以 `/` 结尾的形式
pub fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn absolute_url(&self) -> bool {
        self.absolute_url
    }

    pub fn build_command(&self) -> &[String] {
        &self.build_command
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn build_wait(&self) -> Duration {
        Duration::from_millis(self.build_wait_ms)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn poll_max_interval_ms(&self) -> u64 {
        self.poll_max_interval_ms
    }

    pub fn postbuild_rebuild_button(&self) -> bool {
        self.postbuild_rebuild_button
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// 测试与嵌入场景下直接设置字段
impl Config {
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = normalize_base_url(base);
        self
    }

    pub fn with_absolute_url(mut self, absolute: bool) -> Self {
        self.absolute_url = absolute;
        self
    }

    pub fn with_build_command(mut self, command: Vec<String>) -> Self {
        self.build_command = command;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_build_wait(mut self, wait: Duration) -> Self {
        self.build_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_rebuild_button(mut self, enabled: bool) -> Self {
        self.postbuild_rebuild_button = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::new();
        assert_eq!(c.port(), 7878);
        assert_eq!(c.build_command(), ["myst", "build", "--html", "--ci"]);
        assert!(!c.postbuild_rebuild_button());
        assert_eq!(c.build_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str("port = 9000\npostbuild_rebuild_button = true\n").unwrap();
        assert_eq!(c.port(), 9000);
        assert!(c.postbuild_rebuild_button());
        assert_eq!(c.cache_size(), 64);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let c = Config::from_toml(Path::new("/definitely/not/here.toml"));
        assert_eq!(c.port(), 7878);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("JUPYTER_MYST_BUILD_PROXY_DIR", "/srv/home"),
            ("JUPYTER_MYST_BUILD_PROXY_POSTBUILD", "yes"),
            ("MYST_BUILD_PROXY_BASE_URL", "/user/alice/myst-build"),
            ("MYST_BUILD_PROXY_PORT", "not-a-port"),
            ("MYST_BUILD_PROXY_TIMEOUT", "30"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::new();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.project_root(), Path::new("/srv/home"));
        assert!(c.postbuild_rebuild_button());
        assert_eq!(c.port(), 7878);
        assert_eq!(c.build_timeout(), Duration::from_secs(30));
        let c = c.finalize();
        assert_eq!(c.base_url(), "/user/alice/myst-build/");
    }

    #[test]
    fn test_positional_args() {
        let mut c = Config::new();
        c.apply_args(&["8123".to_string(), "/tmp".to_string(), "/myst".to_string()]);
        assert_eq!(c.port(), 8123);
        assert_eq!(c.project_root(), Path::new("/tmp"));
        assert_eq!(c.finalize().base_url(), "/myst/");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url(""), "/");
        assert_eq!(normalize_base_url("/"), "/");
        assert_eq!(normalize_base_url("myst"), "/myst/");
        assert_eq!(normalize_base_url("/user/bob/myst-build/"), "/user/bob/myst-build/");
    }

    #[test]
    fn test_finalize_fills_worker_threads() {
        let c = Config::new().finalize();
        assert!(c.worker_threads() >= 1);
        assert!(c.project_root().is_absolute());
    }
}
