//! 外部构建进程的调用抽象。
//!
//! 编排器只依赖 [`BuildRunner`]：给定程序、参数、工作目录和显式的环境变量表，
//! 返回结构化的 [`BuildReport`]。进程级环境变量从不被修改。

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};

use std::{
    fmt,
    future::Future,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// 构建日志最多保留的字节数（保留末尾）
const MAX_LOG_BYTES: usize = 512 * 1024;

/// 进程退出后等待输出管道关闭的时间
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

lazy_static! {
    static ref ANSI_RE: Regex = Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi pattern");
}

/// 一次构建调用
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl BuildInvocation {
    /// 由命令行数组构造，第一个元素是程序名
    pub fn from_command(command: &[String], cwd: PathBuf, timeout: Duration) -> Self {
        let (program, args) = match command.split_first() {
            Some((p, rest)) => (p.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            cwd,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitKind {
    /// 正常退出并带有退出码
    Exited(i32),
    /// 被信号终止
    Signaled,
    /// 超时后被强制终止
    TimedOut,
    /// 进程无法启动或等待失败
    Failed(String),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {}", code),
            ExitKind::Signaled => write!(f, "terminated by signal"),
            ExitKind::TimedOut => write!(f, "timed out"),
            ExitKind::Failed(msg) => write!(f, "failed to run: {}", msg),
        }
    }
}

/// 构建进程的结构化结果
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub exit: ExitKind,
    /// stdout 与 stderr 按到达顺序合并后的输出，已去掉 ANSI 控制序列
    pub log: String,
    pub duration: Duration,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.exit == ExitKind::Exited(0)
    }

    pub fn timed_out(&self) -> bool {
        self.exit == ExitKind::TimedOut
    }
}

pub type BuildFuture = Pin<Box<dyn Future<Output = BuildReport> + Send>>;

#[cfg_attr(test, mockall::automock)]
pub trait BuildRunner: Send + Sync {
    fn run(&self, invocation: BuildInvocation) -> BuildFuture;
}

/// 通过 `tokio::process` 真正启动子进程的实现
#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl BuildRunner for CommandRunner {
    fn run(&self, invocation: BuildInvocation) -> BuildFuture {
        Box::pin(run_command(invocation))
    }
}

async fn run_command(invocation: BuildInvocation) -> BuildReport {
    let start = Instant::now();
    debug!(
        "启动构建进程：{}（工作目录 {}）",
        invocation.command_line(),
        invocation.cwd.display()
    );

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // 构建进程自成一个进程组，超时后连同它派生的进程一起终止
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("无法启动构建进程{}：{}", invocation.program, e);
            return BuildReport {
                exit: ExitKind::Failed(e.to_string()),
                log: format!(
                    "Could not start `{}`: {}\nIs the MyST CLI (mystmd) installed and on PATH?\n",
                    invocation.command_line(),
                    e
                ),
                duration: start.elapsed(),
            };
        }
    };

    let group = child.id();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, Arc::clone(&sink))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, Arc::clone(&sink))));
    }

    let exit = match tokio::time::timeout(invocation.timeout, child.wait()).await {
        Ok(Ok(status)) => match status.code() {
            Some(code) => ExitKind::Exited(code),
            None => ExitKind::Signaled,
        },
        Ok(Err(e)) => ExitKind::Failed(e.to_string()),
        Err(_) => {
            warn!(
                "构建进程超过{}秒未结束，强制终止",
                invocation.timeout.as_secs()
            );
            kill_process_group(group);
            if let Err(e) = child.kill().await {
                warn!("终止构建进程失败：{}", e);
            }
            ExitKind::TimedOut
        }
    };

    // 孙进程可能仍持有管道，不能无限等待
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let raw = {
        let guard = sink.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    };
    let mut log = strip_ansi(&raw);
    if exit == ExitKind::TimedOut {
        log.push_str(&format!(
            "\n[myst-build-proxy] build exceeded the {}s timeout and was terminated\n",
            invocation.timeout.as_secs()
        ));
    }

    BuildReport {
        exit,
        log,
        duration: start.elapsed(),
    }
}

/// 向整个进程组发送 SIGKILL
#[cfg(unix)]
fn kill_process_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // 负的 pid 表示整个进程组
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result == 0 {
        debug!("已终止进程组{}", pgid);
    } else {
        warn!("终止进程组{}失败：{}", pgid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: Option<u32>) {}

async fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut log = sink.lock().unwrap_or_else(|p| p.into_inner());
                log.extend_from_slice(&buf[..n]);
                if log.len() > MAX_LOG_BYTES {
                    let excess = log.len() - MAX_LOG_BYTES;
                    log.drain(..excess);
                }
            }
        }
    }
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> BuildInvocation {
        BuildInvocation::from_command(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            std::env::temp_dir(),
            timeout,
        )
    }

    #[test]
    fn test_invocation_from_command() {
        let cmd: Vec<String> = ["myst", "build", "--html", "--ci"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let inv = BuildInvocation::from_command(&cmd, PathBuf::from("/p"), Duration::from_secs(1))
            .env("BASE_URL", "/myst/docs");
        assert_eq!(inv.program, "myst");
        assert_eq!(inv.args, ["build", "--html", "--ci"]);
        assert_eq!(inv.env, [("BASE_URL".to_string(), "/myst/docs".to_string())]);
        assert_eq!(inv.command_line(), "myst build --html --ci");
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31merror\x1b[0m: boom"), "error: boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_captures_output_and_env() {
        let inv = sh("echo out; echo err >&2; echo \"$BASE_URL\"", Duration::from_secs(10))
            .env("BASE_URL", "/user/alice/docs");
        let report = CommandRunner.run(inv).await;
        assert!(report.success(), "{:?}", report);
        assert!(report.log.contains("out"));
        assert!(report.log.contains("err"));
        assert!(report.log.contains("/user/alice/docs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_nonzero_exit() {
        let report = CommandRunner.run(sh("echo broken; exit 3", Duration::from_secs(10))).await;
        assert_eq!(report.exit, ExitKind::Exited(3));
        assert!(!report.success());
        assert!(report.log.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_timeout_kills() {
        let start = Instant::now();
        let report = CommandRunner.run(sh("exec sleep 30", Duration::from_secs(1))).await;
        assert!(report.timed_out());
        assert!(report.log.contains("timeout"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let tmp = tempfile::TempDir::new().unwrap();
        let late = tmp.path().join("late");
        let script = format!("(sleep 2; touch '{}') & wait", late.display());
        let report = CommandRunner.run(sh(&script, Duration::from_secs(1))).await;
        assert!(report.timed_out());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!late.exists(), "a child of the timed-out build kept running");
    }

    #[tokio::test]
    async fn test_command_runner_missing_program() {
        let inv = BuildInvocation::from_command(
            &["definitely-not-a-real-myst-binary".to_string()],
            std::env::temp_dir(),
            Duration::from_secs(1),
        );
        let report = CommandRunner.run(inv).await;
        assert!(matches!(report.exit, ExitKind::Failed(_)));
        assert!(report.log.contains("mystmd"));
    }
}
