// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 定义请求处理生命周期中可能出现的异常情况。
//!
//! - **协议类**：请求报文无法解析、方法或版本不受支持、头部过大。
//! - **路径类**：越权路径、资源不存在、目录中没有 `myst.yml`。
//! - **构建类**：构建失败或超时。这两类通常作为数据记录在项目状态上，
//!   只有在需要把它们渲染成页面时才以 `Exception` 的形式出现。
//!
//! 每个变体都能通过 [`Exception::status_code`] 映射到确定的 HTTP 状态码。

use std::fmt;
use std::path::PathBuf;

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// 请求字节流不是合法的 UTF-8。
    RequestIsNotUtf8,
    /// 请求行或头部格式不正确。
    MalformedRequest,
    /// 请求头部超过了 `MAX_REQUEST_HEAD`。
    RequestTooLarge,
    /// 服务器无法识别的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 服务器不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// 路径越过了项目根目录（`..` 或符号链接逃逸），或者包含非法字符。
    PathError(String),
    /// 请求的项目、目录或文件不存在。
    NotFound(String),
    /// 目录存在，但其中（及其祖先目录中）没有 `myst.yml`。
    MissingManifest(PathBuf),
    /// 构建工具以非零状态退出，或没有产出 `index.html`。
    BuildFailure(String),
    /// 构建超过了配置的时间上限并被终止。
    BuildTimeout(u64),
}

use Exception::*;

impl Exception {
    /// 异常对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            RequestIsNotUtf8 | MalformedRequest | UnsupportedHttpVersion => 400,
            RequestTooLarge => 431,
            UnSupportedRequestMethod => 405,
            PathError(_) => 400,
            NotFound(_) | MissingManifest(_) => 404,
            BuildFailure(_) | BuildTimeout(_) => 500,
        }
    }

    /// 是否属于客户端错误
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequest => write!(f, "Malformed HTTP request"),
            RequestTooLarge => write!(f, "Request head too large"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            PathError(p) => write!(f, "Invalid path: {}", p),
            NotFound(p) => write!(f, "Not found: {}", p),
            MissingManifest(dir) => write!(f, "No myst.yml in {}", dir.display()),
            BuildFailure(msg) => write!(f, "Build failed: {}", msg),
            BuildTimeout(secs) => write!(f, "Build timed out after {}s", secs),
        }
    }
}

impl std::error::Error for Exception {}
