// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 将 TCP 流中读取的原始字节解析为强类型的 `Request`：
//! 1. 请求行（方法、请求目标、版本）。
//! 2. 请求目标拆分为路径与查询字符串，`rebuild` 信号只从查询字符串中读取，
//!    不参与路径解析。
//! 3. 路由与内容协商用到的头部：`Accept`、`Accept-Encoding`、`User-Agent`、
//!    以及挂载层提供的 `X-Forwarded-Prefix`。

use crate::{exception::Exception, param::*};
use log::error;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Request {
    method: HttpRequestMethod,
    /// 原始请求目标中的路径部分（未解码）
    path: String,
    /// `?` 之后的查询字符串
    query: Option<String>,
    version: HttpVersion,
    /// 头部名称统一转为小写
    headers: HashMap<String, String>,
    accept_encoding: Vec<HttpEncoding>,
}

impl Request {
    /// 从原始字节缓冲区尝试构建 `Request` 实例。
    ///
    /// `buffer` 只需包含请求头部（到空行为止），请求体会被忽略。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let request_string = match std::str::from_utf8(buffer) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };
        let head = match request_string.split_once("\r\n\r\n") {
            Some((head, _body)) => head,
            None => request_string,
        };
        let mut lines = head.split(CRLF);

        // 请求行 (e.g., "GET /docs/?rebuild=1 HTTP/1.1")
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest);
        }

        let method = match parts[0].to_uppercase().as_str() {
            "GET" => HttpRequestMethod::Get,
            "HEAD" => HttpRequestMethod::Head,
            "OPTIONS" => HttpRequestMethod::Options,
            "POST" => HttpRequestMethod::Post,
            "PUT" => HttpRequestMethod::Put,
            "DELETE" => HttpRequestMethod::Delete,
            other => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, other);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version = match parts[2].to_uppercase().as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            other => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, other);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        let target = parts[1];
        if !target.starts_with('/') {
            error!("[ID{}]请求目标必须是绝对路径：{}", id, target);
            return Err(Exception::MalformedRequest);
        }
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };

        let mut headers = HashMap::new();
        for line in lines {
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
                None if line.is_empty() => {}
                None => {
                    error!("[ID{}]无法解析的请求头：{}", id, line);
                    return Err(Exception::MalformedRequest);
                }
            }
        }

        let accept_encoding = headers
            .get("accept-encoding")
            .map(|v| parse_accept_encoding(v))
            .unwrap_or_default();

        Ok(Self {
            method,
            path,
            query,
            version,
            headers,
            accept_encoding,
        })
    }
}

/// 解析 `Accept-Encoding`，忽略 `q=0` 的编码
fn parse_accept_encoding(value: &str) -> Vec<HttpEncoding> {
    let mut encodings = Vec::new();
    for item in value.split(',') {
        let mut fields = item.split(';');
        let name = fields.next().unwrap_or_default().trim().to_ascii_lowercase();
        let refused = fields.any(|f| {
            let f = f.trim();
            f == "q=0" || f == "q=0.0" || f == "q=0.00" || f == "q=0.000"
        });
        if refused {
            continue;
        }
        match name.as_str() {
            "gzip" => encodings.push(HttpEncoding::Gzip),
            "deflate" => encodings.push(HttpEncoding::Deflate),
            "br" => encodings.push(HttpEncoding::Br),
            _ => {}
        }
    }
    encodings
}

impl Request {
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 请求路径（不含查询字符串，未解码）
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("-")
    }

    pub fn accept_encoding(&self) -> &[HttpEncoding] {
        &self.accept_encoding
    }

    /// 客户端是否更希望得到 JSON（轮询脚本会带上 `Accept: application/json`）
    pub fn wants_json(&self) -> bool {
        self.header("accept")
            .is_some_and(|a| a.contains("application/json"))
    }

    /// 挂载层通过 `X-Forwarded-Prefix` 告知的对外前缀
    pub fn forwarded_prefix(&self) -> Option<&str> {
        self.header("x-forwarded-prefix").filter(|p| !p.is_empty())
    }

    /// 查询参数的值，只有键没有值时返回空串
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref().and_then(|q| {
            q.split('&').find_map(|pair| match pair.split_once('=') {
                Some((k, v)) if k == name => Some(v),
                None if pair == name => Some(""),
                _ => None,
            })
        })
    }

    /// 是否请求强制重建：`rebuild` 出现且不为 `0`/`false`
    pub fn rebuild_requested(&self) -> bool {
        match self.query_param(REBUILD_PARAM) {
            Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"),
            None => false,
        }
    }

    /// 去掉 `rebuild` 参数后剩余的查询字符串
    pub fn query_without_rebuild(&self) -> Option<String> {
        let rest: Vec<&str> = self
            .query
            .as_deref()?
            .split('&')
            .filter(|pair| {
                let key = pair.split_once('=').map_or(*pair, |(k, _)| k);
                key != REBUILD_PARAM && !pair.is_empty()
            })
            .collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join("&"))
        }
    }
}
