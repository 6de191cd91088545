//! HTML 后处理：根相对链接加前缀、注入重建按钮。
//!
//! 这里的函数都是纯函数（字节 + 前缀 → 字节），不做任何 I/O。

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use std::borrow::Cow;

lazy_static! {
    /// 属性中的根相对地址：`href="/..."`、`src='/...'` 等
    static ref ATTR_RE: Regex = Regex::new(
        r#"(?P<lead>\b(?:href|src|action|poster|data-src)\s*=\s*)(?:"(?P<dq>/[^"]*)"|'(?P<sq>/[^']*)')"#
    )
    .expect("attribute pattern");

    /// 响应式图片的候选列表：`srcset="/a.png 1x, /b.png 2x"`
    static ref SRCSET_RE: Regex = Regex::new(
        r#"(?P<lead>\bsrcset\s*=\s*)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#
    )
    .expect("srcset pattern");

    /// 页面内嵌 JSON 数据中的地址，如 `"url":"/intro"`
    static ref JSON_RE: Regex = Regex::new(
        r#""(?P<key>url|href|src|thumbnail|thumbnailOptimized)":"(?P<url>/[^"]*)""#
    )
    .expect("json pattern");

    /// 内联样式中的 `url(/...)`
    static ref CSS_RE: Regex = Regex::new(
        r#"url\(\s*(?P<q>["']?)(?P<url>/[^)"'\s]*)"#
    )
    .expect("css pattern");
}

/// 重建按钮上的标记属性，用来避免重复注入
pub const REBUILD_MARKER: &str = "data-myst-build-proxy=\"rebuild\"";

const REBUILD_BUTTON: &str = concat!(
    "<a data-myst-build-proxy=\"rebuild\" href=\"?rebuild=1\" title=\"Rebuild this MyST site\" ",
    "style=\"position:fixed;bottom:1rem;right:1rem;z-index:9999;padding:.4rem .8rem;",
    "border-radius:4px;background:#2563eb;color:#fff;font:14px sans-serif;",
    "text-decoration:none;box-shadow:0 1px 3px rgba(0,0,0,.3)\">Rebuild</a>"
);

/// 根相对地址改写器。
///
/// `base` 是去掉末尾 `/` 的前缀（根前缀对应空串）。`previous` 是站点上一次
/// 构建/改写时使用的前缀，落在它下面的地址会被整体迁移到 `base` 下。
#[derive(Debug, Clone)]
pub struct LinkRewriter {
    base: String,
    previous: Option<String>,
}

impl LinkRewriter {
    pub fn new(prefix: &str) -> Self {
        Self {
            base: trim_prefix(prefix),
            previous: None,
        }
    }

    pub fn with_previous_base(mut self, previous: &str) -> Self {
        let previous = trim_prefix(previous);
        self.previous = if previous.is_empty() || previous == self.base {
            None
        } else {
            Some(previous)
        };
        self
    }

    /// 改写后的前缀（不含末尾 `/`）
    pub fn base(&self) -> &str {
        &self.base
    }

    /// 改写单个地址，不需要改写时返回 `None`
    pub fn rewrite_url(&self, url: &str) -> Option<String> {
        if !url.starts_with('/') || url.starts_with("//") {
            return None;
        }
        if !self.base.is_empty() && is_under(url, &self.base) {
            return None;
        }
        if let Some(prev) = &self.previous {
            if is_under(url, prev) {
                let rest = &url[prev.len()..];
                let rest = if rest.is_empty() && self.base.is_empty() {
                    "/"
                } else {
                    rest
                };
                return Some(format!("{}{}", self.base, rest));
            }
        }
        if self.base.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.base, url))
    }

    /// 改写一整页 HTML
    pub fn rewrite<'a>(&self, html: &'a str) -> Cow<'a, str> {
        if self.base.is_empty() && self.previous.is_none() {
            return Cow::Borrowed(html);
        }

        let step1 = ATTR_RE.replace_all(html, |caps: &Captures| {
            let lead = &caps["lead"];
            if let Some(m) = caps.name("dq") {
                let url = self.rewrite_url(m.as_str());
                format!("{}\"{}\"", lead, url.as_deref().unwrap_or(m.as_str()))
            } else {
                let m = &caps["sq"];
                let url = self.rewrite_url(m);
                format!("{}'{}'", lead, url.as_deref().unwrap_or(m))
            }
        });
        let step1b = SRCSET_RE.replace_all(&step1, |caps: &Captures| {
            let lead = &caps["lead"];
            match caps.name("dq") {
                Some(m) => format!("{}\"{}\"", lead, self.rewrite_srcset(m.as_str())),
                None => format!("{}'{}'", lead, self.rewrite_srcset(&caps["sq"])),
            }
        });
        let step2 = JSON_RE.replace_all(&step1b, |caps: &Captures| {
            let url = &caps["url"];
            let new = self.rewrite_url(url);
            format!("\"{}\":\"{}\"", &caps["key"], new.as_deref().unwrap_or(url))
        });
        let step3 = CSS_RE.replace_all(&step2, |caps: &Captures| {
            let url = &caps["url"];
            let new = self.rewrite_url(url);
            format!("url({}{}", &caps["q"], new.as_deref().unwrap_or(url))
        });

        let unchanged = matches!(step1, Cow::Borrowed(_))
            && matches!(step1b, Cow::Borrowed(_))
            && matches!(step2, Cow::Borrowed(_))
            && matches!(step3, Cow::Borrowed(_));
        if unchanged {
            Cow::Borrowed(html)
        } else {
            Cow::Owned(step3.into_owned())
        }
    }
}

impl LinkRewriter {
    /// 逐个改写 `srcset` 候选项的地址，保留描述符和空白。
    /// 含 `data:` 的列表原样保留，base64 里的逗号和 `/` 无法可靠切分。
    fn rewrite_srcset(&self, list: &str) -> String {
        if list.contains("data:") {
            return list.to_string();
        }
        list.split(',')
            .map(|candidate| {
                let trimmed = candidate.trim_start();
                let lead = &candidate[..candidate.len() - trimmed.len()];
                let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
                let (url, rest) = trimmed.split_at(end);
                match self.rewrite_url(url) {
                    Some(new) => format!("{}{}{}", lead, new, rest),
                    None => candidate.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn trim_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

fn is_under(url: &str, base: &str) -> bool {
    match url.strip_prefix(base) {
        Some(rest) => {
            rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('#')
        }
        None => false,
    }
}

/// 对原始 HTML 字节按前缀改写。非 UTF-8 内容原样返回。
pub fn rewrite_html(html: &[u8], prefix: &str) -> Vec<u8> {
    transform_page(html, &LinkRewriter::new(prefix), false)
}

/// 在 `</body>` 之前注入重建按钮；已经注入过的页面保持不变
pub fn inject_rebuild_button(html: &str) -> Cow<'_, str> {
    if html.contains(REBUILD_MARKER) {
        return Cow::Borrowed(html);
    }
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len() + REBUILD_BUTTON.len());
    match lower.rfind("</body>") {
        Some(pos) => {
            out.push_str(&html[..pos]);
            out.push_str(REBUILD_BUTTON);
            out.push_str(&html[pos..]);
        }
        None => {
            out.push_str(html);
            out.push_str(REBUILD_BUTTON);
        }
    }
    Cow::Owned(out)
}

/// 构建后与服务时共用的整页变换
pub fn transform_page(html: &[u8], rewriter: &LinkRewriter, rebuild_button: bool) -> Vec<u8> {
    let text = match std::str::from_utf8(html) {
        Ok(t) => t,
        Err(_) => return html.to_vec(),
    };
    let rewritten = rewriter.rewrite(text);
    if rebuild_button {
        inject_rebuild_button(&rewritten).into_owned().into_bytes()
    } else {
        rewritten.into_owned().into_bytes()
    }
}
