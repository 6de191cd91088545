use crate::{
    cache::FileCache,
    exception::Exception,
    param::*,
    request::Request,
    rewrite::{transform_page, LinkRewriter},
    util::{html_escape, HtmlBuilder},
};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use bytes::Bytes;
use chrono::prelude::*;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, error, warn};

use std::{
    fs,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};

const HTML_TYPE: &str = "text/html;charset=utf-8";
const JSON_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    content_length: u64,
    date: DateTime<Utc>,
    content_encoding: Option<HttpEncoding>,
    server_name: String,
    allow: Option<Vec<HttpRequestMethod>>,
    location: Option<String>,
    cache_control: Option<String>,
    retry_after: Option<u64>,
    content: Option<Bytes>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            content_length: 0,
            date: Utc::now(),
            content_encoding: None,
            server_name: SERVER_NAME.to_string(),
            allow: None,
            location: None,
            cache_control: None,
            retry_after: None,
            content: None,
        }
    }

    /// 设置响应体，按客户端能力压缩。`HEAD` 请求只保留长度
    fn with_body(
        mut self,
        body: Vec<u8>,
        mime: &str,
        request: &Request,
        id: u128,
    ) -> Self {
        self.content_type = Some(mime.to_string());
        if request.method() == HttpRequestMethod::Head {
            self.content_length = body.len() as u64;
            self.content = None;
            return self;
        }

        self.content_encoding = match should_skip_compression(mime) {
            true => None,
            false => decide_encoding(request.accept_encoding()),
        };
        let original_size = body.len();
        let payload = match compress(&body, self.content_encoding) {
            Ok(c) => c,
            Err(e) => {
                error!("[ID{}]压缩失败：{}，返回未压缩内容", id, e);
                self.content_encoding = None;
                body
            }
        };
        if let Some(encoding) = self.content_encoding {
            debug!(
                "[ID{}]使用{}压缩：{} bytes -> {} bytes",
                id,
                encoding,
                original_size,
                payload.len()
            );
        }
        self.content_length = payload.len() as u64;
        self.content = Some(Bytes::from(payload));
        self
    }

    /// 从已构建站点的输出目录读取文件。
    ///
    /// HTML 会经过 `rewriter` 重新加前缀；缓存里存的是改写后、压缩前的字节。
    pub fn from_file(
        path: &Path,
        request: &Request,
        id: u128,
        cache: &Arc<Mutex<FileCache>>,
        rewriter: Option<&LinkRewriter>,
    ) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified = metadata.modified()?;
        let mime = mime_for(path.extension().and_then(|e| e.to_str()).unwrap_or(""));
        let is_html = mime.starts_with("text/html");
        let cache_prefix = match (is_html, rewriter) {
            (true, Some(r)) => r.base().to_string(),
            _ => String::new(),
        };

        let cached = {
            let mut cache = cache.lock().unwrap_or_else(|poisoned| {
                warn!("[ID{}]缓存锁被污染，恢复并继续", id);
                poisoned.into_inner()
            });
            cache.find(path, &cache_prefix, modified)
        };

        let bytes = match cached {
            Some(bytes) => {
                debug!("[ID{}]缓存命中：{}", id, path.display());
                bytes
            }
            None => {
                debug!("[ID{}]缓存未命中，读取文件{}", id, path.display());
                let raw = fs::read(path)?;
                let content = match (is_html, rewriter) {
                    (true, Some(r)) => Bytes::from(transform_page(&raw, r, false)),
                    _ => Bytes::from(raw),
                };
                let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
                cache.push(path, &cache_prefix, content.clone(), modified);
                content
            }
        };

        let mut response = Self::new().with_body(bytes.to_vec(), mime, request, id);
        if is_html {
            response.cache_control = Some("no-cache".to_string());
        }
        Ok(response)
    }

    pub fn from_html(code: u16, html: String, request: &Request, id: u128) -> Self {
        let mut response = Self::new().with_body(html.into_bytes(), HTML_TYPE, request, id);
        response.set_code(code);
        response
    }

    pub fn from_json(code: u16, value: &serde_json::Value, request: &Request, id: u128) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        let mut response = Self::new().with_body(body, JSON_TYPE, request, id);
        response.set_code(code);
        response.cache_control = Some("no-store".to_string());
        response
    }

    /// 通用状态页
    pub fn from_status_code(code: u16, request: &Request, id: u128) -> Self {
        let note = match code {
            404 => Some("<h2>噢！</h2><p>你指定的网页无法找到。</p>"),
            500 => Some("<h2>噢！</h2><p>服务器出现了一个内部错误。</p>"),
            _ => None,
        };
        Self::from_html(code, HtmlBuilder::from_status_code(code, note).build(), request, id)
    }

    /// 把请求处理中的异常渲染成页面
    pub fn from_exception(e: &Exception, request: &Request, id: u128) -> Self {
        let code = e.status_code();
        match e {
            Exception::MissingManifest(dir) => {
                Self::no_project(&dir.display().to_string(), "/", request, id)
            }
            Exception::PathError(_) | Exception::NotFound(_) => {
                Self::from_status_code(code, request, id)
            }
            other => {
                let note = format!("<p>{}</p>", html_escape(&other.to_string()));
                Self::from_html(
                    code,
                    HtmlBuilder::from_status_code(code, Some(&note)).build(),
                    request,
                    id,
                )
            }
        }
    }

    /// “这里没有 MyST 项目”页面，状态码 404，但内容与通用 404 不同
    pub fn no_project(name: &str, root_url: &str, request: &Request, id: u128) -> Self {
        if request.wants_json() {
            let value = serde_json::json!({ "status": "no_project", "directory": name });
            return Self::from_json(404, &value, request, id);
        }
        Self::from_html(404, HtmlBuilder::no_project(name, root_url).build(), request, id)
    }

    /// 无法解析请求时使用，不依赖 `Request`
    pub fn bare_error(e: &Exception) -> Self {
        let mut response = Self::new();
        let body = HtmlBuilder::from_status_code(e.status_code(), None).build();
        response.content_type = Some(HTML_TYPE.to_string());
        response.content_length = body.len() as u64;
        response.content = Some(Bytes::from(body));
        response.set_code(e.status_code());
        response
    }

    pub fn redirect(code: u16, location: &str) -> Self {
        let mut response = Self::new();
        response.set_code(code);
        response.location = Some(location.to_string());
        response.cache_control = Some("no-store".to_string());
        response
    }

    pub fn options() -> Self {
        let mut response = Self::new();
        response.set_code(204);
        response.allow = Some(ALLOWED_METHODS.to_vec());
        response
    }

    pub fn method_not_allowed(request: &Request, id: u128) -> Self {
        let mut response = Self::from_status_code(405, request, id);
        response.allow = Some(ALLOWED_METHODS.to_vec());
        response
    }

    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = reason_phrase(code).to_string();
        self
    }

    pub fn set_retry_after(&mut self, seconds: u64) -> &mut Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn set_cache_control(&mut self, value: &str) -> &mut Self {
        self.cache_control = Some(value.to_string());
        self
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut header = format!(
            "{} {} {}{}",
            self.version, self.status_code, self.information, CRLF
        );
        if let Some(t) = &self.content_type {
            header.push_str(&format!("Content-Type: {}{}", t, CRLF));
        }
        if let Some(e) = self.content_encoding {
            header.push_str(&format!("Content-Encoding: {}{}", e, CRLF));
            header.push_str(&format!("Vary: Accept-Encoding{}", CRLF));
        }
        header.push_str(&format!("Content-Length: {}{}", self.content_length, CRLF));
        header.push_str(&format!("Date: {}{}", format_date(&self.date), CRLF));
        header.push_str(&format!("Server: {}{}", self.server_name, CRLF));
        if let Some(a) = &self.allow {
            let methods: Vec<String> = a.iter().map(|m| m.to_string()).collect();
            header.push_str(&format!("Allow: {}{}", methods.join(", "), CRLF));
        }
        if let Some(l) = &self.location {
            header.push_str(&format!("Location: {}{}", l, CRLF));
        }
        if let Some(c) = &self.cache_control {
            header.push_str(&format!("Cache-Control: {}{}", c, CRLF));
        }
        if let Some(r) = self.retry_after {
            header.push_str(&format!("Retry-After: {}{}", r, CRLF));
        }
        header.push_str(&format!("Connection: close{}", CRLF));
        header.push_str(CRLF);

        let mut bytes = header.into_bytes();
        if let Some(c) = &self.content {
            bytes.extend_from_slice(c);
        }
        bytes
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        self.content_encoding
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn compress(data: &[u8], mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data.to_vec()),
    }
}

fn should_skip_compression(mime_type: &str) -> bool {
    const SKIP: [&str; 10] = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "video/",
        "audio/",
        "application/zip",
        "application/gzip",
        "font/woff",
        "font/woff2",
    ];
    SKIP.iter().any(|skip| mime_type.starts_with(skip))
}

/// 优先 br，其次 gzip、deflate
fn decide_encoding(accept_encoding: &[HttpEncoding]) -> Option<HttpEncoding> {
    [HttpEncoding::Br, HttpEncoding::Gzip, HttpEncoding::Deflate]
        .into_iter()
        .find(|e| accept_encoding.contains(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn request(raw: &str) -> Request {
        Request::try_from(raw.as_bytes(), 1).unwrap()
    }

    fn text(response: &Response) -> String {
        String::from_utf8_lossy(&response.as_bytes()).into_owned()
    }

    #[test]
    fn test_format_date_is_http_date() {
        let date = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        assert_eq!(format_date(&date), "Mon, 19 Oct 2026 08:30:00 GMT");
    }

    #[test]
    fn test_compress_gzip_round_trip() {
        let data = b"Hello, World! This is a test string for compression.".repeat(4);
        let compressed = compress(&data, Some(HttpEncoding::Gzip)).unwrap();
        assert_eq!(&compressed[0..2], &[0x1f, 0x8b]);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_compress_large_data() {
        let data = vec![b'A'; 10000];
        for mode in [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br] {
            assert!(compress(&data, Some(mode)).unwrap().len() < data.len());
        }
        assert_eq!(compress(&data, None).unwrap(), data);
    }

    #[test]
    fn test_decide_encoding_prefers_br() {
        assert_eq!(
            decide_encoding(&[HttpEncoding::Gzip, HttpEncoding::Br]),
            Some(HttpEncoding::Br)
        );
        assert_eq!(decide_encoding(&[HttpEncoding::Deflate]), Some(HttpEncoding::Deflate));
        assert_eq!(decide_encoding(&[]), None);
    }

    #[test]
    fn test_skip_compression_for_images() {
        assert!(should_skip_compression("image/png"));
        assert!(!should_skip_compression("text/css;charset=utf-8"));
    }

    #[test]
    fn test_response_as_bytes_basic() {
        let response = Response::new();
        let s = text(&response);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.contains("Server: myst-build-proxy\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_redirect_headers() {
        let s = text(&Response::redirect(303, "/myst/docs/"));
        assert!(s.starts_with("HTTP/1.1 303 See Other\r\n"));
        assert!(s.contains("Location: /myst/docs/\r\n"));
    }

    #[test]
    fn test_options_lists_allowed_methods() {
        let s = text(&Response::options());
        assert!(s.starts_with("HTTP/1.1 204 No Content"));
        assert!(s.contains("Allow: GET, HEAD, OPTIONS"));
    }

    #[test]
    fn test_from_html_compresses_when_accepted() {
        let req = request("GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        let response = Response::from_html(200, "<p>hi</p>".repeat(100), &req, 1);
        assert_eq!(response.content_encoding(), Some(HttpEncoding::Gzip));
        assert!(text(&response).contains("Content-Encoding: gzip"));
    }

    #[test]
    fn test_head_has_length_but_no_body() {
        let req = request("HEAD / HTTP/1.1\r\n\r\n");
        let response = Response::from_html(200, "<p>hi</p>".to_string(), &req, 1);
        assert!(response.body().is_none());
        assert_eq!(response.content_length(), 9);
        assert!(text(&response).ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_missing_manifest_page() {
        let req = request("GET /notes/ HTTP/1.1\r\n\r\n");
        let e = Exception::MissingManifest("notes".into());
        let response = Response::from_exception(&e, &req, 1);
        assert_eq!(response.status_code(), 404);
        assert!(text(&response).contains("No MyST project here"));
    }

    #[test]
    fn test_from_file_rewrites_html_and_caches() {
        let tmp = TempDir::new().unwrap();
        let page = tmp.path().join("index.html");
        fs::write(&page, r#"<a href="/myst/intro">x</a>"#).unwrap();
        let cache = Arc::new(Mutex::new(FileCache::from_capacity(4)));
        let req = request("GET /u/docs/ HTTP/1.1\r\n\r\n");
        let rewriter = LinkRewriter::new("/u/docs/").with_previous_base("/myst/");

        let first = Response::from_file(&page, &req, 1, &cache, Some(&rewriter)).unwrap();
        assert!(text(&first).contains(r#"href="/u/docs/intro""#));
        assert_eq!(cache.lock().unwrap().len(), 1);

        let second = Response::from_file(&page, &req, 2, &cache, Some(&rewriter)).unwrap();
        assert_eq!(first.body(), second.body());
    }

    #[test]
    fn test_from_file_leaves_assets_alone() {
        let tmp = TempDir::new().unwrap();
        let js = tmp.path().join("app.js");
        fs::write(&js, r#"fetch("/api")"#).unwrap();
        let cache = Arc::new(Mutex::new(FileCache::from_capacity(4)));
        let req = request("GET /app.js HTTP/1.1\r\n\r\n");
        let rewriter = LinkRewriter::new("/u/docs/");
        let response = Response::from_file(&js, &req, 1, &cache, Some(&rewriter)).unwrap();
        assert_eq!(response.body().unwrap().as_ref(), br#"fetch("/api")"#);
        assert_eq!(response.content_type(), Some("text/javascript;charset=utf-8"));
    }

    #[test]
    fn test_from_file_missing_is_error() {
        let cache = Arc::new(Mutex::new(FileCache::from_capacity(1)));
        let req = request("GET / HTTP/1.1\r\n\r\n");
        let missing = Path::new("/definitely/not/here.html");
        assert!(Response::from_file(missing, &req, 1, &cache, None).is_err());
    }
}
