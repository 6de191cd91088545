// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

#[cfg(test)]
mod security_tests {
    //! # 安全回归测试
    //!
    //! 针对真实监听的服务器发送畸形或恶意报文，确认：
    //! - 路径不能越出项目根目录（`..`、编码形式、符号链接）
    //! - 构建产物中的隐藏文件不会被返回
    //! - 过大的请求头和慢速连接不会占住服务器
    //! - 重定向地址中不会出现注入的换行

    use myst_build_proxy::{config::Config, server, AppContext};

    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// 启动一个不会真正运行构建的服务器，返回端口和根目录
    async fn start(config: Config) -> (u16, TempDir) {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("public")).unwrap();
        fs::write(root.path().join("public/readme.txt"), "hello").unwrap();
        let config = config
            .with_project_root(root.path())
            .with_build_command(vec!["false".to_string()])
            .finalize();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(server::serve(listener, std::sync::Arc::new(AppContext::new(config))));
        (port, root)
    }

    async fn send_raw(port: u16, request: &[u8]) -> Result<String, String> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| e.to_string())?;
        stream.write_all(request).await.map_err(|e| e.to_string())?;

        let mut buffer = Vec::new();
        // 硬超时，防止服务器挂起导致测试永久阻塞
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buffer))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    async fn send_request(port: u16, request: &str) -> Result<String, String> {
        send_raw(port, request.as_bytes()).await
    }

    fn extract_status_code(response: &str) -> u16 {
        response
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    /// ## 路径遍历
    #[tokio::test]
    async fn test_path_traversal_simple() {
        let (port, _root) = start(Config::new()).await;
        for attack in [
            "GET /../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /public/../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /../../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ] {
            let response = send_request(port, attack).await.unwrap();
            assert_eq!(extract_status_code(&response), 400, "{}", attack);
        }
    }

    /// ## 编码后的路径遍历
    #[tokio::test]
    async fn test_path_traversal_encoded() {
        let (port, _root) = start(Config::new()).await;
        for attack in [
            "GET /%2e%2e/etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /..%2fetc%2fpasswd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /public/%2e%2e/%2e%2e/etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ] {
            let response = send_request(port, attack).await.unwrap();
            assert_eq!(extract_status_code(&response), 400, "{}", attack);
        }
    }

    /// ## 符号链接逃逸
    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("myst.yml"), "version: 1\n").unwrap();
        let (port, root) = start(Config::new()).await;
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();

        let response = send_request(port, "GET /escape/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(extract_status_code(&response), 400);
        assert!(!outside.path().join("_build").exists());
    }

    /// ## 空字节注入
    #[tokio::test]
    async fn test_null_byte_injection() {
        let (port, _root) = start(Config::new()).await;
        let response = send_request(port, "GET /public%00/readme.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(extract_status_code(&response), 400);
    }

    /// ## 超大请求头
    #[tokio::test]
    async fn test_oversized_header() {
        let (port, _root) = start(Config::new()).await;
        let request = format!(
            "GET / HTTP/1.1\r\nHost: localhost\r\nX-Padding: {}\r\n\r\n",
            "A".repeat(20 * 1024)
        );
        let response = send_request(port, &request).await.unwrap();
        assert_eq!(extract_status_code(&response), 431);
    }

    /// ## 非法协议版本与请求行
    #[tokio::test]
    async fn test_malformed_requests() {
        let (port, _root) = start(Config::new()).await;
        for bad in [
            "GET / HTTP/9.9\r\nHost: localhost\r\n\r\n",
            "GET\r\nHost: localhost\r\n\r\n",
            "GET relative/path HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ] {
            let response = send_request(port, bad).await.unwrap();
            assert_eq!(extract_status_code(&response), 400, "{}", bad);
        }
    }

    /// ## 非 UTF-8 请求
    #[tokio::test]
    async fn test_non_utf8_request() {
        let (port, _root) = start(Config::new()).await;
        let response = send_raw(port, b"GET /\xff\xfe HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(extract_status_code(&response), 400);
    }

    /// ## 不支持的方法
    #[tokio::test]
    async fn test_write_methods_rejected() {
        let (port, _root) = start(Config::new()).await;
        for method in ["POST", "PUT", "DELETE"] {
            let request = format!("{} /public/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n", method);
            let response = send_request(port, &request).await.unwrap();
            assert_eq!(extract_status_code(&response), 405, "{}", method);
            assert!(response.contains("Allow: GET, HEAD, OPTIONS"));
        }
    }

    /// ## 重定向中的 CRLF 注入
    #[tokio::test]
    async fn test_crlf_injection_in_redirect() {
        let (port, _root) = start(Config::new()).await;
        let response = send_request(
            port,
            "GET /public?x=%0d%0aSet-Cookie:%20evil=1 HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(extract_status_code(&response), 301);
        assert!(!response.contains("\r\nSet-Cookie"));
    }

    /// ## 构建产物中的隐藏文件
    #[tokio::test]
    async fn test_hidden_output_files_not_served() {
        let (port, root) = start(Config::new()).await;
        let project = root.path().join("docs");
        let out = project.join("_build/html");
        fs::create_dir_all(&out).unwrap();
        fs::write(project.join("myst.yml"), "version: 1\n").unwrap();
        fs::write(out.join("index.html"), "<html></html>").unwrap();
        fs::write(out.join(".myst-build-proxy.json"), "{}").unwrap();

        let response = send_request(port, "GET /docs/.myst-build-proxy.json HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(extract_status_code(&response), 404);
    }

    /// ## 慢速连接
    #[tokio::test]
    async fn test_slowloris_single() {
        let config = Config::from_toml_str("read_timeout_secs = 1").unwrap();
        let (port, _root) = start(config).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: local").await.unwrap();

        // 服务器应在读取超时后主动关闭连接
        let mut buffer = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buffer)).await;
        assert!(closed.is_ok(), "server kept a stalled connection open");
        assert!(buffer.is_empty());
    }
}
