use chrono::{DateTime, Local};

use crate::{
    param::reason_phrase,
    resolver::DirectoryListing,
    rewrite::REBUILD_MARKER,
};

const BASE_CSS: &str = r"
            body {
                max-width: 50em;
                margin: 2em auto;
                padding: 0 1em;
                font-family: Tahoma, Verdana, Arial, sans-serif;
                line-height: 1.5;
            }
            code { background: #f3f3f3; padding: 0 .2em; }
            ";

pub struct HtmlBuilder {
    title: String,
    css: String,
    script: String,
    head_extra: String,
    body: String,
}

impl HtmlBuilder {
    fn with_body(title: String, body: String) -> Self {
        Self {
            title,
            css: BASE_CSS.to_string(),
            script: String::new(),
            head_extra: String::new(),
            body,
        }
    }

    /// 通用状态页。`note` 是已转义的 HTML 片段
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let description = match note {
            Some(n) => n.to_string(),
            None => format!("<p>{}</p>", reason_phrase(code)),
        };
        Self::with_body(
            format!("{} {}", code, reason_phrase(code)),
            format!("<h1>{}</h1>\n{}", code, description),
        )
    }

    /// 构建中的状态页。
    ///
    /// 脚本以 `Accept: application/json` 轮询当前地址，间隔从 `interval_ms`
    /// 开始翻倍直到 `max_interval_ms`，超过 `deadline_ms` 后停止轮询。
    /// 没有脚本时退化为 `<meta refresh>`。
    pub fn building(
        name: &str,
        started_at: Option<DateTime<Local>>,
        interval_ms: u64,
        max_interval_ms: u64,
        deadline_ms: u64,
    ) -> Self {
        let since = match started_at {
            Some(t) => format!(
                "<p>Started at <time datetime=\"{}\">{}</time>.</p>",
                t.to_rfc3339(),
                t.format("%Y-%m-%d %H:%M:%S")
            ),
            None => String::new(),
        };
        let body = format!(
            r#"<h1>Building {}</h1>
            <p id="myst-build-proxy-status">The MyST site is being built. This page reloads when it is ready.</p>
            {}"#,
            html_escape(name),
            since
        );
        let mut page = Self::with_body(format!("Building {}", name), body);
        page.script = format!(
            r#"
            (function () {{
                var delay = {interval}, maxDelay = {max}, deadline = Date.now() + {deadline};
                function poll() {{
                    if (Date.now() > deadline) {{
                        document.getElementById("myst-build-proxy-status").textContent =
                            "The build is taking longer than expected. Reload this page to check again.";
                        return;
                    }}
                    fetch(window.location.href, {{ headers: {{ "Accept": "application/json" }}, cache: "no-store" }})
                        .then(function (r) {{
                            if (r.status === 202) {{
                                delay = Math.min(delay * 2, maxDelay);
                                setTimeout(poll, delay);
                            }} else if (r.status >= 500) {{
                                r.json().then(showFailure, function () {{ window.location.reload(); }});
                            }} else {{
                                window.location.reload();
                            }}
                        }})
                        .catch(function () {{
                            delay = Math.min(delay * 2, maxDelay);
                            setTimeout(poll, delay);
                        }});
                }}
                function showFailure(info) {{
                    document.title = "Build failed";
                    var status = document.getElementById("myst-build-proxy-status");
                    status.textContent = (info.timed_out ? "The build timed out" : "The build failed")
                        + " (" + info.exit + "). ";
                    var link = document.createElement("a");
                    link.href = "?rebuild=1";
                    link.textContent = "Rebuild";
                    status.appendChild(link);
                    var log = document.createElement("pre");
                    log.textContent = info.log || "";
                    status.parentNode.appendChild(log);
                }}
                setTimeout(poll, delay);
            }})();
            "#,
            interval = interval_ms,
            max = max_interval_ms,
            deadline = deadline_ms
        );
        page.head_extra = format!(
            r#"<noscript><meta http-equiv="refresh" content="{}"></noscript>"#,
            max_interval_ms.div_ceil(1000).max(1)
        );
        page
    }

    /// 构建失败页，附带构建日志
    pub fn build_failed(
        name: &str,
        log: &str,
        exit: &str,
        timed_out: bool,
        finished_at: Option<DateTime<Local>>,
    ) -> Self {
        let headline = if timed_out {
            "The build timed out"
        } else {
            "The build failed"
        };
        let when = match finished_at {
            Some(t) => format!(" at {}", t.format("%Y-%m-%d %H:%M:%S")),
            None => String::new(),
        };
        let body = format!(
            r#"<h1>{} for {}</h1>
            <p>Result: <code>{}</code>{}.</p>
            <p><a {} href="?rebuild=1">Rebuild</a> after fixing the problem.</p>
            <h2>Build log</h2>
            <pre>{}</pre>"#,
            headline,
            html_escape(name),
            html_escape(exit),
            when,
            REBUILD_MARKER,
            html_escape(log)
        );
        let mut page = Self::with_body(format!("Build failed: {}", name), body);
        page.css.push_str("pre { background: #f6f6f6; padding: 1em; overflow-x: auto; white-space: pre-wrap; }");
        page
    }

    /// 目录中没有 `myst.yml` 时的专用页面
    pub fn no_project(name: &str, root_url: &str) -> Self {
        let body = format!(
            r#"<h1>No MyST project here</h1>
            <p>The directory <code>{}</code> does not contain a <code>myst.yml</code> file,
            so there is nothing to build.</p>
            <p>Run <code>myst init</code> in that directory to create a project,
            or go back to the <a href="{}">list of projects</a>.</p>"#,
            html_escape(name),
            html_escape(root_url)
        );
        Self::with_body("No MyST project here".to_string(), body)
    }

    /// 目录浏览页。`prefix` 是该目录对外的地址，以 `/` 结尾
    pub fn from_listing(listing: &DirectoryListing, prefix: &str) -> Self {
        let name = listing.display_name();
        let mut body = format!("<h1>MyST projects in {}</h1><hr>\n<ul>\n", html_escape(&name));
        if !listing.is_root() {
            body.push_str(r#"<li><a href="../">..</a></li>"#);
            body.push('\n');
        }
        for entry in &listing.entries {
            let href = format!(
                "{}{}/",
                prefix,
                percent_encoding::utf8_percent_encode(&entry.name, SEGMENT)
            );
            body.push_str(&format!(
                "<li><a href=\"{}\">{}/</a>{}</li>\n",
                html_escape(&href),
                html_escape(&entry.name),
                if entry.is_project { " (MyST project)" } else { "" }
            ));
        }
        body.push_str("</ul>");
        if listing.entries.is_empty() {
            body.push_str("<p>No sub-directories.</p>");
        }
        Self::with_body(format!("MyST projects in {}", name), body)
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
<html>
    <head>
        <meta charset="utf-8">
        <meta name="viewport" content="width=device-width, initial-scale=1">
        <title>{}</title>
        <style>{}</style>
        {}
        <script>{}</script>
    </head>
    <body>
    {}
    </body>
</html>"##,
            html_escape(&self.title),
            self.css,
            self.head_extra,
            self.script,
            self.body
        )
    }
}

/// 路径段中需要编码的字符
const SEGMENT: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ListingEntry, Segment};
    use std::path::PathBuf;

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"<script>alert("x") & 'y'</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_html_builder_from_status_code() {
        let html = HtmlBuilder::from_status_code(404, None).build();
        assert!(html.contains("<h1>404</h1>"));
        assert!(html.contains("Not Found"));
        assert!(html.contains("<!DOCTYPE html>"));
        assert!(html.contains("charset=\"utf-8\""));
    }

    #[test]
    fn test_unknown_status_code_does_not_panic() {
        let html = HtmlBuilder::from_status_code(999, None).build();
        assert!(html.contains("999"));
    }

    #[test]
    fn test_building_page_polls_with_backoff() {
        let html = HtmlBuilder::building("docs", Some(Local::now()), 1000, 10000, 600000).build();
        assert!(html.contains("Building docs"));
        assert!(html.contains("var delay = 1000, maxDelay = 10000"));
        assert!(html.contains("application/json"));
        assert!(html.contains(r#"<meta http-equiv="refresh" content="10">"#));
    }

    #[test]
    fn test_failure_page_escapes_log() {
        let html = HtmlBuilder::build_failed("docs", "error: <bad> & worse", "exit code 1", false, None).build();
        assert!(html.contains("error: &lt;bad&gt; &amp; worse"));
        assert!(!html.contains("<bad>"));
        assert!(html.contains("?rebuild=1"));
        assert!(html.contains("exit code 1"));
    }

    #[test]
    fn test_failure_page_mentions_timeout() {
        let html = HtmlBuilder::build_failed("docs", "", "timed out", true, None).build();
        assert!(html.contains("timed out"));
    }

    #[test]
    fn test_no_project_page_is_distinct() {
        let html = HtmlBuilder::no_project("notes/draft", "/myst/").build();
        let generic = HtmlBuilder::from_status_code(404, None).build();
        assert!(html.contains("No MyST project here"));
        assert!(html.contains("notes/draft"));
        assert!(!generic.contains("No MyST project here"));
    }

    #[test]
    fn test_listing_links_into_children() {
        let listing = DirectoryListing {
            directory: PathBuf::from("/srv/root/proj"),
            segments: vec![Segment {
                raw: "proj".to_string(),
                decoded: "proj".to_string(),
            }],
            entries: vec![
                ListingEntry {
                    name: "my notes".to_string(),
                    is_project: false,
                },
                ListingEntry {
                    name: "book".to_string(),
                    is_project: true,
                },
            ],
        };
        let html = HtmlBuilder::from_listing(&listing, "/user/alice/myst-build/proj/").build();
        assert!(html.contains(r#"href="/user/alice/myst-build/proj/my%20notes/""#));
        assert!(html.contains(r#"href="/user/alice/myst-build/proj/book/""#));
        assert!(html.contains("(MyST project)"));
        assert!(html.contains(r#"href="../""#));
    }
}
