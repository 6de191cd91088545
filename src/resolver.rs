// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路径解析模块
//!
//! 把挂载前缀之后的请求路径映射为 `(项目目录, 子路径)`。
//!
//! URL 中没有明确的分隔符区分“项目路径”和“站点内子路径”，因此从根目录开始
//! 逐段向下走：第一个包含 `myst.yml` 的目录就是项目目录，其后的所有段都是
//! 子路径。整个过程只做 `stat`/`read_dir`/`canonicalize`，不写任何东西。

use crate::{exception::Exception, param::MANIFEST_FILE};

use log::debug;
use percent_encoding::percent_decode_str;
use serde_derive::Serialize;

use std::fs;
use std::path::{Path, PathBuf};

/// 一个路径段，同时保留原始（编码后）与解码后的形式。
///
/// 原始形式用于拼接对外可见的前缀，解码形式用于访问文件系统。
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub raw: String,
    pub decoded: String,
}

/// 把请求路径切分成段，并做词法上的 `.`/`..` 归一化。
///
/// `..` 试图越过起点时返回 `PathError`。编码后的 `/`、`\` 与 NUL 同样视为非法。
pub fn split_path(path: &str) -> Result<Vec<Segment>, Exception> {
    let mut segments: Vec<Segment> = Vec::new();
    for raw in path.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| Exception::PathError(raw.to_string()))?
            .into_owned();
        if decoded.contains(['/', '\\', '\0']) {
            return Err(Exception::PathError(raw.to_string()));
        }
        match decoded.as_str() {
            "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Exception::PathError(path.to_string()));
                }
            }
            _ => segments.push(Segment {
                raw: raw.to_string(),
                decoded,
            }),
        }
    }
    Ok(segments)
}

/// 路径解析的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 找到了项目
    Project(ProjectPath),
    /// 没有项目，列出目录
    Browse(DirectoryListing),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPath {
    /// 规范化后的绝对项目目录
    pub directory: PathBuf,
    /// 根目录到项目目录经过的段
    pub project_segments: Vec<Segment>,
    /// 项目目录之后的段，即站点内的子路径
    pub sub_path: Vec<Segment>,
}

impl ProjectPath {
    /// 项目对外可见的前缀，总是以 `/` 结尾。`mount` 必须以 `/` 结尾。
    pub fn prefix(&self, mount: &str) -> String {
        join_prefix(mount, &self.project_segments)
    }

    /// 站点内子路径（解码形式），用于在输出目录中定位文件
    pub fn sub_path_decoded(&self) -> Vec<&str> {
        self.sub_path.iter().map(|s| s.decoded.as_str()).collect()
    }

    /// 相对根目录的显示名
    pub fn display_name(&self) -> String {
        display_segments(&self.project_segments)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryListing {
    pub directory: PathBuf,
    pub segments: Vec<Segment>,
    pub entries: Vec<ListingEntry>,
}

impl DirectoryListing {
    pub fn prefix(&self, mount: &str) -> String {
        join_prefix(mount, &self.segments)
    }

    pub fn display_name(&self) -> String {
        display_segments(&self.segments)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingEntry {
    pub name: String,
    pub is_project: bool,
}

fn join_prefix(mount: &str, segments: &[Segment]) -> String {
    let mut prefix = mount.to_string();
    for seg in segments {
        prefix.push_str(&seg.raw);
        prefix.push('/');
    }
    prefix
}

fn display_segments(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    segments
        .iter()
        .map(|s| s.decoded.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn has_manifest(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
}

/// 从 `root` 开始逐段解析 `segments`。
pub fn resolve(root: &Path, segments: &[Segment]) -> Result<Resolution, Exception> {
    let root = root
        .canonicalize()
        .map_err(|_| Exception::NotFound(root.display().to_string()))?;

    if has_manifest(&root) {
        debug!("根目录{}本身就是项目", root.display());
        return Ok(Resolution::Project(ProjectPath {
            directory: root,
            project_segments: Vec::new(),
            sub_path: segments.to_vec(),
        }));
    }

    let mut current = root.clone();
    for (i, seg) in segments.iter().enumerate() {
        let candidate = current.join(&seg.decoded);
        let is_dir = fs::metadata(&candidate).map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            if i == 0 {
                return Err(Exception::NotFound(seg.decoded.clone()));
            }
            // 走进过某个非项目目录，其下的任何请求都归为“没有 MyST 项目”
            return Err(Exception::MissingManifest(current));
        }

        let canonical = candidate
            .canonicalize()
            .map_err(|_| Exception::NotFound(seg.decoded.clone()))?;
        if !canonical.starts_with(&root) {
            return Err(Exception::PathError(format!(
                "{} escapes the project root",
                candidate.display()
            )));
        }
        current = canonical;

        if has_manifest(&current) {
            return Ok(Resolution::Project(ProjectPath {
                directory: current,
                project_segments: segments[..=i].to_vec(),
                sub_path: segments[i + 1..].to_vec(),
            }));
        }
    }

    let entries = list_children(&current)?;
    Ok(Resolution::Browse(DirectoryListing {
        directory: current,
        segments: segments.to_vec(),
        entries,
    }))
}

/// 列出子目录，隐藏目录与构建产物目录不列出
fn list_children(dir: &Path) -> Result<Vec<ListingEntry>, Exception> {
    let read = fs::read_dir(dir).map_err(|_| Exception::NotFound(dir.display().to_string()))?;
    let mut entries: Vec<ListingEntry> = read
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.starts_with('.') || name.starts_with('_') || name == "node_modules" {
                return None;
            }
            Some(ListingEntry {
                is_project: has_manifest(&entry.path()),
                name,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mkproject(root: &Path, rel: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), "version: 1\n").unwrap();
        dir
    }

    fn resolve_str(root: &Path, path: &str) -> Result<Resolution, Exception> {
        resolve(root, &split_path(path)?)
    }

    #[test]
    fn test_split_path_normalizes() {
        let segs = split_path("/a/./b/../c/").unwrap();
        let names: Vec<_> = segs.iter().map(|s| s.decoded.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn test_split_path_rejects_escape() {
        assert!(matches!(split_path("/../etc/passwd"), Err(Exception::PathError(_))));
        assert!(matches!(split_path("/a/../../b"), Err(Exception::PathError(_))));
        assert!(matches!(split_path("/%2e%2e/secret"), Err(Exception::PathError(_))));
        assert!(matches!(split_path("/a%2fb"), Err(Exception::PathError(_))));
    }

    #[test]
    fn test_split_path_keeps_raw_form() {
        let segs = split_path("/my%20notes/").unwrap();
        assert_eq!(segs[0].raw, "my%20notes");
        assert_eq!(segs[0].decoded, "my notes");
    }

    #[test]
    fn test_resolve_project_with_sub_path() {
        let tmp = TempDir::new().unwrap();
        let docs = mkproject(tmp.path(), "docs");
        let Resolution::Project(p) = resolve_str(tmp.path(), "/docs/guide/intro.html").unwrap()
        else {
            panic!("expected project");
        };
        assert_eq!(p.directory, docs.canonicalize().unwrap());
        assert_eq!(p.sub_path_decoded(), ["guide", "intro.html"]);
        assert_eq!(p.prefix("/user/alice/myst-build/"), "/user/alice/myst-build/docs/");
    }

    #[test]
    fn test_resolve_deep_project_not_ancestor() {
        let tmp = TempDir::new().unwrap();
        let deep = mkproject(tmp.path(), "proj/courses/stat134/fall-2025");
        let Resolution::Project(p) =
            resolve_str(tmp.path(), "/proj/courses/stat134/fall-2025/").unwrap()
        else {
            panic!("expected project");
        };
        assert_eq!(p.directory, deep.canonicalize().unwrap());
        assert!(p.sub_path.is_empty());
        assert_eq!(p.display_name(), "proj/courses/stat134/fall-2025");
    }

    #[test]
    fn test_resolve_project_named_like_route() {
        let tmp = TempDir::new().unwrap();
        mkproject(tmp.path(), "myst-build/docs");
        let Resolution::Project(p) = resolve_str(tmp.path(), "/myst-build/docs/").unwrap() else {
            panic!("expected project");
        };
        assert_eq!(
            p.prefix("/user/myst-build/myst-build/"),
            "/user/myst-build/myst-build/myst-build/docs/"
        );
    }

    #[test]
    fn test_resolve_root_project() {
        let tmp = TempDir::new().unwrap();
        mkproject(tmp.path(), "");
        let Resolution::Project(p) = resolve_str(tmp.path(), "/about/").unwrap() else {
            panic!("expected project");
        };
        assert!(p.project_segments.is_empty());
        assert_eq!(p.prefix("/myst/"), "/myst/");
    }

    #[test]
    fn test_resolve_browse_annotates_projects() {
        let tmp = TempDir::new().unwrap();
        mkproject(tmp.path(), "book");
        fs::create_dir_all(tmp.path().join("scratch")).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let Resolution::Browse(listing) = resolve_str(tmp.path(), "/").unwrap() else {
            panic!("expected listing");
        };
        assert!(listing.is_root());
        assert_eq!(
            listing.entries,
            vec![
                ListingEntry { name: "book".to_string(), is_project: true },
                ListingEntry { name: "scratch".to_string(), is_project: false },
            ]
        );
    }

    #[test]
    fn test_resolve_missing_manifest_under_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("scratch")).unwrap();
        let err = resolve_str(tmp.path(), "/scratch/index.html").unwrap_err();
        assert!(matches!(err, Exception::MissingManifest(dir) if dir.ends_with("scratch")));
    }

    #[test]
    fn test_resolve_not_found_at_top_level() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_str(tmp.path(), "/nope/").unwrap_err();
        assert_eq!(err, Exception::NotFound("nope".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        mkproject(outside.path(), "secret");
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("link"))
            .unwrap();
        let err = resolve_str(tmp.path(), "/link/").unwrap_err();
        assert!(matches!(err, Exception::PathError(_)));
    }
}
