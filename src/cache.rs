use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;

#[derive(Clone)]
struct CacheEntry {
    content: Bytes,
    modified_time: SystemTime,
}

/// 已构建站点文件的 LRU 缓存。
///
/// HTML 存的是改写后的字节，所以键里带上改写用的前缀。
pub struct FileCache {
    cache: LruCache<(PathBuf, String), CacheEntry>,
}

impl FileCache {
    // 容量为 0 时按 1 处理
    pub fn from_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    // 放入
    pub fn push(&mut self, path: &Path, prefix: &str, bytes: Bytes, modified_time: SystemTime) {
        let entry = CacheEntry {
            content: bytes,
            modified_time,
        };
        self.cache.put((path.to_path_buf(), prefix.to_string()), entry);
    }

    // 查询有效缓存，修改时间不一致视为失效
    pub fn find(&mut self, path: &Path, prefix: &str, current_modified_time: SystemTime) -> Option<Bytes> {
        let key = (path.to_path_buf(), prefix.to_string());
        match self.cache.get(&key) {
            Some(entry) if entry.modified_time == current_modified_time => {
                Some(entry.content.clone())
            }
            _ => None,
        }
    }

    /// 移除某个目录下的全部条目，构建结束后调用
    pub fn evict_under(&mut self, dir: &Path) -> usize {
        let stale: Vec<(PathBuf, String)> = self
            .cache
            .iter()
            .filter(|(key, _)| key.0.starts_with(dir))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.cache.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}
