//! 数据集操作.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::cache::DiskChunkCache;
use crate::error::Result;
use crate::loader::MhdLoader;

mod luna;

pub use luna::{LunaDataset, LunaDatasetBuilder, LunaSample};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 收集 `{root}/subset*/*.mhd` 对应的所有 `series_uid`, 即本地实际存在的扫描.
pub fn present_series_uids<P: AsRef<Path>>(root: P) -> Result<HashSet<String>> {
    let ans = MhdLoader::new(root.as_ref()).present_series_uids()?;
    log::debug!("{} scans present under {}", ans.len(), root.as_ref().display());
    Ok(ans)
}

/// LUNA 数据集在本地的布局.
///
/// ```text
/// {root}/annotations.csv
/// {root}/candidates.csv
/// {root}/subset0/*.mhd, *.raw
/// ...
/// {cache}/{series_uid}/*.chunk
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LunaPaths {
    root: PathBuf,
    cache: PathBuf,
}

impl LunaPaths {
    /// 以 `root` 为根目录, 块缓存位于 `{root}/cache`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_owned();
        let cache = root.join("cache");
        Self { root, cache }
    }

    /// 修改块缓存目录.
    pub fn with_cache<P: AsRef<Path>>(mut self, cache: P) -> Self {
        self.cache = cache.as_ref().to_owned();
        self
    }

    /// 从环境变量或用户主目录获取.
    ///
    /// 1. 若环境变量 `$LUNA_DATA_DIR` 非空, 则以其为根目录;
    ///   否则以 `$HOME/dataset/luna` 为根目录;
    /// 2. 若环境变量 `$LUNA_CACHE_DIR` 非空, 则以其为块缓存目录;
    ///   否则以 `{root}/cache` 为块缓存目录.
    ///
    /// 既没有 `$LUNA_DATA_DIR` 又找不到用户主目录时返回 `None`.
    pub fn from_env_or_home() -> Option<Self> {
        let root = match non_empty_var("LUNA_DATA_DIR") {
            Some(d) => PathBuf::from(d),
            None => home_dataset_dir_with(["luna"])?,
        };
        let paths = Self::new(root);
        Some(match non_empty_var("LUNA_CACHE_DIR") {
            Some(d) => paths.with_cache(d),
            None => paths,
        })
    }

    /// 数据集根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 块缓存目录.
    #[inline]
    pub fn cache(&self) -> &Path {
        &self.cache
    }

    /// `annotations.csv` 路径.
    pub fn annotations_csv(&self) -> PathBuf {
        self.root.join("annotations.csv")
    }

    /// `candidates.csv` 路径.
    pub fn candidates_csv(&self) -> PathBuf {
        self.root.join("candidates.csv")
    }

    /// 读取本数据集扫描的加载器.
    pub fn mhd_loader(&self) -> MhdLoader {
        MhdLoader::new(&self.root)
    }

    /// 位于块缓存目录的磁盘缓存.
    pub fn disk_chunk_cache(&self) -> DiskChunkCache {
        DiskChunkCache::new(&self.cache)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
