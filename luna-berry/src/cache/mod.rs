//! 两级缓存.
//!
//! 1. [`ScanCache`]: 内存中常驻少量已解码的扫描. 解码一个扫描通常要数秒.
//! 2. [`ChunkStore`]: 按 `(series_uid, center_xyz, width_irc)` 缓存提取出的体素块,
//!   [`DiskChunkCache`] 可跨进程持久保存.
//!
//! [`ChunkSource`] 把二者组合为 "先查块缓存, 否则加载扫描并提取" 的完整流程.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::unsync::OnceCell;

use crate::consts::DEFAULT_SCAN_CACHE_CAPACITY;
use crate::data::{CtScan, RawChunk};
use crate::error::Result;
use crate::loader::ScanLoader;
use crate::Xyz;

mod store;

pub use store::{ChunkKey, ChunkStore, DiskChunkCache, MemoryChunkCache};

/// 有界的扫描缓存, 淘汰最久未使用的扫描.
///
/// 加载扫描时不持有内部锁, 因此多个线程不会因一次缓慢的加载而互相阻塞.
/// 代价是两个线程可能同时加载同一个扫描, 此时保留先插入的那份.
pub struct ScanCache<L> {
    loader: L,
    capacity: NonZeroUsize,

    /// 队尾为最近使用.
    resident: Mutex<VecDeque<Arc<CtScan>>>,
}

impl<L: ScanLoader> ScanCache<L> {
    /// 使用默认容量 [`DEFAULT_SCAN_CACHE_CAPACITY`].
    pub fn new(loader: L) -> Self {
        Self::with_capacity(
            loader,
            NonZeroUsize::new(DEFAULT_SCAN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )
    }

    /// 最多常驻 `capacity` 个扫描.
    pub fn with_capacity(loader: L, capacity: NonZeroUsize) -> Self {
        Self {
            loader,
            capacity,
            resident: Mutex::new(VecDeque::with_capacity(capacity.get())),
        }
    }

    /// 底层加载器.
    #[inline]
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// 缓存容量.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// 当前常驻的扫描标识, 从最久未使用到最近使用.
    pub fn resident_uids(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|scan| scan.series_uid().to_owned())
            .collect()
    }

    /// 获得 `series_uid` 对应的扫描.
    ///
    /// 命中时将其提升为最近使用; 未命中时通过加载器加载 (体素值会被截断),
    /// 插入缓存并淘汰超出容量的最久未使用项.
    pub fn get(&self, series_uid: &str) -> Result<Arc<CtScan>> {
        if let Some(scan) = Self::promote(&mut self.lock(), series_uid) {
            return Ok(scan);
        }

        log::debug!("Loading scan {series_uid}");
        let scan = Arc::new(CtScan::from_raw(series_uid, self.loader.load(series_uid)?)?);

        let mut resident = self.lock();
        // 加载期间可能已被其它线程放入.
        if let Some(existing) = Self::promote(&mut resident, series_uid) {
            return Ok(existing);
        }
        resident.push_back(Arc::clone(&scan));
        while resident.len() > self.capacity.get() {
            if let Some(evicted) = resident.pop_front() {
                log::debug!("Evicting scan {}", evicted.series_uid());
            }
        }
        Ok(scan)
    }

    fn promote(resident: &mut VecDeque<Arc<CtScan>>, series_uid: &str) -> Option<Arc<CtScan>> {
        let pos = resident.iter().position(|s| s.series_uid() == series_uid)?;
        let scan = resident.remove(pos)?;
        resident.push_back(Arc::clone(&scan));
        Some(scan)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<CtScan>>> {
        // 锁内不会 panic, 中毒后的数据仍然完整.
        self.resident.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 带持久缓存的体素块来源.
///
/// 对同一个 key 的并发计算不做互斥: 结果相同, 重复计算只浪费时间.
pub struct ChunkSource<L, S> {
    scans: ScanCache<L>,
    store: S,
}

impl<L: ScanLoader, S: ChunkStore> ChunkSource<L, S> {
    /// 组合扫描缓存与块缓存.
    pub fn new(scans: ScanCache<L>, store: S) -> Self {
        Self { scans, store }
    }

    /// 扫描缓存.
    #[inline]
    pub fn scans(&self) -> &ScanCache<L> {
        &self.scans
    }

    /// 块缓存.
    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// 获得以 `center_xyz` 为中心, 大小为 `width_irc` 的体素块.
    ///
    /// 先查块缓存; 未命中时经扫描缓存加载扫描并提取, 再写回块缓存.
    pub fn raw_candidate(
        &self,
        series_uid: &str,
        center_xyz: Xyz,
        width_irc: [usize; 3],
    ) -> Result<RawChunk> {
        let key = ChunkKey::new(series_uid, center_xyz, width_irc);
        if let Some(chunk) = self.store.lookup(&key)? {
            log::trace!("Chunk cache hit: {key}");
            return Ok(chunk);
        }
        log::trace!("Chunk cache miss: {key}");

        let chunk = self.scans.get(series_uid)?.raw_candidate(center_xyz, width_irc)?;
        self.store.store(&key, &chunk)?;
        Ok(chunk)
    }

    /// 预热同一个扫描上的一批块, 返回新写入的块数.
    ///
    /// 扫描至多加载一次, 且只在确有未命中的块时加载.
    pub fn warm(&self, series_uid: &str, centers: &[Xyz], width_irc: [usize; 3]) -> Result<usize> {
        let scan = OnceCell::new();
        let mut written = 0;
        for &center_xyz in centers {
            let key = ChunkKey::new(series_uid, center_xyz, width_irc);
            if self.store.lookup(&key)?.is_some() {
                continue;
            }
            let chunk = scan
                .get_or_try_init(|| self.scans.get(series_uid))?
                .raw_candidate(center_xyz, width_irc)?;
            self.store.store(&key, &chunk)?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkSource, MemoryChunkCache, ScanCache};
    use crate::consts::hu::{HU_MAX, HU_MIN};
    use crate::error::LunaError;
    use crate::loader::fixtures::{positional_raw, MemoryLoader};
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    fn loader() -> MemoryLoader {
        MemoryLoader::default()
            .with_scan("a", positional_raw((4, 5, 6)))
            .with_scan("b", positional_raw((4, 5, 6)))
            .with_scan("c", positional_raw((4, 5, 6)))
    }

    #[test]
    fn test_scan_cache_default_capacity() {
        let cache = ScanCache::new(loader());
        assert_eq!(cache.capacity(), 1);

        let first = cache.get("a").unwrap();
        let again = cache.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.loader().loads(), 1);

        cache.get("b").unwrap();
        assert_eq!(cache.resident_uids(), vec!["b".to_owned()]);
        cache.get("a").unwrap();
        assert_eq!(cache.loader().loads(), 3);
    }

    #[test]
    fn test_scan_cache_lru_order() {
        let cache = ScanCache::with_capacity(loader(), NonZeroUsize::new(2).unwrap());
        cache.get("a").unwrap();
        cache.get("b").unwrap();
        // 访问 a 使 b 成为最久未使用.
        cache.get("a").unwrap();
        cache.get("c").unwrap();
        assert_eq!(cache.resident_uids(), vec!["a".to_owned(), "c".to_owned()]);
        assert_eq!(cache.loader().loads(), 3);
    }

    #[test]
    fn test_scan_cache_clamps_and_propagates() {
        let mut raw = positional_raw((4, 5, 6));
        raw.data[(3, 4, 5)] = 3071.0;
        raw.data[(0, 0, 0)] = -2048.0;
        let cache = ScanCache::new(loader().with_scan("c", raw));
        let scan = cache.get("c").unwrap();
        assert_eq!(scan[(3, 4, 5)], HU_MAX);
        assert_eq!(scan[(0, 0, 0)], HU_MIN);
        assert_eq!(scan[(1, 2, 3)], 123.0 - 1000.0);
        assert!(matches!(cache.get("missing"), Err(LunaError::ScanNotFound(_))));
        assert_eq!(cache.resident_uids(), vec!["c".to_owned()]);
    }

    #[test]
    fn test_chunk_source_memoizes() {
        let source = ChunkSource::new(ScanCache::new(loader()), MemoryChunkCache::new());
        let first = source.raw_candidate("a", [2.0, 2.0, 2.0], [2, 3, 4]).unwrap();
        let second = source.raw_candidate("a", [2.0, 2.0, 2.0], [2, 3, 4]).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.scans().loader().loads(), 1);
        assert_eq!(source.store().len(), 1);

        // 不同窗口是不同的 key, 但扫描仍然命中.
        source.raw_candidate("a", [2.0, 2.0, 2.0], [2, 2, 2]).unwrap();
        assert_eq!(source.store().len(), 2);
        assert_eq!(source.scans().loader().loads(), 1);
    }

    #[test]
    fn test_chunk_source_errors_not_cached() {
        let source = ChunkSource::new(ScanCache::new(loader()), MemoryChunkCache::new());
        assert!(matches!(
            source.raw_candidate("a", [100.0, 0.0, 0.0], [2, 2, 2]),
            Err(LunaError::OutOfBounds { .. })
        ));
        assert_eq!(source.store().len(), 0);
    }

    #[test]
    fn test_chunk_source_warm() {
        let source = ChunkSource::new(ScanCache::new(loader()), MemoryChunkCache::new());
        let centers = [[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [0.0, 0.0, 0.0]];
        assert_eq!(source.warm("b", &centers, [2, 2, 2]).unwrap(), 2);
        assert_eq!(source.scans().loader().loads(), 1);

        // 全部命中时不再加载扫描.
        source.scans().get("a").unwrap();
        assert_eq!(source.warm("b", &centers, [2, 2, 2]).unwrap(), 0);
        assert_eq!(source.scans().loader().loads(), 2);
    }

    #[test]
    fn test_chunk_source_shared_between_threads() {
        let source = Arc::new(ChunkSource::new(
            ScanCache::new(loader()),
            MemoryChunkCache::new(),
        ));
        std::thread::scope(|s| {
            for t in 0..4 {
                let source = Arc::clone(&source);
                s.spawn(move || {
                    for c in 0..6 {
                        let chunk = source
                            .raw_candidate("a", [c as f64, (t % 5) as f64, 1.0], [2, 2, 2])
                            .unwrap();
                        assert_eq!(chunk.shape(), [2, 2, 2]);
                    }
                });
            }
        });
        assert!(source.store().len() <= 24);
    }
}
