use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::data::RawChunk;
use crate::error::Result;
use crate::loader::check_series_uid;
use crate::Xyz;

/// 体素块缓存的 key: `(series_uid, center_xyz, width_irc)`.
///
/// 浮点坐标按位比较: 两个中心只有在 IEEE-754 位模式完全一致时才相等,
/// 相差一个 ULP 的坐标是不同的 key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    series_uid: String,
    center_bits: [u64; 3],
    width_irc: [usize; 3],
}

impl ChunkKey {
    /// 构造 key.
    pub fn new(series_uid: impl Into<String>, center_xyz: Xyz, width_irc: [usize; 3]) -> Self {
        Self {
            series_uid: series_uid.into(),
            center_bits: center_xyz.map(f64::to_bits),
            width_irc,
        }
    }

    /// 扫描标识.
    #[inline]
    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    /// 候选中心的物理坐标.
    #[inline]
    pub fn center_xyz(&self) -> Xyz {
        self.center_bits.map(f64::from_bits)
    }

    /// 窗口大小.
    #[inline]
    pub fn width_irc(&self) -> [usize; 3] {
        self.width_irc
    }

    /// 缓存文件名. 与 key 一一对应 (不含 `series_uid`, 它作为目录名).
    fn file_name(&self) -> String {
        let [x, y, z] = self.center_bits;
        let [i, r, c] = self.width_irc;
        format!("{x:016x}_{y:016x}_{z:016x}_{i}x{r}x{c}.chunk")
    }
}

impl Display for ChunkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.center_xyz();
        let [i, r, c] = self.width_irc;
        write!(f, "{}@({x}, {y}, {z})[{i}x{r}x{c}]", self.series_uid)
    }
}

/// 体素块缓存.
///
/// 实现者可能会被多个线程同时调用, 对同一个 key 的并发写入应当是安全的.
pub trait ChunkStore {
    /// 查找 `key` 对应的块. 不存在时返回 `Ok(None)`.
    fn lookup(&self, key: &ChunkKey) -> Result<Option<RawChunk>>;

    /// 写入 `key` 对应的块, 覆盖已有值.
    fn store(&self, key: &ChunkKey, chunk: &RawChunk) -> Result<()>;
}

impl<S: ChunkStore + ?Sized> ChunkStore for &S {
    #[inline]
    fn lookup(&self, key: &ChunkKey) -> Result<Option<RawChunk>> {
        (**self).lookup(key)
    }

    #[inline]
    fn store(&self, key: &ChunkKey, chunk: &RawChunk) -> Result<()> {
        (**self).store(key, chunk)
    }
}

impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    #[inline]
    fn lookup(&self, key: &ChunkKey) -> Result<Option<RawChunk>> {
        (**self).lookup(key)
    }

    #[inline]
    fn store(&self, key: &ChunkKey, chunk: &RawChunk) -> Result<()> {
        (**self).store(key, chunk)
    }
}

/// 用于生成唯一的临时文件名.
static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// 磁盘块缓存. 每个 key 一个文件: `{dir}/{series_uid}/{center bits}_{width}.chunk`.
///
/// 文件内容为 zlib 压缩的 bincode `(ChunkKey, RawChunk)`. 写入先落到同目录的临时文件,
/// 再重命名到目标位置, 因此读者要么看到完整的旧文件, 要么看到完整的新文件.
/// 无法解码或 key 不符的文件视为未命中.
#[derive(Clone, Debug)]
pub struct DiskChunkCache {
    dir: PathBuf,
}

impl DiskChunkCache {
    /// 在 `dir` 下缓存. 目录在首次写入时创建.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    /// 缓存根目录.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &ChunkKey) -> Result<PathBuf> {
        check_series_uid(key.series_uid())?;
        Ok(self.dir.join(key.series_uid()).join(key.file_name()))
    }

    fn decode(file: File) -> bincode::Result<(ChunkKey, RawChunk)> {
        bincode::deserialize_from(ZlibDecoder::new(BufReader::new(file)))
    }
}

impl ChunkStore for DiskChunkCache {
    fn lookup(&self, key: &ChunkKey) -> Result<Option<RawChunk>> {
        let path = self.path_of(key)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Self::decode(file) {
            Ok((stored, chunk)) if stored == *key && chunk.shape() == key.width_irc() => {
                Ok(Some(chunk))
            }
            Ok((stored, _)) => {
                log::warn!("Discarding cache entry {}: stored for {stored}", path.display());
                Ok(None)
            }
            Err(e) => {
                log::warn!("Discarding unreadable cache entry {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn store(&self, key: &ChunkKey, chunk: &RawChunk) -> Result<()> {
        let path = self.path_of(key)?;
        let parent = self.dir.join(key.series_uid());
        fs::create_dir_all(&parent)?;

        let tmp = parent.join(format!(
            ".{}.{}.{}.tmp",
            key.file_name(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = (|| -> Result<()> {
            let mut encoder =
                ZlibEncoder::new(BufWriter::new(File::create(&tmp)?), Compression::fast());
            bincode::serialize_into(&mut encoder, &(key, chunk))?;
            let mut writer = encoder.finish()?;
            io::Write::flush(&mut writer)?;
            Ok(())
        })();
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &path).map_err(Into::into)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
}

/// 内存块缓存, 用于测试和一次性运行.
#[derive(Debug, Default)]
pub struct MemoryChunkCache {
    chunks: Mutex<HashMap<ChunkKey, RawChunk>>,
}

impl MemoryChunkCache {
    /// 空缓存.
    pub fn new() -> Self {
        Self::default()
    }

    /// 已缓存的块数.
    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 缓存是否为空.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkStore for MemoryChunkCache {
    fn lookup(&self, key: &ChunkKey) -> Result<Option<RawChunk>> {
        let chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(chunks.get(key).cloned())
    }

    fn store(&self, key: &ChunkKey, chunk: &RawChunk) -> Result<()> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), chunk.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkKey, ChunkStore, DiskChunkCache, MemoryChunkCache};
    use crate::data::RawChunk;
    use crate::error::LunaError;
    use ndarray::Array3;
    use std::fs;

    fn chunk(seed: f32) -> RawChunk {
        RawChunk::new(
            Array3::from_shape_fn((2, 3, 4), |(i, r, c)| seed + (i * 12 + r * 4 + c) as f32),
            [7, 8, 9],
        )
    }

    fn key(x: f64) -> ChunkKey {
        ChunkKey::new("1.2.840.113654", [x, -175.3192718, -298.3875064], [2, 3, 4])
    }

    #[test]
    fn test_key_equality_is_bitwise() {
        let x = -128.6994211f64;
        let next = f64::from_bits(x.to_bits() + 1);
        assert_ne!(key(x), key(next));
        assert_ne!(key(x).file_name(), key(next).file_name());
        assert_eq!(key(x), key(x));
        assert_eq!(key(x).center_xyz()[0], x);
        // 0.0 与 -0.0 位模式不同.
        assert_ne!(key(0.0), key(-0.0));
    }

    #[test]
    fn test_disk_cache_round_trip_and_persistence() {
        let _ = simple_logger::SimpleLogger::new().init();
        let dir = tempfile::tempdir().unwrap();
        let x = -128.6994211f64;
        let next = f64::from_bits(x.to_bits() + 1);

        let cache = DiskChunkCache::new(dir.path().join("chunks"));
        assert_eq!(cache.lookup(&key(x)).unwrap(), None);
        cache.store(&key(x), &chunk(0.0)).unwrap();
        cache.store(&key(next), &chunk(100.0)).unwrap();

        // 新实例读取同一目录, 模拟进程重启.
        let reopened = DiskChunkCache::new(dir.path().join("chunks"));
        assert_eq!(reopened.lookup(&key(x)).unwrap(), Some(chunk(0.0)));
        assert_eq!(reopened.lookup(&key(next)).unwrap(), Some(chunk(100.0)));

        // 覆盖写.
        reopened.store(&key(x), &chunk(5.0)).unwrap();
        assert_eq!(cache.lookup(&key(x)).unwrap(), Some(chunk(5.0)));

        // 没有残留的临时文件.
        let leftovers = fs::read_dir(dir.path().join("chunks").join("1.2.840.113654"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_disk_cache_corrupt_entry_is_miss() {
        let _ = simple_logger::SimpleLogger::new().init();
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskChunkCache::new(dir.path());
        cache.store(&key(1.0), &chunk(0.0)).unwrap();

        let path = cache.path_of(&key(1.0)).unwrap();
        fs::write(&path, b"definitely not zlib").unwrap();
        assert_eq!(cache.lookup(&key(1.0)).unwrap(), None);

        // 文件内容属于另一个 key.
        cache.store(&key(2.0), &chunk(0.0)).unwrap();
        fs::copy(cache.path_of(&key(2.0)).unwrap(), &path).unwrap();
        assert_eq!(cache.lookup(&key(1.0)).unwrap(), None);

        // 重新写入后恢复.
        cache.store(&key(1.0), &chunk(3.0)).unwrap();
        assert_eq!(cache.lookup(&key(1.0)).unwrap(), Some(chunk(3.0)));
    }

    #[test]
    fn test_disk_cache_rejects_unsafe_uid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskChunkCache::new(dir.path());
        let bad = ChunkKey::new("../escape", [0.0; 3], [1, 1, 1]);
        assert!(matches!(
            cache.store(&bad, &chunk(0.0)),
            Err(LunaError::InvalidSeriesUid(_))
        ));
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryChunkCache::new();
        assert!(cache.is_empty());
        cache.store(&key(1.0), &chunk(1.0)).unwrap();
        assert_eq!(cache.lookup(&key(1.0)).unwrap(), Some(chunk(1.0)));
        assert_eq!(cache.lookup(&key(f64::from_bits(1.0f64.to_bits() + 1))).unwrap(), None);
        assert_eq!(cache.len(), 1);
    }
}
