//! LUNA 候选样本数据集.

use std::cmp::Ordering;
use std::sync::Arc;

use ndarray::{Array4, Axis};
use ordered_float::OrderedFloat;
use rand::Rng;

use crate::augment::{augment_chunk, Augmentation};
use crate::cache::{ChunkSource, ChunkStore};
use crate::candidate::{Candidate, CandidateRegistry};
use crate::consts::{DEFAULT_VAL_STRIDE, WIDTH_IRC};
use crate::error::{LunaError, Result};
use crate::loader::ScanLoader;
use crate::{Irc, Xyz};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 数据集的一个样本.
#[derive(Clone, Debug, PartialEq)]
pub struct LunaSample {
    /// 体素块, 形状为 `[1, I, R, C]` (单通道).
    pub chunk: Array4<f32>,

    /// 两类别 one-hot 标签, 顺序为 `[非结节, 结节]`.
    pub label: [i64; 2],

    /// 所属扫描.
    pub series_uid: String,

    /// 候选中心的体素坐标.
    pub center_irc: Irc,
}

/// 候选样本数据集.
///
/// 候选按 `(series_uid, center_xyz)` 升序排列, 使相邻样本落在同一扫描上,
/// 从而让容量很小的扫描缓存也能有很高的命中率.
///
/// 设置 `ratio = k` 后, 索引 `0, k + 1, 2(k + 1), ...` 取正样本, 其余取负样本,
/// 两类各自循环使用. 此时任何索引都合法.
pub struct LunaDataset<L, S> {
    source: Arc<ChunkSource<L, S>>,
    candidates: Vec<Candidate>,

    /// 正样本在 `candidates` 中的下标, 保持相对顺序.
    positive: Vec<usize>,

    /// 负样本在 `candidates` 中的下标, 保持相对顺序.
    negative: Vec<usize>,

    ratio: Option<usize>,
    augmentation: Option<Augmentation>,
    width_irc: [usize; 3],
}

/// [`LunaDataset`] 的构建器.
pub struct LunaDatasetBuilder<'a, L, S> {
    source: Arc<ChunkSource<L, S>>,
    registry: &'a CandidateRegistry,
    val_stride: usize,
    validation: bool,
    series_uid: Option<String>,
    ratio: Option<usize>,
    augmentation: Option<Augmentation>,
    width_irc: [usize; 3],
}

impl<'a, L: ScanLoader, S: ChunkStore> LunaDatasetBuilder<'a, L, S> {
    /// 验证集步长, 默认为 [`DEFAULT_VAL_STRIDE`]. 必须为正.
    pub fn val_stride(mut self, val_stride: usize) -> Self {
        self.val_stride = val_stride;
        self
    }

    /// 构建验证集 (`true`) 还是训练集 (`false`, 默认).
    pub fn validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// 只保留指定扫描上的候选.
    pub fn series_uid(mut self, series_uid: Option<String>) -> Self {
        self.series_uid = series_uid;
        self
    }

    /// 负正样本比例. `None` 或 `Some(0)` 表示不做平衡.
    pub fn ratio(mut self, ratio: Option<usize>) -> Self {
        self.ratio = ratio.filter(|k| *k > 0);
        self
    }

    /// 数据增强. 不做任何变换的配置等同于 `None`.
    pub fn augmentation(mut self, augmentation: Option<Augmentation>) -> Self {
        self.augmentation = augmentation.filter(|a| *a != Augmentation::default());
        self
    }

    /// 提取窗口大小, 默认为 [`WIDTH_IRC`].
    pub fn width_irc(mut self, width_irc: [usize; 3]) -> Self {
        self.width_irc = width_irc;
        self
    }

    /// 构建数据集.
    ///
    /// 1. 复制登记表中的候选列表, 按 `series_uid` 过滤;
    /// 2. 位置 `0, stride, 2 * stride, ...` 构成验证集, 其余构成训练集;
    /// 3. 按 `(series_uid, center_xyz)` 升序排序;
    /// 4. 划分正负样本.
    ///
    /// # 返回值
    ///
    /// - 步长为 0, 返回 `Err(LunaError::InvalidStride)`;
    /// - 窗口某一维为 0, 返回 `Err(LunaError::EmptyWindow)`;
    /// - 训练集为空, 返回 `Err(LunaError::EmptyTrainingSet)`;
    /// - 数据增强参数不合法, 返回 `Err(LunaError::InvalidAugmentation)`;
    /// - 登记表构建失败时原样返回其错误.
    pub fn build(self) -> Result<LunaDataset<L, S>> {
        let stride = self.val_stride;
        if stride == 0 {
            return Err(LunaError::InvalidStride);
        }
        if self.width_irc.contains(&0) {
            return Err(LunaError::EmptyWindow(self.width_irc));
        }
        if let Some(aug) = &self.augmentation {
            aug.validate()?;
        }

        let mut candidates = self.registry.candidates()?.to_vec();
        if let Some(uid) = &self.series_uid {
            candidates.retain(|c| &c.series_uid == uid);
        }

        let total = candidates.len();
        let validation = self.validation;
        let mut candidates = candidates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| (i % stride == 0) == validation)
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        if !validation && candidates.is_empty() {
            return Err(LunaError::EmptyTrainingSet { stride, total });
        }

        candidates.sort_by(cmp_series_then_center);
        let (positive, negative): (Vec<usize>, Vec<usize>) =
            (0..candidates.len()).partition(|&i| candidates[i].is_nodule);

        log::info!(
            "{} dataset: {} samples ({} nodules, {} non-nodules), stride {stride}, ratio {:?}, augmentation {}",
            if validation { "Validation" } else { "Training" },
            candidates.len(),
            positive.len(),
            negative.len(),
            self.ratio,
            self.augmentation.is_some(),
        );

        Ok(LunaDataset {
            source: self.source,
            candidates,
            positive,
            negative,
            ratio: self.ratio,
            augmentation: self.augmentation,
            width_irc: self.width_irc,
        })
    }
}

/// 按 `(series_uid, center_xyz)` 升序比较. 坐标采用全序.
fn cmp_series_then_center(a: &Candidate, b: &Candidate) -> Ordering {
    a.series_uid
        .cmp(&b.series_uid)
        .then_with(|| a.center_xyz.map(OrderedFloat).cmp(&b.center_xyz.map(OrderedFloat)))
}

impl<L: ScanLoader, S: ChunkStore> LunaDataset<L, S> {
    /// 开始构建数据集. `source` 可在多个数据集之间共享.
    pub fn builder(
        source: Arc<ChunkSource<L, S>>,
        registry: &CandidateRegistry,
    ) -> LunaDatasetBuilder<'_, L, S> {
        LunaDatasetBuilder {
            source,
            registry,
            val_stride: DEFAULT_VAL_STRIDE,
            validation: false,
            series_uid: None,
            ratio: None,
            augmentation: None,
            width_irc: WIDTH_IRC,
        }
    }

    /// 过滤与划分后的样本数. 平衡模式下这只是一个名义长度, 任何索引都合法.
    #[inline]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// 数据集是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// 正样本个数.
    #[inline]
    pub fn positive_len(&self) -> usize {
        self.positive.len()
    }

    /// 负样本个数.
    #[inline]
    pub fn negative_len(&self) -> usize {
        self.negative.len()
    }

    /// 全部候选, 按 `(series_uid, center_xyz)` 升序.
    #[inline]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// 提取窗口大小.
    #[inline]
    pub fn width_irc(&self) -> [usize; 3] {
        self.width_irc
    }

    /// 共享的块来源.
    #[inline]
    pub fn source(&self) -> &Arc<ChunkSource<L, S>> {
        &self.source
    }

    /// 逻辑索引 `idx` 对应的候选. 只做下标运算, 不读取任何扫描.
    ///
    /// # 返回值
    ///
    /// - 非平衡模式下 `idx >= len()`, 返回 `Err(LunaError::IndexOutOfRange)`;
    /// - 平衡模式下所需类别为空, 返回 `Err(LunaError::EmptyClass)`.
    pub fn candidate_at(&self, idx: usize) -> Result<&Candidate> {
        let Some(k) = self.ratio else {
            return self.candidates.get(idx).ok_or(LunaError::IndexOutOfRange {
                index: idx,
                len: self.candidates.len(),
            });
        };

        let n = k + 1;
        let (pool, pos, nodule) = if idx % n == 0 {
            (&self.positive, idx / n, true)
        } else {
            (&self.negative, idx - 1 - idx / n, false)
        };
        if pool.is_empty() {
            return Err(LunaError::EmptyClass { nodule });
        }
        Ok(&self.candidates[pool[pos % pool.len()]])
    }

    /// 获取样本, 数据增强使用线程本地随机数生成器.
    pub fn get(&self, idx: usize) -> Result<LunaSample> {
        self.get_with_rng(idx, &mut rand::thread_rng())
    }

    /// 获取样本, 数据增强使用给定的随机数生成器.
    pub fn get_with_rng<R: Rng + ?Sized>(&self, idx: usize, rng: &mut R) -> Result<LunaSample> {
        let candidate = self.candidate_at(idx)?;
        let raw = self.source.raw_candidate(
            &candidate.series_uid,
            candidate.center_xyz,
            self.width_irc,
        )?;

        let (data, center_irc) = match &self.augmentation {
            Some(aug) => (augment_chunk(&raw, aug, rng)?, raw.center_irc()),
            None => raw.into_parts(),
        };

        Ok(LunaSample {
            chunk: data.insert_axis(Axis(0)),
            label: candidate.class().one_hot(),
            series_uid: candidate.series_uid.clone(),
            center_irc,
        })
    }

    /// 按扫描分组的候选中心. 候选已按 `series_uid` 排序, 同一扫描的候选总是相邻.
    fn groups(&self) -> impl Iterator<Item = (&str, Vec<Xyz>)> + '_ {
        self.candidates
            .chunk_by(|a, b| a.series_uid == b.series_uid)
            .map(|group| {
                let centers = group.iter().map(|c| c.center_xyz).collect();
                (group[0].series_uid.as_str(), centers)
            })
    }

    /// 把每个候选的体素块提前写入块缓存, 返回新写入的块数.
    pub fn warm_cache(&self) -> Result<usize> {
        let mut written = 0;
        for (uid, centers) in self.groups() {
            written += self.source.warm(uid, &centers, self.width_irc)?;
        }
        log::info!("Chunk cache warmed: {written} new chunks");
        Ok(written)
    }
}

/// 并发操作部分
#[cfg(feature = "rayon")]
impl<L, S> LunaDataset<L, S>
where
    L: ScanLoader + Send + Sync,
    S: ChunkStore + Send + Sync,
{
    /// 借助 `rayon`, 按扫描并行地预热块缓存, 返回新写入的块数.
    ///
    /// 每个扫描在一个任务内至多加载一次.
    pub fn par_warm_cache(&self) -> Result<usize> {
        let groups = self.groups().collect::<Vec<_>>();
        let written = groups
            .into_par_iter()
            .map(|(uid, centers)| self.source.warm(uid, &centers, self.width_irc))
            .try_reduce(|| 0, |a, b| Ok(a + b))?;
        log::info!("Chunk cache warmed: {written} new chunks");
        Ok(written)
    }
}
