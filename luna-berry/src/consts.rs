//! 通用常量.

/// CT HU 值相关.
pub mod hu {
    /// 扫描体素被截断的下限 (近似空气).
    pub const HU_MIN: f32 = -1000.0;

    /// 扫描体素被截断的上限 (近似骨骼).
    pub const HU_MAX: f32 = 1000.0;

    /// 将 HU 值截断到 `[HU_MIN, HU_MAX]`. NaN 保持不变.
    #[inline]
    pub fn clamp(v: f32) -> f32 {
        v.clamp(HU_MIN, HU_MAX)
    }
}

/// 候选样本周围提取的体素窗口大小, 格式为 (Index, Row, Column).
pub const WIDTH_IRC: [usize; 3] = [32, 48, 48];

/// 扫描缓存默认最多常驻的扫描个数.
///
/// 数据集按 `series_uid` 排序后, 相邻访问几乎总是落在同一个扫描上,
/// 因此 1 已经足够.
pub const DEFAULT_SCAN_CACHE_CAPACITY: usize = 1;

/// 默认验证集步长: 每 10 个样本取 1 个作为验证集.
pub const DEFAULT_VAL_STRIDE: usize = 10;

/// 候选样本类别.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CandidateClass {
    /// 非结节.
    NotNodule,

    /// 结节.
    Nodule,
}

impl CandidateClass {
    /// 从布尔标记构造.
    #[inline]
    pub const fn from_is_nodule(is_nodule: bool) -> Self {
        if is_nodule {
            Self::Nodule
        } else {
            Self::NotNodule
        }
    }

    /// 是否为结节.
    #[inline]
    pub fn is_nodule(&self) -> bool {
        matches!(self, Self::Nodule)
    }

    /// 两类别 one-hot 编码, 顺序为 `[非结节, 结节]`.
    #[inline]
    pub fn one_hot(&self) -> [i64; 2] {
        match self {
            Self::NotNodule => [1, 0],
            Self::Nodule => [0, 1],
        }
    }
}
