use std::ops::Index;

use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::consts::hu;
use crate::error::{LunaError, Result};
use crate::geom::VoxelGeometry;
use crate::loader::RawScan;
use crate::{Idx3d, Irc, Xyz};

/// 3D CT 扫描. 体素按 `[Index, Row, Column]` 存储, HU 值以 `f32` 保存,
/// 并已截断到 `[HU_MIN, HU_MAX]`.
#[derive(Debug, Clone)]
pub struct CtScan {
    series_uid: String,
    data: Array3<f32>,
    geometry: VoxelGeometry,
}

impl Index<Idx3d> for CtScan {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl CtScan {
    /// 由加载器产出的原始数据构建扫描. 体素值会被就地截断.
    ///
    /// 当元信息不合法时返回 `Err(LunaError::InvalidGeometry)`.
    pub fn from_raw(series_uid: impl Into<String>, raw: RawScan) -> Result<Self> {
        let RawScan {
            mut data,
            origin,
            spacing,
            direction,
        } = raw;
        let geometry = VoxelGeometry::new(origin, spacing, direction)?;
        data.mapv_inplace(hu::clamp);
        Ok(Self {
            series_uid: series_uid.into(),
            data,
            geometry,
        })
    }

    /// 扫描标识.
    #[inline]
    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    /// 扫描形状 (I, R, C).
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        let (i, r, c) = self.data.dim();
        [i, r, c]
    }

    /// 扫描的仿射元信息.
    #[inline]
    pub fn geometry(&self) -> &VoxelGeometry {
        &self.geometry
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 以物理坐标 `center_xyz` 为中心, 提取大小为 `width_irc` 的体素块.
    ///
    /// 窗口在边缘处会整体平移以留在扫描内部, 而不会被截短,
    /// 因此返回块的形状总是恰好等于 `width_irc`.
    ///
    /// # 返回值
    ///
    /// - 中心换算到体素坐标后在任一维越界, 返回 `Err(LunaError::OutOfBounds)`;
    /// - 窗口在任一维大于扫描, 返回 `Err(LunaError::WindowTooLarge)`.
    pub fn raw_candidate(&self, center_xyz: Xyz, width_irc: [usize; 3]) -> Result<RawChunk> {
        let center_irc = self.geometry.xyz_to_irc(center_xyz);
        let shape = self.shape();

        let in_bounds = center_irc
            .iter()
            .zip(shape.iter())
            .all(|(&c, &dim)| c >= 0 && (c as usize) < dim);
        if !in_bounds {
            return Err(LunaError::OutOfBounds {
                series_uid: self.series_uid.clone(),
                center_irc,
                shape,
            });
        }
        if width_irc.iter().zip(shape.iter()).any(|(w, dim)| w > dim) {
            return Err(LunaError::WindowTooLarge {
                series_uid: self.series_uid.clone(),
                width: width_irc,
                shape,
            });
        }

        let [(i0, i1), (r0, r1), (c0, c1)] =
            std::array::from_fn(|axis| window_bounds(center_irc[axis], width_irc[axis], shape[axis]));
        let data = self.data.slice(s![i0..i1, r0..r1, c0..c1]).to_owned();
        debug_assert_eq!(data.shape(), width_irc.as_slice());

        Ok(RawChunk { data, center_irc })
    }
}

/// 计算一维上的窗口 `[start, end)`.
///
/// 要求 `0 <= center < dim` 且 `width <= dim`.
pub(crate) fn window_bounds(center: i64, width: usize, dim: usize) -> (usize, usize) {
    let (width, dim) = (width as i64, dim as i64);
    let mut start = (center as f64 - width as f64 / 2.0).round_ties_even() as i64;
    let mut end = start + width;
    if start < 0 {
        start = 0;
        end = width;
    }
    if end > dim {
        end = dim;
        start = end - width;
    }
    debug_assert!(start >= 0 && end - start == width);
    (start as usize, end as usize)
}

/// 从扫描中提取出的体素块与其中心的体素坐标. 值类型, 可序列化.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChunk {
    data: Array3<f32>,
    center_irc: Irc,
}

impl RawChunk {
    /// 直接初始化.
    #[inline]
    pub fn new(data: Array3<f32>, center_irc: Irc) -> Self {
        Self { data, center_irc }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 候选中心的体素坐标 (I, R, C).
    #[inline]
    pub fn center_irc(&self) -> Irc {
        self.center_irc
    }

    /// 块形状 (I, R, C).
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        let (i, r, c) = self.data.dim();
        [i, r, c]
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_parts(self) -> (Array3<f32>, Irc) {
        (self.data, self.center_irc)
    }
}
