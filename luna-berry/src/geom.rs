//! 物理坐标 (XYZ, 毫米) 与体素坐标 (IRC) 的相互转换.
//!
//! 标注表格给出的是病人坐标系下的毫米坐标 `(X, Y, Z)`, 而扫描数组按
//! `[Index, Row, Column]` 存储. 两者之间由每个扫描的原点, 体素间距和方向矩阵决定:
//!
//! `xyz = direction * (cri * spacing) + origin`
//!
//! 其中 `cri` 是 `(Column, Row, Index)`, 即 X 对应列, Y 对应行, Z 对应切片索引.
//! 转换到 IRC 时需要把 CRI 倒序.

use nalgebra::{Matrix3, Vector3};

use crate::error::{LunaError, Result};
use crate::{Irc, Xyz};

/// 单个扫描的仿射元信息.
///
/// 方向矩阵在构造时求逆并缓存, 之后的坐标转换都是纯算术, 不会失败.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelGeometry {
    origin: Vector3<f64>,
    spacing: Vector3<f64>,
    direction: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl VoxelGeometry {
    /// 构建几何信息.
    ///
    /// `direction` 按行优先存储 (与常见图像库 `GetDirection()` 的输出一致).
    ///
    /// # 返回值
    ///
    /// - 任一体素间距非有限或不为正时, 返回 `Err(LunaError::InvalidGeometry)`;
    /// - 原点非有限时, 返回 `Err(LunaError::InvalidGeometry)`;
    /// - 方向矩阵不可逆时, 返回 `Err(LunaError::InvalidGeometry)`.
    pub fn new(origin: Xyz, spacing: Xyz, direction: [f64; 9]) -> Result<Self> {
        if !spacing.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(LunaError::InvalidGeometry(format!(
                "体素间距 {spacing:?} 必须为正"
            )));
        }
        if !origin.iter().all(|o| o.is_finite()) {
            return Err(LunaError::InvalidGeometry(format!(
                "原点 {origin:?} 非有限"
            )));
        }
        let direction = Matrix3::from_row_slice(&direction);
        let inverse = direction.try_inverse().ok_or_else(|| {
            LunaError::InvalidGeometry(format!("方向矩阵 {direction} 不可逆"))
        })?;
        Ok(Self {
            origin: Vector3::from(origin),
            spacing: Vector3::from(spacing),
            direction,
            inverse,
        })
    }

    /// 方向矩阵为单位阵的几何信息.
    pub fn axis_aligned(origin: Xyz, spacing: Xyz) -> Result<Self> {
        Self::new(origin, spacing, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// 原点, `(X, Y, Z)`.
    #[inline]
    pub fn origin(&self) -> Xyz {
        self.origin.into()
    }

    /// 体素间距, `(X, Y, Z)`, 单位毫米.
    #[inline]
    pub fn spacing(&self) -> Xyz {
        self.spacing.into()
    }

    /// 方向矩阵.
    #[inline]
    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    /// 物理坐标转换为未取整的体素坐标 (I, R, C).
    pub fn xyz_to_irc_f64(&self, xyz: Xyz) -> [f64; 3] {
        let cri = (self.inverse * (Vector3::from(xyz) - self.origin)).component_div(&self.spacing);
        [cri.z, cri.y, cri.x]
    }

    /// 物理坐标转换为体素坐标 (I, R, C). 取整规则为四舍六入五成双.
    #[inline]
    pub fn xyz_to_irc(&self, xyz: Xyz) -> Irc {
        self.xyz_to_irc_f64(xyz).map(|v| v.round_ties_even() as i64)
    }

    /// 未取整的体素坐标 (I, R, C) 转换为物理坐标.
    pub fn irc_f64_to_xyz(&self, [i, r, c]: [f64; 3]) -> Xyz {
        let cri = Vector3::new(c, r, i);
        (self.direction * cri.component_mul(&self.spacing) + self.origin).into()
    }

    /// 体素坐标 (I, R, C) 转换为物理坐标.
    #[inline]
    pub fn irc_to_xyz(&self, irc: Irc) -> Xyz {
        self.irc_f64_to_xyz(irc.map(|v| v as f64))
    }
}

/// 物理坐标转换为体素坐标 (I, R, C). 参见 [`VoxelGeometry::xyz_to_irc`].
#[inline]
pub fn xyz_to_irc(xyz: Xyz, geometry: &VoxelGeometry) -> Irc {
    geometry.xyz_to_irc(xyz)
}

/// 体素坐标 (I, R, C) 转换为物理坐标. 参见 [`VoxelGeometry::irc_to_xyz`].
#[inline]
pub fn irc_to_xyz(irc: Irc, geometry: &VoxelGeometry) -> Xyz {
    geometry.irc_to_xyz(irc)
}
