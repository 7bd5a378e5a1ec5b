//! 扫描加载器.
//!
//! 核心流程只依赖 [`ScanLoader`] 这一约定: 给定 `series_uid`,
//! 返回 `[Z, Y, X]` 排列的体素数组和仿射元信息. 具体的文件格式由实现者负责.

use ndarray::Array3;

use crate::error::{LunaError, Result};
use crate::Xyz;

mod mhd;
mod nii;

pub use mhd::{read_mhd, MhdLoader};
pub use nii::{read_nifti, NiftiLoader};

/// 加载器产出的原始扫描.
#[derive(Clone, Debug)]
pub struct RawScan {
    /// 体素数组, 按 `[Z, Y, X]` 即 `[Index, Row, Column]` 排列. 尚未截断.
    pub data: Array3<f32>,

    /// 原点 `(X, Y, Z)`, 单位毫米.
    pub origin: Xyz,

    /// 体素间距 `(X, Y, Z)`, 单位毫米.
    pub spacing: Xyz,

    /// 方向矩阵, 行优先存储.
    pub direction: [f64; 9],
}

/// 按 `series_uid` 加载扫描.
///
/// 实现者可能会被多个线程同时调用.
pub trait ScanLoader {
    /// 加载 `series_uid` 对应的扫描. 找不到文件时应返回
    /// `Err(LunaError::ScanNotFound)`.
    fn load(&self, series_uid: &str) -> Result<RawScan>;
}

impl<L: ScanLoader + ?Sized> ScanLoader for &L {
    #[inline]
    fn load(&self, series_uid: &str) -> Result<RawScan> {
        (**self).load(series_uid)
    }
}

impl<L: ScanLoader + ?Sized> ScanLoader for std::sync::Arc<L> {
    #[inline]
    fn load(&self, series_uid: &str) -> Result<RawScan> {
        (**self).load(series_uid)
    }
}

/// 检查 `series_uid` 能否安全地作为单级文件名使用.
pub(crate) fn check_series_uid(series_uid: &str) -> Result<()> {
    let bad = series_uid.is_empty()
        || series_uid == "."
        || series_uid == ".."
        || series_uid
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | '\0') || ch.is_control());
    if bad {
        Err(LunaError::InvalidSeriesUid(series_uid.to_owned()))
    } else {
        Ok(())
    }
}
