//! nifti (`.nii` / `.nii.gz`) 扫描读取.
//!
//! nifti 的世界坐标系为 RAS, 而 LUNA 的标注使用 LPS (ITK 惯例).
//! 这里统一转换为 LPS, 以便与 [`MhdLoader`](super::MhdLoader) 产出的扫描共用同一套候选坐标.

use std::path::{Path, PathBuf};

use ndarray::Array3;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use super::{check_series_uid, RawScan, ScanLoader};
use crate::error::{LunaError, Result};
use crate::Xyz;

/// 从 `{dir}/{series_uid}.nii.gz` 或 `{dir}/{series_uid}.nii` 加载扫描的加载器.
#[derive(Clone, Debug)]
pub struct NiftiLoader {
    dir: PathBuf,
}

impl NiftiLoader {
    /// 所有 nifti 文件都位于 `dir` 下.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }
}

impl ScanLoader for NiftiLoader {
    fn load(&self, series_uid: &str) -> Result<RawScan> {
        check_series_uid(series_uid)?;
        for ext in ["nii.gz", "nii"] {
            let path = self.dir.join(format!("{series_uid}.{ext}"));
            if path.is_file() {
                log::debug!("Reading scan {}", path.display());
                return read_nifti(path);
            }
        }
        Err(LunaError::ScanNotFound(series_uid.to_owned()))
    }
}

/// 读取 nifti 扫描, 并换算到 LPS 坐标系.
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<RawScan> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    if header.dim[0] != 3 {
        return Err(LunaError::MalformedHeader {
            path: path.to_owned(),
            reason: format!("仅支持 3 维数据, 实际为 {} 维", header.dim[0]),
        });
    }

    // [X, Y, Z] -> [Z, Y, X].
    let data = obj
        .into_volume()
        .into_ndarray::<f32>()?
        .permuted_axes([2, 1, 0].as_slice())
        .into_dimensionality::<ndarray::Ix3>()?;
    let data: Array3<f32> = data.as_standard_layout().into_owned();

    let (origin, spacing, direction) = ras_geometry(&header);
    let (origin, direction) = ras_to_lps(origin, direction);
    Ok(RawScan {
        data,
        origin,
        spacing,
        direction,
    })
}

/// 从头部推导 RAS 坐标系下的 (原点, 体素间距, 行优先方向矩阵).
///
/// 优先使用 sform, 其次 qform, 都缺失时退化为单位方向.
fn ras_geometry(h: &NiftiHeader) -> (Xyz, Xyz, [f64; 9]) {
    let pixdim = |i: usize| (h.pixdim[i] as f64).abs();

    if h.sform_code > 0 {
        let rows = [h.srow_x, h.srow_y, h.srow_z].map(|r| r.map(|v| v as f64));
        let origin = [rows[0][3], rows[1][3], rows[2][3]];
        let spacing: Xyz = std::array::from_fn(|col| {
            (0..3).map(|row| rows[row][col].powi(2)).sum::<f64>().sqrt()
        });
        let direction = std::array::from_fn(|k| {
            let (row, col) = (k / 3, k % 3);
            if spacing[col] > 0.0 {
                rows[row][col] / spacing[col]
            } else {
                0.0
            }
        });
        return (origin, spacing, direction);
    }

    let spacing = [pixdim(1), pixdim(2), pixdim(3)];
    if h.qform_code > 0 {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let direction = [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c) * qfac,
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b) * qfac,
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            (a * a + d * d - c * c - b * b) * qfac,
        ];
        let origin = [h.quatern_x, h.quatern_y, h.quatern_z].map(|v| v as f64);
        return (origin, spacing, direction);
    }

    (
        [0.0; 3],
        spacing,
        [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    )
}

/// RAS -> LPS: 世界坐标的 X, Y 取反.
fn ras_to_lps(mut origin: Xyz, mut direction: [f64; 9]) -> (Xyz, [f64; 9]) {
    origin[0] = -origin[0];
    origin[1] = -origin[1];
    direction[..6].iter_mut().for_each(|v| *v = -*v);
    (origin, direction)
}
