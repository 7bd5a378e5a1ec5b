//! 体素块数据增强: 翻转, 平移, 缩放, 旋转和高斯噪声.
//!
//! 几何部分组合成一个 4x4 仿射矩阵, 然后对输出块的每个体素在输入块中做三线性插值.
//! 矩阵的第 0, 1, 2 行分别作用于 Column, Row, Index 轴, 坐标归一化到 `[-1, 1]`,
//! 越界的采样点夹回到边界 (border padding).
//!
//! 所有随机性都来自调用者传入的 `rng`, 固定种子即可复现.

use std::f64::consts::PI;

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array3, ArrayView3};
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

use crate::data::RawChunk;
use crate::error::{LunaError, Result};

/// 数据增强配置. 默认不做任何变换.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Augmentation {
    /// 每个轴以 1/2 概率镜像.
    pub flip: bool,

    /// 每个轴随机平移 `[-offset, offset]`, 单位为归一化坐标 (1.0 即半个窗口).
    pub offset: Option<f64>,

    /// 每个轴随机缩放 `[1 - scale, 1 + scale]` 倍.
    pub scale: Option<f64>,

    /// 在 Column/Row 平面内随机旋转 `[0, 2π)`.
    pub rotate: bool,

    /// 叠加标准差为 `noise` 的高斯噪声.
    pub noise: Option<f64>,
}

impl Augmentation {
    /// 不做任何变换.
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启/关闭随机镜像.
    pub fn flip(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }

    /// 随机平移幅度.
    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// 随机缩放幅度.
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// 开启/关闭随机旋转.
    pub fn rotate(mut self, rotate: bool) -> Self {
        self.rotate = rotate;
        self
    }

    /// 高斯噪声标准差.
    pub fn noise(mut self, sigma: f64) -> Self {
        self.noise = Some(sigma);
        self
    }

    /// 检查参数. 幅度必须有限, 噪声标准差必须非负.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("offset", self.offset), ("scale", self.scale)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(LunaError::InvalidAugmentation(format!("{name} = {v}")));
                }
            }
        }
        if let Some(sigma) = self.noise {
            if !sigma.is_finite() || sigma < 0.0 {
                return Err(LunaError::InvalidAugmentation(format!("noise = {sigma}")));
            }
        }
        Ok(())
    }

    /// 按配置抽取一个随机仿射矩阵.
    ///
    /// 对每个轴依次抽取 镜像, 平移, 缩放; 最后右乘旋转.
    pub fn sample_transform<R: Rng + ?Sized>(&self, rng: &mut R) -> Matrix4<f64> {
        let mut t = Matrix4::<f64>::identity();
        for axis in 0..3 {
            if self.flip && rng.gen::<f64>() > 0.5 {
                t[(axis, axis)] *= -1.0;
            }
            if let Some(offset) = self.offset {
                t[(axis, 3)] = offset * (rng.gen::<f64>() * 2.0 - 1.0);
            }
            if let Some(scale) = self.scale {
                t[(axis, axis)] *= 1.0 + scale * (rng.gen::<f64>() * 2.0 - 1.0);
            }
        }
        if self.rotate {
            let (s, c) = (rng.gen::<f64>() * 2.0 * PI).sin_cos();
            #[rustfmt::skip]
            let rotation = Matrix4::new(
                c,  -s,  0.0, 0.0,
                s,   c,  0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            );
            t *= rotation;
        }
        t
    }
}

/// 对体素块做数据增强, 返回与输入形状相同的 `[I, R, C]` 数组. 值不再截断.
///
/// # 返回值
///
/// 参数不合法时返回 `Err(LunaError::InvalidAugmentation)`.
pub fn augment_chunk<R: Rng + ?Sized>(
    chunk: &RawChunk,
    augmentation: &Augmentation,
    rng: &mut R,
) -> Result<Array3<f32>> {
    augmentation.validate()?;
    let transform = augmentation.sample_transform(rng);
    let mut out = resample(chunk.data(), &transform);

    match augmentation.noise {
        Some(sigma) if sigma > 0.0 => {
            let normal = Normal::new(0.0, sigma)
                .map_err(|e| LunaError::InvalidAugmentation(e.to_string()))?;
            for v in out.iter_mut() {
                *v += normal.sample(&mut *rng) as f32;
            }
        }
        _ => {}
    }
    Ok(out)
}

/// 一维归一化: 体素中心 `i` -> `[-1, 1]` 内的坐标.
#[inline]
fn normalize(i: usize, len: usize) -> f64 {
    (2 * i + 1) as f64 / len as f64 - 1.0
}

/// 一维反归一化并夹到 `[0, len - 1]`.
#[inline]
fn unnormalize(g: f64, len: usize) -> f64 {
    let v = ((g + 1.0) * len as f64 - 1.0) / 2.0;
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, (len - 1) as f64)
    }
}

/// 把坐标拆为下方整数索引, 上方整数索引和权重. 要求 `0 <= v <= len - 1`.
#[inline]
fn split(v: f64, len: usize) -> (usize, usize, f64) {
    let lo = v.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    (lo, hi, v - lo as f64)
}

/// 按仿射矩阵对 `src` 重采样, 输出形状与输入相同.
fn resample(src: ArrayView3<'_, f32>, transform: &Matrix4<f64>) -> Array3<f32> {
    let (d, h, w) = src.dim();
    if d == 0 || h == 0 || w == 0 {
        return src.to_owned();
    }
    Array3::from_shape_fn((d, h, w), |(k, j, i)| {
        let p = transform * Vector4::new(normalize(i, w), normalize(j, h), normalize(k, d), 1.0);
        let (x0, x1, fx) = split(unnormalize(p.x, w), w);
        let (y0, y1, fy) = split(unnormalize(p.y, h), h);
        let (z0, z1, fz) = split(unnormalize(p.z, d), d);

        let at = |z: usize, y: usize, x: usize| src[(z, y, x)] as f64;
        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
        let c00 = lerp(at(z0, y0, x0), at(z0, y0, x1), fx);
        let c01 = lerp(at(z0, y1, x0), at(z0, y1, x1), fx);
        let c10 = lerp(at(z1, y0, x0), at(z1, y0, x1), fx);
        let c11 = lerp(at(z1, y1, x0), at(z1, y1, x1), fx);
        let c0 = lerp(c00, c01, fy);
        let c1 = lerp(c10, c11, fy);
        lerp(c0, c1, fz) as f32
    })
}

#[cfg(test)]
mod tests {
    use super::{augment_chunk, resample, Augmentation};
    use crate::data::RawChunk;
    use crate::error::LunaError;
    use nalgebra::Matrix4;
    use ndarray::Array3;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(shape: (usize, usize, usize)) -> RawChunk {
        let data = Array3::from_shape_fn(shape, |(i, r, c)| (i * 100 + r * 10 + c) as f32);
        RawChunk::new(data, [1, 2, 3])
    }

    fn max_abs_diff(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_empty_augmentation_is_identity() {
        let chunk = ramp((4, 6, 8));
        let mut rng = StdRng::seed_from_u64(7);
        let out = augment_chunk(&chunk, &Augmentation::new(), &mut rng).unwrap();
        assert_eq!(out.dim(), (4, 6, 8));
        assert!(max_abs_diff(&out, &chunk.data().to_owned()) < 1e-3);
    }

    #[test]
    fn test_flip_reflects_unit_voxel() {
        let mut data = Array3::<f32>::zeros((3, 4, 5));
        data[(0, 0, 0)] = 1.0;
        let chunk = RawChunk::new(data, [0, 0, 0]);
        // 所有 `gen::<f64>()` 都接近 1, 因此每个轴都翻转.
        let mut rng = StepRng::new(u64::MAX, 0);
        let out = augment_chunk(&chunk, &Augmentation::new().flip(true), &mut rng).unwrap();
        assert!((out[(2, 3, 4)] - 1.0).abs() < 1e-5);
        assert!((out.sum() - 1.0).abs() < 1e-4);

        // 全为 0 时都不翻转.
        let mut rng = StepRng::new(0, 0);
        let out = augment_chunk(&chunk, &Augmentation::new().flip(true), &mut rng).unwrap();
        assert!((out[(0, 0, 0)] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_transform_composition() {
        // u = 0 时: 平移为 -offset, 缩放为 1 - scale, 旋转角为 0.
        let mut rng = StepRng::new(0, 0);
        let t = Augmentation::new()
            .offset(0.1)
            .scale(0.2)
            .rotate(true)
            .sample_transform(&mut rng);
        for axis in 0..3 {
            assert!((t[(axis, axis)] - 0.8).abs() < 1e-12);
            assert!((t[(axis, 3)] + 0.1).abs() < 1e-12);
        }
        assert_eq!(t[(3, 3)], 1.0);
        assert_eq!(t[(0, 1)], 0.0);
    }

    #[test]
    fn test_rotation_half_turn() {
        // 绕 Index 轴旋转 180 度等价于同时镜像 Row 与 Column.
        let chunk = ramp((2, 4, 4));
        #[rustfmt::skip]
        let t = Matrix4::new(
            -1.0, 0.0, 0.0, 0.0,
            0.0, -1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let out = resample(chunk.data(), &t);
        for ((k, j, i), v) in out.indexed_iter() {
            assert!((v - chunk.data()[(k, 3 - j, 3 - i)]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_translation_clamps_to_border() {
        let chunk = ramp((1, 1, 4));
        // 平移 2 个归一化单位 = 整个窗口, 所有采样点都落在右边界外.
        let mut t = Matrix4::<f64>::identity();
        t[(0, 3)] = 2.0;
        let out = resample(chunk.data(), &t);
        assert!(out.iter().all(|v| (*v - 3.0).abs() < 1e-5));

        // 平移半个体素 (2 / 4 / 2): 采样点位于相邻体素正中间.
        t[(0, 3)] = 0.25;
        let out = resample(chunk.data(), &t);
        assert!((out[(0, 0, 0)] - 0.5).abs() < 1e-5);
        assert!((out[(0, 0, 3)] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_noise_statistics() {
        let chunk = RawChunk::new(Array3::zeros((16, 16, 16)), [0, 0, 0]);
        let mut rng = StdRng::seed_from_u64(42);
        let out = augment_chunk(&chunk, &Augmentation::new().noise(25.0), &mut rng).unwrap();
        let n = out.len() as f64;
        let mean = out.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = out.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 2.0, "{mean}");
        assert!((var.sqrt() - 25.0).abs() < 1.5, "{}", var.sqrt());
    }

    #[test]
    fn test_noise_parameters() {
        let chunk = ramp((2, 2, 2));
        let mut rng = StdRng::seed_from_u64(0);
        let out = augment_chunk(&chunk, &Augmentation::new().noise(0.0), &mut rng).unwrap();
        assert!(max_abs_diff(&out, &chunk.data().to_owned()) < 1e-4);

        for sigma in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                augment_chunk(&chunk, &Augmentation::new().noise(sigma), &mut rng),
                Err(LunaError::InvalidAugmentation(_))
            ));
        }
        assert!(matches!(
            augment_chunk(&chunk, &Augmentation::new().offset(f64::NAN), &mut rng),
            Err(LunaError::InvalidAugmentation(_))
        ));
    }

    #[test]
    fn test_seeded_reproducible() {
        let chunk = ramp((4, 6, 6));
        let aug = Augmentation::new()
            .flip(true)
            .offset(0.1)
            .scale(0.2)
            .rotate(true)
            .noise(25.0);
        let a = augment_chunk(&chunk, &aug, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = augment_chunk(&chunk, &aug, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }
}
