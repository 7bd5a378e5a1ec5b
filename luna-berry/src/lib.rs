#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 为 LUNA16 肺结节候选分类模型准备 3D CT 样本.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 物理坐标统一采用 LPS `(X, Y, Z)` 毫米坐标, 与 LUNA 标注表一致;
//!   体素坐标统一采用 `(Index, Row, Column)`, 即 `[Z, Y, X]` 存储顺序.
//! 2. 该 crate 不负责模型训练. 它的出口是 [`dataset::LunaSample`].
//!
//! # 开发计划
//!
//! ### 物理坐标与体素坐标互转 ✅
//!
//! 支持任意可逆方向矩阵, 取整方式为 "四舍六入五成双".
//!
//! 实现位于 `luna-berry/src/geom.rs`.
//!
//! ### 候选登记表 ✅
//!
//! 合并 `annotations.csv` 与 `candidates.csv`, 以 `d / 4` 邻域推断候选直径.
//!
//! 实现位于 `luna-berry/src/candidate`.
//!
//! ### 扫描读取 ✅
//!
//! 1. MetaImage (`.mhd` / `.mha`), 含 zlib 压缩与大端数据. ✅
//! 2. nifti (`.nii` / `.nii.gz`), RAS 转 LPS. ✅
//!
//! 实现位于 `luna-berry/src/loader`.
//!
//! ### 候选体素块提取 ✅
//!
//! 固定窗口, 边缘处整体平移而不截短.
//!
//! 实现位于 `luna-berry/src/data`.
//!
//! ### 两级缓存 ✅
//!
//! 1. 内存扫描缓存 (LRU, 默认容量 1). ✅
//! 2. 磁盘体素块缓存, 跨进程持久化, 原子写入. ✅
//! 3. 借助 `rayon` 并行预热. ✅
//!
//! 实现位于 `luna-berry/src/cache`.
//!
//! ### 数据增强 ✅
//!
//! 镜像, 平移, 缩放, 旋转, 高斯噪声. 随机数生成器由调用者显式传入.
//!
//! 实现位于 `luna-berry/src/augment`.
//!
//! ### 平衡采样数据集 ✅
//!
//! 训练/验证集划分, 按负正比例交错取样.
//!
//! 实现位于 `luna-berry/src/dataset`.
//!
//! ### 完善代码文档 ✅
//!
//! 给每个 public API 提供文档, 并视情况给 private
//! API 提供文档.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 物理坐标 `(X, Y, Z)`, 单位毫米.
pub type Xyz = [f64; 3];

/// 体素坐标 `(Index, Row, Column)`. 可能为负 (越界).
pub type Irc = [i64; 3];

/// 3D CT 扫描与体素块.
mod data;

pub use data::{CtScan, RawChunk};

pub mod augment;
pub mod cache;
pub mod candidate;
pub mod consts;
pub mod dataset;
pub mod error;
pub mod geom;
pub mod loader;
pub mod prelude;

pub use error::{LunaError, Result};
