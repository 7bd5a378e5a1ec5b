//! 运行时错误.

use std::path::PathBuf;

use thiserror::Error;

use crate::Irc;

/// 本 crate 的通用结果类型.
pub type Result<T> = std::result::Result<T, LunaError>;

/// 数据准备过程中的各类错误.
#[derive(Error, Debug)]
pub enum LunaError {
    /// 底层 I/O 错误.
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// nifti 文件解析错误.
    #[error("nifti 错误: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 缓存条目的序列化/反序列化错误.
    #[error("缓存编解码错误: {0}")]
    Codec(#[from] bincode::Error),

    /// 数组形状与数据长度不符.
    #[error("数组形状错误: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// 扫描元信息 (原点, 体素间距, 方向矩阵) 不合法.
    #[error("扫描几何信息不合法: {0}")]
    InvalidGeometry(String),

    /// 在本地找不到 `series_uid` 对应的扫描文件.
    #[error("找不到扫描 `{0}`")]
    ScanNotFound(String),

    /// `series_uid` 不能安全地用作文件名.
    #[error("非法的 series_uid `{0}`")]
    InvalidSeriesUid(String),

    /// 扫描头文件格式错误.
    #[error("扫描头文件 {path:?} 格式错误: {reason}")]
    MalformedHeader {
        /// 头文件路径.
        path: PathBuf,
        /// 原因.
        reason: String,
    },

    /// 标注表格格式错误.
    #[error("表格 {table:?} 第 {line} 行格式错误: {reason}")]
    MalformedTable {
        /// 表格路径.
        table: PathBuf,
        /// 行号, 从 1 开始 (包括表头).
        line: usize,
        /// 原因.
        reason: String,
    },

    /// 候选中心换算到体素坐标后越界. 这通常意味着上游数据损坏.
    #[error("扫描 `{series_uid}` 中候选中心 {center_irc:?} 越界, 扫描形状为 {shape:?}")]
    OutOfBounds {
        /// 扫描标识.
        series_uid: String,
        /// 体素坐标中心.
        center_irc: Irc,
        /// 扫描形状 (I, R, C).
        shape: [usize; 3],
    },

    /// 提取窗口在某一维上大于扫描本身.
    #[error("扫描 `{series_uid}` 形状为 {shape:?}, 容纳不下窗口 {width:?}")]
    WindowTooLarge {
        /// 扫描标识.
        series_uid: String,
        /// 窗口大小 (I, R, C).
        width: [usize; 3],
        /// 扫描形状 (I, R, C).
        shape: [usize; 3],
    },

    /// 提取窗口在某一维上为 0.
    #[error("提取窗口 {0:?} 的每一维都必须为正")]
    EmptyWindow([usize; 3]),

    /// 数据增强参数不合法.
    #[error("数据增强参数不合法: {0}")]
    InvalidAugmentation(String),

    /// 验证集步长必须为正.
    #[error("验证集步长必须为正")]
    InvalidStride,

    /// 去掉验证集后训练集为空.
    #[error("步长 {stride} 下 {total} 个样本去掉验证集后训练集为空")]
    EmptyTrainingSet {
        /// 验证集步长.
        stride: usize,
        /// 划分前的样本数.
        total: usize,
    },

    /// 非平衡模式下的索引越界.
    #[error("索引 {index} 越界, 数据集长度为 {len}")]
    IndexOutOfRange {
        /// 请求的索引.
        index: usize,
        /// 数据集长度.
        len: usize,
    },

    /// 平衡采样时某一类样本为空.
    #[error("平衡采样需要{}样本, 但数据集中没有", class_name(.nodule))]
    EmptyClass {
        /// 缺失的是否为结节类.
        nodule: bool,
    },
}

fn class_name(nodule: &bool) -> &'static str {
    if *nodule {
        "结节"
    } else {
        "非结节"
    }
}
