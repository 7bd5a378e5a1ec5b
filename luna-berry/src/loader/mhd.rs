//! MetaImage (`.mhd` + `.raw`, 或单文件 `.mha`) 扫描读取. LUNA16 即以此格式发布.
//!
//! 头部是若干 `Key = Value` 文本行, 以 `ElementDataFile` 结尾.
//! 体素按 X 最快, 其次 Y, 最后 Z 的顺序连续存储, 正好对应 `[Z, Y, X]` 的行优先数组.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use ndarray::Array3;

use super::{check_series_uid, RawScan, ScanLoader};
use crate::error::{LunaError, Result};
use crate::Xyz;

/// 从 `{root}/subset*/{series_uid}.mhd` 加载扫描的加载器.
#[derive(Clone, Debug)]
pub struct MhdLoader {
    root: PathBuf,
}

impl MhdLoader {
    /// `root` 为 LUNA 数据集根目录, 其下有 `subset0`, `subset1`, ... 子目录.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    /// 数据集根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 查找 `series_uid` 对应的头文件路径.
    pub fn locate(&self, series_uid: &str) -> Result<PathBuf> {
        check_series_uid(series_uid)?;
        let filename = format!("{series_uid}.mhd");
        for dir in subset_dirs(&self.root)? {
            let candidate = dir.join(&filename);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(LunaError::ScanNotFound(series_uid.to_owned()))
    }

    /// 收集本地所有 `subset*/*.mhd` 对应的 `series_uid`.
    pub fn present_series_uids(&self) -> Result<HashSet<String>> {
        let mut ans = HashSet::new();
        for dir in subset_dirs(&self.root)? {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "mhd") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ans.insert(stem.to_owned());
                    }
                }
            }
        }
        Ok(ans)
    }
}

impl ScanLoader for MhdLoader {
    fn load(&self, series_uid: &str) -> Result<RawScan> {
        let path = self.locate(series_uid)?;
        log::debug!("Reading scan {}", path.display());
        read_mhd(path)
    }
}

/// 列出 `root` 下所有名为 `subset*` 的目录, 按名称排序.
fn subset_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let is_subset = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with("subset"));
        if is_subset && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// 体素元素类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ElementType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl ElementType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "MET_CHAR" => Self::Char,
            "MET_UCHAR" => Self::UChar,
            "MET_SHORT" => Self::Short,
            "MET_USHORT" => Self::UShort,
            "MET_INT" => Self::Int,
            "MET_UINT" => Self::UInt,
            "MET_FLOAT" => Self::Float,
            "MET_DOUBLE" => Self::Double,
            _ => return None,
        })
    }

    /// 单个元素的字节数.
    fn size(&self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Double => 8,
        }
    }
}

/// 体素数据的位置.
#[derive(Clone, Debug, PartialEq)]
enum DataFile {
    /// 紧随头部之后, 位于同一文件中. 参数为数据起始字节偏移.
    Local(usize),

    /// 独立的数据文件.
    External(PathBuf),
}

/// 已解析的头部.
#[derive(Clone, Debug, PartialEq)]
struct MhdHeader {
    /// `(X, Y, Z)` 方向的体素个数.
    dim_size: [usize; 3],
    spacing: Xyz,
    offset: Xyz,
    transform: [f64; 9],
    element: ElementType,
    msb: bool,
    compressed: bool,
    header_size: usize,
    data_file: DataFile,
}

impl MhdHeader {
    /// 解析头部. `bytes` 是头文件的全部内容, `dir` 是头文件所在目录.
    fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        let malformed = |reason: String| LunaError::MalformedHeader {
            path: path.to_owned(),
            reason,
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut ndims = None;
        let mut dim_size = None;
        let mut spacing = None;
        let mut offset = None;
        let mut transform = None;
        let mut element = None;
        let mut msb = false;
        let mut compressed = false;
        let mut header_size = 0usize;
        let mut data_file = None;

        let mut consumed = 0usize;
        for raw_line in bytes.split_inclusive(|b| *b == b'\n') {
            consumed += raw_line.len();
            let line = String::from_utf8_lossy(raw_line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "NDims" => ndims = Some(parse_list::<usize>(value).map_err(&malformed)?),
                "DimSize" => dim_size = Some(parse_array::<usize, 3>(key, value).map_err(&malformed)?),
                "ElementSpacing" | "ElementSize" => {
                    spacing = Some(parse_array::<f64, 3>(key, value).map_err(&malformed)?)
                }
                "Offset" | "Origin" | "Position" => {
                    offset = Some(parse_array::<f64, 3>(key, value).map_err(&malformed)?)
                }
                "TransformMatrix" | "Rotation" | "Orientation" => {
                    transform = Some(parse_array::<f64, 9>(key, value).map_err(&malformed)?)
                }
                "ElementType" => {
                    element = Some(
                        ElementType::parse(value)
                            .ok_or_else(|| malformed(format!("不支持的元素类型 `{value}`")))?,
                    )
                }
                "BinaryDataByteOrderMSB" | "ElementByteOrderMSB" => msb = parse_bool(value),
                "CompressedData" => compressed = parse_bool(value),
                "HeaderSize" => {
                    header_size = value
                        .parse::<i64>()
                        .ok()
                        .filter(|v| *v >= 0)
                        .ok_or_else(|| malformed(format!("不支持的 HeaderSize `{value}`")))?
                        as usize
                }
                "ElementNumberOfChannels" if value != "1" => {
                    return Err(malformed(format!("不支持多通道数据 ({value})")));
                }
                "ElementDataFile" => {
                    data_file = Some(if value == "LOCAL" {
                        DataFile::Local(consumed)
                    } else {
                        DataFile::External(dir.join(value))
                    });
                    break;
                }
                _ => {}
            }
        }

        if let Some(ndims) = ndims {
            if ndims.as_slice() != [3] {
                return Err(malformed(format!("仅支持 3 维数据, 实际为 {ndims:?}")));
            }
        }
        let missing = |key: &str| malformed(format!("缺少 `{key}`"));
        Ok(Self {
            dim_size: dim_size.ok_or_else(|| missing("DimSize"))?,
            spacing: spacing.unwrap_or([1.0; 3]),
            offset: offset.unwrap_or([0.0; 3]),
            transform: transform.unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]),
            element: element.ok_or_else(|| missing("ElementType"))?,
            msb,
            compressed,
            header_size,
            data_file: data_file.ok_or_else(|| missing("ElementDataFile"))?,
        })
    }

    /// 行优先的方向矩阵.
    ///
    /// `TransformMatrix` 中每连续三个数是一个轴的方向向量, 即方向矩阵的一列.
    fn direction(&self) -> [f64; 9] {
        let t = &self.transform;
        std::array::from_fn(|k| {
            let (row, col) = (k / 3, k % 3);
            t[col * 3 + row]
        })
    }

    /// 体素个数与数据字节数. 溢出时返回 `None`.
    fn payload_size(&self) -> Option<(usize, usize)> {
        let n = self
            .dim_size
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))?;
        Some((n, n.checked_mul(self.element.size())?))
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_list<T: std::str::FromStr>(value: &str) -> std::result::Result<Vec<T>, String> {
    value
        .split_whitespace()
        .map(|tok| tok.parse::<T>().map_err(|_| format!("无法解析数值 `{tok}`")))
        .collect()
}

fn parse_array<T: std::str::FromStr, const N: usize>(
    key: &str,
    value: &str,
) -> std::result::Result<[T; N], String> {
    let v = parse_list::<T>(value)?;
    let len = v.len();
    v.try_into()
        .map_err(|_| format!("`{key}` 需要 {N} 个数值, 实际为 {len} 个"))
}

/// 按字节序把原始字节解码为 `f32`.
macro_rules! decode_as {
    ($order: ty, $bytes: expr, $n: expr, $elem: ty, $read_into: ident) => {{
        let mut buf = vec![<$elem>::default(); $n];
        <$order>::$read_into($bytes, &mut buf);
        buf.into_iter().map(|v| v as f32).collect::<Vec<f32>>()
    }};
}

fn decode<B: ByteOrder>(bytes: &[u8], element: ElementType, n: usize) -> Vec<f32> {
    match element {
        ElementType::Char => bytes.iter().map(|b| *b as i8 as f32).collect(),
        ElementType::UChar => bytes.iter().map(|b| *b as f32).collect(),
        ElementType::Short => decode_as!(B, bytes, n, i16, read_i16_into),
        ElementType::UShort => decode_as!(B, bytes, n, u16, read_u16_into),
        ElementType::Int => decode_as!(B, bytes, n, i32, read_i32_into),
        ElementType::UInt => decode_as!(B, bytes, n, u32, read_u32_into),
        ElementType::Float => decode_as!(B, bytes, n, f32, read_f32_into),
        ElementType::Double => decode_as!(B, bytes, n, f64, read_f64_into),
    }
}

/// 读取 MetaImage 扫描. `path` 为 `.mhd` 或 `.mha` 文件路径.
pub fn read_mhd<P: AsRef<Path>>(path: P) -> Result<RawScan> {
    let path = path.as_ref();
    let header_bytes = fs::read(path)?;
    let header = MhdHeader::parse(&header_bytes, path)?;

    let payload = match &header.data_file {
        DataFile::Local(start) => header_bytes[*start..].to_vec(),
        DataFile::External(data_path) => fs::read(data_path)?,
    };
    let overflow = || LunaError::MalformedHeader {
        path: path.to_owned(),
        reason: format!("`DimSize` {:?} 或 `HeaderSize` 过大", header.dim_size),
    };
    let (n, wanted) = header.payload_size().ok_or_else(overflow)?;
    let end = header.header_size.checked_add(wanted).ok_or_else(overflow)?;

    let payload = if header.compressed {
        let mut buf = Vec::new();
        ZlibDecoder::new(payload.as_slice()).read_to_end(&mut buf)?;
        buf
    } else {
        payload
    };

    let bytes = payload
        .get(header.header_size..end)
        .ok_or_else(|| LunaError::MalformedHeader {
            path: path.to_owned(),
            reason: format!(
                "数据长度不足: 需要 {wanted} 字节, 实际为 {} 字节",
                payload.len().saturating_sub(header.header_size)
            ),
        })?;

    let voxels = if header.msb {
        decode::<BigEndian>(bytes, header.element, n)
    } else {
        decode::<LittleEndian>(bytes, header.element, n)
    };
    let [x, y, z] = header.dim_size;
    let data = Array3::from_shape_vec((z, y, x), voxels)?;

    Ok(RawScan {
        data,
        origin: header.offset,
        spacing: header.spacing,
        direction: header.direction(),
    })
}
