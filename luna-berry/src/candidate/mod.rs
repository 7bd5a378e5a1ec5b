//! 候选结节登记表.
//!
//! 把两张独立采集的标注表 (`annotations.csv` 提供直径, `candidates.csv` 提供类别)
//! 合并为一张带直径的候选列表. 直径通过中心点邻近匹配推断.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use once_cell::sync::OnceCell;
use ordered_float::OrderedFloat;

use crate::consts::CandidateClass;
use crate::dataset::{present_series_uids, LunaPaths};
use crate::error::{LunaError, Result};
use crate::Xyz;

/// 一个候选结节. 构建后不可变.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// 是否为真实结节.
    pub is_nodule: bool,

    /// 结节直径 (毫米). 未能匹配到标注时为 0.
    pub diameter_mm: f64,

    /// 所属扫描.
    pub series_uid: String,

    /// 中心的物理坐标 `(X, Y, Z)`.
    pub center_xyz: Xyz,
}

impl Candidate {
    /// 候选类别.
    #[inline]
    pub fn class(&self) -> CandidateClass {
        CandidateClass::from_is_nodule(self.is_nodule)
    }
}

/// `annotations.csv` 中的一行.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotationRow {
    /// 所属扫描.
    pub series_uid: String,
    /// 结节中心 `(X, Y, Z)`.
    pub center_xyz: Xyz,
    /// 结节直径 (毫米).
    pub diameter_mm: f64,
}

/// `candidates.csv` 中的一行.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateRow {
    /// 所属扫描.
    pub series_uid: String,
    /// 候选中心 `(X, Y, Z)`.
    pub center_xyz: Xyz,
    /// `class` 列非零.
    pub is_nodule: bool,
}

/// 读取表格, 跳过表头和空行, 返回 `(行号, 各字段)`. 行号从 1 开始.
fn read_table(path: &Path) -> Result<Vec<(usize, Vec<String>)>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(no, line)| (no + 1, line.split(',').map(|f| f.trim().to_owned()).collect()))
        .collect())
}

/// 解析 `seriesuid,coordX,coordY,coordZ,<last>` 格式的一行.
fn parse_row<T>(
    table: &Path,
    line: usize,
    fields: &[String],
    last: impl FnOnce(&str) -> Option<T>,
) -> Result<(String, Xyz, T)> {
    let malformed = |reason: String| LunaError::MalformedTable {
        table: table.to_owned(),
        line,
        reason,
    };
    let [uid, x, y, z, tail] = fields else {
        return Err(malformed(format!("需要 5 列, 实际为 {} 列", fields.len())));
    };
    if uid.is_empty() {
        return Err(malformed("seriesuid 为空".to_owned()));
    }
    let coord = |s: &String| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| malformed(format!("无法解析坐标 `{s}`")))
    };
    let center = [coord(x)?, coord(y)?, coord(z)?];
    let tail = last(tail.as_str()).ok_or_else(|| malformed(format!("无法解析末列 `{tail}`")))?;
    Ok((uid.clone(), center, tail))
}

/// 读取 `annotations.csv`: `seriesuid,coordX,coordY,coordZ,diameter_mm`.
pub fn read_annotations<P: AsRef<Path>>(path: P) -> Result<Vec<AnnotationRow>> {
    let path = path.as_ref();
    read_table(path)?
        .into_iter()
        .map(|(line, fields)| {
            let (series_uid, center_xyz, diameter_mm) = parse_row(path, line, &fields, |s| {
                s.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
            })?;
            Ok(AnnotationRow {
                series_uid,
                center_xyz,
                diameter_mm,
            })
        })
        .collect()
}

/// 读取 `candidates.csv`: `seriesuid,coordX,coordY,coordZ,class`.
/// 任何非零整数都视为结节.
pub fn read_candidates<P: AsRef<Path>>(path: P) -> Result<Vec<CandidateRow>> {
    let path = path.as_ref();
    read_table(path)?
        .into_iter()
        .map(|(line, fields)| {
            let (series_uid, center_xyz, is_nodule) =
                parse_row(path, line, &fields, |s| s.parse::<i64>().ok().map(|c| c != 0))?;
            Ok(CandidateRow {
                series_uid,
                center_xyz,
                is_nodule,
            })
        })
        .collect()
}

/// 候选中心是否在标注的 `d / 4` 邻域内 (三个轴分别判断).
#[inline]
fn within_quarter_diameter(candidate: &Xyz, annotation: &AnnotationRow) -> bool {
    let limit = annotation.diameter_mm / 4.0;
    candidate
        .iter()
        .zip(annotation.center_xyz.iter())
        .all(|(c, a)| (c - a).abs() <= limit)
}

/// 合并两张表.
///
/// 1. 标注按 `series_uid` 分组, 组内保持表格顺序;
/// 2. 仅保留 `series_uid` 在 `present` 中的候选;
/// 3. 直径取组内第一个邻近匹配的标注, 没有则为 0;
/// 4. 按 `(is_nodule, diameter_mm)` 降序稳定排序.
pub fn build_candidate_list(
    annotations: &[AnnotationRow],
    candidates: &[CandidateRow],
    present: &HashSet<String>,
) -> Vec<Candidate> {
    let by_series: HashMap<&str, Vec<&AnnotationRow>> = annotations
        .iter()
        .map(|a| (a.series_uid.as_str(), a))
        .into_group_map();

    let mut ans = candidates
        .iter()
        .filter(|row| present.contains(&row.series_uid))
        .map(|row| {
            let diameter_mm = by_series
                .get(row.series_uid.as_str())
                .and_then(|group| {
                    group
                        .iter()
                        .find(|a| within_quarter_diameter(&row.center_xyz, a))
                })
                .map_or(0.0, |a| a.diameter_mm);
            Candidate {
                is_nodule: row.is_nodule,
                diameter_mm,
                series_uid: row.series_uid.clone(),
                center_xyz: row.center_xyz,
            }
        })
        .collect::<Vec<_>>();

    let dropped = candidates.len() - ans.len();
    if dropped > 0 {
        log::debug!("{dropped} candidates dropped: scan not present");
    }

    ans.sort_by(|a, b| {
        let key = |c: &Candidate| (c.is_nodule, OrderedFloat(c.diameter_mm));
        key(b).cmp(&key(a))
    });
    ans
}

/// 候选列表的来源.
#[derive(Debug)]
enum Source {
    /// 两张 CSV 表, 以及用于确定本地扫描集合的数据集根目录.
    Tables {
        annotations: PathBuf,
        candidates: PathBuf,
        root: PathBuf,
    },

    /// 已解析好的行.
    Rows {
        annotations: Vec<AnnotationRow>,
        candidates: Vec<CandidateRow>,
        present: HashSet<String>,
    },
}

/// 候选登记表. 首次访问时构建候选列表, 之后一直复用同一份结果.
///
/// 可在多个数据集 (例如训练集和验证集) 之间共享.
#[derive(Debug)]
pub struct CandidateRegistry {
    source: Source,
    list: OnceCell<Arc<[Candidate]>>,
}

impl CandidateRegistry {
    /// 从数据集路径构建. 表格读取和本地扫描枚举都推迟到首次访问.
    pub fn from_paths(paths: &LunaPaths) -> Self {
        Self::new(Source::Tables {
            annotations: paths.annotations_csv(),
            candidates: paths.candidates_csv(),
            root: paths.root().to_owned(),
        })
    }

    /// 直接从行数据构建.
    pub fn from_rows(
        annotations: Vec<AnnotationRow>,
        candidates: Vec<CandidateRow>,
        present: HashSet<String>,
    ) -> Self {
        Self::new(Source::Rows {
            annotations,
            candidates,
            present,
        })
    }

    fn new(source: Source) -> Self {
        Self {
            source,
            list: OnceCell::new(),
        }
    }

    /// 获得候选列表. 列表在每个登记表对象上至多构建一次.
    ///
    /// 调用者若需修改, 应先复制.
    pub fn candidates(&self) -> Result<Arc<[Candidate]>> {
        self.list
            .get_or_try_init(|| {
                let list = match &self.source {
                    Source::Tables {
                        annotations,
                        candidates,
                        root,
                    } => build_candidate_list(
                        &read_annotations(annotations)?,
                        &read_candidates(candidates)?,
                        &present_series_uids(root)?,
                    ),
                    Source::Rows {
                        annotations,
                        candidates,
                        present,
                    } => build_candidate_list(annotations, candidates, present),
                };
                let nodules = list.iter().filter(|c| c.is_nodule).count();
                log::info!(
                    "Candidate registry built: {} candidates, {nodules} nodules",
                    list.len()
                );
                Ok(Arc::from(list))
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_candidate_list, read_annotations, read_candidates, AnnotationRow, CandidateRegistry,
        CandidateRow,
    };
    use crate::error::LunaError;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Arc;

    fn ann(uid: &str, center_xyz: [f64; 3], diameter_mm: f64) -> AnnotationRow {
        AnnotationRow {
            series_uid: uid.to_owned(),
            center_xyz,
            diameter_mm,
        }
    }

    fn cand(uid: &str, center_xyz: [f64; 3], is_nodule: bool) -> CandidateRow {
        CandidateRow {
            series_uid: uid.to_owned(),
            center_xyz,
            is_nodule,
        }
    }

    fn present(uids: &[&str]) -> HashSet<String> {
        uids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_proximity_match_boundary() {
        let annotations = [ann("s1", [10.0, 20.0, 30.0], 8.0)];
        // d / 4 = 2: 恰好等于边界时匹配.
        let list = build_candidate_list(
            &annotations,
            &[cand("s1", [12.0, 18.0, 30.0], true)],
            &present(&["s1"]),
        );
        assert_eq!(list[0].diameter_mm, 8.0);

        // 任一轴超出即不匹配.
        let list = build_candidate_list(
            &annotations,
            &[cand("s1", [10.0, 20.0, 32.5], true)],
            &present(&["s1"]),
        );
        assert_eq!(list[0].diameter_mm, 0.0);

        // 其它扫描的标注不参与匹配.
        let list = build_candidate_list(
            &annotations,
            &[cand("s2", [10.0, 20.0, 30.0], true)],
            &present(&["s2"]),
        );
        assert_eq!(list[0].diameter_mm, 0.0);
    }

    #[test]
    fn test_first_match_wins() {
        let annotations = [
            ann("s1", [0.0, 0.0, 0.0], 4.0),
            ann("s1", [0.5, 0.0, 0.0], 10.0),
            ann("s1", [0.0, 0.0, 0.0], 20.0),
        ];
        let list = build_candidate_list(
            &annotations,
            &[cand("s1", [0.9, 0.0, 0.0], true)],
            &present(&["s1"]),
        );
        // 第一个标注 d / 4 = 1, |0.9| <= 1.
        assert_eq!(list[0].diameter_mm, 4.0);

        let list = build_candidate_list(
            &annotations,
            &[cand("s1", [2.0, 0.0, 0.0], true)],
            &present(&["s1"]),
        );
        assert_eq!(list[0].diameter_mm, 10.0);
    }

    #[test]
    fn test_absent_series_dropped() {
        let list = build_candidate_list(
            &[],
            &[
                cand("s1", [0.0; 3], false),
                cand("gone", [0.0; 3], true),
                cand("s1", [1.0; 3], false),
            ],
            &present(&["s1"]),
        );
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|c| c.series_uid == "s1"));
    }

    #[test]
    fn test_sorted_descending_and_stable() {
        let annotations = [
            ann("s1", [0.0; 3], 6.0),
            ann("s1", [100.0; 3], 12.0),
        ];
        let candidates = [
            cand("s1", [50.0; 3], false),
            cand("s1", [0.0; 3], true),
            cand("s1", [51.0; 3], false),
            cand("s1", [100.0; 3], true),
            cand("s1", [60.0; 3], true),
            cand("s1", [100.0; 3], false),
        ];
        let list = build_candidate_list(&annotations, &candidates, &present(&["s1"]));
        let got = list
            .iter()
            .map(|c| (c.is_nodule, c.diameter_mm, c.center_xyz[0]))
            .collect::<Vec<_>>();
        assert_eq!(
            got,
            vec![
                (true, 12.0, 100.0),
                (true, 6.0, 0.0),
                (true, 0.0, 60.0),
                (false, 12.0, 100.0),
                (false, 0.0, 50.0),
                (false, 0.0, 51.0),
            ]
        );
        for w in list.windows(2) {
            assert!((w[0].is_nodule, w[0].diameter_mm) >= (w[1].is_nodule, w[1].diameter_mm));
        }
    }

    #[test]
    fn test_matched_diameter_is_near_annotation() {
        let annotations = (0..20)
            .map(|i| ann("s1", [i as f64 * 7.0, 3.0, -1.0], 4.0 + (i % 5) as f64))
            .collect::<Vec<_>>();
        let candidates = (0..200)
            .map(|i| cand("s1", [i as f64 * 0.7, 3.5, -1.2], i % 3 == 0))
            .collect::<Vec<_>>();
        let list = build_candidate_list(&annotations, &candidates, &present(&["s1"]));
        for c in list.iter().filter(|c| c.diameter_mm > 0.0) {
            assert!(annotations.iter().any(|a| a.diameter_mm == c.diameter_mm
                && (0..3).all(|k| (c.center_xyz[k] - a.center_xyz[k]).abs() <= a.diameter_mm / 4.0)));
        }
    }

    #[test]
    fn test_read_tables() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("annotations.csv");
        let c = dir.path().join("candidates.csv");
        fs::write(
            &a,
            "seriesuid,coordX,coordY,coordZ,diameter_mm\n\
             1.3.6.1,-128.6994211,-175.3192718,-298.3875064,5.651470635\n\
             \n",
        )
        .unwrap();
        fs::write(
            &c,
            "seriesuid,coordX,coordY,coordZ,class\n\
             1.3.6.1,-56.08,-67.85,-311.92,0\n\
             1.3.6.1,-128.7,-175.3,-298.4,1\n",
        )
        .unwrap();

        let annotations = read_annotations(&a).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].diameter_mm, 5.651470635);
        let candidates = read_candidates(&c).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[0].is_nodule && candidates[1].is_nodule);

        fs::write(&c, "header\n1.3.6.1,1,2,x,0\n").unwrap();
        match read_candidates(&c) {
            Err(LunaError::MalformedTable { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        fs::write(&c, "header\n1.3.6.1,1,2,3\n").unwrap();
        assert!(matches!(read_candidates(&c), Err(LunaError::MalformedTable { .. })));
    }

    #[test]
    fn test_registry_built_once() {
        let registry = CandidateRegistry::from_rows(
            vec![ann("s1", [0.0; 3], 4.0)],
            vec![cand("s1", [0.0; 3], true), cand("s1", [9.0; 3], false)],
            present(&["s1"]),
        );
        let first = registry.candidates().unwrap();
        let second = registry.candidates().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].diameter_mm, 4.0);
    }
}
