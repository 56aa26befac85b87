//! # VASP OUTCAR 解析器
//!
//! 逐行扫描 OUTCAR，提取运行统计、逐位点磁矩与完成标记。
//! 结构与能量以 vasprun.xml 为准；OUTCAR 缺失时管线降级继续。
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs` 使用
//! - 使用 `models/calculation.rs` 的 RunStats

use crate::error::{MatpipeError, Result};
use crate::models::calculation::RunStats;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// OUTCAR 提取结果
#[derive(Debug, Clone, Default)]
pub struct OutcarData {
    /// 计算是否走到计时统计段（正常收尾标记）
    pub is_finished: bool,
    /// 运行统计
    pub run_stats: RunStats,
    /// 逐位点磁矩 (μB)，取最后一个 magnetization (x) 块
    pub magnetization: Vec<f64>,
    /// 漂移力 (eV/Å)，取最后一次报告
    pub drift: Option<[f64; 3]>,
}

/// 解析 OUTCAR 文件
pub fn parse_outcar_file(path: &Path) -> Result<OutcarData> {
    let file = File::open(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    let reader = BufReader::new(file);
    let mut data = OutcarData::default();
    let mut in_magnetization = false;
    let mut mag_block: Vec<f64> = Vec::new();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };

        // 正常收尾标记
        if line.contains("General timing and accounting informations for this job") {
            data.is_finished = true;
        }

        // "running on   64 total cores"
        if line.contains("running on") && line.contains("total cores") {
            if let Some(val) = extract_number_before(&line, "total cores") {
                data.run_stats.cores = Some(val as u32);
            }
        }

        // "Elapsed time (sec):     1234.567"
        if line.contains("Elapsed time (sec):") {
            data.run_stats.elapsed_time = extract_last_number(&line);
        }

        // "Maximum memory used (kb):      123456."
        if line.contains("Maximum memory used (kb):") {
            data.run_stats.max_memory = extract_last_number(&line);
        }

        // "total drift:   0.000001  -0.000002   0.000003"
        if line.contains("total drift:") {
            let vals: Vec<f64> = line
                .split(':')
                .nth(1)
                .unwrap_or("")
                .split_whitespace()
                .filter_map(|w| w.parse().ok())
                .collect();
            if vals.len() >= 3 {
                data.drift = Some([vals[0], vals[1], vals[2]]);
            }
        }

        // magnetization (x) 块：表头后跳两行分隔线，行首为位点序号
        if line.contains("magnetization (x)") {
            in_magnetization = true;
            mag_block.clear();
            continue;
        }
        if in_magnetization {
            let trimmed = line.trim();
            if trimmed.starts_with("tot") {
                // 合计行结束本块
                in_magnetization = false;
                data.magnetization = mag_block.clone();
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 2 && fields[0].parse::<usize>().is_ok() {
                // 最后一列为合计磁矩
                if let Ok(tot) = fields[fields.len() - 1].parse::<f64>() {
                    mag_block.push(tot);
                }
            }
        }
    }

    Ok(data)
}

/// 从字符串中提取指定标记之前的数字
fn extract_number_before(s: &str, marker: &str) -> Option<f64> {
    let pos = s.find(marker)?;
    s[..pos].split_whitespace().last()?.parse().ok()
}

/// 提取字符串中最后一个数字
fn extract_last_number(s: &str) -> Option<f64> {
    s.split_whitespace()
        .filter_map(|w| w.trim_end_matches('.').parse::<f64>().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_outcar(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_parse_finished_outcar() {
        let content = "\
 running on   64 total cores
 magnetization (x)

# of ion       s       p       d       tot
------------------------------------------
    1        0.01    0.02    2.50    2.53
    2        0.00    0.01   -2.49   -2.48
--------------------------------------------------
tot          0.01    0.03    0.01    0.05

 total drift:      0.000021     -0.000013      0.000002
 General timing and accounting informations for this job:
  Elapsed time (sec):     1234.567
  Maximum memory used (kb):      204800.
";
        let f = write_outcar(content);
        let data = parse_outcar_file(f.path()).unwrap();

        assert!(data.is_finished);
        assert_eq!(data.run_stats.cores, Some(64));
        assert_eq!(data.run_stats.elapsed_time, Some(1234.567));
        assert_eq!(data.magnetization, vec![2.53, -2.48]);
        let drift = data.drift.unwrap();
        assert!((drift[0] - 0.000021).abs() < 1e-9);
    }

    #[test]
    fn test_unfinished_outcar() {
        let f = write_outcar("running on    8 total cores\n");
        let data = parse_outcar_file(f.path()).unwrap();
        assert!(!data.is_finished);
        assert_eq!(data.run_stats.cores, Some(8));
        assert!(data.run_stats.elapsed_time.is_none());
    }
}
