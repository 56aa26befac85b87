//! # VASP KPOINTS 解析器
//!
//! 解析 KPOINTS 文件，识别生成方案（Gamma/Monkhorst/线模式/自动），
//! 线模式结果用于 NSCF 任务类型判定。
//!
//! ## KPOINTS 格式说明
//! ```text
//! Comment line
//! 0                  # 0 = 自动生成；>0 = 显式 k 点数
//! Gamma|Monkhorst|Line-mode|Auto
//! 4 4 4              # 网格（或线模式的高对称点段）
//! 0 0 0              # 可选偏移
//! ```
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs` 使用
//! - 使用 `models/calculation.rs` 的 Kpoints 类型

use crate::error::{MatpipeError, Result};
use crate::models::calculation::{KpointScheme, Kpoints};
use std::fs;
use std::path::Path;

/// 解析 KPOINTS 文件
pub fn parse_kpoints_file(path: &Path) -> Result<Kpoints> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_kpoints_content(&content).ok_or_else(|| MatpipeError::ParseError {
        format: "kpoints".to_string(),
        path: path.display().to_string(),
        reason: "Unrecognized KPOINTS layout".to_string(),
    })
}

/// 从字符串内容解析 KPOINTS
pub fn parse_kpoints_content(content: &str) -> Option<Kpoints> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() < 3 {
        return None;
    }

    let num_kpoints: u32 = lines[1].split_whitespace().next()?.parse().ok()?;
    let mode_line = lines[2].trim().to_lowercase();

    // 线模式：第三行以 l 开头（"Line-mode"）
    if mode_line.starts_with('l') {
        let labels = lines
            .get(4..)
            .unwrap_or(&[])
            .iter()
            .filter_map(|line| {
                // 高对称点行尾常带 "! GAMMA" 式标签
                line.split('!').nth(1).map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .collect();
        return Some(Kpoints {
            scheme: KpointScheme::Line,
            grid: None,
            shift: None,
            num_kpoints,
            labels,
        });
    }

    // 显式 k 点列表
    if num_kpoints > 0 {
        return Some(Kpoints {
            scheme: KpointScheme::Explicit,
            grid: None,
            shift: None,
            num_kpoints,
            labels: Vec::new(),
        });
    }

    let scheme = match mode_line.chars().next()? {
        'g' => KpointScheme::Gamma,
        'm' => KpointScheme::Monkhorst,
        'a' => KpointScheme::Automatic,
        _ => return None,
    };

    if scheme == KpointScheme::Automatic {
        // 自动模式：第四行为长度参数
        return Some(Kpoints {
            scheme,
            grid: None,
            shift: None,
            num_kpoints: 0,
            labels: Vec::new(),
        });
    }

    let grid_vals: Vec<u32> = lines
        .get(3)?
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect();
    if grid_vals.len() < 3 {
        return None;
    }
    let grid = [grid_vals[0], grid_vals[1], grid_vals[2]];

    let shift = lines.get(4).and_then(|line| {
        let vals: Vec<f64> = line
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if vals.len() >= 3 {
            Some([vals[0], vals[1], vals[2]])
        } else {
            None
        }
    });

    Some(Kpoints {
        scheme,
        grid: Some(grid),
        shift,
        num_kpoints: grid[0] * grid[1] * grid[2],
        labels: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gamma_grid() {
        let content = "Automatic mesh\n0\nGamma\n4 4 4\n0 0 0\n";
        let kpoints = parse_kpoints_content(content).unwrap();
        assert_eq!(kpoints.scheme, KpointScheme::Gamma);
        assert_eq!(kpoints.grid, Some([4, 4, 4]));
        assert_eq!(kpoints.num_kpoints, 64);
        assert!(!kpoints.is_line_mode());
    }

    #[test]
    fn test_parse_monkhorst() {
        let content = "mesh\n0\nMonkhorst-Pack\n2 2 2\n";
        let kpoints = parse_kpoints_content(content).unwrap();
        assert_eq!(kpoints.scheme, KpointScheme::Monkhorst);
    }

    #[test]
    fn test_parse_line_mode() {
        let content = "\
Line path
20
Line-mode
Reciprocal
0.0 0.0 0.0 ! GAMMA
0.5 0.0 0.5 ! X

0.5 0.0 0.5 ! X
0.5 0.25 0.75 ! W
";
        let kpoints = parse_kpoints_content(content).unwrap();
        assert!(kpoints.is_line_mode());
        assert_eq!(kpoints.num_kpoints, 20);
        assert!(kpoints.labels.contains(&"GAMMA".to_string()));
    }

    #[test]
    fn test_too_short_returns_none() {
        assert!(parse_kpoints_content("only\ntwo").is_none());
    }
}
