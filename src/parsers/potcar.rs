//! # VASP POTCAR 解析器
//!
//! 从 POTCAR 提取 TITEL 行，或解析 POTCAR.spec 摘要文件；两者并存时
//! 以完整 POTCAR 为准，保证赝势只有一个规范表示。
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs` 使用
//! - 使用 `models/calculation.rs` 的 PotcarSpec 类型

use crate::error::{MatpipeError, Result};
use crate::models::calculation::PotcarSpec;
use regex::Regex;
use std::fs;
use std::path::Path;

/// 解析完整 POTCAR 文件（可能串联多个元素块）
pub fn parse_potcar_file(path: &Path) -> Result<Vec<PotcarSpec>> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(parse_potcar_content(&content))
}

/// 从 POTCAR 内容提取 TITEL 行
///
/// `TITEL  = PAW_PBE Fe_pv 02Aug2007` → titel 为整行值，symbol 为第二个字段。
pub fn parse_potcar_content(content: &str) -> Vec<PotcarSpec> {
    let re = Regex::new(r"TITEL\s*=\s*(.+)").expect("static regex");

    content
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| {
            let titel = caps[1].trim().to_string();
            let symbol = titel
                .split_whitespace()
                .nth(1)
                .unwrap_or_default()
                .to_string();
            PotcarSpec { titel, symbol }
        })
        .collect()
}

/// 解析 POTCAR.spec 摘要（每行一个 TITEL 值）
pub fn parse_potcar_spec_file(path: &Path) -> Result<Vec<PotcarSpec>> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|titel| PotcarSpec {
            titel: titel.to_string(),
            symbol: titel
                .split_whitespace()
                .nth(1)
                .unwrap_or_default()
                .to_string(),
        })
        .collect())
}

/// 调和 POTCAR 与 POTCAR.spec：完整 POTCAR 优先
pub fn reconcile(
    from_potcar: Option<Vec<PotcarSpec>>,
    from_spec: Option<Vec<PotcarSpec>>,
) -> Vec<PotcarSpec> {
    match (from_potcar, from_spec) {
        (Some(full), _) if !full.is_empty() => full,
        (_, Some(spec)) => spec,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_titel_lines() {
        let content = "\
 PAW_PBE Si 05Jan2001
 parameters from PSCTR are:
   VRHFIN =Si: s2p2
   TITEL  = PAW_PBE Si 05Jan2001
End of Dataset
   TITEL  = PAW_PBE O 08Apr2002
";
        let specs = parse_potcar_content(content);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].symbol, "Si");
        assert_eq!(specs[1].titel, "PAW_PBE O 08Apr2002");
    }

    #[test]
    fn test_reconcile_prefers_full_potcar() {
        let full = vec![PotcarSpec {
            titel: "PAW_PBE Fe_pv 02Aug2007".to_string(),
            symbol: "Fe_pv".to_string(),
        }];
        let spec = vec![PotcarSpec {
            titel: "PAW_PBE Fe 06Sep2000".to_string(),
            symbol: "Fe".to_string(),
        }];

        let merged = reconcile(Some(full.clone()), Some(spec.clone()));
        assert_eq!(merged, full);

        let merged = reconcile(None, Some(spec.clone()));
        assert_eq!(merged, spec);

        assert!(reconcile(None, None).is_empty());
    }
}
