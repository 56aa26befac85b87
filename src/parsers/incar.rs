//! # VASP INCAR 解析器
//!
//! 解析 INCAR 文本为规范化参数映射。
//!
//! ## 规范化规则
//! - 键去空白并大写
//! - `.TRUE./.FALSE./T/F` 解析为布尔
//! - 支持 Fortran 重复计数（`2*1.0` → `[1.0, 1.0]`）
//! - `#` 与 `!` 之后为行内注释
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs`, `validate/` 使用
//! - 使用 `models/calculation.rs` 的参数类型

use crate::error::{MatpipeError, Result};
use crate::models::calculation::{IncarValue, Parameters};
use std::fs;
use std::path::Path;

/// 解析 INCAR 文件
pub fn parse_incar_file(path: &Path) -> Result<Parameters> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(parse_incar_content(&content))
}

/// 从字符串内容解析 INCAR
///
/// 无法识别的行被跳过（validation 引擎负责语义检查，解析本身不报错）。
pub fn parse_incar_content(content: &str) -> Parameters {
    let mut params = Parameters::new();

    for line in content.lines() {
        // 剥离注释
        let line = line.split(['#', '!']).next().unwrap_or("");
        // 一行可包含分号分隔的多个赋值
        for stmt in line.split(';') {
            let mut parts = stmt.splitn(2, '=');
            let key = match parts.next() {
                Some(k) => k.trim().to_uppercase(),
                None => continue,
            };
            let raw = match parts.next() {
                Some(v) => v.trim(),
                None => continue,
            };
            if key.is_empty() || raw.is_empty() {
                continue;
            }
            params.insert(key, parse_value(raw));
        }
    }

    params
}

/// 解析单个 INCAR 值
pub fn parse_value(raw: &str) -> IncarValue {
    let trimmed = raw.trim();
    let upper = trimmed.to_uppercase();

    match upper.as_str() {
        ".TRUE." | "T" | "TRUE" => return IncarValue::Bool(true),
        ".FALSE." | "F" | "FALSE" => return IncarValue::Bool(false),
        _ => {}
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    if tokens.len() == 1 {
        if let Ok(i) = tokens[0].parse::<i64>() {
            return IncarValue::Int(i);
        }
        if let Ok(f) = tokens[0].parse::<f64>() {
            return IncarValue::Float(f);
        }
        return IncarValue::Str(trimmed.to_string());
    }

    // 多值：展开重复计数后尝试整数列表、浮点列表
    let expanded = expand_repeats(&tokens);

    if let Some(ints) = expanded
        .iter()
        .map(|t| t.parse::<i64>().ok())
        .collect::<Option<Vec<i64>>>()
    {
        return IncarValue::IntList(ints);
    }

    if let Some(floats) = expanded
        .iter()
        .map(|t| t.parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()
    {
        return IncarValue::FloatList(floats);
    }

    IncarValue::Str(trimmed.to_string())
}

/// 展开 Fortran 重复计数记法（`3*0.5` → 三个 `0.5`）
fn expand_repeats(tokens: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for token in tokens {
        if let Some((count, value)) = token.split_once('*') {
            if let Ok(n) = count.parse::<usize>() {
                for _ in 0..n {
                    out.push(value.to_string());
                }
                continue;
            }
        }
        out.push(token.to_string());
    }
    out
}
