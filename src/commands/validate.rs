//! # validate 命令实现
//!
//! 读取任务文档，执行 INCAR 合规性校验，打印汇总表格。
//!
//! ## 功能
//! - 从 JSONL 读取任务文档（反序列化时重新派生类型字段）
//! - 每个任务独立校验，互不影响
//! - 终端表格汇总 + 可选 JSONL 输出
//!
//! ## 依赖关系
//! - 使用 `cli/validate.rs` 定义的参数
//! - 使用 `validate/`, `store/`, `models/task.rs`
//! - 使用 `tabled` 打印汇总表格

use crate::cli::validate::ValidateArgs;
use crate::error::{MatpipeError, Result};
use crate::models::task::TaskDoc;
use crate::store::{DocStore, JsonlStore};
use crate::utils::output;
use crate::validate::{ValidateConfig, ValidationDoc};

use std::collections::BTreeMap;
use tabled::{Table, Tabled};

/// 汇总表格行
#[derive(Debug, Clone, Tabled)]
struct ValidationRow {
    #[tabled(rename = "Task")]
    task_id: String,
    #[tabled(rename = "Valid")]
    valid: bool,
    #[tabled(rename = "Reasons")]
    reasons: usize,
    #[tabled(rename = "Warnings")]
    warnings: usize,
}

/// 从 JSONL 读取任务文档（经过规范化）
pub fn load_tasks(path: &std::path::Path) -> Result<Vec<TaskDoc>> {
    let store = JsonlStore::new(path, &["task_id"]);
    let values = store.query(&BTreeMap::new())?;
    let mut tasks = Vec::with_capacity(values.len());
    for value in values {
        tasks.push(TaskDoc::from_document(value)?);
    }
    tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    Ok(tasks)
}

/// 执行 validate 命令
pub fn execute(args: ValidateArgs) -> Result<()> {
    output::print_header("Validating task documents");

    if !args.tasks.exists() {
        return Err(MatpipeError::FileNotFound {
            path: args.tasks.display().to_string(),
        });
    }

    let tasks = load_tasks(&args.tasks)?;
    if tasks.is_empty() {
        output::print_warning("No task documents to validate.");
        return Ok(());
    }
    output::print_info(&format!("Validating {} task documents", tasks.len()));

    let config = ValidateConfig {
        fft_grid_tolerance: args.fft_grid_tolerance,
        entropy_per_atom_max: args.entropy_per_atom_max,
    };

    let docs: Vec<ValidationDoc> = tasks
        .iter()
        .map(|task| ValidationDoc::from_task(task, &config))
        .collect();

    let rows: Vec<ValidationRow> = docs
        .iter()
        .filter(|d| !args.only_invalid || !d.valid)
        .map(|d| ValidationRow {
            task_id: d.task_id.clone(),
            valid: d.valid,
            reasons: d.reasons.len(),
            warnings: d.warnings.len(),
        })
        .collect();

    if rows.is_empty() {
        output::print_success("All tasks valid.");
    } else {
        println!("{}", Table::new(&rows));
    }

    for doc in &docs {
        for reason in &doc.reasons {
            output::print_warning(&format!("{}: {}", doc.task_id, reason));
        }
    }

    let invalid = docs.iter().filter(|d| !d.valid).count();
    if invalid > 0 {
        output::print_warning(&format!("{} of {} tasks invalid", invalid, docs.len()));
    } else {
        output::print_success(&format!("All {} tasks valid", docs.len()));
    }

    if let Some(out_path) = &args.output {
        let values: Vec<serde_json::Value> = docs
            .iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: out_path.display().to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        let mut store = JsonlStore::new(out_path, &["task_id"]);
        store.update(values)?;
        output::print_success(&format!(
            "Wrote validation documents to '{}'",
            out_path.display()
        ));
    }

    Ok(())
}
