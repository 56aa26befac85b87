//! # parse 命令实现
//!
//! 递归收集 VASP 任务目录，并行装配任务文档，写入 JSONL 存储。
//!
//! ## 功能
//! - 扫描含 vasprun.xml* 文件的目录
//! - 每个目录装配为一个任务文档（多阶段弛豫归并）
//! - 单目录失败记录并继续
//!
//! ## 依赖关系
//! - 使用 `cli/parse.rs` 定义的参数
//! - 使用 `batch/`, `parsers/taskdir.rs`, `store/`
//! - 使用 `utils/output.rs`

use crate::batch::{BatchRunner, ProcessResult, TaskDirCollector};
use crate::cli::parse::ParseArgs;
use crate::error::{MatpipeError, Result};
use crate::parsers::taskdir;
use crate::store::{DocStore, JsonlStore};
use crate::utils::output;

/// 执行 parse 命令
pub fn execute(args: ParseArgs) -> Result<()> {
    output::print_header("Parsing VASP task directories");

    if !args.root.exists() {
        return Err(MatpipeError::DirectoryNotFound {
            path: args.root.display().to_string(),
        });
    }

    let dirs = TaskDirCollector::default().collect(&args.root);
    if dirs.is_empty() {
        output::print_warning("No task directories found (no vasprun.xml* files).");
        return Ok(());
    }
    output::print_info(&format!("Found {} task directories", dirs.len()));

    // 目录按字典序编号，重复运行得到稳定的任务标识
    let items: Vec<(String, std::path::PathBuf)> = dirs
        .into_iter()
        .enumerate()
        .map(|(i, dir)| (format!("{}-{}", args.prefix, i + 1), dir))
        .collect();

    let runner = BatchRunner::new(args.jobs);
    let result = runner.run(items, "Assembling task documents", |(task_id, dir)| {
        match taskdir::assemble_task(dir, task_id) {
            Ok(assembled) => ProcessResult::Success(assembled.doc),
            Err(e) => ProcessResult::Failed(dir.display().to_string(), e.to_string()),
        }
    });

    for (dir, err) in &result.failures {
        output::print_warning(&format!("{}: {}", dir, err));
    }

    let values: Vec<serde_json::Value> = result
        .outputs
        .iter()
        .map(|doc| {
            serde_json::to_value(doc).map_err(|e| MatpipeError::JsonError {
                path: args.output.display().to_string(),
                source: e,
            })
        })
        .collect::<Result<_>>()?;

    let mut store = JsonlStore::new(&args.output, &["task_id"]);
    store.update(values)?;

    output::print_success(&format!(
        "Wrote {} task documents to '{}'",
        result.outputs.len(),
        args.output.display()
    ));
    output::print_build_report(
        "parse",
        result.outputs.len(),
        result.skipped,
        result.failures.len(),
    );
    Ok(())
}
