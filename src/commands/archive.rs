//! # archive 命令实现
//!
//! 将任务文档导出为列式归档文件（每个任务一组 JSON，可选 CSV）。
//!
//! ## 功能
//! - 结构归档: 晶格 + 按列存放的分数坐标与磁矩
//! - 轨迹归档: 逐离子步的能量、力、应力
//! - 缺少最终结构的任务跳过并记录
//!
//! ## 依赖关系
//! - 使用 `cli/archive.rs` 定义的参数
//! - 使用 `archive/`, `commands/validate.rs` (文档读取)
//! - 使用 `utils/progress.rs` 显示进度

use crate::archive::{write_json, StructureColumns, TrajectoryColumns};
use crate::cli::archive::ArchiveArgs;
use crate::commands::validate::load_tasks;
use crate::error::{MatpipeError, Result};
use crate::utils::{output, progress};

/// 执行 archive 命令
pub fn execute(args: ArchiveArgs) -> Result<()> {
    output::print_header("Archiving task documents");

    if !args.tasks.exists() {
        return Err(MatpipeError::FileNotFound {
            path: args.tasks.display().to_string(),
        });
    }

    let tasks = load_tasks(&args.tasks)?;
    if tasks.is_empty() {
        output::print_warning("No task documents to archive.");
        return Ok(());
    }

    std::fs::create_dir_all(&args.output_dir).map_err(|e| MatpipeError::FileWriteError {
        path: args.output_dir.display().to_string(),
        source: e,
    })?;

    let pb = progress::create_progress_bar(tasks.len() as u64, "Archiving");
    let mut archived = 0usize;
    let mut skipped = 0usize;

    for task in &tasks {
        pb.inc(1);

        let structure = match task.final_structure() {
            Some(s) => s,
            None => {
                output::print_skip(&format!("{}: no final structure", task.task_id));
                skipped += 1;
                continue;
            }
        };

        let structure_cols = StructureColumns::from_structure(structure);
        let structure_path = args
            .output_dir
            .join(format!("{}_structure.json", task.task_id));
        write_json(&structure_cols, &structure_path)?;

        let trajectory_cols =
            TrajectoryColumns::from_ionic_steps(&task.task_id, &task.output.ionic_steps);
        let trajectory_path = args
            .output_dir
            .join(format!("{}_trajectory.json", task.task_id));
        write_json(&trajectory_cols, &trajectory_path)?;

        if args.csv {
            structure_cols.write_csv(
                &args
                    .output_dir
                    .join(format!("{}_structure.csv", task.task_id)),
            )?;
            trajectory_cols.write_csv(
                &args
                    .output_dir
                    .join(format!("{}_trajectory.csv", task.task_id)),
            )?;
        }
        archived += 1;
    }
    pb.finish_and_clear();

    output::print_success(&format!(
        "Archived {} tasks to '{}' ({} skipped)",
        archived,
        args.output_dir.display(),
        skipped
    ));
    Ok(())
}
