//! # archive 子命令 CLI 定义
//!
//! 任务文档导出为列式归档
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/archive.rs`

use clap::Args;
use std::path::PathBuf;

/// archive 子命令参数
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// JSONL file of task documents (from `matpipe parse`)
    pub tasks: PathBuf,

    /// Output directory for per-task archive files
    #[arg(long, default_value = "archive")]
    pub output_dir: PathBuf,

    /// Also emit CSV site/trajectory tables next to the JSON files
    #[arg(long, default_value_t = false)]
    pub csv: bool,
}
