//! # parse 子命令 CLI 定义
//!
//! 递归扫描任务目录并装配任务文档
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/parse.rs`

use clap::Args;
use std::path::PathBuf;

/// parse 子命令参数
#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Root directory containing VASP task directories
    pub root: PathBuf,

    /// Output JSONL file for assembled task documents
    #[arg(long, default_value = "tasks.jsonl")]
    pub output: PathBuf,

    /// Task id prefix; ids are assigned as <prefix>-<n> in directory order
    #[arg(long, default_value = "task")]
    pub prefix: String,

    /// Number of parallel jobs (0 = number of CPUs)
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,
}
