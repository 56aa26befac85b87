//! # validate 子命令 CLI 定义
//!
//! 对任务文档执行 INCAR 合规性校验
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/validate.rs`

use clap::Args;
use std::path::PathBuf;

/// validate 子命令参数
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// JSONL file of task documents (from `matpipe parse`)
    pub tasks: PathBuf,

    /// Optional JSONL output for validation documents
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// FFT grid tolerance factor applied to the minimal valid grid
    #[arg(long, default_value_t = 0.9)]
    pub fft_grid_tolerance: f64,

    /// Maximum |electronic entropy| per atom (eV/atom)
    #[arg(long, default_value_t = 0.001)]
    pub entropy_per_atom_max: f64,

    /// Only print invalid tasks
    #[arg(long, default_value_t = false)]
    pub only_invalid: bool,
}
