//! # build 子命令 CLI 定义
//!
//! 选择并运行一个 ETL 构建器
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/build.rs`

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// 构建目标
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildTarget {
    /// Task documents → materials documents
    Materials,
    /// Optimization + deformation tasks → elastic tensors
    Elasticity,
    /// Defect/bulk task pairing → defect documents
    Defects,
    /// Defect documents → per-material thermodynamics
    DefectThermo,
    /// PES task documents → minima, transition states, reactions
    Pes,
    /// DDB documents → phonon band summaries via external tool
    Phonon,
}

/// build 子命令参数
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Which builder to run
    #[arg(value_enum)]
    pub target: BuildTarget,

    /// Source JSONL: task docs (materials/elasticity/defects), defect docs
    /// (defect-thermo), PES task docs (pes), or DDB docs (phonon)
    pub source: PathBuf,

    /// Output JSONL file (for `pes`, a directory receiving three files)
    #[arg(long, default_value = "build_output.jsonl")]
    pub output: PathBuf,

    /// Text file listing material ids that have dielectric documents
    /// (defects: required for non-metallic hosts)
    #[arg(long)]
    pub dielectrics: Option<PathBuf>,

    /// Text file listing elements with chemical-potential reference entries
    /// (defect-thermo)
    #[arg(long)]
    pub elements: Option<PathBuf>,

    /// External phonon tool command
    #[arg(long, default_value = "anaddb")]
    pub phonon_command: String,

    /// Working directory for temporary DDB files (defaults to the system
    /// temporary directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// External tool timeout in seconds
    #[arg(long, default_value_t = 3600)]
    pub timeout: u64,

    /// Give up on a defect when multiple bulk candidates match
    #[arg(long, default_value_t = false)]
    pub strict_bulk: bool,

    /// Ignore metal-ligand bonds when comparing reactions
    #[arg(long, default_value_t = false)]
    pub ignore_metal_bonds: bool,
}
