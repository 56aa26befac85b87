//! # CLI 模块
//!
//! 使用 `clap` 定义命令行参数和子命令。
//!
//! ## 命令结构
//! - `parse`: 任务目录 → 任务文档 JSONL
//! - `validate`: 任务文档 → 输入合规性校验
//! - `build`: 任务/缺陷/势能面/声子构建管线
//! - `archive`: 任务文档 → 列式归档
//!
//! ## 依赖关系
//! - 被 `main.rs` 使用
//! - 子模块: parse, validate, build, archive

pub mod archive;
pub mod build;
pub mod parse;
pub mod validate;

use clap::{Parser, Subcommand};

/// Matpipe - 第一性原理计算数据管线
#[derive(Parser)]
#[command(name = "matpipe")]
#[command(version)]
#[command(about = "A data pipeline for first-principles calculation results", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
pub enum Commands {
    /// Parse VASP task directories into task documents
    Parse(parse::ParseArgs),

    /// Validate task documents against reference input sets
    Validate(validate::ValidateArgs),

    /// Run an ETL builder over parsed documents
    Build(build::BuildArgs),

    /// Export task documents to columnar archive formats
    Archive(archive::ArchiveArgs),
}
