//! # 命令执行模块
//!
//! 实现各子命令的业务逻辑。
//!
//! ## 依赖关系
//! - 被 `main.rs` 调用
//! - 使用 `cli/`, `parsers/`, `builders/`, `store/`, `utils/`
//! - 子模块: parse, validate, build, archive

pub mod archive;
pub mod build;
pub mod parse;
pub mod validate;

use crate::cli::Commands;
use crate::error::Result;

/// 执行命令
pub fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Parse(args) => parse::execute(args),
        Commands::Validate(args) => validate::execute(args),
        Commands::Build(args) => build::execute(args),
        Commands::Archive(args) => archive::execute(args),
    }
}
