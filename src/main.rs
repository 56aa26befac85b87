//! # Matpipe - 第一性原理计算结果数据管线
//!
//! 将 VASP 计算目录解析为结构化任务文档，校验输入合规性，并聚合为
//! 材料、弹性、缺陷、势能面与声子等衍生文档。
//!
//! ## 子命令
//! - `parse`    - 递归解析 VASP 任务目录为任务文档 (JSONL)
//! - `validate` - INCAR 输入合规性校验
//! - `build`    - 聚合衍生文档 (materials / elasticity / defects /
//!   defect-thermo / pes / phonon)
//! - `archive`  - 任务文档导出为列式归档
//!
//! ## 依赖关系
//! ```text
//! main.rs
//!   ├── cli/        (命令行参数定义)
//!   ├── commands/   (命令执行逻辑)
//!   │     ├── parsers/   (VASP 输出解析器)
//!   │     ├── validate/  (输入校验规则)
//!   │     ├── builders/  (文档聚合构建器)
//!   │     ├── store/     (文档存储)
//!   │     └── archive/   (列式归档编码)
//!   ├── models/     (数据模型)
//!   ├── matching/   (结构匹配)
//!   ├── symmetry/   (晶格点群)
//!   ├── tensor/     (张量运算)
//!   ├── batch/      (并行批处理)
//!   ├── utils/      (工具函数)
//!   └── error.rs    (错误处理)
//! ```

mod archive;
mod batch;
mod builders;
mod cli;
mod commands;
mod error;
mod matching;
mod models;
mod parsers;
mod store;
mod symmetry;
mod tensor;
mod utils;
mod validate;

use clap::Parser;
use cli::Cli;

fn main() {
    // Initialize colored output for Windows compatibility
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cli = Cli::parse();

    if let Err(e) = commands::run(cli.command) {
        utils::output::print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
