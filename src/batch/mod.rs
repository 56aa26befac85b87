//! # 批量处理模块
//!
//! 提供任务目录收集与并行批量处理能力。
//!
//! ## 功能
//! - 递归收集任务目录
//! - 并行处理与进度反馈
//! - 成功/跳过/失败统计
//!
//! ## 依赖关系
//! - 被各命令模块使用
//! - 使用 `rayon` 进行并行处理
//! - 使用 `indicatif` 显示进度

pub mod collector;
pub mod runner;

pub use collector::TaskDirCollector;
pub use runner::{BatchResult, BatchRunner, ProcessResult};
