//! # 数据模型模块
//!
//! 定义管线全部文档模式：晶体结构、计算记录、任务文档与各派生文档。
//!
//! ## 依赖关系
//! - 被 `parsers/`, `validate/`, `builders/`, `store/`, `archive/` 使用
//! - 子模块: structure, calculation, task, defect, elasticity, pes

pub mod calculation;
pub mod defect;
pub mod elasticity;
pub mod pes;
pub mod structure;
pub mod task;

pub use calculation::{
    CalcType, Calculation, CalculationInput, CalculationOutput, RunType, TaskState, TaskType,
};
pub use structure::{Lattice, Site, Structure};
pub use task::{AnalysisDoc, ComputedEntry, TaskDoc};
