//! # 构建器框架
//!
//! 三阶段构建协议：`get_items` 取出自包含条目，`process_item`
//! 纯函数式地处理单条，`update_targets` 按存储契约写回。
//! 外部调度器可按条目并行 `process_item`，阶段内不共享可变状态。
//!
//! ## 失败语义
//! 单条失败记日志并跳过，不中止批次；只有取条目与写回失败才向上传播。
//!
//! ## 模块列表
//! - `materials`: 任务 → 材料文档
//! - `elasticity`: 形变任务组 → 弹性张量
//! - `defects`: 缺陷任务配对与热力学聚合
//! - `pes`: 势能面极小点/过渡态/反应
//! - `phonon`: 外部声子工具驱动

pub mod defects;
pub mod elasticity;
pub mod materials;
pub mod pes;
pub mod phonon;

use crate::error::Result;
use crate::utils::output;

/// 构建器公共配置（显式传入，无全局单例）
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// 母晶格/形变矩阵比较容差
    pub lattice_tol: f64,
    /// 结构匹配的位点容差
    pub site_tol: f64,
    /// 势能面极小点允许的最低频率下限 (cm⁻¹)
    pub negative_threshold: f64,
    /// 过渡矢量与位移投影的匹配容差（1 - |cos| 上限）
    pub mode_projection_tol: f64,
    /// 反应比较是否计入金属-配体键
    pub consider_metal_bonds: bool,
    /// 本体配对严格模式：多个候选本体不一致时放弃该缺陷
    pub strict_bulk_matching: bool,
    /// 外部命令超时（秒）
    pub subprocess_timeout_secs: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            lattice_tol: 1e-5,
            site_tol: 1e-3,
            negative_threshold: -75.0,
            mode_projection_tol: 0.1,
            consider_metal_bonds: true,
            strict_bulk_matching: false,
            subprocess_timeout_secs: 3600,
        }
    }
}

/// 三阶段构建器
pub trait Builder {
    type Item;
    type Doc;

    fn name(&self) -> &str;

    /// 取出本轮全部自包含条目
    fn get_items(&mut self) -> Result<Vec<Self::Item>>;

    /// 处理单条：Ok(None) 表示有意跳过
    fn process_item(&self, item: &Self::Item) -> Result<Option<Self::Doc>>;

    /// 按存储契约写回整批产出
    fn update_targets(&mut self, docs: Vec<Self::Doc>) -> Result<()>;
}

/// 构建轮次统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 同步驱动一轮构建，逐条捕获失败
pub fn run_builder<B: Builder>(builder: &mut B) -> Result<BuildReport> {
    let items = builder.get_items()?;
    let mut report = BuildReport::default();
    let mut docs = Vec::new();

    for item in &items {
        match builder.process_item(item) {
            Ok(Some(doc)) => {
                docs.push(doc);
                report.processed += 1;
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                output::print_warning(&format!("{}: item failed: {}", builder.name(), e));
                report.failed += 1;
            }
        }
    }

    builder.update_targets(docs)?;
    output::print_build_report(builder.name(), report.processed, report.skipped, report.failed);
    Ok(report)
}
