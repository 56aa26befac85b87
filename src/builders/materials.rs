//! # 材料构建器
//!
//! 把指向同一晶体的任务文档聚合为材料文档：结构等价的任务合并，
//! 材料标识取组内最小任务标识，电子结构摘要取最新静态计算。
//!
//! ## 分组语义
//! 先按约化化学式分桶，桶内用结构匹配器做逐代表贪心合并；
//! 容差比较不传递，分组结果依赖任务排序（按 task_id 固定排序消除
//! 运行间差异）。
//!
//! ## 依赖关系
//! - 被 `commands/build.rs` 使用
//! - 使用 `matching/`, `store/`, `models/task.rs`

use crate::builders::{Builder, BuilderConfig};
use crate::error::{MatpipeError, Result};
use crate::matching::StructureMatcher;
use crate::models::calculation::{RunType, TaskState, TaskType};
use crate::models::structure::Structure;
use crate::models::task::{ComputedEntry, TaskDoc};
use crate::store::DocStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 材料文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialsDoc {
    /// 材料标识（组内最小任务标识）
    pub material_id: String,
    /// 约化化学式
    pub formula: String,
    /// 代表结构（最新优化任务的最终结构）
    pub structure: Structure,
    /// 带隙 (eV)，来自最新静态计算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandgap: Option<f64>,
    /// 是否金属
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_metal: Option<bool>,
    /// 各泛函类型的计算条目
    pub entries: BTreeMap<String, ComputedEntry>,
    /// 组内全部任务
    pub task_ids: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// 材料构建器
pub struct MaterialsBuilder<S: DocStore> {
    tasks: Vec<TaskDoc>,
    target: S,
    matcher: StructureMatcher,
}

impl<S: DocStore> MaterialsBuilder<S> {
    pub fn new(tasks: Vec<TaskDoc>, target: S, config: &BuilderConfig) -> Self {
        MaterialsBuilder {
            tasks,
            target,
            matcher: StructureMatcher::new(config.lattice_tol * 100.0, config.site_tol),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }
}

impl<S: DocStore> Builder for MaterialsBuilder<S> {
    type Item = Vec<TaskDoc>;
    type Doc = MaterialsDoc;

    fn name(&self) -> &str {
        "materials"
    }

    /// 结构等价的成功任务为一个条目
    fn get_items(&mut self) -> Result<Vec<Vec<TaskDoc>>> {
        let mut eligible: Vec<TaskDoc> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Success && t.final_structure().is_some())
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        // 化学式分桶后逐代表贪心合并
        let mut buckets: BTreeMap<String, Vec<Vec<TaskDoc>>> = BTreeMap::new();
        for task in eligible {
            let formula = task
                .final_structure()
                .map(|s| s.reduced_formula())
                .unwrap_or_default();
            let groups = buckets.entry(formula).or_default();

            let matched = groups.iter_mut().find(|group| {
                let rep = group[0].final_structure();
                let cand = task.final_structure();
                match (rep, cand) {
                    (Some(a), Some(b)) => self.matcher.matches(a, b),
                    _ => false,
                }
            });
            match matched {
                Some(group) => group.push(task),
                None => groups.push(vec![task]),
            }
        }

        Ok(buckets.into_values().flatten().collect())
    }

    fn process_item(&self, group: &Vec<TaskDoc>) -> Result<Option<MaterialsDoc>> {
        if group.is_empty() {
            return Ok(None);
        }

        let material_id = group
            .iter()
            .map(|t| t.task_id.clone())
            .min()
            .unwrap_or_default();

        // 代表结构：最新完成的优化任务，否则最新任务
        let newest = |task_type: Option<TaskType>| -> Option<&TaskDoc> {
            group
                .iter()
                .filter(|t| task_type.map(|tt| t.task_type == tt).unwrap_or(true))
                .max_by_key(|t| t.completed_at())
        };
        let structure_source = newest(Some(TaskType::StructureOptimization))
            .or_else(|| newest(None))
            .ok_or_else(|| MatpipeError::Other("empty material group".to_string()))?;
        let structure = structure_source
            .final_structure()
            .cloned()
            .ok_or_else(|| MatpipeError::Other("material group lost its structure".to_string()))?;

        // 电子结构摘要：最新静态计算
        let bands = newest(Some(TaskType::Static)).and_then(|t| t.output.bands.as_ref());

        // 每种泛函保留最新条目
        let mut entries: BTreeMap<String, ComputedEntry> = BTreeMap::new();
        let mut latest: BTreeMap<RunType, DateTime<Utc>> = BTreeMap::new();
        for task in group {
            let Some(entry) = task.entry.as_ref() else {
                continue;
            };
            let ts = task.completed_at().unwrap_or(task.last_updated);
            if latest.get(&task.run_type).map(|prev| ts > *prev).unwrap_or(true) {
                latest.insert(task.run_type, ts);
                entries.insert(task.run_type.to_string(), entry.clone());
            }
        }

        Ok(Some(MaterialsDoc {
            material_id,
            formula: structure.reduced_formula(),
            structure,
            bandgap: bands.map(|b| b.bandgap),
            is_metal: bands.map(|b| b.is_metal),
            entries,
            task_ids: group.iter().map(|t| t.task_id.clone()).collect(),
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<MaterialsDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<materials doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}
