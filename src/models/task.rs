//! # 任务文档数据模型
//!
//! 将一个任务目录的若干 `Calculation`（按逆时序）聚合为规范任务文档，
//! 并派生分析摘要与计算条目。
//!
//! ## 不变式
//! - run_type/task_type/calc_type 永远在构造/反序列化时重新派生，
//!   不信任已存储的值（"re-derivation on load"）
//! - analysis 永远由 calcs_reversed 重新计算
//! - entry 在装配时构建一次，之后不再重建
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs`, `validate/`, `builders/`, `store/` 使用
//! - 使用 `models/calculation.rs`, `models/structure.rs`

use crate::models::calculation::{
    CalcType, Calculation, CalculationInput, CalculationOutput, PotcarSpec, RunStats, RunType,
    TaskState, TaskType,
};
use crate::models::structure::Structure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 分析摘要：由完整 calcs_reversed 派生，不单独持久化后信任
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisDoc {
    /// 体积变化 (Å³)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_volume: Option<f64>,
    /// 体积变化百分比
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_volume_pct: Option<f64>,
    /// 最终结构最大受力 (eV/Å)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_force: Option<f64>,
    /// 警告
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// 错误
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// 体积变化超过该比例时记入警告
const VOLUME_CHANGE_WARNING_TOL: f64 = 0.2;

impl AnalysisDoc {
    /// 从计算序列派生分析摘要
    pub fn from_calcs(calcs_reversed: &[Calculation]) -> AnalysisDoc {
        let mut doc = AnalysisDoc::default();

        // 最早阶段的初始结构 vs 最后阶段的最终结构
        let initial = calcs_reversed
            .last()
            .and_then(|c| c.input.structure.as_ref());
        let final_ = calcs_reversed
            .first()
            .and_then(|c| c.output.structure.as_ref());

        if let (Some(s0), Some(s1)) = (initial, final_) {
            let v0 = s0.lattice.volume().abs();
            let v1 = s1.lattice.volume().abs();
            if v0 > 0.0 {
                let dv = v1 - v0;
                doc.delta_volume = Some(dv);
                doc.delta_volume_pct = Some(dv / v0 * 100.0);
                if (dv / v0).abs() > VOLUME_CHANGE_WARNING_TOL {
                    doc.warnings.push(format!(
                        "Volume change of {:.1}% is larger than {:.0}%",
                        dv / v0 * 100.0,
                        VOLUME_CHANGE_WARNING_TOL * 100.0
                    ));
                }
            }
        }

        if let Some(calc) = calcs_reversed.first() {
            let max_force = calc
                .output
                .forces
                .iter()
                .map(|f| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
                .fold(None, |acc: Option<f64>, x| {
                    Some(acc.map_or(x, |a| a.max(x)))
                });
            doc.max_force = max_force;
        }

        doc
    }
}

/// 计算条目摘要：装配时构建一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedEntry {
    /// 元素计数
    pub composition: BTreeMap<String, usize>,
    /// 能量 (eV)
    pub energy: f64,
    /// 能量修正 (eV)
    pub correction: f64,
    /// 泛函类型
    pub run_type: RunType,
    /// 赝势规范表示
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub potcar_spec: Vec<PotcarSpec>,
    /// 来源任务
    pub task_id: String,
}

/// 规范任务文档
///
/// calcs_reversed 按逆时序排列：`calcs_reversed[0]` 为最后执行的阶段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDoc {
    /// 任务标识
    pub task_id: String,
    /// 任务目录
    pub dir_name: String,
    /// 计算序列（逆时序）
    #[serde(default)]
    pub calcs_reversed: Vec<Calculation>,
    /// 外部提供的输入记录
    #[serde(default)]
    pub input: CalculationInput,
    /// *.orig 输入快照
    #[serde(default)]
    pub orig_inputs: CalculationInput,
    /// 最终输出摘要
    #[serde(default)]
    pub output: CalculationOutput,
    /// 分析摘要（构造时重新计算）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisDoc>,
    /// 计算条目（装配时构建一次）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<ComputedEntry>,
    /// 任务终态
    pub state: TaskState,
    /// 泛函类型（构造时重新派生）
    pub run_type: RunType,
    /// 任务类型（构造时重新派生）
    pub task_type: TaskType,
    /// 计算类型（构造时重新派生）
    pub calc_type: CalcType,
    /// 运行统计
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_stats: Option<RunStats>,
    /// 标签（由 transformations.other_parameters.tags 提升）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// 作者（由 transformations.other_parameters.author 提升）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// transformations.json 内容
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformations: Option<serde_json::Value>,
    /// custodian.json 内容
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custodian: Option<serde_json::Value>,
    /// 目录内其他 JSON 文件
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_json: BTreeMap<String, serde_json::Value>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
    /// 显式扩展映射（替代开放记录）
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl TaskDoc {
    /// 由计算序列装配任务文档并执行规范化
    pub fn new(task_id: impl Into<String>, dir_name: impl Into<String>) -> TaskDoc {
        TaskDoc {
            task_id: task_id.into(),
            dir_name: dir_name.into(),
            calcs_reversed: Vec::new(),
            input: CalculationInput::default(),
            orig_inputs: CalculationInput::default(),
            output: CalculationOutput::default(),
            analysis: None,
            entry: None,
            state: TaskState::Failed,
            run_type: RunType::Gga,
            task_type: TaskType::Static,
            calc_type: CalcType {
                run_type: RunType::Gga,
                task_type: TaskType::Static,
            },
            run_stats: None,
            tags: Vec::new(),
            author: None,
            transformations: None,
            custodian: None,
            additional_json: BTreeMap::new(),
            last_updated: Utc::now(),
            extensions: BTreeMap::new(),
        }
    }

    /// 类型派生所用的首个非空输入集
    ///
    /// 扫描顺序 {calcs_reversed[0].input, input, orig_inputs}：
    /// calcs_reversed 反映实际最后执行的输入，优先于外部提供的快照。
    pub fn first_input_set(&self) -> Option<&CalculationInput> {
        [
            self.calcs_reversed.first().map(|c| &c.input),
            Some(&self.input),
            Some(&self.orig_inputs),
        ]
        .into_iter()
        .flatten()
        .find(|input| !input.is_empty())
    }

    /// transformations.json 是否带形变变换标记
    fn has_deformation_marker(&self) -> bool {
        fn contains_deformation(value: &serde_json::Value) -> bool {
            match value {
                serde_json::Value::String(s) => s.contains("DeformStructureTransformation"),
                serde_json::Value::Array(items) => items.iter().any(contains_deformation),
                serde_json::Value::Object(map) => map.values().any(contains_deformation),
                _ => false,
            }
        }
        self.transformations
            .as_ref()
            .map(contains_deformation)
            .unwrap_or(false)
    }

    /// 规范化：每个构造与反序列化路径都必须调用
    ///
    /// 重新派生 run/task/calc 类型、重算 analysis、补齐 output 汇总、
    /// 判定终态。entry 仅在缺失且存在最终结构时构建一次。
    pub fn normalize(&mut self) {
        let derived = self.first_input_set().map(|input| {
            let line_mode = input
                .kpoints
                .as_ref()
                .map(|k| k.is_line_mode())
                .unwrap_or(false);
            (
                RunType::from_parameters(&input.parameters),
                TaskType::from_inputs(&input.parameters, line_mode),
            )
        });
        if let Some((run_type, task_type)) = derived {
            self.run_type = run_type;
            self.task_type = task_type;
        }

        if self.has_deformation_marker() {
            self.task_type = TaskType::Deformation;
        }

        self.calc_type = CalcType {
            run_type: self.run_type,
            task_type: self.task_type,
        };

        // output 汇总镜像最后阶段
        if let Some(last_calc) = self.calcs_reversed.first() {
            self.output = last_calc.output.clone();
            self.run_stats = last_calc.output.run_stats.clone();
        }
        self.output.normalize();

        self.state = if !self.calcs_reversed.is_empty()
            && self.calcs_reversed.iter().all(|c| c.completed)
        {
            TaskState::Success
        } else {
            TaskState::Failed
        };

        self.analysis = Some(AnalysisDoc::from_calcs(&self.calcs_reversed));

        if self.entry.is_none() {
            self.entry = self.build_entry();
        }
    }

    /// 构建计算条目（要求最后阶段存在最终结构与能量）
    fn build_entry(&self) -> Option<ComputedEntry> {
        let calc = self.calcs_reversed.first()?;
        let structure = calc.output.structure.as_ref()?;
        let energy = calc.output.energy?;

        Some(ComputedEntry {
            composition: structure.composition(),
            energy,
            correction: 0.0,
            run_type: self.run_type,
            potcar_spec: calc.input.potcar_spec.clone(),
            task_id: self.task_id.clone(),
        })
    }

    /// 从 JSON 文档重建任务文档
    ///
    /// 无论存储值如何（包括被破坏的 run/task/calc 类型），一律重新派生。
    pub fn from_document(value: serde_json::Value) -> crate::error::Result<TaskDoc> {
        let mut doc: TaskDoc = serde_json::from_value(value).map_err(|e| {
            crate::error::MatpipeError::JsonError {
                path: "<document>".to_string(),
                source: e,
            }
        })?;
        doc.normalize();
        Ok(doc)
    }

    /// 最终输出结构
    pub fn final_structure(&self) -> Option<&Structure> {
        self.output.structure.as_ref()
    }

    /// 完成时间（最后阶段）
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.calcs_reversed.first().and_then(|c| c.completed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calculation::{IncarValue, IonicStep, Parameters};
    use crate::models::structure::{Lattice, Site};

    fn si_structure() -> Structure {
        Structure::new(
            "Si",
            Lattice::from_parameters(5.43, 5.43, 5.43, 90.0, 90.0, 90.0),
            vec![
                Site::new("Si", [0.0, 0.0, 0.0]),
                Site::new("Si", [0.25, 0.25, 0.25]),
            ],
        )
    }

    fn relax_params() -> Parameters {
        [
            ("GGA".to_string(), IncarValue::Str("PE".to_string())),
            ("NSW".to_string(), IncarValue::Int(99)),
            ("IBRION".to_string(), IncarValue::Int(2)),
        ]
        .into_iter()
        .collect()
    }

    fn sample_calc(energy: f64) -> Calculation {
        let mut output = CalculationOutput {
            structure: Some(si_structure()),
            ionic_steps: vec![IonicStep {
                energy,
                e_wo_entrp: None,
                forces: vec![[0.0, 0.0, 0.01], [0.0, 0.0, -0.01]],
                stress: None,
                structure: Some(si_structure()),
                electronic_steps: Vec::new(),
            }],
            ..Default::default()
        };
        output.normalize();

        Calculation {
            dir_name: "calc".to_string(),
            task_name: "relax1".to_string(),
            completed: true,
            completed_at: None,
            input: CalculationInput {
                structure: Some(si_structure()),
                parameters: relax_params(),
                ..Default::default()
            },
            output,
        }
    }

    fn sample_task() -> TaskDoc {
        let mut doc = TaskDoc::new("mp-1", "/calcs/si");
        doc.calcs_reversed = vec![sample_calc(-10.85), sample_calc(-10.80)];
        doc.normalize();
        doc
    }

    #[test]
    fn test_normalize_derives_types_and_state() {
        let doc = sample_task();
        assert_eq!(doc.run_type, RunType::Gga);
        assert_eq!(doc.task_type, TaskType::StructureOptimization);
        assert_eq!(doc.state, TaskState::Success);
        assert_eq!(doc.output.energy, Some(-10.85));
    }

    #[test]
    fn test_entry_built_once() {
        let doc = sample_task();
        let entry = doc.entry.as_ref().expect("entry built during normalize");
        assert_eq!(entry.energy, -10.85);
        assert_eq!(entry.composition.get("Si"), Some(&2));
        assert_eq!(entry.task_id, "mp-1");
    }

    #[test]
    fn test_rederivation_overrides_corrupted_stored_types() {
        let doc = sample_task();
        let mut value = serde_json::to_value(&doc).unwrap();

        // 故意破坏已存储的派生字段
        value["run_type"] = serde_json::json!("Hf");
        value["task_type"] = serde_json::json!("Static");

        let rebuilt = TaskDoc::from_document(value).unwrap();
        assert_eq!(rebuilt.run_type, doc.run_type);
        assert_eq!(rebuilt.task_type, doc.task_type);
        assert_eq!(rebuilt.calc_type, doc.calc_type);
    }

    #[test]
    fn test_input_precedence_calcs_first() {
        let mut doc = sample_task();

        // orig_inputs 声称是静态计算；calcs_reversed 实际执行的是弛豫
        doc.orig_inputs = CalculationInput {
            parameters: [("NSW".to_string(), IncarValue::Int(0))].into_iter().collect(),
            ..Default::default()
        };
        doc.normalize();
        assert_eq!(doc.task_type, TaskType::StructureOptimization);

        // 没有 calcs 时回退到 input / orig_inputs
        doc.calcs_reversed.clear();
        doc.input = CalculationInput::default();
        doc.normalize();
        assert_eq!(doc.task_type, TaskType::Static);
    }

    #[test]
    fn test_deformation_marker_overrides_task_type() {
        let mut doc = sample_task();
        doc.transformations = Some(serde_json::json!({
            "history": [{"@class": "DeformStructureTransformation"}]
        }));
        doc.normalize();
        assert_eq!(doc.task_type, TaskType::Deformation);
    }

    #[test]
    fn test_incomplete_calc_fails_state() {
        let mut doc = sample_task();
        doc.calcs_reversed[1].completed = false;
        doc.normalize();
        assert_eq!(doc.state, TaskState::Failed);
    }
}
