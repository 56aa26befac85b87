//! # 计算记录数据模型
//!
//! 单次 VASP 计算（如 relax1/relax2 子阶段）的输入、输出与派生类型。
//!
//! ## 依赖关系
//! - 被 `parsers/`, `models/task.rs`, `validate/`, `builders/` 使用
//! - 使用 `models/structure.rs`

use crate::models::structure::Structure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─────────────────────────────────────────────────────────────
// INCAR 参数值
// ─────────────────────────────────────────────────────────────

/// INCAR 参数值（扁平 key→标量/列表 映射的值类型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    Str(String),
}

impl IncarValue {
    /// 数值视图（Bool 按 0/1 处理）
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            IncarValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            IncarValue::Int(i) => Some(*i as f64),
            IncarValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IncarValue::Bool(b) => Some(if *b { 1 } else { 0 }),
            IncarValue::Int(i) => Some(*i),
            IncarValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            IncarValue::Bool(b) => Some(*b),
            IncarValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IncarValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// 规范化的参数映射：键已去空白并大写
pub type Parameters = BTreeMap<String, IncarValue>;

/// 参数映射便捷读取
pub fn param_f64(params: &Parameters, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

pub fn param_i64(params: &Parameters, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn param_bool(params: &Parameters, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn param_str<'a>(params: &'a Parameters, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

// ─────────────────────────────────────────────────────────────
// 派生类型：RunType / TaskType / CalcType
// ─────────────────────────────────────────────────────────────

/// 交换关联泛函类型（+U 为独立变体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunType {
    Gga,
    GgaU,
    Lda,
    LdaU,
    Scan,
    ScanU,
    R2scan,
    R2scanU,
    Hf,
    HfU,
}

impl RunType {
    /// 从规范化参数映射派生泛函类型
    ///
    /// 优先级：METAGGA > LHFCALC > GGA 标签；LDAU=true 追加 +U
    pub fn from_parameters(params: &Parameters) -> RunType {
        let plus_u = param_bool(params, "LDAU").unwrap_or(false);

        if let Some(metagga) = param_str(params, "METAGGA") {
            let tag = metagga.trim().to_uppercase();
            if !tag.is_empty() && tag != "NONE" {
                return match (tag.as_str(), plus_u) {
                    ("R2SCAN", false) => RunType::R2scan,
                    ("R2SCAN", true) => RunType::R2scanU,
                    (_, false) => RunType::Scan,
                    (_, true) => RunType::ScanU,
                };
            }
        }

        if param_bool(params, "LHFCALC").unwrap_or(false) {
            return if plus_u { RunType::HfU } else { RunType::Hf };
        }

        // GGA 标签缺失或 "--" 视为 LDA 赝势默认
        let gga_tag = param_str(params, "GGA").map(|s| s.trim().to_uppercase());
        let is_lda = matches!(gga_tag.as_deref(), None | Some("" | "--" | "CA"));

        match (is_lda, plus_u) {
            (true, false) => RunType::Lda,
            (true, true) => RunType::LdaU,
            (false, false) => RunType::Gga,
            (false, true) => RunType::GgaU,
        }
    }

    /// 去掉 +U 后缀的基础泛函
    pub fn base(&self) -> RunType {
        match self {
            RunType::GgaU => RunType::Gga,
            RunType::LdaU => RunType::Lda,
            RunType::ScanU => RunType::Scan,
            RunType::R2scanU => RunType::R2scan,
            RunType::HfU => RunType::Hf,
            other => *other,
        }
    }

    pub fn is_plus_u(&self) -> bool {
        *self != self.base()
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunType::Gga => "GGA",
            RunType::GgaU => "GGA+U",
            RunType::Lda => "LDA",
            RunType::LdaU => "LDA+U",
            RunType::Scan => "SCAN",
            RunType::ScanU => "SCAN+U",
            RunType::R2scan => "R2SCAN",
            RunType::R2scanU => "R2SCAN+U",
            RunType::Hf => "HF",
            RunType::HfU => "HF+U",
        };
        write!(f, "{}", s)
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    StructureOptimization,
    Static,
    Deformation,
    MolecularDynamics,
    NscfLine,
    NscfUniform,
}

impl TaskType {
    /// 从参数与 KPOINTS 线模式标志派生任务类型
    ///
    /// Deformation 不由 INCAR 决定，由任务目录的形变变换标记覆盖。
    pub fn from_inputs(params: &Parameters, kpoints_line_mode: bool) -> TaskType {
        let icharg = param_i64(params, "ICHARG").unwrap_or(0);
        if icharg >= 11 {
            return if kpoints_line_mode {
                TaskType::NscfLine
            } else {
                TaskType::NscfUniform
            };
        }

        let ibrion = param_i64(params, "IBRION").unwrap_or(-1);
        if ibrion == 0 {
            return TaskType::MolecularDynamics;
        }

        let nsw = param_i64(params, "NSW").unwrap_or(0);
        if nsw <= 1 {
            TaskType::Static
        } else {
            TaskType::StructureOptimization
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::StructureOptimization => "Structure Optimization",
            TaskType::Static => "Static",
            TaskType::Deformation => "Deformation",
            TaskType::MolecularDynamics => "Molecular Dynamics",
            TaskType::NscfLine => "NSCF Line",
            TaskType::NscfUniform => "NSCF Uniform",
        };
        write!(f, "{}", s)
    }
}

/// 泛函类型 × 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalcType {
    pub run_type: RunType,
    pub task_type: TaskType,
}

impl std::fmt::Display for CalcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.run_type, self.task_type)
    }
}

/// 任务终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Success,
    Failed,
    Error,
}

// ─────────────────────────────────────────────────────────────
// 输入 / 输出记录
// ─────────────────────────────────────────────────────────────

/// KPOINTS 描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpoints {
    /// 生成方案
    pub scheme: KpointScheme,
    /// 网格尺寸（Gamma/Monkhorst 模式）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<[u32; 3]>,
    /// 网格偏移
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shift: Option<[f64; 3]>,
    /// 显式 k 点数（线模式为每段点数）
    pub num_kpoints: u32,
    /// 线模式高对称点标签
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl Kpoints {
    pub fn is_line_mode(&self) -> bool {
        self.scheme == KpointScheme::Line
    }
}

/// KPOINTS 生成方案
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KpointScheme {
    Gamma,
    Monkhorst,
    Line,
    Automatic,
    Explicit,
}

/// 赝势描述（POTCAR 与 POTCAR.spec 调和后的唯一规范表示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotcarSpec {
    /// TITEL 行（如 "PAW_PBE Si 05Jan2001"）
    pub titel: String,
    /// 元素符号（含修饰，如 "Si", "Fe_pv"）
    pub symbol: String,
}

/// 电子（SCF）迭代记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectronicStep {
    /// 自由能 e_fr_energy (eV)
    pub energy: f64,
    /// 去熵能量 e_wo_entrp (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_wo_entrp: Option<f64>,
    /// 熵项 eentropy (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eentropy: Option<f64>,
}

/// 离子步记录（嵌套电子步）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonicStep {
    /// 自由能 e_fr_energy (eV)
    pub energy: f64,
    /// 去熵能量 (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_wo_entrp: Option<f64>,
    /// 各位点受力 (eV/Å)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forces: Vec<[f64; 3]>,
    /// 应力张量 (kBar，VASP 约定)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress: Option<[[f64; 3]; 3]>,
    /// 本步结构
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    /// 电子步序列
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub electronic_steps: Vec<ElectronicStep>,
}

/// 运行统计（来自 OUTCAR）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunStats {
    /// 总耗时（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    /// 使用核数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// 最大内存 (kB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<f64>,
}

/// 电子结构摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BandSummary {
    /// 带隙 (eV)
    pub bandgap: f64,
    /// 导带底 (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cbm: Option<f64>,
    /// 价带顶 (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vbm: Option<f64>,
    /// 是否金属（带隙低于数值阈值）
    pub is_metal: bool,
    /// 费米能级 (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efermi: Option<f64>,
    /// 是否来自线模式 k 路径
    #[serde(default)]
    pub is_line_mode: bool,
}

/// 计算输入记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalculationInput {
    /// 初始结构
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    /// VASP 规范化后的有效参数（vasprun 所见）
    #[serde(default)]
    pub parameters: Parameters,
    /// 按原样解析的 INCAR 文件内容
    #[serde(default)]
    pub incar: Parameters,
    /// KPOINTS 描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kpoints: Option<Kpoints>,
    /// 赝势规范表示
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub potcar_spec: Vec<PotcarSpec>,
}

impl CalculationInput {
    /// 输入集是否为空（无参数亦无结构）
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.incar.is_empty() && self.structure.is_none()
    }
}

/// 计算输出记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalculationOutput {
    /// 最终结构
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    /// 最终能量 (eV)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    /// 每原子能量 (eV/atom)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_per_atom: Option<f64>,
    /// 电子结构摘要
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bands: Option<BandSummary>,
    /// 最终受力 (eV/Å)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forces: Vec<[f64; 3]>,
    /// 最终应力 (kBar)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress: Option<[[f64; 3]; 3]>,
    /// 离子步轨迹
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ionic_steps: Vec<IonicStep>,
    /// 每个离子步的电子步数（构造时由 ionic_steps 重新计算）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub num_electronic_steps: Vec<usize>,
    /// 运行统计
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_stats: Option<RunStats>,
}

impl CalculationOutput {
    /// 由离子步轨迹重建汇总字段，维持
    /// `num_electronic_steps[i] == ionic_steps[i].electronic_steps.len()` 不变式
    pub fn normalize(&mut self) {
        self.num_electronic_steps = self
            .ionic_steps
            .iter()
            .map(|s| s.electronic_steps.len())
            .collect();

        if let Some(last) = self.ionic_steps.last() {
            if self.energy.is_none() {
                self.energy = Some(last.energy);
            }
            if self.forces.is_empty() {
                self.forces = last.forces.clone();
            }
            if self.stress.is_none() {
                self.stress = last.stress;
            }
        }

        if let (Some(e), Some(structure)) = (self.energy, self.structure.as_ref()) {
            if !structure.sites.is_empty() {
                self.energy_per_atom = Some(e / structure.sites.len() as f64);
            }
        }
    }
}

/// 单次计算记录：一个输入/输出对加元数据
///
/// 对应一个优化/弛豫子阶段（如 relax1, relax2），解析完成后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    /// 计算目录
    pub dir_name: String,
    /// 子阶段名（"standard", "relax1", "relax2", ...）
    pub task_name: String,
    /// 计算是否正常完成
    pub completed: bool,
    /// 完成时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 输入记录
    pub input: CalculationInput,
    /// 输出记录
    pub output: CalculationOutput,
}

impl Calculation {
    /// 派生泛函类型
    pub fn run_type(&self) -> RunType {
        RunType::from_parameters(&self.input.parameters)
    }

    /// 派生任务类型
    pub fn task_type(&self) -> TaskType {
        let line_mode = self
            .input
            .kpoints
            .as_ref()
            .map(|k| k.is_line_mode())
            .unwrap_or(false);
        TaskType::from_inputs(&self.input.parameters, line_mode)
    }

    /// 派生计算类型
    pub fn calc_type(&self) -> CalcType {
        CalcType {
            run_type: self.run_type(),
            task_type: self.task_type(),
        }
    }

    /// 判定完成状态
    ///
    /// 分子动力学（IBRION=0）要求完成步数等于 NSW；普通计算使用
    /// 电子/离子收敛标志的合取。
    pub fn determine_completed(
        params: &Parameters,
        n_ionic_steps: usize,
        electronic_converged: bool,
        ionic_converged: bool,
    ) -> bool {
        let ibrion = param_i64(params, "IBRION").unwrap_or(-1);
        if ibrion == 0 {
            let nsw = param_i64(params, "NSW").unwrap_or(0).max(0) as usize;
            n_ionic_steps == nsw
        } else {
            electronic_converged && ionic_converged
        }
    }
}
