//! # 点缺陷文档数据模型
//!
//! 缺陷身份（类型+元素+电荷+位点）、缺陷-本体任务配对结果文档，
//! 以及按本体材料聚合的缺陷热力学文档。
//!
//! ## 依赖关系
//! - 被 `builders/defects.rs` 使用
//! - 使用 `models/structure.rs`

use crate::models::calculation::RunType;
use crate::models::structure::Structure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 点缺陷种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefectKind {
    Vacancy,
    Substitution,
    Interstitial,
}

impl std::fmt::Display for DefectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DefectKind::Vacancy => "vacancy",
            DefectKind::Substitution => "substitution",
            DefectKind::Interstitial => "interstitial",
        };
        write!(f, "{}", s)
    }
}

/// 点缺陷身份：本体结构内的位点 + 元素 + 电荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    /// 缺陷种类
    pub kind: DefectKind,
    /// 缺陷元素（空位为被移除元素，间隙/替位为插入元素）
    pub element: String,
    /// 缺陷净电荷
    pub charge: i32,
    /// 名义缺陷位点分数坐标（本体原胞基）
    pub site: [f64; 3],
    /// 本体约化化学式
    pub bulk_formula: String,
}

impl Defect {
    /// 缺陷名（如 "vacancy_O"）
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind, self.element)
    }

    /// 点缺陷比较器等价：电荷 + 原胞位点身份 + 种类/元素
    ///
    /// 位点按分数坐标模 1 以容差比较。
    pub fn matches(&self, other: &Defect, site_tol: f64) -> bool {
        if self.kind != other.kind
            || self.element != other.element
            || self.charge != other.charge
            || self.bulk_formula != other.bulk_formula
        {
            return false;
        }
        (0..3).all(|i| {
            let mut d = (self.site[i] - other.site[i]).abs() % 1.0;
            if d > 0.5 {
                d = 1.0 - d;
            }
            d < site_tol
        })
    }
}

/// 形成能分量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FormationEnergyParts {
    /// 缺陷超胞能量 (eV)
    pub defect_energy: f64,
    /// 本体超胞能量 (eV)
    pub bulk_energy: f64,
    /// 有限尺寸/电荷修正 (eV)
    pub correction: f64,
    /// 修正方案名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_scheme: Option<String>,
}

impl FormationEnergyParts {
    /// 未计入化学势项的形成能
    pub fn uncorrected(&self) -> f64 {
        self.defect_energy - self.bulk_energy
    }

    pub fn corrected(&self) -> f64 {
        self.uncorrected() + self.correction
    }
}

/// 缺陷文档：缺陷任务与其本体任务的配对结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectDoc {
    /// 缺陷身份
    pub defect: Defect,
    /// 缺陷任务
    pub defect_task_id: String,
    /// 配对的本体任务
    pub bulk_task_id: String,
    /// 本体材料标识
    pub material_id: String,
    /// 泛函类型（配对时忽略 +U 后缀比较）
    pub run_type: RunType,
    /// 缺陷弛豫后的最终结构
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defect_structure: Option<Structure>,
    /// 形成能分量
    pub energy_parts: FormationEnergyParts,
    /// 参与过本等价类的全部任务（审计保留，含被替换的旧代表）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}

/// 缺陷热力学文档：同一本体材料下的缺陷集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectThermoDoc {
    /// 本体材料标识（分组键，严格精确匹配）
    pub material_id: String,
    /// 本体约化化学式
    pub bulk_formula: String,
    /// 去重后的缺陷文档（每等价类保留最近更新的代表）
    pub defect_docs: Vec<DefectDoc>,
    /// 形成能汇总：缺陷名 → (电荷 → 修正后形成能)
    pub formation_energies: BTreeMap<String, BTreeMap<i32, f64>>,
    /// 化学势端点元素
    pub chempot_elements: Vec<String>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}
