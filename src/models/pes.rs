//! # 势能面文档数据模型
//!
//! 分子几何、振动频率与简正模式，以及由其派生的势能面极小点、
//! 过渡态与反应文档。
//!
//! ## 依赖关系
//! - 被 `builders/pes.rs` 使用
//! - 无外部模块依赖

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 分子几何（笛卡尔坐标，Å）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    /// 元素符号（与 coords 对齐）
    pub elements: Vec<String>,
    /// 原子坐标
    pub coords: Vec<[f64; 3]>,
    /// 净电荷
    pub charge: i32,
    /// 自旋多重度
    pub spin_multiplicity: u32,
}

impl Molecule {
    /// 原子数
    pub fn num_atoms(&self) -> usize {
        self.elements.len()
    }

    /// 元素计数
    pub fn composition(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for el in &self.elements {
            *counts.entry(el.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// 两原子间距
    pub fn distance(&self, i: usize, j: usize) -> f64 {
        let a = self.coords[i];
        let b = self.coords[j];
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }
}

/// 常见元素共价半径 (Å)，用于成键判定
pub fn covalent_radius(element: &str) -> f64 {
    match element {
        "H" => 0.31,
        "B" => 0.84,
        "C" => 0.76,
        "N" => 0.71,
        "O" => 0.66,
        "F" => 0.57,
        "Si" => 1.11,
        "P" => 1.07,
        "S" => 1.05,
        "Cl" => 1.02,
        "Br" => 1.20,
        "I" => 1.39,
        "Li" => 1.28,
        "Na" => 1.66,
        "K" => 2.03,
        "Mg" => 1.41,
        "Ca" => 1.76,
        "Fe" => 1.32,
        "Co" => 1.26,
        "Ni" => 1.24,
        "Cu" => 1.32,
        "Zn" => 1.22,
        "Pd" => 1.39,
        "Pt" => 1.36,
        _ => 1.4,
    }
}

/// 金属元素判定（金属-配体键可在反应比较中忽略）
pub fn is_metal(element: &str) -> bool {
    matches!(
        element,
        "Li" | "Na" | "K" | "Rb" | "Cs" | "Mg" | "Ca" | "Sr" | "Ba" | "Fe" | "Co" | "Ni"
            | "Cu" | "Zn" | "Pd" | "Pt" | "Ag" | "Au" | "Al" | "Ti" | "V" | "Cr" | "Mn"
    )
}

/// 分子图：按共价半径和容差判定的无向键集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeGraph {
    /// 元素符号
    pub elements: Vec<String>,
    /// 键（原子索引对，i < j）
    pub bonds: Vec<(usize, usize)>,
}

/// 键长容差因子：d < tol * (r_i + r_j) 视为成键
const BOND_TOL: f64 = 1.2;

impl MoleculeGraph {
    /// 从分子几何构建键图
    pub fn from_molecule(mol: &Molecule) -> MoleculeGraph {
        let n = mol.num_atoms();
        let mut bonds = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let cutoff =
                    BOND_TOL * (covalent_radius(&mol.elements[i]) + covalent_radius(&mol.elements[j]));
                if mol.distance(i, j) < cutoff {
                    bonds.push((i, j));
                }
            }
        }
        MoleculeGraph {
            elements: mol.elements.clone(),
            bonds,
        }
    }

    /// 去除金属-配体键后的键图
    pub fn without_metal_bonds(&self) -> MoleculeGraph {
        MoleculeGraph {
            elements: self.elements.clone(),
            bonds: self
                .bonds
                .iter()
                .copied()
                .filter(|&(i, j)| !is_metal(&self.elements[i]) && !is_metal(&self.elements[j]))
                .collect(),
        }
    }

    /// 键类型多重集（元素对按字典序，如 "C-H"）
    pub fn bond_type_multiset(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for &(i, j) in &self.bonds {
            let mut pair = [self.elements[i].as_str(), self.elements[j].as_str()];
            pair.sort();
            *counts.entry(format!("{}-{}", pair[0], pair[1])).or_insert(0) += 1;
        }
        counts
    }

    /// 图同构性的确定性近似：迭代颜色精化后比较颜色多重集
    ///
    /// 对本管线出现的化学图（小分子、元素标签丰富）区分能力足够；
    /// 与上游的逐代表贪心分组一样，不保证数学意义上的完备性。
    pub fn is_isomorphic(&self, other: &MoleculeGraph) -> bool {
        if self.elements.len() != other.elements.len() || self.bonds.len() != other.bonds.len() {
            return false;
        }
        self.refined_colors() == other.refined_colors()
    }

    /// Weisfeiler-Lehman 风格颜色精化，返回稳定后的颜色多重集
    fn refined_colors(&self) -> BTreeMap<String, usize> {
        let n = self.elements.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(i, j) in &self.bonds {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }

        let mut colors: Vec<String> = self.elements.clone();
        for _ in 0..n.max(1) {
            let next: Vec<String> = (0..n)
                .map(|i| {
                    let mut neighbor_colors: Vec<&str> =
                        adjacency[i].iter().map(|&j| colors[j].as_str()).collect();
                    neighbor_colors.sort();
                    format!("{}({})", colors[i], neighbor_colors.join(","))
                })
                .collect();
            if next == colors {
                break;
            }
            colors = next;
        }

        let mut counts = BTreeMap::new();
        for c in colors {
            *counts.entry(c).or_insert(0) += 1;
        }
        counts
    }
}

/// 势能面任务文档（Jaguar 类量子化学优化+频率任务）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PesTaskDoc {
    /// 任务标识
    pub task_id: String,
    /// 弛豫后的分子几何
    pub molecule: Molecule,
    /// 优化初始几何
    pub initial_molecule: Molecule,
    /// 电子能量 (Hartree)
    pub energy: f64,
    /// 振动频率 (cm⁻¹，升序)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frequencies: Vec<f64>,
    /// 简正模式（与 frequencies 对齐，每原子一个位移向量）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normal_modes: Vec<Vec<[f64; 3]>>,
    /// 理论方法标签
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// 溶剂标签
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solvent: Option<String>,
    /// 完成时间
    pub completed_at: DateTime<Utc>,
}

/// 势能面极小点文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PesMinimumDoc {
    /// 代表任务标识
    pub task_id: String,
    /// 分子几何
    pub molecule: Molecule,
    /// 电子能量 (Hartree)
    pub energy: f64,
    /// 最低频率 (cm⁻¹)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lowest_frequency: Option<f64>,
    /// 同一几何分组内的全部任务
    pub task_ids: Vec<String>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}

/// 过渡态文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStateDoc {
    /// 代表任务标识
    pub task_id: String,
    /// 分子几何
    pub molecule: Molecule,
    /// 电子能量 (Hartree)
    pub energy: f64,
    /// 虚频 (cm⁻¹，负值)
    pub imaginary_frequency: f64,
    /// 过渡矢量（最低频简正模式）
    pub transition_mode: Vec<[f64; 3]>,
    /// 正向端点极小点任务
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_minimum: Option<String>,
    /// 反向端点极小点任务
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_minimum: Option<String>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}

/// 反应文档：过渡态与其端点构成的基元反应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDoc {
    /// 过渡态任务标识
    pub ts_task_id: String,
    /// 反应物极小点任务
    pub reactant_task_id: String,
    /// 产物极小点任务
    pub product_task_id: String,
    /// 断裂键类型多重集
    pub broken_bonds: BTreeMap<String, usize>,
    /// 生成键类型多重集
    pub formed_bonds: BTreeMap<String, usize>,
    /// 正向势垒 (Hartree)
    pub forward_barrier: f64,
    /// 反向势垒 (Hartree)
    pub reverse_barrier: f64,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water(offset: f64) -> Molecule {
        Molecule {
            elements: vec!["O".to_string(), "H".to_string(), "H".to_string()],
            coords: vec![
                [offset, 0.0, 0.0],
                [offset + 0.96, 0.0, 0.0],
                [offset - 0.24, 0.93, 0.0],
            ],
            charge: 0,
            spin_multiplicity: 1,
        }
    }

    #[test]
    fn test_water_graph_bonds() {
        let g = MoleculeGraph::from_molecule(&water(0.0));
        assert_eq!(g.bonds.len(), 2);
        assert_eq!(g.bond_type_multiset().get("H-O"), Some(&2));
    }

    #[test]
    fn test_isomorphic_translated_molecule() {
        let a = MoleculeGraph::from_molecule(&water(0.0));
        let b = MoleculeGraph::from_molecule(&water(5.0));
        assert!(a.is_isomorphic(&b));
    }

    #[test]
    fn test_not_isomorphic_different_formula() {
        let a = MoleculeGraph::from_molecule(&water(0.0));
        let methane = Molecule {
            elements: vec![
                "C".to_string(),
                "H".to_string(),
                "H".to_string(),
                "H".to_string(),
                "H".to_string(),
            ],
            coords: vec![
                [0.0, 0.0, 0.0],
                [0.63, 0.63, 0.63],
                [-0.63, -0.63, 0.63],
                [-0.63, 0.63, -0.63],
                [0.63, -0.63, -0.63],
            ],
            charge: 0,
            spin_multiplicity: 1,
        };
        let b = MoleculeGraph::from_molecule(&methane);
        assert!(!a.is_isomorphic(&b));
    }

    #[test]
    fn test_metal_bond_removal() {
        let mol = Molecule {
            elements: vec!["Li".to_string(), "O".to_string(), "H".to_string()],
            coords: vec![[0.0, 0.0, 0.0], [1.9, 0.0, 0.0], [2.86, 0.0, 0.0]],
            charge: 1,
            spin_multiplicity: 1,
        };
        let g = MoleculeGraph::from_molecule(&mol);
        assert_eq!(g.bonds.len(), 2);

        let stripped = g.without_metal_bonds();
        assert_eq!(stripped.bonds.len(), 1);
        assert_eq!(stripped.bond_type_multiset().get("H-O"), Some(&1));
    }
}
