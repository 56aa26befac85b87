//! # 归档编解码模块
//!
//! 把结构与离子步轨迹转成列式表示，便于批量归档与表格工具消费。
//!
//! ## 功能
//! - `StructureColumns`: 位点的列式（数组结构体）表示，可逆转换
//! - `TrajectoryColumns`: 离子步能量/受力/应力的扁平化列
//! - CSV 与 JSON 写出
//!
//! ## 依赖关系
//! - 被 `commands/archive.rs` 使用
//! - 使用 `csv`, `serde_json` 写出
//! - 使用 `models/structure.rs`, `models/calculation.rs`

use crate::error::{MatpipeError, Result};
use crate::models::calculation::IonicStep;
use crate::models::structure::{Lattice, Site, Structure};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 结构的列式表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureColumns {
    pub name: String,
    /// 晶格矩阵（行向量）
    pub lattice: [[f64; 3]; 3],
    /// 元素列（与坐标列对齐）
    pub elements: Vec<String>,
    pub frac_a: Vec<f64>,
    pub frac_b: Vec<f64>,
    pub frac_c: Vec<f64>,
    /// 位点磁矩（无数据处为 None）
    pub magmoms: Vec<Option<f64>>,
}

impl StructureColumns {
    pub fn from_structure(structure: &Structure) -> StructureColumns {
        let n = structure.num_sites();
        let mut cols = StructureColumns {
            name: structure.name.clone(),
            lattice: structure.lattice.matrix,
            elements: Vec::with_capacity(n),
            frac_a: Vec::with_capacity(n),
            frac_b: Vec::with_capacity(n),
            frac_c: Vec::with_capacity(n),
            magmoms: Vec::with_capacity(n),
        };
        for site in &structure.sites {
            cols.elements.push(site.element.clone());
            cols.frac_a.push(site.position[0]);
            cols.frac_b.push(site.position[1]);
            cols.frac_c.push(site.position[2]);
            cols.magmoms.push(site.magmom);
        }
        cols
    }

    /// 列式表示 → 结构；各列长度不一致视为损坏数据
    pub fn to_structure(&self) -> Result<Structure> {
        let n = self.elements.len();
        if [
            self.frac_a.len(),
            self.frac_b.len(),
            self.frac_c.len(),
            self.magmoms.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err(MatpipeError::InvalidArgument(format!(
                "structure columns for '{}' have mismatched lengths",
                self.name
            )));
        }

        let sites = (0..n)
            .map(|i| Site {
                element: self.elements[i].clone(),
                position: [self.frac_a[i], self.frac_b[i], self.frac_c[i]],
                magmom: self.magmoms[i],
            })
            .collect();

        Ok(Structure {
            name: self.name.clone(),
            lattice: Lattice::from_vectors(self.lattice),
            sites,
        })
    }

    /// 逐位点 CSV：element, frac_a, frac_b, frac_c, magmom
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(MatpipeError::from)?;
        writer.write_record(["element", "frac_a", "frac_b", "frac_c", "magmom"])?;
        for i in 0..self.elements.len() {
            writer.write_record([
                self.elements[i].clone(),
                self.frac_a[i].to_string(),
                self.frac_b[i].to_string(),
                self.frac_c[i].to_string(),
                self.magmoms[i].map(|m| m.to_string()).unwrap_or_default(),
            ])?;
        }
        writer.flush().map_err(|e| MatpipeError::FileWriteError {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

/// 离子步轨迹的列式表示
///
/// 受力按 步 × 原子 × 分量 展平；应力按 步 × 9 展平，
/// 无应力数据的轨迹该列为空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryColumns {
    pub task_id: String,
    pub num_steps: usize,
    pub num_atoms: usize,
    /// 每步能量 (eV)
    pub energies: Vec<f64>,
    /// 展平受力 (eV/Å)，长度 = 步数 × 原子数 × 3
    pub forces: Vec<f64>,
    /// 展平应力 (kBar)，长度 = 步数 × 9，或空
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stresses: Vec<f64>,
}

impl TrajectoryColumns {
    pub fn from_ionic_steps(task_id: &str, steps: &[IonicStep]) -> TrajectoryColumns {
        let num_atoms = steps.first().map(|s| s.forces.len()).unwrap_or(0);
        let mut cols = TrajectoryColumns {
            task_id: task_id.to_string(),
            num_steps: steps.len(),
            num_atoms,
            energies: Vec::with_capacity(steps.len()),
            forces: Vec::new(),
            stresses: Vec::new(),
        };

        let all_have_stress = !steps.is_empty() && steps.iter().all(|s| s.stress.is_some());
        for step in steps {
            cols.energies.push(step.energy);
            for force in &step.forces {
                cols.forces.extend_from_slice(force);
            }
            if all_have_stress {
                if let Some(stress) = step.stress {
                    for row in &stress {
                        cols.stresses.extend_from_slice(row);
                    }
                }
            }
        }
        cols
    }

    /// 逐步 CSV：step, energy, max_force；各列长度不一致视为损坏数据
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if self.energies.len() != self.num_steps
            || self.forces.len() != self.num_steps * self.num_atoms * 3
            || (!self.stresses.is_empty() && self.stresses.len() != self.num_steps * 9)
        {
            return Err(MatpipeError::InvalidArgument(format!(
                "trajectory columns for '{}' have mismatched lengths",
                self.task_id
            )));
        }

        let mut writer = csv::Writer::from_path(path).map_err(MatpipeError::from)?;
        writer.write_record(["step", "energy", "max_force"])?;
        for step in 0..self.num_steps {
            let from = step * self.num_atoms * 3;
            let to = from + self.num_atoms * 3;
            let max_force = self.forces[from..to]
                .chunks(3)
                .map(|f| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
                .fold(0.0f64, f64::max);
            writer.write_record([
                step.to_string(),
                self.energies[step].to_string(),
                max_force.to_string(),
            ])?;
        }
        writer.flush().map_err(|e| MatpipeError::FileWriteError {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

/// 任意可序列化文档写为 JSON 文件
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| MatpipeError::FileWriteError {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::to_writer_pretty(file, value).map_err(|e| MatpipeError::JsonError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}
