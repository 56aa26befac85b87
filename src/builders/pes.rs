//! # 势能面构建器
//!
//! 把量子化学优化+频率任务整理为势能面文档：
//! - `PesMinimumBuilder`: 按分子图等价分组的极小点
//! - `TransitionStateBuilder`: 过渡态及其正/反向端点关联
//! - `ReactionBuilder`: 过渡态 + 两端点 → 去重后的基元反应
//!
//! ## 频率分类（对最终频率列表判定）
//! - 极小点：少于 2 个频率，或最低频 ≥ 阈值（默认 −75 cm⁻¹）且
//!   次低频 > 0
//! - 过渡态：恰一个虚频，或两个虚频且次虚频在阈值内
//! - 两者都不满足的任务静默丢弃（可能属于另一类或无效）
//!
//! ## 端点关联
//! 过渡矢量（最低频简正模式）与"过渡态 → 候选极小点初始几何"的
//! 位移向量分别归一化后投影；方向余弦接近 ±1 才算端点，符号区分
//! 正向（产物）与反向（反应物）。
//!
//! ## 依赖关系
//! - 被 `commands/build.rs` 使用
//! - 使用 `models/pes.rs`, `store/`

use crate::builders::{Builder, BuilderConfig};
use crate::error::{MatpipeError, Result};
use crate::models::pes::{
    MoleculeGraph, PesMinimumDoc, PesTaskDoc, ReactionDoc, TransitionStateDoc,
};
use crate::store::DocStore;
use chrono::Utc;
use std::collections::BTreeMap;

/// 极小点判定：频率升序列表
pub fn is_minimum(frequencies: &[f64], negative_threshold: f64) -> bool {
    if frequencies.len() < 2 {
        return true;
    }
    frequencies[0] >= negative_threshold && frequencies[1] > 0.0
}

/// 过渡态判定：恰一个虚频，或两个且次虚频在阈值内
pub fn is_transition_state(frequencies: &[f64], negative_threshold: f64) -> bool {
    let imaginary: Vec<f64> = frequencies.iter().copied().filter(|f| *f < 0.0).collect();
    match imaginary.len() {
        1 => true,
        2 => imaginary[1] >= negative_threshold,
        _ => false,
    }
}

fn flatten(vectors: &[[f64; 3]]) -> Vec<f64> {
    vectors.iter().flat_map(|v| v.iter().copied()).collect()
}

fn normalized(v: Vec<f64>) -> Option<Vec<f64>> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm < 1e-10 {
        return None;
    }
    Some(v.into_iter().map(|x| x / norm).collect())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 分组键：同一键下才比较分子图
fn group_key(task: &PesTaskDoc) -> (i32, u32, Option<String>, Option<String>) {
    (
        task.molecule.charge,
        task.molecule.spin_multiplicity,
        task.method.clone(),
        task.solvent.clone(),
    )
}

// ─────────────────────────────────────────────────────────────
// 极小点构建器
// ─────────────────────────────────────────────────────────────

pub struct PesMinimumBuilder<S: DocStore> {
    tasks: Vec<PesTaskDoc>,
    target: S,
    config: BuilderConfig,
}

impl<S: DocStore> PesMinimumBuilder<S> {
    pub fn new(tasks: Vec<PesTaskDoc>, target: S, config: &BuilderConfig) -> Self {
        PesMinimumBuilder {
            tasks,
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }
}

impl<S: DocStore> Builder for PesMinimumBuilder<S> {
    type Item = Vec<PesTaskDoc>;
    type Doc = PesMinimumDoc;

    fn name(&self) -> &str {
        "pes_minima"
    }

    /// 电荷/自旋/方法/溶剂一致且分子图同构的任务为一组
    fn get_items(&mut self) -> Result<Vec<Vec<PesTaskDoc>>> {
        let mut minima: Vec<PesTaskDoc> = self
            .tasks
            .iter()
            .filter(|t| is_minimum(&t.frequencies, self.config.negative_threshold))
            .cloned()
            .collect();
        minima.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut groups: Vec<(MoleculeGraph, Vec<PesTaskDoc>)> = Vec::new();
        for task in minima {
            let graph = MoleculeGraph::from_molecule(&task.molecule);
            let matched = groups.iter_mut().find(|(rep_graph, members)| {
                group_key(&members[0]) == group_key(&task) && rep_graph.is_isomorphic(&graph)
            });
            match matched {
                Some((_, members)) => members.push(task),
                None => groups.push((graph, vec![task])),
            }
        }
        Ok(groups.into_iter().map(|(_, members)| members).collect())
    }

    fn process_item(&self, group: &Vec<PesTaskDoc>) -> Result<Option<PesMinimumDoc>> {
        // 组内最低能量任务为代表
        let Some(rep) = group
            .iter()
            .min_by(|a, b| a.energy.partial_cmp(&b.energy).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return Ok(None);
        };

        Ok(Some(PesMinimumDoc {
            task_id: rep.task_id.clone(),
            molecule: rep.molecule.clone(),
            energy: rep.energy,
            lowest_frequency: rep.frequencies.first().copied(),
            task_ids: group.iter().map(|t| t.task_id.clone()).collect(),
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<PesMinimumDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<pes minimum doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}

// ─────────────────────────────────────────────────────────────
// 过渡态构建器
// ─────────────────────────────────────────────────────────────

pub struct TransitionStateBuilder<S: DocStore> {
    tasks: Vec<PesTaskDoc>,
    target: S,
    config: BuilderConfig,
}

impl<S: DocStore> TransitionStateBuilder<S> {
    pub fn new(tasks: Vec<PesTaskDoc>, target: S, config: &BuilderConfig) -> Self {
        TransitionStateBuilder {
            tasks,
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }

    /// 候选极小点相对过渡态的方向余弦
    ///
    /// 位移取候选极小点的优化初始几何（端点从过渡态出发弛豫）。
    fn endpoint_cosine(&self, ts: &PesTaskDoc, candidate: &PesTaskDoc) -> Option<f64> {
        if ts.molecule.elements != candidate.initial_molecule.elements {
            return None;
        }
        let mode = normalized(flatten(ts.normal_modes.first()?))?;

        let displacement: Vec<[f64; 3]> = candidate
            .initial_molecule
            .coords
            .iter()
            .zip(&ts.molecule.coords)
            .map(|(m, t)| [m[0] - t[0], m[1] - t[1], m[2] - t[2]])
            .collect();
        let disp = normalized(flatten(&displacement))?;

        Some(dot(&mode, &disp))
    }
}

impl<S: DocStore> Builder for TransitionStateBuilder<S> {
    type Item = (PesTaskDoc, Vec<PesTaskDoc>);
    type Doc = TransitionStateDoc;

    fn name(&self) -> &str {
        "transition_states"
    }

    /// 每个过渡态任务带上同键下的候选极小点
    fn get_items(&mut self) -> Result<Vec<(PesTaskDoc, Vec<PesTaskDoc>)>> {
        let minima: Vec<PesTaskDoc> = self
            .tasks
            .iter()
            .filter(|t| is_minimum(&t.frequencies, self.config.negative_threshold))
            .cloned()
            .collect();

        let mut ts_tasks: Vec<PesTaskDoc> = self
            .tasks
            .iter()
            .filter(|t| is_transition_state(&t.frequencies, self.config.negative_threshold))
            .cloned()
            .collect();
        ts_tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        Ok(ts_tasks
            .into_iter()
            .map(|ts| {
                let candidates = minima
                    .iter()
                    .filter(|m| {
                        group_key(m) == group_key(&ts)
                            && m.molecule.composition() == ts.molecule.composition()
                    })
                    .cloned()
                    .collect();
                (ts, candidates)
            })
            .collect())
    }

    fn process_item(
        &self,
        (ts, candidates): &(PesTaskDoc, Vec<PesTaskDoc>),
    ) -> Result<Option<TransitionStateDoc>> {
        let Some(&imaginary_frequency) = ts.frequencies.first() else {
            return Ok(None);
        };
        let Some(transition_mode) = ts.normal_modes.first().cloned() else {
            return Ok(None);
        };

        // 每个方向保留余弦绝对值最大的端点
        let mut forward: Option<(f64, &PesTaskDoc)> = None;
        let mut reverse: Option<(f64, &PesTaskDoc)> = None;
        for candidate in candidates {
            let Some(cos) = self.endpoint_cosine(ts, candidate) else {
                continue;
            };
            if 1.0 - cos.abs() > self.config.mode_projection_tol {
                continue;
            }
            let slot = if cos > 0.0 { &mut forward } else { &mut reverse };
            if slot.map(|(best, _)| cos.abs() > best).unwrap_or(true) {
                *slot = Some((cos.abs(), candidate));
            }
        }

        Ok(Some(TransitionStateDoc {
            task_id: ts.task_id.clone(),
            molecule: ts.molecule.clone(),
            energy: ts.energy,
            imaginary_frequency,
            transition_mode,
            forward_minimum: forward.map(|(_, m)| m.task_id.clone()),
            reverse_minimum: reverse.map(|(_, m)| m.task_id.clone()),
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<TransitionStateDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<transition state doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}

// ─────────────────────────────────────────────────────────────
// 反应构建器
// ─────────────────────────────────────────────────────────────

pub struct ReactionBuilder<S: DocStore> {
    transition_states: Vec<TransitionStateDoc>,
    /// 端点任务查找表
    tasks: BTreeMap<String, PesTaskDoc>,
    target: S,
    config: BuilderConfig,
}

/// 多重集差（按键截断到零）
fn multiset_sub(
    a: &BTreeMap<String, usize>,
    b: &BTreeMap<String, usize>,
) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for (key, &count) in a {
        let other = b.get(key).copied().unwrap_or(0);
        if count > other {
            out.insert(key.clone(), count - other);
        }
    }
    out
}

impl<S: DocStore> ReactionBuilder<S> {
    pub fn new(
        transition_states: Vec<TransitionStateDoc>,
        tasks: Vec<PesTaskDoc>,
        target: S,
        config: &BuilderConfig,
    ) -> Self {
        ReactionBuilder {
            transition_states,
            tasks: tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect(),
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }

    fn graph_of(&self, task_id: &str) -> Option<MoleculeGraph> {
        let graph = MoleculeGraph::from_molecule(&self.tasks.get(task_id)?.molecule);
        if self.config.consider_metal_bonds {
            Some(graph)
        } else {
            Some(graph.without_metal_bonds())
        }
    }

    /// 两条反应是否等价（正向或反向标注）
    fn same_reaction(
        &self,
        a: &ReactionDoc,
        b: &ReactionDoc,
        graphs: &BTreeMap<String, MoleculeGraph>,
    ) -> bool {
        let (Some(ar), Some(ap), Some(br), Some(bp)) = (
            graphs.get(&a.reactant_task_id),
            graphs.get(&a.product_task_id),
            graphs.get(&b.reactant_task_id),
            graphs.get(&b.product_task_id),
        ) else {
            return false;
        };

        let forward = ar.is_isomorphic(br)
            && ap.is_isomorphic(bp)
            && a.broken_bonds == b.broken_bonds
            && a.formed_bonds == b.formed_bonds;
        let reversed = ar.is_isomorphic(bp)
            && ap.is_isomorphic(br)
            && a.broken_bonds == b.formed_bonds
            && a.formed_bonds == b.broken_bonds;
        forward || reversed
    }
}

impl<S: DocStore> Builder for ReactionBuilder<S> {
    type Item = ReactionDoc;
    type Doc = ReactionDoc;

    fn name(&self) -> &str {
        "reactions"
    }

    /// 组装候选反应并去重；正向端点为产物，反向端点为反应物
    fn get_items(&mut self) -> Result<Vec<ReactionDoc>> {
        let mut candidates = Vec::new();
        let mut graphs: BTreeMap<String, MoleculeGraph> = BTreeMap::new();

        let mut sorted = self.transition_states.clone();
        sorted.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        for ts in &sorted {
            let (Some(product_id), Some(reactant_id)) =
                (ts.forward_minimum.clone(), ts.reverse_minimum.clone())
            else {
                continue;
            };
            let (Some(reactant), Some(product)) =
                (self.tasks.get(&reactant_id), self.tasks.get(&product_id))
            else {
                continue;
            };
            let (Some(reactant_graph), Some(product_graph)) =
                (self.graph_of(&reactant_id), self.graph_of(&product_id))
            else {
                continue;
            };

            let reactant_bonds = reactant_graph.bond_type_multiset();
            let product_bonds = product_graph.bond_type_multiset();
            graphs.insert(reactant_id.clone(), reactant_graph);
            graphs.insert(product_id.clone(), product_graph);

            candidates.push(ReactionDoc {
                ts_task_id: ts.task_id.clone(),
                reactant_task_id: reactant_id,
                product_task_id: product_id,
                broken_bonds: multiset_sub(&reactant_bonds, &product_bonds),
                formed_bonds: multiset_sub(&product_bonds, &reactant_bonds),
                forward_barrier: ts.energy - reactant.energy,
                reverse_barrier: ts.energy - product.energy,
                last_updated: Utc::now(),
            });
        }

        // 逐代表贪心去重，保留任务标识序首个
        let mut unique: Vec<ReactionDoc> = Vec::new();
        for candidate in candidates {
            if !unique
                .iter()
                .any(|kept| self.same_reaction(kept, &candidate, &graphs))
            {
                unique.push(candidate);
            }
        }
        Ok(unique)
    }

    fn process_item(&self, item: &ReactionDoc) -> Result<Option<ReactionDoc>> {
        Ok(Some(item.clone()))
    }

    fn update_targets(&mut self, docs: Vec<ReactionDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<reaction doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}
