//! # 点缺陷构建器
//!
//! 两个构建器：`DefectBuilder` 把缺陷任务与本体任务配对并按缺陷
//! 等价类去重；`DefectThermoBuilder` 把配对结果按本体材料聚合为
//! 热力学文档。
//!
//! ## 缺陷等价（两级判定）
//! 1. 点缺陷比较器：种类 + 元素 + 电荷 + 原胞位点身份
//! 2. 回退判定：比较器未命中时，同种类/元素/电荷且弛豫结构等价
//!    （间隙缺陷的名义位点经弛豫后不可靠）
//!
//! ## 本体配对
//! 候选本体须满足：化学式一致、泛函类型一致（忽略 +U 后缀）、
//! 位点数相差至多 1、结构缺陷匹配。按任务标识排序后取首个命中；
//! `strict_bulk_matching` 开启时多个候选即放弃该缺陷。
//!
//! ## 依赖关系
//! - 被 `commands/build.rs` 使用
//! - 使用 `matching/`, `models/defect.rs`, `builders/materials.rs`

use crate::builders::materials::MaterialsDoc;
use crate::builders::{Builder, BuilderConfig};
use crate::error::{MatpipeError, Result};
use crate::matching::StructureMatcher;
use crate::models::calculation::TaskState;
use crate::models::defect::{
    Defect, DefectDoc, DefectKind, DefectThermoDoc, FormationEnergyParts,
};
use crate::models::task::TaskDoc;
use crate::store::DocStore;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// 一个缺陷等价类及其配对上下文
pub struct DefectGroup {
    /// 代表缺陷（最新任务的元数据）
    pub defect: Defect,
    /// 等价类内全部任务（最新在前）
    pub tasks: Vec<TaskDoc>,
    /// 候选本体任务（已按任务标识排序）
    pub bulk_candidates: Vec<TaskDoc>,
    /// 本体材料标识
    pub material_id: String,
}

/// 缺陷配对构建器
pub struct DefectBuilder<S: DocStore> {
    tasks: Vec<TaskDoc>,
    materials: Vec<MaterialsDoc>,
    /// 已有介电文档的材料
    dielectric_material_ids: BTreeSet<String>,
    target: S,
    config: BuilderConfig,
    matcher: StructureMatcher,
}

/// 从任务元数据中提取缺陷身份
///
/// 在 transformations 与附加 JSON 中寻找 `defect` 对象：
/// `{"@class": "Vacancy", "element": "O", "charge": -2,
///   "site": [x, y, z], "bulk_formula": "MgO"}`
pub fn defect_from_task(task: &TaskDoc) -> Option<Defect> {
    fn find(value: &serde_json::Value) -> Option<&serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => {
                if let Some(d) = map.get("defect") {
                    if d.is_object() {
                        return Some(d);
                    }
                }
                map.values().find_map(find)
            }
            serde_json::Value::Array(items) => items.iter().find_map(find),
            _ => None,
        }
    }

    let sources = task
        .transformations
        .iter()
        .chain(task.additional_json.values());
    let obj = sources.filter_map(find).next()?;

    let kind = match obj.get("@class")?.as_str()?.to_lowercase().as_str() {
        "vacancy" => DefectKind::Vacancy,
        "substitution" => DefectKind::Substitution,
        "interstitial" => DefectKind::Interstitial,
        _ => return None,
    };
    let site_arr = obj.get("site")?.as_array()?;
    if site_arr.len() != 3 {
        return None;
    }
    let mut site = [0.0; 3];
    for (i, v) in site_arr.iter().enumerate() {
        site[i] = v.as_f64()?;
    }

    Some(Defect {
        kind,
        element: obj.get("element")?.as_str()?.to_string(),
        charge: obj.get("charge").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        site,
        bulk_formula: obj.get("bulk_formula")?.as_str()?.to_string(),
    })
}

/// 缺陷元数据中的可选修正项
fn correction_from_task(task: &TaskDoc) -> (f64, Option<String>) {
    fn find(value: &serde_json::Value) -> Option<(f64, Option<String>)> {
        match value {
            serde_json::Value::Object(map) => {
                if let Some(d) = map.get("defect") {
                    if let Some(c) = d.get("correction").and_then(|v| v.as_f64()) {
                        let scheme = d
                            .get("correction_scheme")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string());
                        return Some((c, scheme));
                    }
                }
                map.values().find_map(find)
            }
            serde_json::Value::Array(items) => items.iter().find_map(find),
            _ => None,
        }
    }

    task.transformations
        .iter()
        .chain(task.additional_json.values())
        .filter_map(find)
        .next()
        .unwrap_or((0.0, None))
}

impl<S: DocStore> DefectBuilder<S> {
    pub fn new(
        tasks: Vec<TaskDoc>,
        materials: Vec<MaterialsDoc>,
        dielectric_material_ids: BTreeSet<String>,
        target: S,
        config: &BuilderConfig,
    ) -> Self {
        DefectBuilder {
            tasks,
            materials,
            dielectric_material_ids,
            target,
            config: config.clone(),
            matcher: StructureMatcher::new(1e-3, config.site_tol),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }

    /// 两级缺陷等价判定
    fn equivalent(&self, a: &(TaskDoc, Defect), b: &(TaskDoc, Defect)) -> bool {
        if a.1.matches(&b.1, self.config.site_tol) {
            return true;
        }
        if a.1.kind != b.1.kind
            || a.1.element != b.1.element
            || a.1.charge != b.1.charge
            || a.1.bulk_formula != b.1.bulk_formula
        {
            return false;
        }
        match (a.0.final_structure(), b.0.final_structure()) {
            (Some(x), Some(y)) => {
                x.composition() == y.composition() && self.matcher.matches(x, y)
            }
            _ => false,
        }
    }
}

impl<S: DocStore> Builder for DefectBuilder<S> {
    type Item = DefectGroup;
    type Doc = DefectDoc;

    fn name(&self) -> &str {
        "defects"
    }

    fn get_items(&mut self) -> Result<Vec<DefectGroup>> {
        let mut defect_tasks: Vec<(TaskDoc, Defect)> = Vec::new();
        let mut bulk_tasks: Vec<TaskDoc> = Vec::new();

        for task in &self.tasks {
            if task.state != TaskState::Success || task.final_structure().is_none() {
                continue;
            }
            match defect_from_task(task) {
                Some(defect) => defect_tasks.push((task.clone(), defect)),
                None => bulk_tasks.push(task.clone()),
            }
        }
        defect_tasks.sort_by(|a, b| a.0.task_id.cmp(&b.0.task_id));
        bulk_tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        // 逐代表贪心归入等价类
        let mut classes: Vec<Vec<(TaskDoc, Defect)>> = Vec::new();
        for entry in defect_tasks {
            match classes.iter_mut().find(|c| self.equivalent(&c[0], &entry)) {
                Some(class) => class.push(entry),
                None => classes.push(vec![entry]),
            }
        }

        let mut items = Vec::new();
        for mut class in classes {
            // 最新任务为等价类代表
            class.sort_by(|a, b| b.0.completed_at().cmp(&a.0.completed_at()));
            let (rep_task, rep_defect) = &class[0];

            // 本体材料资格预筛
            let Some(material) = self
                .materials
                .iter()
                .find(|m| m.formula == rep_defect.bulk_formula)
            else {
                continue;
            };
            let is_metal = material.is_metal.unwrap_or(false);
            if !is_metal && !self.dielectric_material_ids.contains(&material.material_id) {
                continue;
            }

            let rep_structure = rep_task.final_structure();
            let rep_nsites = rep_structure.map(|s| s.num_sites() as i64).unwrap_or(0);
            let bulk_candidates: Vec<TaskDoc> = bulk_tasks
                .iter()
                .filter(|bulk| {
                    let Some(bs) = bulk.final_structure() else {
                        return false;
                    };
                    if bs.reduced_formula() != rep_defect.bulk_formula {
                        return false;
                    }
                    if bulk.run_type.base() != rep_task.run_type.base() {
                        return false;
                    }
                    if (bs.num_sites() as i64 - rep_nsites).abs() > 1 {
                        return false;
                    }
                    rep_structure
                        .map(|ds| self.matcher.matches_with_defect(ds, bs))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            items.push(DefectGroup {
                defect: rep_defect.clone(),
                tasks: class.into_iter().map(|(t, _)| t).collect(),
                bulk_candidates,
                material_id: material.material_id.clone(),
            });
        }
        Ok(items)
    }

    fn process_item(&self, group: &DefectGroup) -> Result<Option<DefectDoc>> {
        // 首个命中的本体即配对结果；严格模式下歧义即放弃
        let bulk = match group.bulk_candidates.as_slice() {
            [] => return Ok(None),
            [only] => only,
            [first, ..] => {
                if self.config.strict_bulk_matching {
                    return Ok(None);
                }
                first
            }
        };

        let rep = &group.tasks[0];
        let (defect_energy, bulk_energy) = match (rep.output.energy, bulk.output.energy) {
            (Some(d), Some(b)) => (d, b),
            _ => return Ok(None),
        };
        let (correction, correction_scheme) = correction_from_task(rep);

        Ok(Some(DefectDoc {
            defect: group.defect.clone(),
            defect_task_id: rep.task_id.clone(),
            bulk_task_id: bulk.task_id.clone(),
            material_id: group.material_id.clone(),
            run_type: rep.run_type,
            defect_structure: rep.final_structure().cloned(),
            energy_parts: FormationEnergyParts {
                defect_energy,
                bulk_energy,
                correction,
                correction_scheme,
            },
            task_ids: group.tasks.iter().map(|t| t.task_id.clone()).collect(),
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<DefectDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<defect doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}

/// 缺陷热力学聚合构建器
pub struct DefectThermoBuilder<S: DocStore> {
    defect_docs: Vec<DefectDoc>,
    /// 有化学势参考条目的元素
    available_elements: BTreeSet<String>,
    target: S,
    config: BuilderConfig,
}

impl<S: DocStore> DefectThermoBuilder<S> {
    pub fn new(
        defect_docs: Vec<DefectDoc>,
        available_elements: BTreeSet<String>,
        target: S,
        config: &BuilderConfig,
    ) -> Self {
        DefectThermoBuilder {
            defect_docs,
            available_elements,
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }

    /// 缺陷文档涉及的化学势端点元素
    fn chempot_elements(doc: &DefectDoc) -> BTreeSet<String> {
        let mut elements: BTreeSet<String> = doc
            .defect_structure
            .iter()
            .flat_map(|s| s.elements())
            .collect();
        elements.insert(doc.defect.element.clone());
        elements
    }
}

impl<S: DocStore> Builder for DefectThermoBuilder<S> {
    type Item = Vec<DefectDoc>;
    type Doc = DefectThermoDoc;

    fn name(&self) -> &str {
        "defect_thermo"
    }

    /// 按本体材料标识严格分组（不做容差匹配）
    fn get_items(&mut self) -> Result<Vec<Vec<DefectDoc>>> {
        let mut groups: BTreeMap<String, Vec<DefectDoc>> = BTreeMap::new();
        for doc in &self.defect_docs {
            // 化学势端点缺参考条目的文档不可用
            if !Self::chempot_elements(doc).is_subset(&self.available_elements) {
                continue;
            }
            groups
                .entry(doc.material_id.clone())
                .or_default()
                .push(doc.clone());
        }
        Ok(groups.into_values().collect())
    }

    fn process_item(&self, docs: &Vec<DefectDoc>) -> Result<Option<DefectThermoDoc>> {
        if docs.is_empty() {
            return Ok(None);
        }

        // 每个等价类保留最近更新的代表，合并贡献任务
        let mut deduped: Vec<DefectDoc> = Vec::new();
        let mut sorted = docs.clone();
        sorted.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        for doc in sorted {
            match deduped
                .iter_mut()
                .find(|kept| kept.defect.matches(&doc.defect, self.config.site_tol))
            {
                Some(kept) => {
                    for id in &doc.task_ids {
                        if !kept.task_ids.contains(id) {
                            kept.task_ids.push(id.clone());
                        }
                    }
                }
                None => deduped.push(doc),
            }
        }

        let mut formation_energies: BTreeMap<String, BTreeMap<i32, f64>> = BTreeMap::new();
        let mut chempot_elements: BTreeSet<String> = BTreeSet::new();
        for doc in &deduped {
            formation_energies
                .entry(doc.defect.name())
                .or_default()
                .insert(doc.defect.charge, doc.energy_parts.corrected());
            chempot_elements.extend(Self::chempot_elements(doc));
        }

        Ok(Some(DefectThermoDoc {
            material_id: deduped[0].material_id.clone(),
            bulk_formula: deduped[0].defect.bulk_formula.clone(),
            defect_docs: deduped,
            formation_energies,
            chempot_elements: chempot_elements.into_iter().collect(),
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<DefectThermoDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<defect thermo doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::run_builder;
    use crate::models::calculation::{
        Calculation, CalculationInput, CalculationOutput, IncarValue, IonicStep, Parameters,
        RunType,
    };
    use crate::models::structure::{Lattice, Site, Structure};
    use crate::store::MemStore;

    fn mgo_bulk() -> Structure {
        let mut sites = Vec::new();
        for (i, frac) in [0.0, 0.5].iter().enumerate() {
            for z in [0.0, 0.5] {
                sites.push(Site::new(
                    if i == 0 { "Mg" } else { "O" },
                    [*frac, *frac, z],
                ));
            }
        }
        Structure::new(
            "MgO",
            Lattice::from_parameters(4.2, 4.2, 4.2, 90.0, 90.0, 90.0),
            sites,
        )
    }

    fn mgo_vacancy() -> Structure {
        let mut s = mgo_bulk();
        // 移除位于 [0.5, 0.5, 0.5] 的 O
        s.sites.retain(|site| site.position != [0.5, 0.5, 0.5]);
        s
    }

    fn make_task(task_id: &str, structure: Structure, energy: f64) -> TaskDoc {
        let params: Parameters = [
            ("GGA".to_string(), IncarValue::Str("PE".to_string())),
            ("NSW".to_string(), IncarValue::Int(0)),
        ]
        .into_iter()
        .collect();

        let mut output = CalculationOutput {
            structure: Some(structure.clone()),
            ionic_steps: vec![IonicStep {
                energy,
                e_wo_entrp: None,
                forces: vec![[0.0; 3]; structure.num_sites()],
                stress: None,
                structure: Some(structure.clone()),
                electronic_steps: Vec::new(),
            }],
            ..Default::default()
        };
        output.normalize();

        let mut doc = TaskDoc::new(task_id, format!("/calcs/{}", task_id));
        doc.calcs_reversed = vec![Calculation {
            dir_name: task_id.to_string(),
            task_name: "standard".to_string(),
            completed: true,
            completed_at: Some(Utc::now()),
            input: CalculationInput {
                structure: Some(structure),
                parameters: params,
                ..Default::default()
            },
            output,
        }];
        doc.normalize();
        doc
    }

    fn defect_task(task_id: &str, charge: i32, site: [f64; 3]) -> TaskDoc {
        let mut doc = make_task(task_id, mgo_vacancy(), -40.0);
        doc.additional_json.insert(
            "defect_info".to_string(),
            serde_json::json!({
                "defect": {
                    "@class": "Vacancy",
                    "element": "O",
                    "charge": charge,
                    "site": site,
                    "bulk_formula": "MgO",
                    "correction": 0.25,
                    "correction_scheme": "freysoldt",
                }
            }),
        );
        doc
    }

    fn material(is_metal: bool) -> MaterialsDoc {
        MaterialsDoc {
            material_id: "mp-100".to_string(),
            formula: "MgO".to_string(),
            structure: mgo_bulk(),
            bandgap: Some(if is_metal { 0.0 } else { 4.5 }),
            is_metal: Some(is_metal),
            entries: BTreeMap::new(),
            task_ids: vec!["mp-100".to_string()],
            last_updated: Utc::now(),
        }
    }

    fn dielectric() -> BTreeSet<String> {
        ["mp-100".to_string()].into_iter().collect()
    }

    #[test]
    fn test_pairs_defect_with_bulk() {
        let tasks = vec![
            make_task("mp-bulk", mgo_bulk(), -48.0),
            defect_task("mp-def", -2, [0.5, 0.5, 0.5]),
        ];
        let mut builder = DefectBuilder::new(
            tasks,
            vec![material(false)],
            dielectric(),
            MemStore::new(&["defect_task_id"]),
            &BuilderConfig::default(),
        );
        let report = run_builder(&mut builder).unwrap();
        assert_eq!(report.processed, 1);

        let docs = builder.into_target().query(&BTreeMap::new()).unwrap();
        let doc: DefectDoc = serde_json::from_value(docs[0].clone()).unwrap();
        assert_eq!(doc.bulk_task_id, "mp-bulk");
        assert_eq!(doc.material_id, "mp-100");
        assert_eq!(doc.defect.name(), "vacancy_O");
        assert!((doc.energy_parts.uncorrected() - 8.0).abs() < 1e-12);
        assert!((doc.energy_parts.corrected() - 8.25).abs() < 1e-12);
    }

    #[test]
    fn test_equivalent_defects_are_merged() {
        let tasks = vec![
            make_task("mp-bulk", mgo_bulk(), -48.0),
            defect_task("mp-def1", -2, [0.5, 0.5, 0.5]),
            // 位点相同（周期像），属同一等价类
            defect_task("mp-def2", -2, [0.5, 0.5, 1.5000002]),
        ];
        let mut builder = DefectBuilder::new(
            tasks,
            vec![material(false)],
            dielectric(),
            MemStore::new(&["defect_task_id"]),
            &BuilderConfig::default(),
        );
        let items = builder.get_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tasks.len(), 2);

        let doc = builder.process_item(&items[0]).unwrap().unwrap();
        assert_eq!(doc.task_ids.len(), 2);
    }

    #[test]
    fn test_charge_separates_classes() {
        let tasks = vec![
            make_task("mp-bulk", mgo_bulk(), -48.0),
            defect_task("mp-def1", -2, [0.5, 0.5, 0.5]),
            defect_task("mp-def2", 0, [0.5, 0.5, 0.5]),
        ];
        let mut builder = DefectBuilder::new(
            tasks,
            vec![material(false)],
            dielectric(),
            MemStore::new(&["defect_task_id"]),
            &BuilderConfig::default(),
        );
        let items = builder.get_items().unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_nonmetal_requires_dielectric() {
        let tasks = vec![
            make_task("mp-bulk", mgo_bulk(), -48.0),
            defect_task("mp-def", -2, [0.5, 0.5, 0.5]),
        ];
        let mut builder = DefectBuilder::new(
            tasks.clone(),
            vec![material(false)],
            BTreeSet::new(),
            MemStore::new(&["defect_task_id"]),
            &BuilderConfig::default(),
        );
        assert!(builder.get_items().unwrap().is_empty());

        // 金属本体不需要介电文档
        let mut builder = DefectBuilder::new(
            tasks,
            vec![material(true)],
            BTreeSet::new(),
            MemStore::new(&["defect_task_id"]),
            &BuilderConfig::default(),
        );
        assert_eq!(builder.get_items().unwrap().len(), 1);
    }

    #[test]
    fn test_strict_bulk_matching_rejects_ambiguity() {
        let tasks = vec![
            make_task("mp-bulk1", mgo_bulk(), -48.0),
            make_task("mp-bulk2", mgo_bulk(), -48.1),
            defect_task("mp-def", -2, [0.5, 0.5, 0.5]),
        ];

        let config = BuilderConfig::default();
        let mut builder = DefectBuilder::new(
            tasks.clone(),
            vec![material(false)],
            dielectric(),
            MemStore::new(&["defect_task_id"]),
            &config,
        );
        let items = builder.get_items().unwrap();
        // 默认策略：取任务标识序首个候选
        let doc = builder.process_item(&items[0]).unwrap().unwrap();
        assert_eq!(doc.bulk_task_id, "mp-bulk1");

        let strict = BuilderConfig {
            strict_bulk_matching: true,
            ..BuilderConfig::default()
        };
        let mut builder = DefectBuilder::new(
            tasks,
            vec![material(false)],
            dielectric(),
            MemStore::new(&["defect_task_id"]),
            &strict,
        );
        let items = builder.get_items().unwrap();
        assert!(builder.process_item(&items[0]).unwrap().is_none());
    }

    fn defect_doc(name_charge: (DefectKind, i32), formation: f64) -> DefectDoc {
        DefectDoc {
            defect: Defect {
                kind: name_charge.0,
                element: "O".to_string(),
                charge: name_charge.1,
                site: [0.5, 0.5, 0.5],
                bulk_formula: "MgO".to_string(),
            },
            defect_task_id: format!("mp-{}", name_charge.1),
            bulk_task_id: "mp-bulk".to_string(),
            material_id: "mp-100".to_string(),
            run_type: RunType::Gga,
            defect_structure: Some(mgo_vacancy()),
            energy_parts: FormationEnergyParts {
                defect_energy: formation,
                bulk_energy: 0.0,
                correction: 0.0,
                correction_scheme: None,
            },
            task_ids: vec![format!("mp-{}", name_charge.1)],
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_thermo_groups_by_material() {
        let docs = vec![
            defect_doc((DefectKind::Vacancy, 0), 5.0),
            defect_doc((DefectKind::Vacancy, -2), 7.5),
        ];
        let elements: BTreeSet<String> =
            ["Mg".to_string(), "O".to_string()].into_iter().collect();

        let mut builder = DefectThermoBuilder::new(
            docs,
            elements,
            MemStore::new(&["material_id"]),
            &BuilderConfig::default(),
        );
        let report = run_builder(&mut builder).unwrap();
        assert_eq!(report.processed, 1);

        let values = builder.into_target().query(&BTreeMap::new()).unwrap();
        let doc: DefectThermoDoc = serde_json::from_value(values[0].clone()).unwrap();
        assert_eq!(doc.material_id, "mp-100");
        assert_eq!(doc.defect_docs.len(), 2);
        let by_charge = &doc.formation_energies["vacancy_O"];
        assert_eq!(by_charge[&0], 5.0);
        assert_eq!(by_charge[&-2], 7.5);
        assert_eq!(doc.chempot_elements, vec!["Mg".to_string(), "O".to_string()]);
    }

    #[test]
    fn test_thermo_excludes_missing_chempots() {
        let docs = vec![defect_doc((DefectKind::Vacancy, 0), 5.0)];
        // 缺 O 的参考条目
        let elements: BTreeSet<String> = ["Mg".to_string()].into_iter().collect();

        let mut builder = DefectThermoBuilder::new(
            docs,
            elements,
            MemStore::new(&["material_id"]),
            &BuilderConfig::default(),
        );
        assert!(builder.get_items().unwrap().is_empty());
    }
}
