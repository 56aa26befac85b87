//! # 弹性张量构建器
//!
//! 把一个结构优化任务和围绕它的一组形变任务拟合成二阶弹性张量。
//!
//! ## 流程
//! 1. 按母晶格分组：形变任务的母晶格 = 形变后晶格 × (Fᵀ)⁻¹，
//!    与优化任务自身晶格用容差关联表贪心归组
//! 2. 组内筛选：取最新优化任务；形变任务须与其 LREAL/ENCUT 一致；
//!    同一形变矩阵只保留最新任务
//! 3. 主应变 = Green-Lagrange 应变，主应力 = VASP 应力换算 GPa
//! 4. 晶格点群派生应变（应力随之变换，重复项平均）
//! 5. 最小二乘拟合；应变矩阵秩不足 6 时放弃该组而非报错
//!
//! ## 依赖关系
//! - 被 `commands/build.rs` 使用
//! - 使用 `tensor/`, `symmetry/`, `matching/`

use crate::builders::{Builder, BuilderConfig};
use crate::error::{MatpipeError, Result};
use crate::matching::TensorMapping;
use crate::models::calculation::{param_f64, param_str, TaskState, TaskType};
use crate::models::elasticity::{
    DerivedElasticProperties, ElasticTensorDoc, ElasticityDoc, FittingData,
};
use crate::models::structure::{invert_3x3, matmul_3x3, matrices_allclose, transpose_3x3};
use crate::models::task::TaskDoc;
use crate::store::DocStore;
use crate::symmetry::lattice_point_group;
use crate::tensor::{
    compliance_tensor, fit_elastic_tensor, strain_matrix_rank, strain_to_voigt, stress_to_voigt,
    vasp_stress_to_gpa, Deformation,
};
use chrono::Utc;

/// 一个待拟合的组：优化任务 + 筛选后的形变任务
pub struct ElasticGroup {
    pub optimization: TaskDoc,
    pub deformations: Vec<(TaskDoc, Deformation)>,
}

/// 弹性张量构建器
pub struct ElasticityBuilder<S: DocStore> {
    tasks: Vec<TaskDoc>,
    target: S,
    config: BuilderConfig,
}

impl<S: DocStore> ElasticityBuilder<S> {
    pub fn new(tasks: Vec<TaskDoc>, target: S, config: &BuilderConfig) -> Self {
        ElasticityBuilder {
            tasks,
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }
}

/// 从 transformations 记录中提取形变矩阵
pub fn deformation_from_task(task: &TaskDoc) -> Option<Deformation> {
    fn find(value: &serde_json::Value) -> Option<[[f64; 3]; 3]> {
        match value {
            serde_json::Value::Object(map) => {
                if let Some(m) = map.get("deformation").and_then(as_matrix) {
                    return Some(m);
                }
                map.values().find_map(find)
            }
            serde_json::Value::Array(items) => items.iter().find_map(find),
            _ => None,
        }
    }

    fn as_matrix(value: &serde_json::Value) -> Option<[[f64; 3]; 3]> {
        let rows = value.as_array()?;
        if rows.len() != 3 {
            return None;
        }
        let mut m = [[0.0; 3]; 3];
        for (i, row) in rows.iter().enumerate() {
            let cols = row.as_array()?;
            if cols.len() != 3 {
                return None;
            }
            for (j, v) in cols.iter().enumerate() {
                m[i][j] = v.as_f64()?;
            }
        }
        Some(m)
    }

    task.transformations.as_ref().and_then(find).map(Deformation)
}

/// 形变任务的母晶格：L_parent = L_sim · (Fᵀ)⁻¹
fn parent_lattice(sim_lattice: &[[f64; 3]; 3], f: &Deformation) -> Option<[[f64; 3]; 3]> {
    let ft_inv = invert_3x3(&transpose_3x3(&f.0))?;
    Some(matmul_3x3(sim_lattice, &ft_inv))
}

/// 形变任务须与优化任务一致的输入签名
fn input_signature(task: &TaskDoc) -> (Option<String>, Option<f64>) {
    let Some(input) = task.first_input_set() else {
        return (None, None);
    };
    let lreal = param_str(&input.incar, "LREAL").map(|s| s.to_uppercase());
    let encut =
        param_f64(&input.incar, "ENCUT").or_else(|| param_f64(&input.parameters, "ENMAX"));
    (lreal, encut)
}

impl<S: DocStore> Builder for ElasticityBuilder<S> {
    type Item = ElasticGroup;
    type Doc = ElasticityDoc;

    fn name(&self) -> &str {
        "elasticity"
    }

    fn get_items(&mut self) -> Result<Vec<ElasticGroup>> {
        struct RawGroup {
            optimizations: Vec<TaskDoc>,
            deformations: Vec<(TaskDoc, Deformation)>,
        }

        let mut groups: TensorMapping<RawGroup> = TensorMapping::new(self.config.lattice_tol);

        let mut sorted: Vec<&TaskDoc> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Success)
            .collect();
        sorted.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        for task in sorted {
            let Some(structure) = task.final_structure() else {
                continue;
            };
            match task.task_type {
                TaskType::StructureOptimization => {
                    let key = structure.lattice.matrix;
                    match groups.get_mut(&key) {
                        Some(g) => g.optimizations.push(task.clone()),
                        None => groups.insert(
                            key,
                            RawGroup {
                                optimizations: vec![task.clone()],
                                deformations: Vec::new(),
                            },
                        ),
                    }
                }
                TaskType::Deformation => {
                    let Some(f) = deformation_from_task(task) else {
                        continue;
                    };
                    let Some(key) = parent_lattice(&structure.lattice.matrix, &f) else {
                        continue;
                    };
                    match groups.get_mut(&key) {
                        Some(g) => g.deformations.push((task.clone(), f)),
                        None => groups.insert(
                            key,
                            RawGroup {
                                optimizations: Vec::new(),
                                deformations: vec![(task.clone(), f)],
                            },
                        ),
                    }
                }
                _ => {}
            }
        }

        let mut items = Vec::new();
        for group in groups.values() {
            // 最新完成的优化任务代表该母晶格
            let Some(optimization) = group
                .optimizations
                .iter()
                .max_by_key(|t| t.completed_at())
                .cloned()
            else {
                continue;
            };

            // 输入不一致的形变任务会引入系统性偏差，直接剔除
            let opt_sig = input_signature(&optimization);
            let mut newest: TensorMapping<(TaskDoc, Deformation)> =
                TensorMapping::new(self.config.lattice_tol);
            for (task, f) in &group.deformations {
                if input_signature(task) != opt_sig {
                    continue;
                }
                match newest.get_mut(&f.0) {
                    Some(slot) => {
                        if task.completed_at() > slot.0.completed_at() {
                            *slot = (task.clone(), *f);
                        }
                    }
                    None => newest.insert(f.0, (task.clone(), *f)),
                }
            }

            items.push(ElasticGroup {
                optimization,
                deformations: newest.values().cloned().collect(),
            });
        }
        Ok(items)
    }

    fn process_item(&self, group: &ElasticGroup) -> Result<Option<ElasticityDoc>> {
        let mut primary_strains_3x3 = Vec::new();
        let mut primary_stresses_3x3 = Vec::new();
        let mut deformation_task_ids = Vec::new();

        for (task, f) in &group.deformations {
            let Some(stress_kbar) = task.output.stress else {
                continue;
            };
            primary_strains_3x3.push(f.green_lagrange_strain());
            primary_stresses_3x3.push(vasp_stress_to_gpa(&stress_kbar));
            deformation_task_ids.push(task.task_id.clone());
        }

        // 点群派生：主应变经对称操作映到新应变，应力随之变换；
        // 落回主应变容差内的丢弃，多个操作映到同一应变的取平均
        let opt_structure = group
            .optimization
            .final_structure()
            .ok_or_else(|| MatpipeError::MissingInputSet {
                task_id: group.optimization.task_id.clone(),
            })?;
        let ops = lattice_point_group(&opt_structure.lattice);

        let mut derived: TensorMapping<([[f64; 3]; 3], usize)> =
            TensorMapping::new(self.config.lattice_tol);
        for op in &ops {
            for (strain, stress) in primary_strains_3x3.iter().zip(&primary_stresses_3x3) {
                let t_strain = op.transform_tensor(strain);
                let is_primary = primary_strains_3x3
                    .iter()
                    .any(|p| matrices_allclose(p, &t_strain, self.config.lattice_tol));
                if is_primary {
                    continue;
                }
                let t_stress = op.transform_tensor(stress);
                match derived.get_mut(&t_strain) {
                    Some((sum, count)) => {
                        for i in 0..3 {
                            for j in 0..3 {
                                sum[i][j] += t_stress[i][j];
                            }
                        }
                        *count += 1;
                    }
                    None => derived.insert(t_strain, (t_stress, 1)),
                }
            }
        }

        let primary_strains: Vec<[f64; 6]> =
            primary_strains_3x3.iter().map(strain_to_voigt).collect();
        let primary_stresses: Vec<[f64; 6]> =
            primary_stresses_3x3.iter().map(stress_to_voigt).collect();

        // 只保留提升应变组秩的派生应变：线性相关的行不提供新约束，
        // 只会加重其所在方向的拟合权重
        let mut derived_strains = Vec::new();
        let mut derived_stresses = Vec::new();
        let mut accepted = primary_strains.clone();
        let mut rank = strain_matrix_rank(&accepted);
        for (strain, (sum, count)) in derived.iter() {
            let mut avg = [[0.0; 3]; 3];
            for i in 0..3 {
                for j in 0..3 {
                    avg[i][j] = sum[i][j] / *count as f64;
                }
            }
            let voigt = strain_to_voigt(strain);
            accepted.push(voigt);
            let new_rank = strain_matrix_rank(&accepted);
            if new_rank > rank {
                rank = new_rank;
                derived_strains.push(voigt);
                derived_stresses.push(stress_to_voigt(&avg));
            } else {
                accepted.pop();
            }
        }

        let mut all_strains = primary_strains.clone();
        all_strains.extend_from_slice(&derived_strains);
        let mut all_stresses = primary_stresses.clone();
        all_stresses.extend_from_slice(&derived_stresses);

        let Some(c_ij) = fit_elastic_tensor(&all_strains, &all_stresses) else {
            // 应变覆盖不全，等待更多形变任务
            return Ok(None);
        };
        let Some(s_ij) = compliance_tensor(&c_ij) else {
            return Ok(None);
        };
        let derived_properties = match crate::tensor::vrh_averages(&c_ij) {
            Some(vrh) => DerivedElasticProperties {
                k_vrh: vrh.k_vrh,
                g_vrh: vrh.g_vrh,
                young_modulus: vrh.young_modulus,
                poisson_ratio: vrh.poisson_ratio,
            },
            None => DerivedElasticProperties::default(),
        };

        let equilibrium_stress = group
            .optimization
            .output
            .stress
            .map(|s| stress_to_voigt(&vasp_stress_to_gpa(&s)));

        Ok(Some(ElasticityDoc {
            material_key: format!(
                "{}_{}",
                opt_structure.reduced_formula(),
                group.optimization.task_id
            ),
            optimization_task_id: group.optimization.task_id.clone(),
            elastic_tensor: ElasticTensorDoc { c_ij, s_ij },
            fitting_data: FittingData {
                primary_strains,
                primary_stresses,
                derived_strains,
                derived_stresses,
                deformation_task_ids,
                equilibrium_stress,
            },
            derived_properties,
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<ElasticityDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<elasticity doc>".to_string(),
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
    };
    use crate::models::structure::{Lattice, Site, Structure};
    use crate::store::MemStore;
    use approx::assert_relative_eq;

    const A0: f64 = 4.0;
    // 各向同性介质：λ = C12, μ = C44, C11 = λ + 2μ
    const C11: f64 = 166.0;
    const C12: f64 = 64.0;
    const C44: f64 = (C11 - C12) / 2.0;

    fn cubic_structure(lattice: [[f64; 3]; 3]) -> Structure {
        Structure::new(
            "Cu",
            Lattice::from_vectors(lattice),
            vec![Site::new("Cu", [0.0, 0.0, 0.0])],
        )
    }

    /// σ = λ·tr(ε)·I + 2μ·ε（ε 为 Green-Lagrange 应变），返回 kBar 应力
    fn stress_for(f: &Deformation) -> [[f64; 3]; 3] {
        let e = f.green_lagrange_strain();
        let trace = e[0][0] + e[1][1] + e[2][2];
        let mut s = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                s[i][j] = 2.0 * C44 * e[i][j];
                if i == j {
                    s[i][j] += C12 * trace;
                }
            }
        }
        // GPa → VASP kBar 记号
        for row in s.iter_mut() {
            for v in row.iter_mut() {
                *v /= crate::tensor::VASP_STRESS_TO_GPA;
            }
        }
        s
    }

    fn base_incar() -> Parameters {
        [
            ("ENCUT".to_string(), IncarValue::Float(520.0)),
            ("LREAL".to_string(), IncarValue::Str("False".to_string())),
        ]
        .into_iter()
        .collect()
    }

    fn make_task(
        task_id: &str,
        structure: Structure,
        stress: Option<[[f64; 3]; 3]>,
        nsw: i64,
        transformations: Option<serde_json::Value>,
        incar: Parameters,
    ) -> TaskDoc {
        let params: Parameters = [
            ("GGA".to_string(), IncarValue::Str("PE".to_string())),
            ("NSW".to_string(), IncarValue::Int(nsw)),
            ("IBRION".to_string(), IncarValue::Int(2)),
        ]
        .into_iter()
        .collect();

        let mut output = CalculationOutput {
            structure: Some(structure.clone()),
            stress,
            ionic_steps: vec![IonicStep {
                energy: -3.7,
                e_wo_entrp: None,
                forces: vec![[0.0; 3]],
                stress,
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
                incar,
                ..Default::default()
            },
            output,
        }];
        doc.transformations = transformations;
        doc.normalize();
        doc
    }

    fn deformation_task(task_id: &str, f: Deformation, incar: Parameters) -> TaskDoc {
        let parent = cubic_structure([[A0, 0.0, 0.0], [0.0, A0, 0.0], [0.0, 0.0, A0]]);
        let deformed = parent.deformed(&f.0);
        let transformations = serde_json::json!({
            "history": [{
                "@class": "DeformStructureTransformation",
                "deformation": f.0,
            }]
        });
        make_task(
            task_id,
            deformed,
            Some(stress_for(&f)),
            0,
            Some(transformations),
            incar,
        )
    }

    fn six_deformations() -> Vec<Deformation> {
        let d = 0.01;
        let mut out = Vec::new();
        for i in 0..3 {
            let mut m = Deformation::identity().0;
            m[i][i] += d;
            out.push(Deformation(m));
        }
        for (i, j) in [(1, 2), (0, 2), (0, 1)] {
            let mut m = Deformation::identity().0;
            m[i][j] += d;
            out.push(Deformation(m));
        }
        out
    }

    fn opt_task() -> TaskDoc {
        make_task(
            "mp-opt",
            cubic_structure([[A0, 0.0, 0.0], [0.0, A0, 0.0], [0.0, 0.0, A0]]),
            Some([[0.0; 3]; 3]),
            99,
            None,
            base_incar(),
        )
    }

    #[test]
    fn test_recovers_isotropic_tensor() {
        let mut tasks = vec![opt_task()];
        for (i, f) in six_deformations().into_iter().enumerate() {
            tasks.push(deformation_task(&format!("mp-d{}", i), f, base_incar()));
        }

        let mut builder =
            ElasticityBuilder::new(tasks, MemStore::new(&["material_key"]), &BuilderConfig::default());
        let items = builder.get_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].deformations.len(), 6);

        let doc = builder.process_item(&items[0]).unwrap().unwrap();
        let c = doc.elastic_tensor.c_ij;
        assert_relative_eq!(c[0][0], C11, epsilon = 1e-6);
        assert_relative_eq!(c[0][1], C12, epsilon = 1e-6);
        assert_relative_eq!(c[3][3], C44, epsilon = 1e-6);
        assert_relative_eq!(c[0][3], 0.0, epsilon = 1e-6);

        // 各向同性极限：K = (C11 + 2·C12)/3
        assert_relative_eq!(
            doc.derived_properties.k_vrh,
            (C11 + 2.0 * C12) / 3.0,
            epsilon = 1e-6
        );
        assert_eq!(doc.optimization_task_id, "mp-opt");
        assert_eq!(doc.fitting_data.deformation_task_ids.len(), 6);
        assert_eq!(doc.fitting_data.equilibrium_stress, Some([0.0; 6]));
    }

    #[test]
    fn test_dependent_derived_strains_are_excluded() {
        // 六个主应变已满秩，所有对称派生应变都线性相关，应全部剔除
        let mut tasks = vec![opt_task()];
        for (i, f) in six_deformations().into_iter().enumerate() {
            tasks.push(deformation_task(&format!("mp-d{}", i), f, base_incar()));
        }

        let mut builder =
            ElasticityBuilder::new(tasks, MemStore::new(&["material_key"]), &BuilderConfig::default());
        let items = builder.get_items().unwrap();
        let doc = builder.process_item(&items[0]).unwrap().unwrap();

        assert!(doc.fitting_data.derived_strains.is_empty());
        assert!(doc.fitting_data.derived_stresses.is_empty());
        assert_relative_eq!(doc.elastic_tensor.c_ij[0][0], C11, epsilon = 1e-6);
    }

    #[test]
    fn test_rank_deficient_group_is_skipped() {
        // 只有单一方向的形变，应变矩阵秩 1
        let f = six_deformations()[0];
        let tasks = vec![opt_task(), deformation_task("mp-d0", f, base_incar())];

        let mut builder =
            ElasticityBuilder::new(tasks, MemStore::new(&["material_key"]), &BuilderConfig::default());
        let report = run_builder(&mut builder).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_mismatched_inputs_are_filtered() {
        let mut low_encut = base_incar();
        low_encut.insert("ENCUT".to_string(), IncarValue::Float(400.0));

        let defs = six_deformations();
        let mut tasks = vec![opt_task()];
        for (i, f) in defs.iter().enumerate().take(5) {
            tasks.push(deformation_task(&format!("mp-d{}", i), *f, base_incar()));
        }
        tasks.push(deformation_task("mp-d5", defs[5], low_encut));

        let mut builder =
            ElasticityBuilder::new(tasks, MemStore::new(&["material_key"]), &BuilderConfig::default());
        let items = builder.get_items().unwrap();
        assert_eq!(items.len(), 1);
        // 截断能不一致的形变任务被剔除
        assert_eq!(items[0].deformations.len(), 5);
    }

    #[test]
    fn test_duplicate_deformation_keeps_one() {
        let f = six_deformations()[0];
        let tasks = vec![
            opt_task(),
            deformation_task("mp-d0a", f, base_incar()),
            deformation_task("mp-d0b", f, base_incar()),
        ];

        let mut builder =
            ElasticityBuilder::new(tasks, MemStore::new(&["material_key"]), &BuilderConfig::default());
        let items = builder.get_items().unwrap();
        assert_eq!(items[0].deformations.len(), 1);
    }

    #[test]
    fn test_deformation_matrix_extraction() {
        let f = Deformation([[1.01, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let task = deformation_task("mp-x", f, base_incar());
        let extracted = deformation_from_task(&task).unwrap();
        assert_eq!(extracted.0, f.0);
        assert_eq!(task.task_type, TaskType::Deformation);
    }
}
