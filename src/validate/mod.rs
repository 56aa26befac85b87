//! # 任务文档校验
//!
//! 对装配好的任务文档执行 INCAR 参数校验，产出校验文档。
//! 规则实现见 `incar`，参考输入集见 `refset`。
//!
//! ## 模块列表
//! - `incar`: 校验规则与判定原语
//! - `refset`: 参考输入集与 FFT 网格例程

pub mod incar;
pub mod refset;

use crate::models::task::TaskDoc;
use chrono::{DateTime, Utc};
use incar::Finding;
use refset::ReferenceInputSet;
use serde::{Deserialize, Serialize};

/// 校验配置（显式传入，无全局默认单例）
#[derive(Debug, Clone)]
pub struct ValidateConfig {
    /// FFT 网格下限的容差系数
    pub fft_grid_tolerance: f64,
    /// 每原子熵项上限 (eV/atom)
    pub entropy_per_atom_max: f64,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        ValidateConfig {
            fft_grid_tolerance: 0.9,
            entropy_per_atom_max: 0.001,
        }
    }
}

/// 校验结果文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDoc {
    pub task_id: String,
    /// 无阻断性问题
    pub valid: bool,
    /// 阻断性问题列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// 提示列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl ValidationDoc {
    /// 对任务文档执行全部规则
    pub fn from_task(doc: &TaskDoc, config: &ValidateConfig) -> ValidationDoc {
        let refset = ReferenceInputSet::for_task_type(doc.task_type);
        let findings = incar::run_all_checks(doc, &refset, config);

        let mut reasons = Vec::new();
        let mut warnings = Vec::new();
        for finding in findings {
            match finding {
                Finding::Reason(msg) => reasons.push(msg),
                Finding::Warning(msg) => warnings.push(msg),
            }
        }

        ValidationDoc {
            task_id: doc.task_id.clone(),
            valid: reasons.is_empty(),
            reasons,
            warnings,
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calculation::{
        BandSummary, Calculation, CalculationInput, CalculationOutput, IncarValue, IonicStep,
        KpointScheme, Kpoints, Parameters,
    };
    use crate::models::structure::{Lattice, Site, Structure};

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

    /// 非金属静态计算的基线文档：所有规则都应通过
    fn base_doc() -> TaskDoc {
        let params: Parameters = [
            ("GGA".to_string(), IncarValue::Str("PE".to_string())),
            ("NSW".to_string(), IncarValue::Int(0)),
            ("ISMEAR".to_string(), IncarValue::Int(0)),
            ("SIGMA".to_string(), IncarValue::Float(0.05)),
            ("ENMAX".to_string(), IncarValue::Float(520.0)),
            ("EDIFF".to_string(), IncarValue::Float(1e-6)),
        ]
        .into_iter()
        .collect();

        let mut output = CalculationOutput {
            structure: Some(si_structure()),
            bands: Some(BandSummary {
                bandgap: 1.0,
                is_metal: false,
                ..Default::default()
            }),
            ionic_steps: vec![IonicStep {
                energy: -10.8,
                e_wo_entrp: None,
                forces: vec![[0.0, 0.0, 0.01], [0.0, 0.0, -0.01]],
                stress: None,
                structure: Some(si_structure()),
                electronic_steps: Vec::new(),
            }],
            ..Default::default()
        };
        output.normalize();

        let mut doc = TaskDoc::new("mp-1", "/calcs/si");
        doc.calcs_reversed = vec![Calculation {
            dir_name: "calc".to_string(),
            task_name: "standard".to_string(),
            completed: true,
            completed_at: None,
            input: CalculationInput {
                structure: Some(si_structure()),
                parameters: params,
                ..Default::default()
            },
            output,
        }];
        doc.normalize();
        doc
    }

    fn set_param(doc: &mut TaskDoc, key: &str, value: IncarValue) {
        doc.calcs_reversed[0]
            .input
            .parameters
            .insert(key.to_string(), value);
        doc.normalize();
    }

    fn reasons_containing(doc: &TaskDoc, needle: &str) -> usize {
        let validation = ValidationDoc::from_task(doc, &ValidateConfig::default());
        validation
            .reasons
            .iter()
            .filter(|r| r.contains(needle))
            .count()
    }

    #[test]
    fn test_baseline_is_valid() {
        let doc = base_doc();
        let validation = ValidationDoc::from_task(&doc, &ValidateConfig::default());
        assert!(validation.valid, "unexpected reasons: {:?}", validation.reasons);
    }

    #[test]
    fn test_ismear_positive_on_nonmetal() {
        let mut doc = base_doc();
        set_param(&mut doc, "ISMEAR", IncarValue::Int(1));
        assert!(reasons_containing(&doc, "ISMEAR") > 0);
    }

    #[test]
    fn test_sigma_too_wide_on_nonmetal() {
        let mut doc = base_doc();
        set_param(&mut doc, "SIGMA", IncarValue::Float(0.2));
        assert!(reasons_containing(&doc, "SIGMA") > 0);
    }

    #[test]
    fn test_sigma_ignored_for_tetrahedron() {
        let mut doc = base_doc();
        set_param(&mut doc, "ISMEAR", IncarValue::Int(-5));
        set_param(&mut doc, "SIGMA", IncarValue::Float(1000.0));
        assert_eq!(reasons_containing(&doc, "SIGMA"), 0);
    }

    #[test]
    fn test_encut_too_low() {
        let mut doc = base_doc();
        set_param(&mut doc, "ENMAX", IncarValue::Float(1.0));
        assert!(reasons_containing(&doc, "ENCUT") > 0);
    }

    #[test]
    fn test_ediff_too_loose() {
        let mut doc = base_doc();
        set_param(&mut doc, "EDIFF", IncarValue::Float(1e-2));
        assert!(reasons_containing(&doc, "EDIFF:") > 0);
    }

    #[test]
    fn test_nbands_out_of_range_both_sides() {
        let mut doc = base_doc();
        set_param(&mut doc, "NELECT", IncarValue::Float(8.0));

        set_param(&mut doc, "NBANDS", IncarValue::Int(1));
        assert!(reasons_containing(&doc, "NBANDS") > 0);

        set_param(&mut doc, "NBANDS", IncarValue::Int(1000));
        assert!(reasons_containing(&doc, "NBANDS") > 0);

        set_param(&mut doc, "NBANDS", IncarValue::Int(8));
        assert_eq!(reasons_containing(&doc, "NBANDS"), 0);
    }

    #[test]
    fn test_lreal_checked_at_incar_level_only() {
        let mut doc = base_doc();

        // parameters 层的 LREAL 不触发
        set_param(&mut doc, "LREAL", IncarValue::Bool(true));
        assert_eq!(reasons_containing(&doc, "LREAL"), 0);

        // incar 文件层触发
        doc.calcs_reversed[0]
            .input
            .incar
            .insert("LREAL".to_string(), IncarValue::Bool(true));
        doc.normalize();
        assert!(reasons_containing(&doc, "LREAL") > 0);
    }

    #[test]
    fn test_lmaxmix_is_warning_for_scf() {
        let mut doc = base_doc();
        set_param(&mut doc, "LMAXMIX", IncarValue::Int(0));

        let validation = ValidationDoc::from_task(&doc, &ValidateConfig::default());
        assert!(!validation.reasons.iter().any(|r| r.contains("LMAXMIX")));
        assert!(validation.warnings.iter().any(|w| w.contains("LMAXMIX")));
    }

    #[test]
    fn test_entropy_term_flags_sigma() {
        let mut doc = base_doc();
        doc.calcs_reversed[0].output.ionic_steps[0].electronic_steps = vec![
            crate::models::calculation::ElectronicStep {
                energy: -10.8,
                e_wo_entrp: None,
                eentropy: Some(-0.1),
            },
        ];
        doc.normalize();

        // 0.1 eV / 2 原子 = 50 meV/atom，远超 1 meV/atom
        assert!(reasons_containing(&doc, "SIGMA") > 0);
    }

    #[test]
    fn test_fft_grid_only_when_user_set() {
        let mut doc = base_doc();
        let validation = ValidationDoc::from_task(&doc, &ValidateConfig::default());
        assert!(!validation.reasons.iter().any(|r| r.contains("NGX")));

        doc.calcs_reversed[0]
            .input
            .incar
            .insert("NGX".to_string(), IncarValue::Int(2));
        doc.calcs_reversed[0]
            .input
            .parameters
            .insert("NGX".to_string(), IncarValue::Int(2));
        doc.normalize();
        assert!(reasons_containing(&doc, "NGX") > 0);
    }

    #[test]
    fn test_icharg_invalid_value() {
        let mut doc = base_doc();
        set_param(&mut doc, "ICHARG", IncarValue::Int(9));
        assert!(reasons_containing(&doc, "ICHARG") > 0);

        set_param(&mut doc, "ICHARG", IncarValue::Int(2));
        assert_eq!(reasons_containing(&doc, "ICHARG"), 0);
    }

    #[test]
    fn test_nelm_too_low() {
        let mut doc = base_doc();
        set_param(&mut doc, "NELM", IncarValue::Int(1));
        assert!(reasons_containing(&doc, "NELM") > 0);

        set_param(&mut doc, "NELM", IncarValue::Int(100));
        assert_eq!(reasons_containing(&doc, "NELM"), 0);
    }

    #[test]
    fn test_lorbit_invalid_value() {
        let mut doc = base_doc();
        set_param(&mut doc, "LORBIT", IncarValue::Int(99));
        assert!(reasons_containing(&doc, "LORBIT") > 0);

        set_param(&mut doc, "LORBIT", IncarValue::Int(11));
        assert_eq!(reasons_containing(&doc, "LORBIT"), 0);
    }

    fn set_kpoint_grid(doc: &mut TaskDoc, grid: [u32; 3]) {
        doc.calcs_reversed[0].input.kpoints = Some(Kpoints {
            scheme: KpointScheme::Gamma,
            grid: Some(grid),
            shift: Some([0.0; 3]),
            num_kpoints: 0,
            labels: Vec::new(),
        });
        doc.normalize();
    }

    #[test]
    fn test_kpoint_density_too_low() {
        let mut doc = base_doc();
        // 无 KPOINTS 数据不报
        assert_eq!(reasons_containing(&doc, "KPOINTS"), 0);

        // 1 k 点 × 2 位点 = 2，远低于下限
        set_kpoint_grid(&mut doc, [1, 1, 1]);
        assert!(reasons_containing(&doc, "KPOINTS") > 0);

        // 30³ × 2 = 54000，密度充足
        set_kpoint_grid(&mut doc, [30, 30, 30]);
        assert_eq!(reasons_containing(&doc, "KPOINTS"), 0);
    }

    #[test]
    fn test_kpoint_density_skips_line_mode() {
        let mut doc = base_doc();
        doc.calcs_reversed[0].input.kpoints = Some(Kpoints {
            scheme: KpointScheme::Line,
            grid: None,
            shift: None,
            num_kpoints: 20,
            labels: vec!["G".to_string(), "X".to_string()],
        });
        doc.normalize();
        assert_eq!(reasons_containing(&doc, "KPOINTS"), 0);
    }

    #[test]
    fn test_check_is_idempotent() {
        let mut doc = base_doc();
        set_param(&mut doc, "ISMEAR", IncarValue::Int(1));
        set_param(&mut doc, "EDIFF", IncarValue::Float(1e-2));

        let config = ValidateConfig::default();
        let first = ValidationDoc::from_task(&doc, &config);
        let second = ValidationDoc::from_task(&doc, &config);
        assert_eq!(first.reasons, second.reasons);
        assert_eq!(first.warnings, second.warnings);
    }
}
