//! # 任务目录装配
//!
//! 发现任务目录中的多阶段计算产物（vasprun.xml.relax1 / .relax2 / ...），
//! 逐阶段装配 `Calculation`，再聚合为规范 `TaskDoc`。
//!
//! ## 降级策略
//! - vasprun.xml 为每阶段的硬依赖，缺失或损坏即失败
//! - OUTCAR / CONTCAR / INCAR / KPOINTS / POTCAR 缺失时降级继续，记入警告
//!
//! ## 依赖关系
//! - 被 `commands/parse.rs`, `builders/` 使用
//! - 使用 `parsers/{vasprun,outcar,poscar,incar,kpoints,potcar}.rs`, `models/task.rs`

use crate::error::{MatpipeError, Result};
use crate::models::calculation::{
    param_i64, Calculation, CalculationInput, CalculationOutput, Kpoints, Parameters,
};
use crate::models::task::TaskDoc;
use crate::parsers::{incar, kpoints, outcar, poscar, potcar, vasprun};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// 任务目录装配结果
#[derive(Debug)]
pub struct AssembledTask {
    pub doc: TaskDoc,
    /// 降级解析产生的警告
    pub warnings: Vec<String>,
}

/// 阶段描述：vasprun.xml 文件与其阶段后缀
#[derive(Debug, Clone)]
struct Stage {
    /// 阶段名："standard" 或 "relax1", "relax2", ...
    task_name: String,
    /// 文件名后缀：""、".relax1" 等
    suffix: String,
    vasprun_path: PathBuf,
}

/// 发现目录中的计算阶段，按执行顺序排列
fn discover_stages(dir: &Path) -> Result<Vec<Stage>> {
    let entries = fs::read_dir(dir).map_err(|_| MatpipeError::DirectoryNotFound {
        path: dir.display().to_string(),
    })?;

    let mut stages: Vec<Stage> = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.starts_with("vasprun.xml") {
            continue;
        }
        let suffix = file_name["vasprun.xml".len()..].to_string();
        let task_name = if suffix.is_empty() {
            "standard".to_string()
        } else {
            suffix.trim_start_matches('.').to_string()
        };
        // 压缩产物等无法识别的后缀跳过
        if !suffix.is_empty() && !task_name.starts_with("relax") {
            continue;
        }
        stages.push(Stage {
            task_name,
            suffix,
            vasprun_path: entry.path(),
        });
    }

    // relax1 < relax2 < ... < standard（无后缀视为单阶段）
    stages.sort_by_key(|s| {
        s.task_name
            .strip_prefix("relax")
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
    });

    if stages.is_empty() {
        return Err(MatpipeError::EmptyTaskDirectory {
            path: dir.display().to_string(),
        });
    }
    Ok(stages)
}

/// 查找带阶段后缀的输入/输出文件（如 "INCAR.relax1"）
fn stage_file(dir: &Path, base: &str, suffix: &str) -> Option<PathBuf> {
    let path = dir.join(format!("{}{}", base, suffix));
    if path.is_file() {
        return Some(path);
    }
    // 单阶段目录常无后缀
    let bare = dir.join(base);
    if bare.is_file() {
        Some(bare)
    } else {
        None
    }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// 装配单个计算阶段
fn assemble_calculation(
    dir: &Path,
    stage: &Stage,
    warnings: &mut Vec<String>,
) -> Result<Calculation> {
    let vr = vasprun::parse_vasprun_file(&stage.vasprun_path)?;

    // INCAR 文件优先，缺失时回退到 vasprun 的 INCAR 回显
    let incar_params = match stage_file(dir, "INCAR", &stage.suffix) {
        Some(path) => match incar::parse_incar_file(&path) {
            Ok(p) => p,
            Err(e) => {
                warnings.push(format!("{}: falling back to vasprun INCAR echo ({})", stage.task_name, e));
                vr.incar.clone()
            }
        },
        None => vr.incar.clone(),
    };

    let kpts: Option<Kpoints> = match stage_file(dir, "KPOINTS", &stage.suffix) {
        Some(path) => match kpoints::parse_kpoints_file(&path) {
            Ok(k) => Some(k),
            Err(e) => {
                warnings.push(format!("{}: KPOINTS unreadable ({})", stage.task_name, e));
                vr.kpoints.clone()
            }
        },
        None => vr.kpoints.clone(),
    };

    let from_potcar = stage_file(dir, "POTCAR", &stage.suffix)
        .and_then(|p| potcar::parse_potcar_file(&p).ok());
    let from_spec = stage_file(dir, "POTCAR.spec", &stage.suffix)
        .and_then(|p| potcar::parse_potcar_spec_file(&p).ok());
    let potcar_spec = potcar::reconcile(from_potcar, from_spec);

    let initial_structure = vr.initial_structure.clone().or_else(|| {
        stage_file(dir, "POSCAR", &stage.suffix).and_then(|p| poscar::parse_poscar_file(&p).ok())
    });

    // 最终结构：vasprun 为准，CONTCAR 兜底
    let final_structure = vr.final_structure.clone().or_else(|| {
        let contcar = stage_file(dir, "CONTCAR", &stage.suffix)
            .and_then(|p| poscar::parse_poscar_file(&p).ok());
        if contcar.is_some() {
            warnings.push(format!(
                "{}: final structure taken from CONTCAR",
                stage.task_name
            ));
        }
        contcar
    });

    // OUTCAR 可选：只贡献运行统计与收尾标记
    let outcar_data = stage_file(dir, "OUTCAR", &stage.suffix).map(|p| outcar::parse_outcar_file(&p));
    let outcar_data = match outcar_data {
        Some(Ok(data)) => Some(data),
        Some(Err(e)) => {
            warnings.push(format!("{}: OUTCAR unreadable ({})", stage.task_name, e));
            None
        }
        None => {
            warnings.push(format!("{}: OUTCAR missing, run stats unavailable", stage.task_name));
            None
        }
    };
    if let Some(data) = &outcar_data {
        if !data.is_finished {
            warnings.push(format!(
                "{}: OUTCAR has no timing block, job may have been killed",
                stage.task_name
            ));
        }
        if let Some(drift) = data.drift {
            let norm = (drift[0] * drift[0] + drift[1] * drift[1] + drift[2] * drift[2]).sqrt();
            if norm > 0.01 {
                warnings.push(format!(
                    "{}: large total drift {:.4} eV/A",
                    stage.task_name, norm
                ));
            }
        }
    }

    let electronic_converged = vr.electronic_converged();
    let ionic_converged = vr.ionic_converged();
    let completed = Calculation::determine_completed(
        &vr.parameters,
        vr.ionic_steps.len(),
        electronic_converged,
        ionic_converged,
    );

    let mut output = CalculationOutput {
        structure: final_structure,
        ionic_steps: vr.ionic_steps.clone(),
        bands: band_summary_for(&vr, kpts.as_ref(), warnings, &stage.task_name),
        run_stats: outcar_data.as_ref().map(|d| d.run_stats.clone()),
        ..Default::default()
    };
    output.normalize();

    Ok(Calculation {
        dir_name: dir.display().to_string(),
        task_name: stage.task_name.clone(),
        completed,
        completed_at: file_mtime(&stage.vasprun_path),
        input: CalculationInput {
            structure: initial_structure,
            parameters: vr.parameters.clone(),
            incar: incar_params,
            kpoints: kpts,
            potcar_spec,
        },
        output,
    })
}

/// 电子结构摘要的采集策略
///
/// 只为静态类计算（NSW ≤ 1）持久化摘要；NSCF（ICHARG > 10）按线模式
/// k 路径标记；IBRION = 1 时费米能级可能滞后一步，记入警告。
fn band_summary_for(
    vr: &vasprun::VasprunData,
    kpts: Option<&Kpoints>,
    warnings: &mut Vec<String>,
    task_name: &str,
) -> Option<crate::models::calculation::BandSummary> {
    let nsw = param_i64(&vr.parameters, "NSW").unwrap_or(0);
    if nsw > 1 {
        return None;
    }

    let mut bands = vr.band_summary()?;

    let icharg = param_i64(&vr.parameters, "ICHARG").unwrap_or(0);
    if icharg > 10 {
        bands.is_line_mode = kpts.map(|k| k.is_line_mode()).unwrap_or(false);
    }

    if param_i64(&vr.parameters, "IBRION") == Some(1) {
        warnings.push(format!(
            "{}: Fermi level from vasprun.xml may be stale for IBRION = 1",
            task_name
        ));
    }

    Some(bands)
}

/// 读取目录内 JSON 文件
fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| MatpipeError::JsonError {
        path: path.display().to_string(),
        source: e,
    })
}

/// *.orig 输入快照
fn collect_orig_inputs(dir: &Path, warnings: &mut Vec<String>) -> CalculationInput {
    let mut input = CalculationInput::default();

    let orig = |base: &str| -> Option<PathBuf> {
        let p = dir.join(format!("{}.orig", base));
        p.is_file().then_some(p)
    };

    if let Some(path) = orig("INCAR") {
        match incar::parse_incar_file(&path) {
            Ok(params) => input.incar = params,
            Err(e) => warnings.push(format!("INCAR.orig unreadable ({})", e)),
        }
    }
    if let Some(path) = orig("KPOINTS") {
        input.kpoints = kpoints::parse_kpoints_file(&path).ok();
    }
    if let Some(path) = orig("POSCAR") {
        input.structure = poscar::parse_poscar_file(&path).ok();
    }
    let from_potcar = orig("POTCAR").and_then(|p| potcar::parse_potcar_file(&p).ok());
    let from_spec = orig("POTCAR.spec").and_then(|p| potcar::parse_potcar_spec_file(&p).ok());
    input.potcar_spec = potcar::reconcile(from_potcar, from_spec);

    input
}

/// 从 transformations.json 提升 tags / author 到文档顶层
fn hoist_transformation_metadata(doc: &mut TaskDoc) {
    let Some(transformations) = doc.transformations.as_mut() else {
        return;
    };
    let Some(other) = transformations
        .get_mut("other_parameters")
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };

    if let Some(tags) = other.remove("tags") {
        if let Ok(tags) = serde_json::from_value::<Vec<String>>(tags) {
            doc.tags = tags;
        }
    }
    if let Some(author) = other.remove("author") {
        if let Some(author) = author.as_str() {
            doc.author = Some(author.to_string());
        }
    }
}

/// 从任务目录装配任务文档
pub fn assemble_task(dir: &Path, task_id: &str) -> Result<AssembledTask> {
    let mut warnings: Vec<String> = Vec::new();
    let stages = discover_stages(dir)?;

    let mut calcs: Vec<Calculation> = Vec::with_capacity(stages.len());
    for stage in &stages {
        calcs.push(assemble_calculation(dir, stage, &mut warnings)?);
    }
    // 逆时序：最后阶段在前
    calcs.reverse();

    let mut doc = TaskDoc::new(task_id, dir.display().to_string());
    doc.calcs_reversed = calcs;
    doc.orig_inputs = collect_orig_inputs(dir, &mut warnings);

    // 目录旁路 JSON
    for entry in fs::read_dir(dir).into_iter().flatten().flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".json") {
            continue;
        }
        match read_json(&entry.path()) {
            Ok(value) => match name.as_str() {
                "transformations.json" => doc.transformations = Some(value),
                "custodian.json" => doc.custodian = Some(value),
                other => {
                    let key = other.trim_end_matches(".json").to_string();
                    doc.additional_json.insert(key, value);
                }
            },
            Err(e) => warnings.push(format!("{}: {}", name, e)),
        }
    }

    hoist_transformation_metadata(&mut doc);
    doc.normalize();

    // 磁矩只在 OUTCAR 存在时可得，挂到扩展映射
    if let Some(mag_path) = stage_file(dir, "OUTCAR", stages.last().map(|s| s.suffix.as_str()).unwrap_or("")) {
        if let Ok(data) = outcar::parse_outcar_file(&mag_path) {
            if !data.magnetization.is_empty() {
                doc.extensions.insert(
                    "magnetization".to_string(),
                    serde_json::json!(data.magnetization),
                );
            }
        }
    }

    // 装配期警告并入分析摘要
    if let Some(analysis) = doc.analysis.as_mut() {
        analysis.warnings.extend(warnings.iter().cloned());
    }

    Ok(AssembledTask { doc, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calculation::{TaskState, TaskType};
    use crate::parsers::vasprun::sample_vasprun;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_two_stage_relaxation_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        write_file(dir, "vasprun.xml.relax1", &sample_vasprun(99, 3));
        write_file(dir, "vasprun.xml.relax2", &sample_vasprun(99, 2));
        write_file(dir, "INCAR.relax1", "NSW = 99\nIBRION = 2\nGGA = PE\n");
        write_file(dir, "INCAR.relax2", "NSW = 99\nIBRION = 2\nGGA = PE\n");
        write_file(dir, "KPOINTS", "mesh\n0\nGamma\n2 2 2\n0 0 0\n");
        write_file(
            dir,
            "transformations.json",
            r#"{"history": [], "other_parameters": {"tags": ["prod"], "author": "lab"}}"#,
        );

        let assembled = assemble_task(dir, "mp-42").unwrap();
        let doc = &assembled.doc;

        assert_eq!(doc.calcs_reversed.len(), 2);
        assert_eq!(doc.calcs_reversed[0].task_name, "relax2");
        assert_eq!(doc.calcs_reversed[1].task_name, "relax1");
        assert_eq!(doc.state, TaskState::Success);
        assert_eq!(doc.task_type, TaskType::StructureOptimization);
        assert_eq!(doc.tags, vec!["prod"]);
        assert_eq!(doc.author.as_deref(), Some("lab"));

        // 条目能量等于最后阶段的最终能量
        let entry = doc.entry.as_ref().unwrap();
        assert_eq!(Some(entry.energy), doc.output.energy);
        // OUTCAR 缺失 → 降级警告而非失败
        assert!(assembled.warnings.iter().any(|w| w.contains("OUTCAR")));
    }

    #[test]
    fn test_single_stage_static_with_bands() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write_file(dir, "vasprun.xml", &sample_vasprun(0, 1));

        let assembled = assemble_task(dir, "mp-7").unwrap();
        let doc = &assembled.doc;

        assert_eq!(doc.calcs_reversed.len(), 1);
        assert_eq!(doc.calcs_reversed[0].task_name, "standard");
        assert_eq!(doc.task_type, TaskType::Static);

        // 静态计算持久化电子结构摘要
        let bands = doc.output.bands.as_ref().unwrap();
        assert!(!bands.is_metal);
        assert!((bands.bandgap - 1.7).abs() < 1e-10);
    }

    #[test]
    fn test_relaxation_drops_band_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write_file(dir, "vasprun.xml", &sample_vasprun(99, 2));

        let assembled = assemble_task(dir, "mp-8").unwrap();
        assert!(assembled.doc.output.bands.is_none());
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = assemble_task(tmp.path(), "mp-9").unwrap_err();
        assert!(matches!(err, MatpipeError::EmptyTaskDirectory { .. }));
    }

    #[test]
    fn test_orig_inputs_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write_file(dir, "vasprun.xml", &sample_vasprun(0, 1));
        write_file(dir, "INCAR.orig", "NSW = 0\nENCUT = 520\n");

        let assembled = assemble_task(dir, "mp-10").unwrap();
        assert!(!assembled.doc.orig_inputs.incar.is_empty());
    }
}
