//! # build 命令实现
//!
//! 按目标选择构建器，从 JSONL 源读取文档，运行一轮构建并写回
//! JSONL 目标。
//!
//! ## 管线组合
//! - `materials` / `elasticity` / `defects`: 以任务文档为源
//! - `defect-thermo`: 以缺陷文档为源
//! - `pes`: 以势能面任务文档为源，依次产出极小点、过渡态、反应
//! - `phonon`: 以 DDB 文档为源，驱动外部工具
//!
//! ## 依赖关系
//! - 使用 `cli/build.rs` 定义的参数
//! - 使用 `builders/`, `store/`, `utils/output.rs`

use crate::builders::defects::{DefectBuilder, DefectThermoBuilder};
use crate::builders::elasticity::ElasticityBuilder;
use crate::builders::materials::{MaterialsBuilder, MaterialsDoc};
use crate::builders::pes::{PesMinimumBuilder, ReactionBuilder, TransitionStateBuilder};
use crate::builders::phonon::{DdbDoc, PhononBuilder};
use crate::builders::{run_builder, BuilderConfig};
use crate::cli::build::{BuildArgs, BuildTarget};
use crate::commands::validate::load_tasks;
use crate::error::{MatpipeError, Result};
use crate::models::defect::DefectDoc;
use crate::models::pes::{PesTaskDoc, TransitionStateDoc};
use crate::store::{DocStore, JsonlStore, MemStore};
use crate::utils::output;

use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// 从 JSONL 读取并反序列化一类文档
fn load_docs<T: DeserializeOwned>(path: &Path, key_fields: &[&str]) -> Result<Vec<T>> {
    let store = JsonlStore::new(path, key_fields);
    store
        .query(&BTreeMap::new())?
        .into_iter()
        .map(|value| {
            serde_json::from_value(value).map_err(|e| MatpipeError::JsonError {
                path: path.display().to_string(),
                source: e,
            })
        })
        .collect()
}

/// 读取每行一个条目的文本清单
fn load_id_list(path: &Path) -> Result<BTreeSet<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// 执行 build 命令
pub fn execute(args: BuildArgs) -> Result<()> {
    output::print_header(&format!("Building: {:?}", args.target));

    if !args.source.exists() {
        return Err(MatpipeError::FileNotFound {
            path: args.source.display().to_string(),
        });
    }

    let config = BuilderConfig {
        strict_bulk_matching: args.strict_bulk,
        consider_metal_bonds: !args.ignore_metal_bonds,
        subprocess_timeout_secs: args.timeout,
        ..BuilderConfig::default()
    };

    match args.target {
        BuildTarget::Materials => {
            let tasks = load_tasks(&args.source)?;
            let target = JsonlStore::new(&args.output, &["material_id"]);
            let mut builder = MaterialsBuilder::new(tasks, target, &config);
            run_builder(&mut builder)?;
        }
        BuildTarget::Elasticity => {
            let tasks = load_tasks(&args.source)?;
            let target = JsonlStore::new(&args.output, &["material_key"]);
            let mut builder = ElasticityBuilder::new(tasks, target, &config);
            run_builder(&mut builder)?;
        }
        BuildTarget::Defects => {
            let tasks = load_tasks(&args.source)?;

            // 先在内存中聚合材料文档，作为缺陷配对的资格依据
            let mut materials_builder =
                MaterialsBuilder::new(tasks.clone(), MemStore::new(&["material_id"]), &config);
            run_builder(&mut materials_builder)?;
            let materials: Vec<MaterialsDoc> = materials_builder
                .into_target()
                .query(&BTreeMap::new())?
                .into_iter()
                .map(|v| {
                    serde_json::from_value(v).map_err(|e| MatpipeError::JsonError {
                        path: "<materials doc>".to_string(),
                        source: e,
                    })
                })
                .collect::<Result<_>>()?;

            let dielectrics = match &args.dielectrics {
                Some(path) => load_id_list(path)?,
                None => BTreeSet::new(),
            };
            if dielectrics.is_empty() {
                output::print_warning(
                    "No dielectric material ids supplied; non-metallic hosts will be skipped.",
                );
            }

            let target = JsonlStore::new(&args.output, &["defect_task_id"]);
            let mut builder = DefectBuilder::new(tasks, materials, dielectrics, target, &config);
            run_builder(&mut builder)?;
        }
        BuildTarget::DefectThermo => {
            let defect_docs: Vec<DefectDoc> = load_docs(&args.source, &["defect_task_id"])?;
            let elements = match &args.elements {
                Some(path) => load_id_list(path)?,
                None => {
                    return Err(MatpipeError::InvalidArgument(
                        "defect-thermo requires --elements".to_string(),
                    ))
                }
            };

            let target = JsonlStore::new(&args.output, &["material_id"]);
            let mut builder = DefectThermoBuilder::new(defect_docs, elements, target, &config);
            run_builder(&mut builder)?;
        }
        BuildTarget::Pes => {
            let pes_tasks: Vec<PesTaskDoc> = load_docs(&args.source, &["task_id"])?;
            std::fs::create_dir_all(&args.output).map_err(|e| MatpipeError::FileWriteError {
                path: args.output.display().to_string(),
                source: e,
            })?;

            let minima_target = JsonlStore::new(args.output.join("minima.jsonl"), &["task_id"]);
            let mut minima_builder =
                PesMinimumBuilder::new(pes_tasks.clone(), minima_target, &config);
            run_builder(&mut minima_builder)?;

            let ts_path = args.output.join("transition_states.jsonl");
            let ts_target = JsonlStore::new(&ts_path, &["task_id"]);
            let mut ts_builder = TransitionStateBuilder::new(pes_tasks.clone(), ts_target, &config);
            run_builder(&mut ts_builder)?;

            let transition_states: Vec<TransitionStateDoc> = load_docs(&ts_path, &["task_id"])?;
            let reactions_target =
                JsonlStore::new(args.output.join("reactions.jsonl"), &["ts_task_id"]);
            let mut reaction_builder =
                ReactionBuilder::new(transition_states, pes_tasks, reactions_target, &config);
            run_builder(&mut reaction_builder)?;
        }
        BuildTarget::Phonon => {
            let ddb_docs: Vec<DdbDoc> = load_docs(&args.source, &["material_id"])?;
            let workdir = args
                .workdir
                .clone()
                .unwrap_or_else(std::env::temp_dir);

            let target = JsonlStore::new(&args.output, &["material_id"]);
            let mut builder =
                PhononBuilder::new(ddb_docs, &args.phonon_command, workdir, target, &config);
            run_builder(&mut builder)?;
        }
    }

    output::print_success(&format!("Output written to '{}'", args.output.display()));
    Ok(())
}
