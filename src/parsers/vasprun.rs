//! # vasprun.xml 解析器
//!
//! 基于 quick-xml 事件流解析 vasprun.xml，提取有效参数、INCAR 回显、
//! k 点、离子步轨迹（嵌套电子步）、本征值与费米能级。
//!
//! ## 解析策略
//! - 单遍事件循环 + 显式状态标志，不构建 DOM
//! - 结构由 `<crystal>` basis 与 `<varray name="positions">` 组装，
//!   元素符号来自 `<atominfo>`
//! - 本征值只在 `<eigenvalues>` 且不在 `<projected>` 内收集
//!
//! ## 依赖关系
//! - 被 `parsers/taskdir.rs` 使用
//! - 使用 `models/calculation.rs`, `models/structure.rs`

use crate::error::{MatpipeError, Result};
use crate::models::calculation::{
    param_i64, BandSummary, ElectronicStep, IncarValue, IonicStep, KpointScheme, Kpoints,
    Parameters,
};
use crate::models::structure::{Lattice, Site, Structure};
use crate::parsers::incar;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs;
use std::path::Path;

/// 金属判定的带隙数值阈值 (eV)
pub const METAL_GAP_TOL: f64 = 1e-4;

/// vasprun.xml 提取结果
#[derive(Debug, Clone, Default)]
pub struct VasprunData {
    /// VASP 规范化后的有效参数
    pub parameters: Parameters,
    /// INCAR 回显（用户实际设置的标签）
    pub incar: Parameters,
    /// k 点描述
    pub kpoints: Option<Kpoints>,
    /// 初始结构
    pub initial_structure: Option<Structure>,
    /// 最终结构
    pub final_structure: Option<Structure>,
    /// 离子步轨迹
    pub ionic_steps: Vec<IonicStep>,
    /// 费米能级 (eV)
    pub efermi: Option<f64>,
    /// 本征值 (energy, occupation) 扁平列表
    pub eigenvalues: Vec<(f64, f64)>,
    /// 位点元素符号
    pub elements: Vec<String>,
}

impl VasprunData {
    /// 电子收敛：最后一个离子步的 SCF 步数未达 NELM
    pub fn electronic_converged(&self) -> bool {
        let nelm = param_i64(&self.parameters, "NELM").unwrap_or(60) as usize;
        match self.ionic_steps.last() {
            Some(step) => step.electronic_steps.len() < nelm,
            None => false,
        }
    }

    /// 离子收敛：静态计算恒真；弛豫要求步数未达 NSW
    pub fn ionic_converged(&self) -> bool {
        let nsw = param_i64(&self.parameters, "NSW").unwrap_or(0);
        if nsw <= 1 {
            true
        } else {
            (self.ionic_steps.len() as i64) < nsw
        }
    }

    /// 由本征值派生电子结构摘要
    ///
    /// 占据阈值 1e-8：占据态更新 vbm，空态更新 cbm。
    pub fn band_summary(&self) -> Option<BandSummary> {
        if self.eigenvalues.is_empty() {
            return None;
        }

        let mut vbm = f64::NEG_INFINITY;
        let mut cbm = f64::INFINITY;
        for &(energy, occupation) in &self.eigenvalues {
            if occupation > 1e-8 {
                vbm = vbm.max(energy);
            } else {
                cbm = cbm.min(energy);
            }
        }
        if !vbm.is_finite() || !cbm.is_finite() {
            return None;
        }

        let bandgap = (cbm - vbm).max(0.0);
        Some(BandSummary {
            bandgap,
            cbm: Some(cbm),
            vbm: Some(vbm),
            is_metal: bandgap < METAL_GAP_TOL,
            efermi: self.efermi,
            is_line_mode: false,
        })
    }
}

/// 解析 vasprun.xml 文件
pub fn parse_vasprun_file(path: &Path) -> Result<VasprunData> {
    let content = fs::read_to_string(path).map_err(|e| MatpipeError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_vasprun_content(&content).map_err(|reason| MatpipeError::ParseError {
        format: "vasprun.xml".to_string(),
        path: path.display().to_string(),
        reason,
    })
}

/// 结构组装暂存
#[derive(Default)]
struct StructureBuffer {
    name: String,
    basis: Vec<[f64; 3]>,
    positions: Vec<[f64; 3]>,
}

impl StructureBuffer {
    fn build(&self, elements: &[String]) -> Option<Structure> {
        if self.basis.len() != 3 || self.positions.is_empty() {
            return None;
        }
        let lattice = Lattice::from_vectors([self.basis[0], self.basis[1], self.basis[2]]);
        let sites = self
            .positions
            .iter()
            .enumerate()
            .map(|(i, &pos)| {
                let element = elements.get(i).cloned().unwrap_or_else(|| "X".to_string());
                Site::new(element, pos)
            })
            .collect();
        Some(Structure::new(self.name.clone(), lattice, sites))
    }
}

/// 从字符串内容解析 vasprun.xml（错误为原因字符串，由调用方包装）
pub fn parse_vasprun_content(xml: &str) -> std::result::Result<VasprunData, String> {
    let mut reader = Reader::from_str(xml);
    let mut data = VasprunData::default();

    // 区段标志
    let mut in_parameters = false;
    let mut in_incar = false;
    let mut in_calculation = false;
    let mut in_scstep = false;
    let mut in_projected = false;
    let mut in_eigenvalues = false;
    let mut in_atominfo_atoms = false;
    let mut in_dos = false;
    let mut in_generation = false;
    let mut generation_scheme: Option<String> = None;

    // 当前标量/向量标签
    let mut current_tag: Option<(String, String, String)> = None; // (元素名, name 属性, type 属性)
    let mut current_varray: Option<String> = None;
    let mut structure_buf: Option<StructureBuffer> = None;
    let mut in_crystal = false;
    let mut rc_first_cell = false;
    let mut pending_text = String::new();

    // 当前离子步暂存
    let mut step_energy: Option<f64> = None;
    let mut step_e_wo: Option<f64> = None;
    let mut step_forces: Vec<[f64; 3]> = Vec::new();
    let mut step_stress: Option<[[f64; 3]; 3]> = None;
    let mut stress_rows: Vec<[f64; 3]> = Vec::new();
    let mut step_structure: Option<Structure> = None;
    let mut electronic_steps: Vec<ElectronicStep> = Vec::new();
    let mut sc_energy: Option<f64> = None;
    let mut sc_e_wo: Option<f64> = None;
    let mut sc_eentropy: Option<f64> = None;
    let mut kpoint_divisions: Option<[u32; 3]> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = local_name(&e);
                pending_text.clear();
                match tag.as_str() {
                    "parameters" => in_parameters = true,
                    "incar" => in_incar = true,
                    "calculation" => {
                        in_calculation = true;
                        step_energy = None;
                        step_e_wo = None;
                        step_forces.clear();
                        step_stress = None;
                        step_structure = None;
                        electronic_steps.clear();
                    }
                    "scstep" => {
                        in_scstep = true;
                        sc_energy = None;
                        sc_e_wo = None;
                        sc_eentropy = None;
                    }
                    "projected" => in_projected = true,
                    "eigenvalues" => in_eigenvalues = true,
                    "dos" => in_dos = true,
                    "generation" => {
                        in_generation = true;
                        generation_scheme = attr_value(&e, "param");
                    }
                    "structure" => {
                        structure_buf = Some(StructureBuffer {
                            name: attr_value(&e, "name").unwrap_or_else(|| "step".to_string()),
                            ..Default::default()
                        });
                    }
                    "crystal" => in_crystal = true,
                    "varray" => {
                        current_varray = attr_value(&e, "name");
                        if current_varray.as_deref() == Some("stress") {
                            stress_rows.clear();
                        }
                    }
                    "array" => {
                        if attr_value(&e, "name").as_deref() == Some("atoms") {
                            in_atominfo_atoms = true;
                            data.elements.clear();
                        }
                    }
                    "rc" => rc_first_cell = true,
                    "i" | "v" => {
                        current_tag = Some((
                            tag,
                            attr_value(&e, "name").unwrap_or_default(),
                            attr_value(&e, "type").unwrap_or_default(),
                        ));
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(_)) => {}
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                pending_text.push_str(&text);
            }
            Ok(Event::End(e)) => {
                let tag = local_name_end(e.name().as_ref());
                match tag.as_str() {
                    "parameters" => in_parameters = false,
                    "incar" => in_incar = false,
                    "calculation" => {
                        in_calculation = false;
                        let mut step = IonicStep {
                            energy: step_energy.unwrap_or(0.0),
                            e_wo_entrp: step_e_wo,
                            forces: std::mem::take(&mut step_forces),
                            stress: step_stress.take(),
                            structure: step_structure.take(),
                            electronic_steps: std::mem::take(&mut electronic_steps),
                        };
                        // 离子步能量缺失时回退到最后一个电子步
                        if step_energy.is_none() {
                            if let Some(last) = step.electronic_steps.last() {
                                step.energy = last.energy;
                            }
                        }
                        data.ionic_steps.push(step);
                    }
                    "scstep" => {
                        in_scstep = false;
                        if let Some(energy) = sc_energy {
                            electronic_steps.push(ElectronicStep {
                                energy,
                                e_wo_entrp: sc_e_wo,
                                eentropy: sc_eentropy,
                            });
                        }
                    }
                    "projected" => in_projected = false,
                    "eigenvalues" => in_eigenvalues = false,
                    "dos" => in_dos = false,
                    "generation" => in_generation = false,
                    "structure" => {
                        if let Some(buf) = structure_buf.take() {
                            let structure = buf.build(&data.elements);
                            match buf.name.as_str() {
                                "initialpos" => data.initial_structure = structure,
                                "finalpos" => data.final_structure = structure,
                                _ => {
                                    if in_calculation {
                                        step_structure = structure;
                                    }
                                }
                            }
                        }
                    }
                    "crystal" => in_crystal = false,
                    "varray" => {
                        if current_varray.as_deref() == Some("stress") && stress_rows.len() == 3 {
                            step_stress = Some([stress_rows[0], stress_rows[1], stress_rows[2]]);
                        }
                        current_varray = None;
                    }
                    "array" => in_atominfo_atoms = false,
                    "set" => {}
                    "c" => {
                        if in_atominfo_atoms && rc_first_cell {
                            data.elements.push(pending_text.trim().to_string());
                            rc_first_cell = false;
                        }
                        pending_text.clear();
                    }
                    "r" => {
                        if in_eigenvalues && !in_projected {
                            let vals: Vec<f64> = pending_text
                                .split_whitespace()
                                .filter_map(|w| w.parse().ok())
                                .collect();
                            if vals.len() >= 2 {
                                data.eigenvalues.push((vals[0], vals[1]));
                            }
                        }
                        pending_text.clear();
                    }
                    "i" | "v" => {
                        if let Some((_, name, type_attr)) = current_tag.take() {
                            let text = pending_text.trim().to_string();
                            pending_text.clear();
                            handle_scalar(
                                &mut data,
                                &name,
                                &type_attr,
                                &text,
                                in_parameters,
                                in_incar,
                                in_scstep,
                                in_calculation,
                                in_dos,
                                in_generation,
                                &mut sc_energy,
                                &mut sc_e_wo,
                                &mut sc_eentropy,
                                &mut step_energy,
                                &mut step_e_wo,
                                &mut kpoint_divisions,
                                current_varray.as_deref(),
                                structure_buf.as_mut(),
                                in_crystal,
                                &mut step_forces,
                                &mut stress_rows,
                            );
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
    }

    // k 点组装
    if let Some(scheme) = generation_scheme {
        let scheme_lower = scheme.to_lowercase();
        let (scheme, line_mode) = match scheme_lower.as_str() {
            "listgenerated" => (KpointScheme::Line, true),
            s if s.starts_with('m') => (KpointScheme::Monkhorst, false),
            _ => (KpointScheme::Gamma, false),
        };
        data.kpoints = Some(Kpoints {
            scheme,
            grid: if line_mode { None } else { kpoint_divisions },
            shift: None,
            num_kpoints: kpoint_divisions
                .map(|g| g[0] * g[1] * g[2])
                .unwrap_or(0),
            labels: Vec::new(),
        });
    }

    if data.parameters.is_empty() && data.ionic_steps.is_empty() {
        return Err("No parameters or ionic steps found".to_string());
    }

    Ok(data)
}

/// 处理 `<i>` / `<v>` 标量与向量值
#[allow(clippy::too_many_arguments)]
fn handle_scalar(
    data: &mut VasprunData,
    name: &str,
    type_attr: &str,
    text: &str,
    in_parameters: bool,
    in_incar: bool,
    in_scstep: bool,
    in_calculation: bool,
    in_dos: bool,
    in_generation: bool,
    sc_energy: &mut Option<f64>,
    sc_e_wo: &mut Option<f64>,
    sc_eentropy: &mut Option<f64>,
    step_energy: &mut Option<f64>,
    step_e_wo: &mut Option<f64>,
    kpoint_divisions: &mut Option<[u32; 3]>,
    current_varray: Option<&str>,
    structure_buf: Option<&mut StructureBuffer>,
    in_crystal: bool,
    step_forces: &mut Vec<[f64; 3]>,
    stress_rows: &mut Vec<[f64; 3]>,
) {
    // varray 内的行向量
    if let Some(varray) = current_varray {
        if let Some(row) = parse_row3(text) {
            match varray {
                "basis" => {
                    if let Some(buf) = structure_buf {
                        if in_crystal {
                            buf.basis.push(row);
                        }
                    }
                }
                "positions" => {
                    if let Some(buf) = structure_buf {
                        buf.positions.push(row);
                    }
                }
                "forces" => step_forces.push(row),
                "stress" => stress_rows.push(row),
                _ => {}
            }
        }
        return;
    }

    // 能量标量
    if in_scstep {
        match name {
            "e_fr_energy" => *sc_energy = text.parse().ok(),
            "e_wo_entrp" => *sc_e_wo = text.parse().ok(),
            "eentropy" => *sc_eentropy = text.parse().ok(),
            _ => {}
        }
        return;
    }
    if in_calculation && !in_dos {
        match name {
            "e_fr_energy" => *step_energy = text.parse().ok(),
            "e_wo_entrp" => *step_e_wo = text.parse().ok(),
            _ => {}
        }
    }
    if in_dos && name == "efermi" {
        data.efermi = text.parse().ok();
        return;
    }
    if in_generation && name == "divisions" {
        let vals: Vec<u32> = text
            .split_whitespace()
            .filter_map(|w| w.parse().ok())
            .collect();
        if vals.len() >= 3 {
            *kpoint_divisions = Some([vals[0], vals[1], vals[2]]);
        }
        return;
    }

    // 参数 / INCAR 回显
    if (in_parameters || in_incar) && !name.is_empty() {
        let value = parse_typed_value(text, type_attr);
        let target = if in_incar {
            &mut data.incar
        } else {
            &mut data.parameters
        };
        target.insert(name.to_uppercase(), value);
    }
}

/// 按 type 属性解析 vasprun 标量
fn parse_typed_value(text: &str, type_attr: &str) -> IncarValue {
    match type_attr {
        "logical" => {
            let upper = text.trim().to_uppercase();
            IncarValue::Bool(upper.starts_with('T'))
        }
        "int" => {
            let ints: Vec<i64> = text
                .split_whitespace()
                .filter_map(|w| w.parse().ok())
                .collect();
            match ints.len() {
                0 => IncarValue::Str(text.to_string()),
                1 => IncarValue::Int(ints[0]),
                _ => IncarValue::IntList(ints),
            }
        }
        "string" => IncarValue::Str(text.trim().to_string()),
        _ => incar::parse_value(text),
    }
}

fn parse_row3(text: &str) -> Option<[f64; 3]> {
    let vals: Vec<f64> = text
        .split_whitespace()
        .filter_map(|w| w.parse().ok())
        .collect();
    if vals.len() >= 3 {
        Some([vals[0], vals[1], vals[2]])
    } else {
        None
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn local_name_end(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_string()
}

fn attr_value(e: &BytesStart, key: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

/// 两离子步弛豫的最小 vasprun 片段（供本模块与 taskdir 测试共用）
#[cfg(test)]
pub(crate) fn sample_vasprun(nsw: i64, ionic_steps: usize) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<modeling>
 <incar>
  <i type="int" name="NSW">"#,
    );
    xml.push_str(&nsw.to_string());
    xml.push_str(
        r#"</i>
  <i type="string" name="GGA">PE</i>
 </incar>
 <kpoints>
  <generation param="Gamma">
   <v type="int" name="divisions">2 2 2</v>
  </generation>
 </kpoints>
 <parameters>
  <separator name="electronic">
   <i type="int" name="NELM">60</i>
   <i name="ENMAX">520.0</i>
   <i type="int" name="ISMEAR">0</i>
   <i name="SIGMA">0.05</i>
  </separator>
  <separator name="ionic">
   <i type="int" name="NSW">"#,
    );
    xml.push_str(&nsw.to_string());
    xml.push_str(
        r#"</i>
   <i type="int" name="IBRION">2</i>
  </separator>
  <separator name="xc">
   <i type="string" name="GGA">PE</i>
  </separator>
 </parameters>
 <atominfo>
  <array name="atoms">
   <set>
    <rc><c>Si</c><c> 1</c></rc>
    <rc><c>Si</c><c> 1</c></rc>
   </set>
  </array>
 </atominfo>
 <structure name="initialpos">
  <crystal>
   <varray name="basis">
    <v>5.40 0.00 0.00</v>
    <v>0.00 5.40 0.00</v>
    <v>0.00 0.00 5.40</v>
   </varray>
  </crystal>
  <varray name="positions">
   <v>0.00 0.00 0.00</v>
   <v>0.25 0.25 0.25</v>
  </varray>
 </structure>
"#,
    );

    for i in 0..ionic_steps {
        let energy = -10.0 - 0.4 * (i as f64 + 1.0);
        xml.push_str(&format!(
            r#" <calculation>
  <scstep>
   <energy><i name="e_fr_energy">{e1}</i><i name="e_wo_entrp">{e1}</i><i name="eentropy">-0.0001</i></energy>
  </scstep>
  <scstep>
   <energy><i name="e_fr_energy">{e}</i><i name="e_wo_entrp">{e}</i><i name="eentropy">-0.0001</i></energy>
  </scstep>
  <structure>
   <crystal>
    <varray name="basis">
     <v>5.43 0.00 0.00</v>
     <v>0.00 5.43 0.00</v>
     <v>0.00 0.00 5.43</v>
    </varray>
   </crystal>
   <varray name="positions">
    <v>0.00 0.00 0.00</v>
    <v>0.25 0.25 0.25</v>
   </varray>
  </structure>
  <varray name="forces">
   <v>0.00 0.00 0.01</v>
   <v>0.00 0.00 -0.01</v>
  </varray>
  <varray name="stress">
   <v>1.0 0.0 0.0</v>
   <v>0.0 1.0 0.0</v>
   <v>0.0 0.0 1.0</v>
  </varray>
  <energy><i name="e_fr_energy">{e}</i><i name="e_wo_entrp">{e}</i></energy>
 </calculation>
"#,
            e1 = energy + 0.1,
            e = energy,
        ));
    }

    xml.push_str(
        r#" <structure name="finalpos">
  <crystal>
   <varray name="basis">
    <v>5.43 0.00 0.00</v>
    <v>0.00 5.43 0.00</v>
    <v>0.00 0.00 5.43</v>
   </varray>
  </crystal>
  <varray name="positions">
   <v>0.00 0.00 0.00</v>
   <v>0.25 0.25 0.25</v>
  </varray>
 </structure>
 <dos>
  <i name="efermi">5.12</i>
 </dos>
 <eigenvalues>
  <array>
   <set>
    <r>-6.10 1.00</r>
    <r>-1.25 1.00</r>
    <r>0.45 0.00</r>
    <r>2.30 0.00</r>
   </set>
  </array>
 </eigenvalues>
</modeling>
"#,
    );

    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameters_and_incar() {
        let data = parse_vasprun_content(&sample_vasprun(99, 2)).unwrap();
        assert_eq!(param_i64(&data.parameters, "NSW"), Some(99));
        assert_eq!(param_i64(&data.parameters, "NELM"), Some(60));
        assert_eq!(param_i64(&data.incar, "NSW"), Some(99));
        assert_eq!(
            data.parameters.get("ENMAX"),
            Some(&IncarValue::Float(520.0))
        );
    }

    #[test]
    fn test_parse_ionic_steps_with_electronic_steps() {
        let data = parse_vasprun_content(&sample_vasprun(99, 2)).unwrap();
        assert_eq!(data.ionic_steps.len(), 2);

        for step in &data.ionic_steps {
            assert_eq!(step.electronic_steps.len(), 2);
            assert_eq!(step.forces.len(), 2);
            assert!(step.stress.is_some());
            assert!(step.structure.is_some());
        }
        assert!((data.ionic_steps[1].energy - (-10.8)).abs() < 1e-10);
        assert_eq!(
            data.ionic_steps[0].electronic_steps[0].eentropy,
            Some(-0.0001)
        );
    }

    #[test]
    fn test_parse_structures_and_elements() {
        let data = parse_vasprun_content(&sample_vasprun(99, 2)).unwrap();
        assert_eq!(data.elements, vec!["Si", "Si"]);

        let final_structure = data.final_structure.as_ref().unwrap();
        assert_eq!(final_structure.sites.len(), 2);
        let (a, _, _, _, _, _) = final_structure.lattice.parameters();
        assert!((a - 5.43).abs() < 1e-6);
    }

    #[test]
    fn test_band_summary_insulator() {
        let data = parse_vasprun_content(&sample_vasprun(0, 1)).unwrap();
        let bands = data.band_summary().unwrap();

        assert!((bands.vbm.unwrap() - (-1.25)).abs() < 1e-10);
        assert!((bands.cbm.unwrap() - 0.45).abs() < 1e-10);
        assert!((bands.bandgap - 1.7).abs() < 1e-10);
        assert!(!bands.is_metal);
        assert_eq!(bands.efermi, Some(5.12));
    }

    #[test]
    fn test_convergence_flags() {
        // 弛豫在 NSW 之前停止 → 收敛
        let data = parse_vasprun_content(&sample_vasprun(99, 2)).unwrap();
        assert!(data.electronic_converged());
        assert!(data.ionic_converged());

        // 步数打满 NSW → 未收敛
        let data = parse_vasprun_content(&sample_vasprun(2, 2)).unwrap();
        assert!(!data.ionic_converged());
    }

    #[test]
    fn test_kpoints_from_generation() {
        let data = parse_vasprun_content(&sample_vasprun(99, 1)).unwrap();
        let kpoints = data.kpoints.unwrap();
        assert_eq!(kpoints.scheme, KpointScheme::Gamma);
        assert_eq!(kpoints.grid, Some([2, 2, 2]));
    }
}
