//! # VASP 产物解析器集合
//!
//! 每个子模块解析一类 VASP 文件；`taskdir` 负责把目录内的多阶段产物
//! 装配为规范任务文档。
//!
//! ## 模块列表
//! - `incar`: INCAR 标签文件
//! - `kpoints`: KPOINTS 文件
//! - `poscar`: POSCAR/CONTCAR 结构文件
//! - `potcar`: POTCAR / POTCAR.spec 赝势描述
//! - `outcar`: OUTCAR 运行统计
//! - `vasprun`: vasprun.xml 主产物
//! - `taskdir`: 任务目录装配

pub mod incar;
pub mod kpoints;
pub mod outcar;
pub mod poscar;
pub mod potcar;
pub mod taskdir;
pub mod vasprun;
