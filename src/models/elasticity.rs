//! # 弹性张量文档数据模型
//!
//! 二阶弹性张量拟合结果及其拟合数据来源。
//!
//! ## 依赖关系
//! - 被 `builders/elasticity.rs` 使用
//! - 使用 `tensor/` 的 Voigt 表示

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 弹性张量（IEEE 风格 6x6 Voigt 表示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticTensorDoc {
    /// 刚度张量 C (GPa)
    pub c_ij: [[f64; 6]; 6],
    /// 柔度张量 S (TPa⁻¹，原始柔度 ×1000)
    pub s_ij: [[f64; 6]; 6],
}

/// 拟合数据：主应变/派生应变及对应应力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittingData {
    /// 显式计算的主应变（Voigt 6 分量）
    pub primary_strains: Vec<[f64; 6]>,
    /// 主应变对应应力 (GPa, Voigt)
    pub primary_stresses: Vec<[f64; 6]>,
    /// 对称操作派生的应变
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_strains: Vec<[f64; 6]>,
    /// 派生应变对应应力（由主应力变换而来，重复项已平均）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_stresses: Vec<[f64; 6]>,
    /// 形变任务标识
    pub deformation_task_ids: Vec<String>,
    /// 平衡（零应变）应力 (GPa, Voigt)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equilibrium_stress: Option<[f64; 6]>,
}

/// 派生弹性性质（Voigt-Reuss-Hill 平均）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DerivedElasticProperties {
    /// 体模量 K_VRH (GPa)
    pub k_vrh: f64,
    /// 剪切模量 G_VRH (GPa)
    pub g_vrh: f64,
    /// 杨氏模量 (GPa)
    pub young_modulus: f64,
    /// 泊松比
    pub poisson_ratio: f64,
}

/// 弹性文档：一个优化任务 + 一组形变任务的拟合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticityDoc {
    /// 材料键（优化任务的约化化学式 + 任务标识）
    pub material_key: String,
    /// 优化任务标识
    pub optimization_task_id: String,
    /// 拟合得到的弹性张量
    pub elastic_tensor: ElasticTensorDoc,
    /// 拟合数据
    pub fitting_data: FittingData,
    /// 派生性质
    pub derived_properties: DerivedElasticProperties,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}
