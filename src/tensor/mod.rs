//! # 形变与弹性张量工具
//!
//! 形变梯度、Green-Lagrange 应变、Voigt 记号转换、应力单位换算，
//! 以及弹性常数矩阵的最小二乘拟合。
//!
//! ## 约定
//! - 应变 Voigt 向量为工程记号：[e11, e22, e33, 2e23, 2e13, 2e12]
//! - 应力 Voigt 向量：[s11, s22, s33, s23, s13, s12]，单位 GPa
//! - VASP 应力为 kBar 且符号相反，换算系数 -0.1
//!
//! ## 依赖关系
//! - 被 `builders/elasticity.rs` 使用
//! - 使用 `models/structure.rs`；SVD 与线性求解来自 nalgebra

use crate::models::structure::{matmul_3x3, transpose_3x3};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// VASP 应力（kBar，压为正）换算为 GPa（拉为正）
pub const VASP_STRESS_TO_GPA: f64 = -0.1;

/// 最小二乘拟合的奇异值秩判定阈值
const RANK_TOL: f64 = 1e-10;

/// 形变梯度 F
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deformation(pub [[f64; 3]; 3]);

impl Deformation {
    pub fn identity() -> Deformation {
        Deformation([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    /// Green-Lagrange 应变 E = ½(FᵀF − I)
    pub fn green_lagrange_strain(&self) -> [[f64; 3]; 3] {
        let ft_f = matmul_3x3(&transpose_3x3(&self.0), &self.0);
        let mut e = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                let id = if i == j { 1.0 } else { 0.0 };
                e[i][j] = 0.5 * (ft_f[i][j] - id);
            }
        }
        e
    }

    /// 是否为恒等形变（容差内）
    pub fn is_identity(&self, atol: f64) -> bool {
        let id = Deformation::identity();
        crate::models::structure::matrices_allclose(&self.0, &id.0, atol)
    }
}

/// 应变张量 → 工程 Voigt 向量
pub fn strain_to_voigt(e: &[[f64; 3]; 3]) -> [f64; 6] {
    [
        e[0][0],
        e[1][1],
        e[2][2],
        2.0 * e[1][2],
        2.0 * e[0][2],
        2.0 * e[0][1],
    ]
}

/// 应力张量 → Voigt 向量
pub fn stress_to_voigt(s: &[[f64; 3]; 3]) -> [f64; 6] {
    [s[0][0], s[1][1], s[2][2], s[1][2], s[0][2], s[0][1]]
}

/// VASP 应力张量 (kBar) → GPa 张量
pub fn vasp_stress_to_gpa(s: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = s[i][j] * VASP_STRESS_TO_GPA;
        }
    }
    out
}

/// 最小二乘拟合弹性常数矩阵 C（GPa）
///
/// 求解 E·C = S：E 为 N×6 应变矩阵，S 为 N×6 应力矩阵，按应力分量
/// 逐列求解。应变矩阵秩不足 6 时无法确定全部常数，返回 None。
pub fn fit_elastic_tensor(strains: &[[f64; 6]], stresses: &[[f64; 6]]) -> Option<[[f64; 6]; 6]> {
    if strains.len() != stresses.len() || strains.len() < 6 {
        return None;
    }

    let n = strains.len();
    let e = DMatrix::from_fn(n, 6, |i, j| strains[i][j]);

    let svd = e.clone().svd(true, true);
    if svd.rank(RANK_TOL) < 6 {
        return None;
    }

    let mut c = [[0.0; 6]; 6];
    for j in 0..6 {
        let s_col = DVector::from_fn(n, |i, _| stresses[i][j]);
        let coeffs = svd.solve(&s_col, RANK_TOL).ok()?;
        // C 的第 j 行：σ_j = Σ_k C[j][k]·ε_k
        for k in 0..6 {
            c[j][k] = coeffs[k];
        }
    }

    // 对称化：应力应变功共轭要求 C 对称
    for i in 0..6 {
        for j in (i + 1)..6 {
            let avg = 0.5 * (c[i][j] + c[j][i]);
            c[i][j] = avg;
            c[j][i] = avg;
        }
    }

    Some(c)
}

/// Voigt 应变行组的数值秩
pub fn strain_matrix_rank(strains: &[[f64; 6]]) -> usize {
    if strains.is_empty() {
        return 0;
    }
    DMatrix::from_fn(strains.len(), 6, |i, j| strains[i][j]).rank(RANK_TOL)
}

/// C (GPa) 的逆 × 1000 → 柔度矩阵 S (TPa⁻¹)
pub fn compliance_tensor(c: &[[f64; 6]; 6]) -> Option<[[f64; 6]; 6]> {
    let m = DMatrix::from_fn(6, 6, |i, j| c[i][j]);
    let inv = m.try_inverse()?;
    let mut s = [[0.0; 6]; 6];
    for i in 0..6 {
        for j in 0..6 {
            s[i][j] = inv[(i, j)] * 1000.0;
        }
    }
    Some(s)
}

/// Voigt-Reuss-Hill 平均派生的弹性性质
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrhAverages {
    /// 体模量 (GPa)
    pub k_vrh: f64,
    /// 剪切模量 (GPa)
    pub g_vrh: f64,
    /// 杨氏模量 (GPa)
    pub young_modulus: f64,
    /// 泊松比
    pub poisson_ratio: f64,
}

/// 由 C（GPa）计算 VRH 平均
pub fn vrh_averages(c: &[[f64; 6]; 6]) -> Option<VrhAverages> {
    let s_gpa = {
        let m = DMatrix::from_fn(6, 6, |i, j| c[i][j]);
        let inv = m.try_inverse()?;
        let mut s = [[0.0; 6]; 6];
        for i in 0..6 {
            for j in 0..6 {
                s[i][j] = inv[(i, j)];
            }
        }
        s
    };

    let k_v = (c[0][0] + c[1][1] + c[2][2] + 2.0 * (c[0][1] + c[0][2] + c[1][2])) / 9.0;
    let g_v = (c[0][0] + c[1][1] + c[2][2] - c[0][1] - c[0][2] - c[1][2]
        + 3.0 * (c[3][3] + c[4][4] + c[5][5]))
        / 15.0;

    let s_trace = s_gpa[0][0] + s_gpa[1][1] + s_gpa[2][2];
    let s_off = s_gpa[0][1] + s_gpa[0][2] + s_gpa[1][2];
    let s_shear = s_gpa[3][3] + s_gpa[4][4] + s_gpa[5][5];

    let k_r_denom = s_trace + 2.0 * s_off;
    let g_r_denom = 4.0 * s_trace - 4.0 * s_off + 3.0 * s_shear;
    if k_r_denom.abs() < 1e-12 || g_r_denom.abs() < 1e-12 {
        return None;
    }
    let k_r = 1.0 / k_r_denom;
    let g_r = 15.0 / g_r_denom;

    let k_vrh = 0.5 * (k_v + k_r);
    let g_vrh = 0.5 * (g_v + g_r);
    let denom = 3.0 * k_vrh + g_vrh;
    if denom.abs() < 1e-12 {
        return None;
    }

    Some(VrhAverages {
        k_vrh,
        g_vrh,
        young_modulus: 9.0 * k_vrh * g_vrh / denom,
        poisson_ratio: (3.0 * k_vrh - 2.0 * g_vrh) / (2.0 * denom),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_green_lagrange_uniaxial() {
        let f = Deformation([[1.01, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let e = f.green_lagrange_strain();

        // E11 = (1.01² − 1)/2
        assert_relative_eq!(e[0][0], (1.01f64.powi(2) - 1.0) / 2.0, epsilon = 1e-12);
        assert_relative_eq!(e[1][1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(e[0][1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_voigt_engineering_shear() {
        let e = [
            [0.01, 0.003, 0.0],
            [0.003, 0.0, 0.002],
            [0.0, 0.002, -0.01],
        ];
        let v = strain_to_voigt(&e);
        assert_relative_eq!(v[0], 0.01);
        assert_relative_eq!(v[3], 0.004);
        assert_relative_eq!(v[5], 0.006);
    }

    #[test]
    fn test_vasp_stress_conversion_sign() {
        let kbar = [[-100.0, 0.0, 0.0], [0.0, -100.0, 0.0], [0.0, 0.0, -100.0]];
        let gpa = vasp_stress_to_gpa(&kbar);
        assert_relative_eq!(gpa[0][0], 10.0);
    }

    /// 立方晶体参考矩阵（GPa）
    fn cubic_c(c11: f64, c12: f64, c44: f64) -> [[f64; 6]; 6] {
        let mut c = [[0.0; 6]; 6];
        for i in 0..3 {
            for j in 0..3 {
                c[i][j] = if i == j { c11 } else { c12 };
            }
            c[i + 3][i + 3] = c44;
        }
        c
    }

    fn apply_c(c: &[[f64; 6]; 6], strain: &[f64; 6]) -> [f64; 6] {
        let mut s = [0.0; 6];
        for i in 0..6 {
            for j in 0..6 {
                s[i] += c[i][j] * strain[j];
            }
        }
        s
    }

    #[test]
    fn test_fit_recovers_cubic_tensor() {
        let c_ref = cubic_c(166.0, 64.0, 80.0);

        let mut strains = Vec::new();
        let mut stresses = Vec::new();
        for axis in 0..6 {
            for &mag in &[-0.01, 0.01] {
                let mut e = [0.0; 6];
                e[axis] = mag;
                strains.push(e);
                stresses.push(apply_c(&c_ref, &e));
            }
        }

        let fitted = fit_elastic_tensor(&strains, &stresses).unwrap();
        for i in 0..6 {
            for j in 0..6 {
                assert_relative_eq!(fitted[i][j], c_ref[i][j], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_strain_matrix_rank_ignores_dependent_rows() {
        let e1 = [0.01, 0.0, 0.0, 0.0, 0.0, 0.0];
        let e2 = [0.0, 0.01, 0.0, 0.0, 0.0, 0.0];
        // e1 + e2：线性相关，不提升秩
        let sum = [0.01, 0.01, 0.0, 0.0, 0.0, 0.0];

        assert_eq!(strain_matrix_rank(&[]), 0);
        assert_eq!(strain_matrix_rank(&[e1, e2]), 2);
        assert_eq!(strain_matrix_rank(&[e1, e2, sum]), 2);
    }

    #[test]
    fn test_fit_rank_deficient_returns_none() {
        // 只有单轴应变：秩 1，无法确定 36 个常数
        let c_ref = cubic_c(166.0, 64.0, 80.0);
        let mut strains = Vec::new();
        let mut stresses = Vec::new();
        for &mag in &[-0.01, -0.005, 0.005, 0.01, 0.02, 0.03] {
            let e = [mag, 0.0, 0.0, 0.0, 0.0, 0.0];
            strains.push(e);
            stresses.push(apply_c(&c_ref, &e));
        }

        assert!(fit_elastic_tensor(&strains, &stresses).is_none());
    }

    #[test]
    fn test_vrh_isotropic_limit() {
        // 各向同性：c11 = c12 + 2*c44
        let c = cubic_c(160.0, 80.0, 40.0);
        let props = vrh_averages(&c).unwrap();

        // K = (c11 + 2 c12)/3, G = c44
        assert_relative_eq!(props.k_vrh, (160.0 + 2.0 * 80.0) / 3.0, epsilon = 1e-9);
        assert_relative_eq!(props.g_vrh, 40.0, epsilon = 1e-9);
        assert!(props.poisson_ratio > 0.0 && props.poisson_ratio < 0.5);
    }

    #[test]
    fn test_compliance_units() {
        let c = cubic_c(100.0, 50.0, 25.0);
        let s = compliance_tensor(&c).unwrap();

        // S·C/1000 应为恒等
        let mut prod = [[0.0; 6]; 6];
        for i in 0..6 {
            for j in 0..6 {
                for k in 0..6 {
                    prod[i][j] += s[i][k] / 1000.0 * c[k][j];
                }
            }
        }
        for (i, row) in prod.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(*v, expected, epsilon = 1e-9);
            }
        }
    }
}
