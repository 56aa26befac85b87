//! # 晶格点群操作
//!
//! 枚举保持度规张量的整数旋转矩阵，转换为笛卡尔点群操作，
//! 用于弹性拟合中由对称性派生等价应变/应力。
//!
//! ## 约定
//! - 分数坐标操作 W 满足 Wᵀ·G·W = G（G 为度规张量）
//! - 笛卡尔操作 R = Mᵀ·W·(Mᵀ)⁻¹，对二阶张量作用为 R·T·Rᵀ
//!
//! ## 依赖关系
//! - 被 `builders/elasticity.rs` 使用
//! - 使用 `models/structure.rs`

use crate::models::structure::{invert_3x3, matmul_3x3, matrices_allclose, transpose_3x3, Lattice};

/// 度规张量比较容差（Å²）
const METRIC_TOL: f64 = 1e-5;

/// 笛卡尔点群操作（正交矩阵）
#[derive(Debug, Clone, PartialEq)]
pub struct SymmOp {
    pub rotation: [[f64; 3]; 3],
}

impl SymmOp {
    /// 对二阶张量作用：R·T·Rᵀ
    pub fn transform_tensor(&self, tensor: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
        let rt = transpose_3x3(&self.rotation);
        matmul_3x3(&matmul_3x3(&self.rotation, tensor), &rt)
    }

    /// 逆操作（正交矩阵的逆即转置）
    pub fn inverse(&self) -> SymmOp {
        SymmOp {
            rotation: transpose_3x3(&self.rotation),
        }
    }
}

/// 枚举晶格的点群操作
///
/// 候选为元素取值 {-1, 0, 1}、行列式 ±1 的整数矩阵，共 3^9 个；
/// 保留满足 Wᵀ·G·W = G 的操作。立方晶格应得到 48 个。
pub fn lattice_point_group(lattice: &Lattice) -> Vec<SymmOp> {
    let g = lattice.metric_tensor();
    let m_t = transpose_3x3(&lattice.matrix);
    let Some(m_t_inv) = invert_3x3(&m_t) else {
        return Vec::new();
    };

    let mut ops = Vec::new();
    let mut w = [[0.0f64; 3]; 3];

    // 9 个元素各取 {-1, 0, 1}
    for idx in 0..19683u32 {
        let mut rem = idx;
        for row in w.iter_mut() {
            for v in row.iter_mut() {
                *v = (rem % 3) as f64 - 1.0;
                rem /= 3;
            }
        }

        let det = det_3x3(&w);
        if (det.abs() - 1.0).abs() > 1e-9 {
            continue;
        }

        let wt_g_w = matmul_3x3(&matmul_3x3(&transpose_3x3(&w), &g), &w);
        if !matrices_allclose(&wt_g_w, &g, METRIC_TOL) {
            continue;
        }

        let rotation = matmul_3x3(&matmul_3x3(&m_t, &w), &m_t_inv);
        ops.push(SymmOp { rotation });
    }

    ops
}

fn det_3x3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
