//! # 晶体结构数据模型
//!
//! 定义统一的晶体结构表示，供解析器、匹配器和构建器使用。
//!
//! ## 依赖关系
//! - 被 `parsers/`, `matching/`, `tensor/`, `builders/` 使用
//! - 无外部模块依赖

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 晶格参数表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    /// 晶格向量矩阵 (3x3)，行向量表示 a, b, c
    /// [[a1, a2, a3], [b1, b2, b3], [c1, c2, c3]]
    pub matrix: [[f64; 3]; 3],
}

impl Lattice {
    /// 从晶格向量矩阵创建
    pub fn from_vectors(matrix: [[f64; 3]; 3]) -> Self {
        Lattice { matrix }
    }

    /// 从晶格参数 (a, b, c, alpha, beta, gamma) 创建晶格
    /// 角度单位：度
    pub fn from_parameters(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        let alpha_rad = alpha.to_radians();
        let beta_rad = beta.to_radians();
        let gamma_rad = gamma.to_radians();

        let cos_alpha = alpha_rad.cos();
        let cos_beta = beta_rad.cos();
        let cos_gamma = gamma_rad.cos();
        let sin_gamma = gamma_rad.sin();

        let a_vec = [a, 0.0, 0.0];
        let b_vec = [b * cos_gamma, b * sin_gamma, 0.0];

        let c1 = c * cos_beta;
        let c2 = c * (cos_alpha - cos_beta * cos_gamma) / sin_gamma;
        let c3 = (c * c - c1 * c1 - c2 * c2).sqrt();
        let c_vec = [c1, c2, c3];

        Lattice {
            matrix: [a_vec, b_vec, c_vec],
        }
    }

    /// 获取晶格参数 (a, b, c, alpha, beta, gamma)
    pub fn parameters(&self) -> (f64, f64, f64, f64, f64, f64) {
        let a_vec = self.matrix[0];
        let b_vec = self.matrix[1];
        let c_vec = self.matrix[2];

        let a = norm(&a_vec);
        let b = norm(&b_vec);
        let c = norm(&c_vec);

        let alpha = (dot(&b_vec, &c_vec) / (b * c)).acos().to_degrees();
        let beta = (dot(&a_vec, &c_vec) / (a * c)).acos().to_degrees();
        let gamma = (dot(&a_vec, &b_vec) / (a * b)).acos().to_degrees();

        (a, b, c, alpha, beta, gamma)
    }

    /// 计算晶格体积
    pub fn volume(&self) -> f64 {
        let a = self.matrix[0];
        let b = self.matrix[1];
        let c = self.matrix[2];

        a[0] * (b[1] * c[2] - b[2] * c[1]) - a[1] * (b[0] * c[2] - b[2] * c[0])
            + a[2] * (b[0] * c[1] - b[1] * c[0])
    }

    /// 度规张量 G = M·Mᵀ
    pub fn metric_tensor(&self) -> [[f64; 3]; 3] {
        let m = &self.matrix;
        let mut g = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                g[i][j] = dot(&m[i], &m[j]);
            }
        }
        g
    }

    /// 晶格矩阵的逆
    pub fn inverse(&self) -> Option<[[f64; 3]; 3]> {
        invert_3x3(&self.matrix)
    }

    /// 分数坐标转笛卡尔坐标
    pub fn frac_to_cart(&self, frac: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        [
            frac[0] * m[0][0] + frac[1] * m[1][0] + frac[2] * m[2][0],
            frac[0] * m[0][1] + frac[1] * m[1][1] + frac[2] * m[2][1],
            frac[0] * m[0][2] + frac[1] * m[1][2] + frac[2] * m[2][2],
        ]
    }

    /// 笛卡尔坐标转分数坐标
    pub fn cart_to_frac(&self, cart: [f64; 3]) -> [f64; 3] {
        match self.inverse() {
            Some(inv) => [
                cart[0] * inv[0][0] + cart[1] * inv[1][0] + cart[2] * inv[2][0],
                cart[0] * inv[0][1] + cart[1] * inv[1][1] + cart[2] * inv[2][1],
                cart[0] * inv[0][2] + cart[1] * inv[1][2] + cart[2] * inv[2][2],
            ],
            None => cart,
        }
    }

    /// 两个晶格矩阵是否在绝对容差内逐元素相等
    pub fn allclose(&self, other: &Lattice, atol: f64) -> bool {
        matrices_allclose(&self.matrix, &other.matrix, atol)
    }
}

/// 3x3 矩阵求逆（行列式过小返回 None）
pub fn invert_3x3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);

    if det.abs() < 1e-12 {
        return None;
    }

    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det,
        ],
    ])
}

/// 3x3 矩阵乘法 A·B
pub fn matmul_3x3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            for (k, b_row) in b.iter().enumerate() {
                out[i][j] += a[i][k] * b_row[j];
            }
        }
    }
    out
}

/// 3x3 矩阵转置
pub fn transpose_3x3(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = m[j][i];
        }
    }
    out
}

/// 两个 3x3 矩阵逐元素绝对容差比较
pub fn matrices_allclose(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3], atol: f64) -> bool {
    for i in 0..3 {
        for j in 0..3 {
            if (a[i][j] - b[i][j]).abs() > atol {
                return false;
            }
        }
    }
    true
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(v: &[f64; 3]) -> f64 {
    dot(v, v).sqrt()
}

/// 晶体位点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// 元素符号
    pub element: String,

    /// 分数坐标 [x, y, z]
    pub position: [f64; 3],

    /// 可选：磁矩 (μB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magmom: Option<f64>,
}

impl Site {
    pub fn new(element: impl Into<String>, position: [f64; 3]) -> Self {
        Site {
            element: element.into(),
            position,
            magmom: None,
        }
    }
}

/// 晶体结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// 结构名称
    pub name: String,

    /// 晶格
    pub lattice: Lattice,

    /// 位点列表
    pub sites: Vec<Site>,
}

impl Structure {
    pub fn new(name: impl Into<String>, lattice: Lattice, sites: Vec<Site>) -> Self {
        Structure {
            name: name.into(),
            lattice,
            sites,
        }
    }

    /// 元素计数（按元素符号字典序）
    pub fn composition(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for site in &self.sites {
            *counts.entry(site.element.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// 计算化学式（如 Na4Cl4）
    pub fn formula(&self) -> String {
        self.composition()
            .into_iter()
            .map(|(el, count)| {
                if count == 1 {
                    el
                } else {
                    format!("{}{}", el, count)
                }
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// 约化化学式（计数除以最大公约数，如 NaCl）
    pub fn reduced_formula(&self) -> String {
        let comp = self.composition();
        let divisor = comp.values().fold(0usize, |acc, &c| gcd(acc, c)).max(1);
        comp.into_iter()
            .map(|(el, count)| {
                let n = count / divisor;
                if n == 1 {
                    el
                } else {
                    format!("{}{}", el, n)
                }
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// 结构中出现的元素集合（字典序）
    pub fn elements(&self) -> Vec<String> {
        self.composition().into_keys().collect()
    }

    /// 位点数
    pub fn num_sites(&self) -> usize {
        self.sites.len()
    }

    /// 每原子体积
    pub fn volume_per_atom(&self) -> Option<f64> {
        if self.sites.is_empty() {
            return None;
        }
        Some(self.lattice.volume().abs() / self.sites.len() as f64)
    }

    /// 施加形变梯度 F：新晶格 M' = M·Fᵀ，分数坐标不变
    pub fn deformed(&self, deformation: &[[f64; 3]; 3]) -> Structure {
        let new_matrix = matmul_3x3(&self.lattice.matrix, &transpose_3x3(deformation));
        Structure {
            name: self.name.clone(),
            lattice: Lattice::from_vectors(new_matrix),
            sites: self.sites.clone(),
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
