//! # 结构与张量匹配
//!
//! 弹性与缺陷管线的两类近似匹配：
//! - `StructureMatcher`: 成分 + 晶格 + 位点对应的结构等价判定
//! - `TensorMapping`: 以 3×3 矩阵为键、容差比较的贪心关联表
//!
//! ## 注意
//! 容差比较不具传递性：贪心策略把每个新键归入第一个命中的代表元，
//! 代表元链上的两端可能超出容差。分组结果依赖插入顺序。
//!
//! ## 依赖关系
//! - 被 `builders/elasticity.rs`, `builders/defects.rs` 使用
//! - 使用 `models/structure.rs`

use crate::models::structure::{matrices_allclose, Structure};

/// 结构匹配器
#[derive(Debug, Clone)]
pub struct StructureMatcher {
    /// 晶格矩阵逐元素容差 (Å)
    pub lattice_tol: f64,
    /// 分数坐标容差
    pub site_tol: f64,
}

impl Default for StructureMatcher {
    fn default() -> Self {
        StructureMatcher {
            lattice_tol: 1e-3,
            site_tol: 1e-3,
        }
    }
}

impl StructureMatcher {
    pub fn new(lattice_tol: f64, site_tol: f64) -> Self {
        StructureMatcher {
            lattice_tol,
            site_tol,
        }
    }

    /// 两结构是否等价：成分相同、晶格接近、位点一一对应
    pub fn matches(&self, a: &Structure, b: &Structure) -> bool {
        if a.composition() != b.composition() {
            return false;
        }
        if !a.lattice.allclose(&b.lattice, self.lattice_tol) {
            return false;
        }
        self.sites_correspond(a, b)
    }

    /// 缺陷变体：允许位点数相差至多 1（空位/间隙），其余位点仍须对应
    pub fn matches_with_defect(&self, defective: &Structure, bulk: &Structure) -> bool {
        let diff = defective.num_sites() as i64 - bulk.num_sites() as i64;
        if diff.abs() > 1 {
            return false;
        }
        if !defective.lattice.allclose(&bulk.lattice, self.lattice_tol * 10.0) {
            return false;
        }

        // 小结构的每个位点都应在大结构中找到对应
        let (small, large) = if defective.num_sites() <= bulk.num_sites() {
            (defective, bulk)
        } else {
            (bulk, defective)
        };

        let mut used = vec![false; large.sites.len()];
        for site in &small.sites {
            let found = large.sites.iter().enumerate().find(|(i, other)| {
                !used[*i]
                    && other.element == site.element
                    && frac_close(site.position, other.position, self.site_tol * 10.0)
            });
            match found {
                Some((i, _)) => used[i] = true,
                None => return false,
            }
        }
        true
    }

    /// 位点一一对应（同元素、分数坐标模 1 接近）
    fn sites_correspond(&self, a: &Structure, b: &Structure) -> bool {
        if a.num_sites() != b.num_sites() {
            return false;
        }
        let mut used = vec![false; b.sites.len()];
        for site in &a.sites {
            let found = b.sites.iter().enumerate().find(|(i, other)| {
                !used[*i]
                    && other.element == site.element
                    && frac_close(site.position, other.position, self.site_tol)
            });
            match found {
                Some((i, _)) => used[i] = true,
                None => return false,
            }
        }
        true
    }
}

/// 分数坐标比较（考虑周期镜像）
pub fn frac_close(a: [f64; 3], b: [f64; 3], tol: f64) -> bool {
    (0..3).all(|i| {
        let d = (a[i] - b[i]).rem_euclid(1.0);
        d.min(1.0 - d) <= tol
    })
}

/// 以 3×3 矩阵为键的贪心关联表
///
/// 查找按插入顺序扫描，返回首个容差内命中的条目。
#[derive(Debug, Clone)]
pub struct TensorMapping<V> {
    tol: f64,
    entries: Vec<([[f64; 3]; 3], V)>,
}

impl<V> TensorMapping<V> {
    pub fn new(tol: f64) -> Self {
        TensorMapping {
            tol,
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &[[f64; 3]; 3]) -> Option<&V> {
        self.entries
            .iter()
            .find(|(k, _)| matrices_allclose(k, key, self.tol))
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &[[f64; 3]; 3]) -> Option<&mut V> {
        let tol = self.tol;
        self.entries
            .iter_mut()
            .find(|(k, _)| matrices_allclose(k, key, tol))
            .map(|(_, v)| v)
    }

    /// 插入：键已存在（容差内）则覆盖其值，保留原代表键
    pub fn insert(&mut self, key: [[f64; 3]; 3], value: V) {
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn contains_key(&self, key: &[[f64; 3]; 3]) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[[f64; 3]; 3], &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}
