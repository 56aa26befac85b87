//! # 参考输入集
//!
//! 校验引擎比对用的规范输入参数集合，按任务类型给出期望值，
//! 并提供按实际 ENCUT 计算最小 FFT 网格的例程。
//!
//! ## 依赖关系
//! - 被 `validate/incar.rs` 使用
//! - 使用 `models/calculation.rs`, `models/structure.rs`

use crate::models::calculation::TaskType;
use crate::models::structure::Lattice;

/// 规范输入参数集
#[derive(Debug, Clone)]
pub struct ReferenceInputSet {
    /// 平面波截断能下限 (eV)
    pub encut: f64,
    /// 电子收敛阈值上限 (eV)
    pub ediff: f64,
    /// 力收敛阈值 (eV/Å)，EDIFFG 为负时的判据
    pub ediffg_force: f64,
    /// 展宽上限 (eV)，高斯/费米展宽下的非金属判据
    pub sigma_max: f64,
    /// 非金属允许的 ISMEAR 值
    pub ismear_nonmetal: &'static [i64],
    /// 金属允许的 ISMEAR 值
    pub ismear_metal: &'static [i64],
    /// 允许的 ALGO 值（大写）
    pub algo_allowed: &'static [&'static str],
    /// 允许的 ISYM 值
    pub isym_allowed: &'static [i64],
    /// 自洽计算允许的 ICHARG 值
    pub icharg_scf: &'static [i64],
    /// 非自洽计算允许的 ICHARG 值（+10 表示固定电荷密度）
    pub icharg_nscf: &'static [i64],
    /// 电子步数上限 NELM 的下限
    pub nelm_min: i64,
    /// 允许的 LORBIT 值
    pub lorbit_allowed: &'static [i64],
    /// 每倒易原子最少 k 点数（k 点数 × 位点数）
    pub kppra_min: f64,
}

impl ReferenceInputSet {
    /// 按任务类型取参考集
    pub fn for_task_type(task_type: TaskType) -> ReferenceInputSet {
        let base = ReferenceInputSet {
            encut: 520.0,
            ediff: 1e-4,
            ediffg_force: 0.05,
            sigma_max: 0.05,
            ismear_nonmetal: &[-5, -4, -2, -1, 0],
            ismear_metal: &[-5, 0, 1, 2],
            algo_allowed: &["NORMAL", "FAST", "ALL", "DAMPED"],
            isym_allowed: &[-1, 0, 1, 2],
            icharg_scf: &[0, 1, 2, 4],
            icharg_nscf: &[0, 1, 2, 4, 11, 12],
            nelm_min: 60,
            lorbit_allowed: &[0, 1, 2, 5, 10, 11, 12],
            kppra_min: 900.0,
        };

        match task_type {
            // 静态/NSCF 用更严的电子收敛
            TaskType::Static | TaskType::NscfLine | TaskType::NscfUniform => ReferenceInputSet {
                ediff: 1e-5,
                ..base
            },
            _ => base,
        }
    }

    /// 按实际 ENCUT 计算最小 FFT 网格（密度网格，波函数截断的两倍）
    ///
    /// G_cut = sqrt(ENCUT/Ry)/a₀ (rad/Å)；轴向点数取
    /// ceil(4·G_cut·a_i/2π) 并上调到偶数。
    pub fn minimal_fft_grid(&self, encut: f64, lattice: &Lattice) -> [u32; 3] {
        const RYTOEV: f64 = 13.605826;
        const AUTOA: f64 = 0.529177249;
        let g_cut = (encut / RYTOEV).sqrt() / AUTOA;

        let (a, b, c, _, _, _) = lattice.parameters();
        let mut grid = [0u32; 3];
        for (i, len) in [a, b, c].into_iter().enumerate() {
            let n = (4.0 * g_cut * len / (2.0 * std::f64::consts::PI)).ceil() as u32;
            grid[i] = if n % 2 == 0 { n } else { n + 1 };
        }
        grid
    }
}
