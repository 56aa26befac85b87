//! # INCAR 校验规则
//!
//! 每条规则为纯函数 `fn(&CheckContext) -> Vec<Finding>`，由调用方
//! 拼接结果；规则之间无共享状态，可单独测试。
//!
//! ## 约定
//! - 阻断性问题产出 Reason，提示性问题产出 Warning
//! - 可选数据缺失从不报错，必要时降级为提示
//! - Reason 文案以 "INPUT SETTINGS --> {TAG}" 开头
//!
//! ## 依赖关系
//! - 被 `validate/mod.rs` 使用
//! - 使用 `validate/refset.rs`, `models/{task,calculation}.rs`

use crate::models::calculation::{
    param_bool, param_f64, param_i64, param_str, IonicStep, Kpoints, Parameters, TaskType,
};
use crate::models::task::TaskDoc;
use crate::validate::refset::ReferenceInputSet;
use crate::validate::ValidateConfig;

/// 单条校验发现
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// 阻断性问题：文档不可用于下游
    Reason(String),
    /// 提示性问题
    Warning(String),
}

/// 一次校验的输入上下文（全部借用自任务文档）
pub struct CheckContext<'a> {
    /// VASP 规范化后的有效参数
    pub parameters: &'a Parameters,
    /// 用户 INCAR 文件原样内容
    pub incar: &'a Parameters,
    /// 输出带隙 (eV)；缺失时跳过依赖带隙的判定
    pub bandgap: Option<f64>,
    /// 最终结构位点数
    pub n_sites: Option<usize>,
    /// 离子步轨迹
    pub ionic_steps: &'a [IonicStep],
    /// KPOINTS 描述；缺失时跳过 k 点密度判定
    pub kpoints: Option<&'a Kpoints>,
    pub task_type: TaskType,
    pub refset: &'a ReferenceInputSet,
    pub config: &'a ValidateConfig,
}

impl CheckContext<'_> {
    /// 带隙高于数值阈值视为非金属
    fn is_nonmetal(&self) -> Option<bool> {
        self.bandgap.map(|gap| gap > 1e-4)
    }

    /// 有效参数优先，INCAR 兜底
    fn tag_f64(&self, tag: &str) -> Option<f64> {
        param_f64(self.parameters, tag).or_else(|| param_f64(self.incar, tag))
    }

    fn tag_i64(&self, tag: &str) -> Option<i64> {
        param_i64(self.parameters, tag).or_else(|| param_i64(self.incar, tag))
    }
}

// ─────────────────────────────────────────────────────────────
// 三个通用判定原语
// ─────────────────────────────────────────────────────────────

/// 等值判定：actual 应等于 expected（allow_close 时用相对容差）
pub fn required(tag: &str, actual: f64, expected: f64, allow_close: bool) -> Option<Finding> {
    let ok = if allow_close {
        (actual - expected).abs() <= expected.abs().max(1.0) * 1e-2
    } else {
        actual == expected
    };
    (!ok).then(|| {
        Finding::Reason(format!(
            "INPUT SETTINGS --> {}: set to {}, but should be {}.",
            tag, actual, expected
        ))
    })
}

/// 集合判定：actual 应属于 allowed
pub fn allowed(tag: &str, actual: i64, allowed_set: &[i64]) -> Option<Finding> {
    (!allowed_set.contains(&actual)).then(|| {
        Finding::Reason(format!(
            "INPUT SETTINGS --> {}: set to {}, but should be one of {:?}.",
            tag, actual, allowed_set
        ))
    })
}

/// 比较方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    AtMost,
    AtLeast,
}

/// 不等式判定
pub fn relative(tag: &str, actual: f64, bound: f64, direction: Bound) -> Option<Finding> {
    let (ok, op) = match direction {
        Bound::AtMost => (actual <= bound, "<="),
        Bound::AtLeast => (actual >= bound, ">="),
    };
    (!ok).then(|| {
        Finding::Reason(format!(
            "INPUT SETTINGS --> {}: set to {}, but should be {} {}.",
            tag, actual, op, bound
        ))
    })
}

// ─────────────────────────────────────────────────────────────
// 具体规则
// ─────────────────────────────────────────────────────────────

/// ISMEAR：非金属禁用正值展宽
pub fn check_ismear(ctx: &CheckContext) -> Vec<Finding> {
    let Some(ismear) = ctx.tag_i64("ISMEAR") else {
        return Vec::new();
    };
    let findings = match ctx.is_nonmetal() {
        Some(true) => allowed("ISMEAR", ismear, ctx.refset.ismear_nonmetal),
        Some(false) => allowed("ISMEAR", ismear, ctx.refset.ismear_metal),
        None => None,
    };
    findings.into_iter().collect()
}

/// SIGMA：高斯/费米展宽下非金属限制展宽宽度；四面体法忽略 SIGMA
pub fn check_sigma(ctx: &CheckContext) -> Vec<Finding> {
    let ismear = ctx.tag_i64("ISMEAR").unwrap_or(1);
    if ismear <= -4 {
        return Vec::new();
    }
    let Some(sigma) = ctx.tag_f64("SIGMA") else {
        return Vec::new();
    };
    if ctx.is_nonmetal() != Some(true) {
        return Vec::new();
    }
    relative("SIGMA", sigma, ctx.refset.sigma_max, Bound::AtMost)
        .into_iter()
        .collect()
}

/// SIGMA 熵项：任一电子步 |T·S|/位点数超过 1 meV/atom 即说明展宽过宽
pub fn check_sigma_entropy(ctx: &CheckContext) -> Vec<Finding> {
    let Some(n_sites) = ctx.n_sites.filter(|&n| n > 0) else {
        return Vec::new();
    };

    let max_entropy = ctx
        .ionic_steps
        .iter()
        .flat_map(|step| step.electronic_steps.iter())
        .filter_map(|e| e.eentropy)
        .map(f64::abs)
        .fold(0.0f64, f64::max);

    let per_atom = max_entropy / n_sites as f64;
    if per_atom > ctx.config.entropy_per_atom_max {
        vec![Finding::Reason(format!(
            "INPUT SETTINGS --> SIGMA: entropy term T*S of {:.4} eV/atom exceeds {:.4} eV/atom, smearing is too wide.",
            per_atom, ctx.config.entropy_per_atom_max
        ))]
    } else {
        Vec::new()
    }
}

/// ENCUT：截断能不得低于参考集
pub fn check_encut(ctx: &CheckContext) -> Vec<Finding> {
    let Some(enmax) = ctx.tag_f64("ENMAX").or_else(|| ctx.tag_f64("ENCUT")) else {
        return vec![Finding::Warning(
            "TaskDoc does not contain an ENCUT/ENMAX value!".to_string(),
        )];
    };
    relative("ENCUT", enmax, ctx.refset.encut, Bound::AtLeast)
        .into_iter()
        .collect()
}

/// EDIFF：电子收敛阈值不得松于参考集
pub fn check_ediff(ctx: &CheckContext) -> Vec<Finding> {
    let Some(ediff) = ctx.tag_f64("EDIFF") else {
        return Vec::new();
    };
    relative("EDIFF", ediff, ctx.refset.ediff, Bound::AtMost)
        .into_iter()
        .collect()
}

/// 收敛性：末态力收敛或最后两离子步能量收敛，二者取或
///
/// 不同参考集用力或能量形式的 EDIFFG，单独检查任一判据都会误报。
pub fn check_convergence(ctx: &CheckContext) -> Vec<Finding> {
    if ctx.task_type == TaskType::Static || ctx.task_type == TaskType::MolecularDynamics {
        return Vec::new();
    }
    if ctx.ionic_steps.is_empty() {
        return vec![Finding::Warning(
            "TaskDoc does not contain ionic steps, convergence not checked!".to_string(),
        )];
    }

    let force_limit = match ctx.tag_f64("EDIFFG") {
        Some(e) if e < 0.0 => e.abs(),
        _ => ctx.refset.ediffg_force,
    };

    let force_converged = match ctx.ionic_steps.last() {
        Some(step) if !step.forces.is_empty() => step
            .forces
            .iter()
            .map(|f| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
            .all(|norm| norm <= force_limit),
        _ => false,
    };

    let energy_limit = match ctx.tag_f64("EDIFFG") {
        Some(e) if e > 0.0 => e,
        _ => ctx.tag_f64("EDIFF").unwrap_or(ctx.refset.ediff) * 10.0,
    };
    let n = ctx.ionic_steps.len();
    let energy_converged = n >= 2
        && (ctx.ionic_steps[n - 1].energy - ctx.ionic_steps[n - 2].energy).abs() <= energy_limit;

    if ctx.ionic_steps.last().map(|s| s.forces.is_empty()).unwrap_or(true) {
        return vec![Finding::Warning(
            "TaskDoc does not contain output forces!".to_string(),
        )];
    }

    if force_converged || energy_converged {
        Vec::new()
    } else {
        vec![Finding::Reason(format!(
            "CONVERGENCE --> neither force (<= {} eV/A) nor energy (<= {} eV) criterion met.",
            force_limit, energy_limit
        ))]
    }
}

/// NBANDS：带数需覆盖电子数且不过度冗余
pub fn check_nbands(ctx: &CheckContext) -> Vec<Finding> {
    let (Some(nbands), Some(nelect)) = (ctx.tag_i64("NBANDS"), ctx.tag_f64("NELECT")) else {
        return Vec::new();
    };
    let min_bands = (nelect / 2.0).ceil() as i64;
    let max_bands = (min_bands * 4).max(min_bands + 4);

    if nbands < min_bands || nbands > max_bands {
        vec![Finding::Reason(format!(
            "INPUT SETTINGS --> NBANDS: set to {}, but should be between {} and {}.",
            nbands, min_bands, max_bands
        ))]
    } else {
        Vec::new()
    }
}

/// LREAL：用户 INCAR 显式开启实空间投影会损失精度
///
/// 只看 incar 文件层：VASP 会把 parameters 里的 LREAL 规范化，
/// 无法区分用户意图。
pub fn check_lreal(ctx: &CheckContext) -> Vec<Finding> {
    match ctx.incar.get("LREAL").and_then(|v| v.as_bool()) {
        Some(true) => vec![Finding::Reason(
            "INPUT SETTINGS --> LREAL: set to True, but should be False.".to_string(),
        )],
        _ => Vec::new(),
    }
}

/// LMAXMIX：SCF 计算里错误值只降低效率，NSCF 里破坏电荷密度读取
pub fn check_lmaxmix(ctx: &CheckContext) -> Vec<Finding> {
    let Some(lmaxmix) = ctx.tag_i64("LMAXMIX") else {
        return Vec::new();
    };
    if lmaxmix >= 2 {
        return Vec::new();
    }

    let message = format!(
        "INPUT SETTINGS --> LMAXMIX: set to {}, but should be >= 2.",
        lmaxmix
    );
    let is_nscf = matches!(ctx.task_type, TaskType::NscfLine | TaskType::NscfUniform);
    if is_nscf {
        vec![Finding::Reason(message)]
    } else {
        vec![Finding::Warning(message)]
    }
}

/// FFT 网格：仅当用户显式设置 NG* 标签时检查
///
/// 期望网格按实际 ENCUT（可能高于参考集）计算，再乘容差系数。
pub fn check_fft_grid(ctx: &CheckContext, structure_lattice: Option<&crate::models::structure::Lattice>) -> Vec<Finding> {
    const TAGS: [&str; 6] = ["NGX", "NGY", "NGZ", "NGXF", "NGYF", "NGZF"];
    let user_set: Vec<&str> = TAGS
        .iter()
        .copied()
        .filter(|t| ctx.incar.contains_key(*t))
        .collect();
    if user_set.is_empty() {
        return Vec::new();
    }
    let Some(lattice) = structure_lattice else {
        return vec![Finding::Warning(
            "TaskDoc does not contain a structure, FFT grid not checked!".to_string(),
        )];
    };
    let encut = ctx
        .tag_f64("ENMAX")
        .or_else(|| ctx.tag_f64("ENCUT"))
        .unwrap_or(ctx.refset.encut);
    let minimal = ctx.refset.minimal_fft_grid(encut, lattice);

    let mut findings = Vec::new();
    for tag in user_set {
        let axis = match tag.chars().nth(2) {
            Some('X') => 0,
            Some('Y') => 1,
            _ => 2,
        };
        let value = ctx.tag_i64(tag).unwrap_or(0);
        let floor = (minimal[axis] as f64 * ctx.config.fft_grid_tolerance) as i64;
        if value < floor {
            findings.push(Finding::Reason(format!(
                "INPUT SETTINGS --> {}: set to {}, but should be at least {}.",
                tag, value, floor
            )));
        }
    }
    findings
}

/// ISPIN 取值
pub fn check_ispin(ctx: &CheckContext) -> Vec<Finding> {
    match ctx.tag_i64("ISPIN") {
        Some(ispin) => allowed("ISPIN", ispin, &[1, 2]).into_iter().collect(),
        None => Vec::new(),
    }
}

/// ALGO 取值
pub fn check_algo(ctx: &CheckContext) -> Vec<Finding> {
    let Some(algo) = param_str(ctx.parameters, "ALGO").or_else(|| param_str(ctx.incar, "ALGO"))
    else {
        return Vec::new();
    };
    let upper = algo.trim().to_uppercase();
    if ctx.refset.algo_allowed.contains(&upper.as_str()) {
        Vec::new()
    } else {
        vec![Finding::Reason(format!(
            "INPUT SETTINGS --> ALGO: set to {}, but should be one of {:?}.",
            algo, ctx.refset.algo_allowed
        ))]
    }
}

/// ISYM 取值
pub fn check_isym(ctx: &CheckContext) -> Vec<Finding> {
    match ctx.tag_i64("ISYM") {
        Some(isym) => allowed("ISYM", isym, ctx.refset.isym_allowed)
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

/// LASPH：meta-GGA 必须开启非球形梯度修正
pub fn check_lasph(ctx: &CheckContext) -> Vec<Finding> {
    let has_metagga = param_str(ctx.parameters, "METAGGA")
        .map(|m| {
            let tag = m.trim().to_uppercase();
            !tag.is_empty() && tag != "NONE"
        })
        .unwrap_or(false);
    if !has_metagga {
        return Vec::new();
    }
    match param_bool(ctx.parameters, "LASPH") {
        Some(false) | None => vec![Finding::Reason(
            "INPUT SETTINGS --> LASPH: set to False, but should be True for meta-GGA runs."
                .to_string(),
        )],
        Some(true) => Vec::new(),
    }
}

/// POTIM：弛豫步长过大提示
pub fn check_potim(ctx: &CheckContext) -> Vec<Finding> {
    if ctx.task_type != TaskType::StructureOptimization {
        return Vec::new();
    }
    match ctx.tag_f64("POTIM") {
        Some(potim) if potim > 0.5 => vec![Finding::Warning(format!(
            "INPUT SETTINGS --> POTIM: set to {}, large step sizes can destabilize relaxations.",
            potim
        ))],
        _ => Vec::new(),
    }
}

/// ICHARG：自洽计算不得使用 +10 的固定密度模式，取值须合法
pub fn check_icharg(ctx: &CheckContext) -> Vec<Finding> {
    let Some(icharg) = ctx.tag_i64("ICHARG") else {
        return Vec::new();
    };
    let is_nscf = matches!(ctx.task_type, TaskType::NscfLine | TaskType::NscfUniform);
    let allowed_set = if is_nscf {
        ctx.refset.icharg_nscf
    } else {
        ctx.refset.icharg_scf
    };
    allowed("ICHARG", icharg, allowed_set).into_iter().collect()
}

/// NELM：电子步数上限过低时 SCF 无法收敛
pub fn check_nelm(ctx: &CheckContext) -> Vec<Finding> {
    let Some(nelm) = ctx.tag_i64("NELM") else {
        return Vec::new();
    };
    relative(
        "NELM",
        nelm as f64,
        ctx.refset.nelm_min as f64,
        Bound::AtLeast,
    )
    .into_iter()
    .collect()
}

/// LORBIT 取值
pub fn check_lorbit(ctx: &CheckContext) -> Vec<Finding> {
    match ctx.tag_i64("LORBIT") {
        Some(lorbit) => allowed("LORBIT", lorbit, ctx.refset.lorbit_allowed)
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

/// k 点密度：k 点数 × 位点数不得低于参考下限
///
/// 线模式按高对称路径取点，密度判定不适用。
pub fn check_kpoint_density(ctx: &CheckContext) -> Vec<Finding> {
    let (Some(kpoints), Some(n_sites)) = (ctx.kpoints, ctx.n_sites.filter(|&n| n > 0)) else {
        return Vec::new();
    };
    if kpoints.is_line_mode() {
        return Vec::new();
    }
    let num_kpoints = match kpoints.grid {
        Some(grid) => grid.iter().map(|&n| n as u64).product::<u64>(),
        None => kpoints.num_kpoints as u64,
    };
    if num_kpoints == 0 {
        return Vec::new();
    }

    let kppra = num_kpoints as f64 * n_sites as f64;
    if kppra < ctx.refset.kppra_min {
        vec![Finding::Reason(format!(
            "INPUT SETTINGS --> KPOINTS: {} k-points per reciprocal atom, but should be at least {}.",
            kppra, ctx.refset.kppra_min
        ))]
    } else {
        Vec::new()
    }
}

/// 全部规则，按固定顺序执行
pub fn run_all_checks(doc: &TaskDoc, refset: &ReferenceInputSet, config: &ValidateConfig) -> Vec<Finding> {
    let empty_params = Parameters::new();
    let input = doc.first_input_set();
    let (parameters, incar) = match input {
        Some(input) => (&input.parameters, &input.incar),
        None => (&empty_params, &empty_params),
    };

    let ctx = CheckContext {
        parameters,
        incar,
        bandgap: doc.output.bands.as_ref().map(|b| b.bandgap),
        n_sites: doc.output.structure.as_ref().map(|s| s.num_sites()),
        ionic_steps: &doc.output.ionic_steps,
        kpoints: input.and_then(|i| i.kpoints.as_ref()),
        task_type: doc.task_type,
        refset,
        config,
    };
    let lattice = doc.output.structure.as_ref().map(|s| &s.lattice);

    let mut findings = Vec::new();
    findings.extend(check_ismear(&ctx));
    findings.extend(check_sigma(&ctx));
    findings.extend(check_sigma_entropy(&ctx));
    findings.extend(check_encut(&ctx));
    findings.extend(check_ediff(&ctx));
    findings.extend(check_convergence(&ctx));
    findings.extend(check_nbands(&ctx));
    findings.extend(check_lreal(&ctx));
    findings.extend(check_lmaxmix(&ctx));
    findings.extend(check_fft_grid(&ctx, lattice));
    findings.extend(check_ispin(&ctx));
    findings.extend(check_algo(&ctx));
    findings.extend(check_isym(&ctx));
    findings.extend(check_lasph(&ctx));
    findings.extend(check_potim(&ctx));
    findings.extend(check_icharg(&ctx));
    findings.extend(check_nelm(&ctx));
    findings.extend(check_lorbit(&ctx));
    findings.extend(check_kpoint_density(&ctx));
    findings
}
