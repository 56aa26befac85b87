//! # 声子构建器
//!
//! DDB 文本文档 → 外部 `anaddb` 风格工具子进程 → 声子频带文档。
//! DDB 内容在任务文档中按原样存为字符串，这里落盘为临时文件后
//! 交给外部命令处理。
//!
//! ## 子进程契约
//! 外部命令带显式超时：轮询退出状态，超时后杀死进程并返回
//! `CommandTimeout`。单条失败由构建驱动捕获记录，不中止批次。
//!
//! ## 依赖关系
//! - 被 `commands/build.rs` 使用
//! - 使用 `error/` 的外部命令错误变体

use crate::builders::{Builder, BuilderConfig};
use crate::error::{MatpipeError, Result};
use crate::store::DocStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// 子进程退出状态轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// DDB 源文档：材料标识 + 原样存储的 DDB 文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdbDoc {
    pub material_id: String,
    /// DDB 文件内容（文本块）
    pub ddb: String,
}

/// 声子频带文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhononDoc {
    /// 材料标识
    pub material_id: String,
    /// 最低声子频率 (cm⁻¹)
    pub min_frequency: f64,
    /// 最高声子频率 (cm⁻¹)
    pub max_frequency: f64,
    /// 模式总数
    pub num_modes: usize,
    /// 是否存在虚频（动力学不稳定）
    pub has_imaginary: bool,
    /// 全部频率
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frequencies: Vec<f64>,
    /// 文档更新时间
    pub last_updated: DateTime<Utc>,
}

/// 运行外部命令并限时等待，返回标准输出
///
/// 超时后杀死子进程；命令缺失与非零退出分别映射为专用错误。
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<String> {
    let program = command.get_program().to_string_lossy().to_string();

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MatpipeError::CommandNotFound {
                    command: program.clone(),
                }
            } else {
                MatpipeError::CommandFailed {
                    command: program.clone(),
                    stderr: e.to_string(),
                }
            }
        })?;

    let start = Instant::now();
    loop {
        let status = child.try_wait().map_err(|e| MatpipeError::CommandFailed {
            command: program.clone(),
            stderr: e.to_string(),
        })?;

        match status {
            Some(status) => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    let _ = pipe.read_to_string(&mut stdout);
                }
                if !status.success() {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr);
                    }
                    return Err(MatpipeError::CommandFailed {
                        command: program,
                        stderr,
                    });
                }
                return Ok(stdout);
            }
            None => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(MatpipeError::CommandTimeout {
                        command: program,
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// 从工具输出中提取全部可解析为数值的记号作为频率表
pub fn parse_frequencies(output: &str) -> Vec<f64> {
    output
        .split_whitespace()
        .filter_map(|tok| tok.parse::<f64>().ok())
        .collect()
}

/// 声子构建器：逐条驱动外部工具
pub struct PhononBuilder<S: DocStore> {
    ddb_docs: Vec<DdbDoc>,
    /// 外部工具命令名
    command: String,
    /// 临时 DDB 文件落盘目录
    workdir: PathBuf,
    target: S,
    config: BuilderConfig,
}

impl<S: DocStore> PhononBuilder<S> {
    pub fn new(
        ddb_docs: Vec<DdbDoc>,
        command: impl Into<String>,
        workdir: impl Into<PathBuf>,
        target: S,
        config: &BuilderConfig,
    ) -> Self {
        PhononBuilder {
            ddb_docs,
            command: command.into(),
            workdir: workdir.into(),
            target,
            config: config.clone(),
        }
    }

    pub fn into_target(self) -> S {
        self.target
    }
}

impl<S: DocStore> Builder for PhononBuilder<S> {
    type Item = DdbDoc;
    type Doc = PhononDoc;

    fn name(&self) -> &str {
        "phonon"
    }

    fn get_items(&mut self) -> Result<Vec<DdbDoc>> {
        let mut docs = self.ddb_docs.clone();
        docs.sort_by(|a, b| a.material_id.cmp(&b.material_id));
        Ok(docs)
    }

    fn process_item(&self, item: &DdbDoc) -> Result<Option<PhononDoc>> {
        let ddb_path = self
            .workdir
            .join(format!("{}_{}.ddb", item.material_id, std::process::id()));
        std::fs::write(&ddb_path, &item.ddb).map_err(|e| MatpipeError::FileWriteError {
            path: ddb_path.display().to_string(),
            source: e,
        })?;

        let result = run_with_timeout(
            Command::new(&self.command).arg(&ddb_path),
            Duration::from_secs(self.config.subprocess_timeout_secs),
        );
        let _ = std::fs::remove_file(&ddb_path);
        let output = result?;

        let frequencies = parse_frequencies(&output);
        let (Some(&min), Some(&max)) = (
            frequencies
                .iter()
                .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)),
            frequencies
                .iter()
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)),
        ) else {
            // 工具没有产出频率表
            return Ok(None);
        };

        Ok(Some(PhononDoc {
            material_id: item.material_id.clone(),
            min_frequency: min,
            max_frequency: max,
            num_modes: frequencies.len(),
            has_imaginary: min < 0.0,
            frequencies,
            last_updated: Utc::now(),
        }))
    }

    fn update_targets(&mut self, docs: Vec<PhononDoc>) -> Result<()> {
        let values: Vec<serde_json::Value> = docs
            .into_iter()
            .map(|d| {
                serde_json::to_value(d).map_err(|e| MatpipeError::JsonError {
                    path: "<phonon doc>".to_string(),
                    source: e,
                })
            })
            .collect::<Result<_>>()?;
        self.target.update(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::run_builder;
    use crate::store::MemStore;
    use std::collections::BTreeMap;

    #[test]
    fn test_run_with_timeout_success() {
        let out = run_with_timeout(
            Command::new("echo").arg("120.5 340.0 -12.5"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(parse_frequencies(&out), vec![120.5, 340.0, -12.5]);
    }

    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let err = run_with_timeout(
            Command::new("sleep").arg("30"),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, MatpipeError::CommandTimeout { .. }));
    }

    #[test]
    fn test_missing_command_is_reported() {
        let err = run_with_timeout(
            &mut Command::new("matpipe-no-such-tool"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, MatpipeError::CommandNotFound { .. }));
    }

    #[test]
    fn test_failing_command_is_reported() {
        let err =
            run_with_timeout(&mut Command::new("false"), Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MatpipeError::CommandFailed { .. }));
    }

    #[test]
    fn test_builder_parses_tool_output() {
        // cat 原样回显 DDB 内容，充当最小化的外部工具
        let tmp = tempfile::tempdir().unwrap();
        let ddb_docs = vec![
            DdbDoc {
                material_id: "mp-1".to_string(),
                ddb: "-30.0 100.0 250.0".to_string(),
            },
            DdbDoc {
                material_id: "mp-2".to_string(),
                ddb: "50.0 80.0".to_string(),
            },
        ];

        let mut builder = PhononBuilder::new(
            ddb_docs,
            "cat",
            tmp.path(),
            MemStore::new(&["material_id"]),
            &BuilderConfig::default(),
        );
        let report = run_builder(&mut builder).unwrap();
        assert_eq!(report.processed, 2);

        let values = builder.into_target().query(&BTreeMap::new()).unwrap();
        let doc: PhononDoc = values
            .iter()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .find(|d: &PhononDoc| d.material_id == "mp-1")
            .unwrap();
        assert_eq!(doc.min_frequency, -30.0);
        assert_eq!(doc.max_frequency, 250.0);
        assert_eq!(doc.num_modes, 3);
        assert!(doc.has_imaginary);
    }

    #[test]
    fn test_failed_items_do_not_abort_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let ddb_docs = vec![DdbDoc {
            material_id: "mp-1".to_string(),
            ddb: "x".to_string(),
        }];

        // 不存在的工具：条目失败但批次完成
        let mut builder = PhononBuilder::new(
            ddb_docs,
            "matpipe-no-such-tool",
            tmp.path(),
            MemStore::new(&["material_id"]),
            &BuilderConfig::default(),
        );
        let report = run_builder(&mut builder).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 1);
    }
}
