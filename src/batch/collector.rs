//! # 任务目录收集器
//!
//! 递归扫描根目录，找出所有包含 VASP 计算产物的任务目录。
//!
//! ## 判定规则
//! 目录内存在以 `vasprun.xml` 开头的文件即视为任务目录；
//! 不再向其子目录深入（嵌套产物属于同一任务）。
//!
//! ## 依赖关系
//! - 被 `commands/parse.rs` 调用
//! - 使用 `walkdir` 遍历目录树

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 任务目录收集器
pub struct TaskDirCollector {
    /// 最大递归深度
    max_depth: usize,
}

impl Default for TaskDirCollector {
    fn default() -> Self {
        TaskDirCollector { max_depth: 8 }
    }
}

impl TaskDirCollector {
    pub fn new(max_depth: usize) -> Self {
        TaskDirCollector { max_depth }
    }

    /// 收集 root 下的全部任务目录（字典序）
    pub fn collect(&self, root: &Path) -> Vec<PathBuf> {
        if is_task_dir(root) {
            return vec![root.to_path_buf()];
        }

        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in WalkDir::new(root)
            .max_depth(self.max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with("vasprun.xml") {
                if let Some(parent) = entry.path().parent() {
                    dirs.insert(parent.to_path_buf());
                }
            }
        }
        dirs.into_iter().collect()
    }
}

fn is_task_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("vasprun.xml")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_collect_nested_task_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("block/launcher_a");
        let b = tmp.path().join("block/launcher_b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("vasprun.xml"), "x").unwrap();
        fs::write(b.join("vasprun.xml.relax1"), "x").unwrap();
        fs::write(tmp.path().join("block/notes.txt"), "x").unwrap();

        let dirs = TaskDirCollector::default().collect(tmp.path());
        assert_eq!(dirs, vec![a, b]);
    }

    #[test]
    fn test_collect_single_task_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("vasprun.xml"), "x").unwrap();

        let dirs = TaskDirCollector::default().collect(tmp.path());
        assert_eq!(dirs.len(), 1);
    }
}
