//! # 文档存储
//!
//! 构建器读写的键值文档集合抽象：声明唯一键与 `last_updated` 字段，
//! 支持增量过滤与"先删后写"的批量更新契约。
//!
//! ## 更新契约
//! 1. 附加构建时间戳 `_build_ts`
//! 2. 删除与新批次共享去重键的旧文档
//! 3. 按键 upsert 新批次（复合键以 '/' 连接各字段值）
//!
//! ## 超限处理
//! 文档超过尺寸上限时按序剥离 `normalmode_eigenvecs`、`force_constants`
//! 并重试，全部剥离后仍超限才报错。
//!
//! ## 依赖关系
//! - 被 `builders/`, `commands/` 使用
//! - 使用 `error.rs`；JSONL 持久化用 serde_json

use crate::error::{MatpipeError, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// 超限时按序剥离的大字段
const STRIPPABLE_FIELDS: [&str; 2] = ["normalmode_eigenvecs", "force_constants"];

/// 构建时间戳字段
pub const BUILD_TS_FIELD: &str = "_build_ts";

/// 文档集合抽象
pub trait DocStore {
    /// 集合的唯一键字段（复合键为多个字段）
    fn key_fields(&self) -> &[String];

    /// 全量查询，可按字段等值过滤
    fn query(&self, criteria: &BTreeMap<String, Value>) -> Result<Vec<Value>>;

    /// 比较目标集合，返回源中 `last_updated` 更新的键
    fn newer_in(&self, target: &dyn DocStore) -> Result<Vec<String>> {
        let target_docs = target.query(&BTreeMap::new())?;
        let mut target_updated: BTreeMap<String, String> = BTreeMap::new();
        for doc in &target_docs {
            if let (Some(key), Some(lu)) = (self.doc_key(doc), doc_last_updated(doc)) {
                target_updated.insert(key, lu);
            }
        }

        let mut keys = Vec::new();
        for doc in self.query(&BTreeMap::new())? {
            let Some(key) = self.doc_key(&doc) else {
                continue;
            };
            let newer = match (doc_last_updated(&doc), target_updated.get(&key)) {
                (_, None) => true,
                (Some(src), Some(dst)) => src.as_str() > dst.as_str(),
                (None, Some(_)) => false,
            };
            if newer {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// 按契约写入一个批次
    fn update(&mut self, docs: Vec<Value>) -> Result<()>;

    /// 按键删除文档
    fn remove_docs(&mut self, keys: &[String]) -> Result<()>;

    /// 从文档中提取（复合）键
    fn doc_key(&self, doc: &Value) -> Option<String> {
        let mut parts = Vec::new();
        for field in self.key_fields() {
            let v = doc.get(field)?;
            parts.push(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        Some(parts.join("/"))
    }
}

fn doc_last_updated(doc: &Value) -> Option<String> {
    doc.get("last_updated")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// 超限剥离：依次移除已知大字段直到符合上限
pub fn strip_oversize(doc: &mut Value, size_limit: usize) -> Result<()> {
    let mut size = serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0);
    if size <= size_limit {
        return Ok(());
    }

    for field in STRIPPABLE_FIELDS {
        if let Some(map) = doc.as_object_mut() {
            if map.remove(field).is_some() {
                size = serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0);
                if size <= size_limit {
                    return Ok(());
                }
            }
        }
    }

    Err(MatpipeError::DocumentTooLarge {
        size,
        limit: size_limit,
    })
}

/// 批次预处理：附加时间戳并执行超限剥离
fn prepare_batch(docs: &mut Vec<Value>, size_limit: Option<usize>) -> Result<()> {
    let ts = Value::String(Utc::now().to_rfc3339());
    for doc in docs.iter_mut() {
        if let Some(map) = doc.as_object_mut() {
            map.insert(BUILD_TS_FIELD.to_string(), ts.clone());
        }
        if let Some(limit) = size_limit {
            strip_oversize(doc, limit)?;
        }
    }
    Ok(())
}

/// 内存集合（测试与单机构建用）
#[derive(Debug, Default)]
pub struct MemStore {
    key_fields: Vec<String>,
    docs: BTreeMap<String, Value>,
    /// 单文档尺寸上限（字节），None 为不限
    pub size_limit: Option<usize>,
}

impl MemStore {
    pub fn new(key_fields: &[&str]) -> MemStore {
        MemStore {
            key_fields: key_fields.iter().map(|s| s.to_string()).collect(),
            docs: BTreeMap::new(),
            size_limit: None,
        }
    }

    pub fn with_size_limit(mut self, limit: usize) -> MemStore {
        self.size_limit = Some(limit);
        self
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl DocStore for MemStore {
    fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    fn query(&self, criteria: &BTreeMap<String, Value>) -> Result<Vec<Value>> {
        Ok(self
            .docs
            .values()
            .filter(|doc| criteria.iter().all(|(k, v)| doc.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    fn update(&mut self, mut docs: Vec<Value>) -> Result<()> {
        prepare_batch(&mut docs, self.size_limit)?;

        let keys: Vec<String> = docs.iter().filter_map(|d| self.doc_key(d)).collect();
        self.remove_docs(&keys)?;

        for doc in docs {
            if let Some(key) = self.doc_key(&doc) {
                self.docs.insert(key, doc);
            }
        }
        Ok(())
    }

    fn remove_docs(&mut self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.docs.remove(key);
        }
        Ok(())
    }
}

/// JSONL 文件集合：每行一个文档，整体读写
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    key_fields: Vec<String>,
    pub size_limit: Option<usize>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>, key_fields: &[&str]) -> JsonlStore {
        JsonlStore {
            path: path.into(),
            key_fields: key_fields.iter().map(|s| s.to_string()).collect(),
            size_limit: None,
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, Value>> {
        let mut docs = BTreeMap::new();
        if !self.path.exists() {
            return Ok(docs);
        }
        let file = fs::File::open(&self.path).map_err(|e| MatpipeError::FileReadError {
            path: self.path.display().to_string(),
            source: e,
        })?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| MatpipeError::FileReadError {
                path: self.path.display().to_string(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value =
                serde_json::from_str(&line).map_err(|e| MatpipeError::JsonError {
                    path: self.path.display().to_string(),
                    source: e,
                })?;
            if let Some(key) = self.doc_key(&doc) {
                docs.insert(key, doc);
            }
        }
        Ok(docs)
    }

    fn write_all(&self, docs: &BTreeMap<String, Value>) -> Result<()> {
        let mut file = fs::File::create(&self.path).map_err(|e| MatpipeError::FileWriteError {
            path: self.path.display().to_string(),
            source: e,
        })?;
        for doc in docs.values() {
            let line = serde_json::to_string(doc).map_err(|e| MatpipeError::JsonError {
                path: self.path.display().to_string(),
                source: e,
            })?;
            writeln!(file, "{}", line).map_err(|e| MatpipeError::FileWriteError {
                path: self.path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl DocStore for JsonlStore {
    fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    fn query(&self, criteria: &BTreeMap<String, Value>) -> Result<Vec<Value>> {
        Ok(self
            .read_all()?
            .into_values()
            .filter(|doc| criteria.iter().all(|(k, v)| doc.get(k) == Some(v)))
            .collect())
    }

    fn update(&mut self, mut docs: Vec<Value>) -> Result<()> {
        prepare_batch(&mut docs, self.size_limit)?;

        let mut existing = self.read_all()?;
        for doc in docs {
            if let Some(key) = self.doc_key(&doc) {
                existing.insert(key, doc);
            }
        }
        self.write_all(&existing)
    }

    fn remove_docs(&mut self, keys: &[String]) -> Result<()> {
        let mut existing = self.read_all()?;
        for key in keys {
            existing.remove(key);
        }
        self.write_all(&existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mem_store_upsert_and_query() {
        let mut store = MemStore::new(&["task_id"]);
        store
            .update(vec![
                json!({"task_id": "mp-1", "energy": -10.0, "last_updated": "2026-01-01T00:00:00Z"}),
                json!({"task_id": "mp-2", "energy": -20.0, "last_updated": "2026-01-02T00:00:00Z"}),
            ])
            .unwrap();
        assert_eq!(store.len(), 2);

        // 同键覆盖
        store
            .update(vec![json!({"task_id": "mp-1", "energy": -11.0})])
            .unwrap();
        assert_eq!(store.len(), 2);

        let mut criteria = BTreeMap::new();
        criteria.insert("task_id".to_string(), json!("mp-1"));
        let docs = store.query(&criteria).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["energy"], json!(-11.0));
        // 时间戳由 update 附加
        assert!(docs[0].get(BUILD_TS_FIELD).is_some());
    }

    #[test]
    fn test_composite_key() {
        let mut store = MemStore::new(&["molecule_id", "solvent", "method"]);
        store
            .update(vec![
                json!({"molecule_id": "m1", "solvent": "water", "method": "b3lyp", "e": 1.0}),
                json!({"molecule_id": "m1", "solvent": "thf", "method": "b3lyp", "e": 2.0}),
            ])
            .unwrap();
        assert_eq!(store.len(), 2);

        store
            .update(vec![json!({
                "molecule_id": "m1", "solvent": "water", "method": "b3lyp", "e": 3.0
            })])
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_newer_in_incremental_filter() {
        let mut source = MemStore::new(&["task_id"]);
        let mut target = MemStore::new(&["task_id"]);

        source
            .update(vec![
                json!({"task_id": "mp-1", "last_updated": "2026-02-01T00:00:00Z"}),
                json!({"task_id": "mp-2", "last_updated": "2026-02-01T00:00:00Z"}),
            ])
            .unwrap();
        target
            .update(vec![
                json!({"task_id": "mp-1", "last_updated": "2026-03-01T00:00:00Z"}),
            ])
            .unwrap();

        let keys = source.newer_in(&target).unwrap();
        // mp-2 缺失于目标，mp-1 目标更新
        assert_eq!(keys, vec!["mp-2".to_string()]);
    }

    #[test]
    fn test_oversize_strips_then_errors() {
        let big = vec![0.0f64; 400];
        let mut doc = json!({
            "task_id": "mp-1",
            "normalmode_eigenvecs": big.clone(),
            "force_constants": big.clone(),
        });

        // 剥离 normalmode_eigenvecs 后可容纳
        strip_oversize(&mut doc, 2000).unwrap();
        assert!(doc.get("normalmode_eigenvecs").is_none());
        assert!(doc.get("force_constants").is_some());

        // 全部剥离仍超限
        let mut tiny = json!({
            "task_id": "mp-1",
            "normalmode_eigenvecs": big.clone(),
            "force_constants": big,
            "payload": vec![0.0f64; 400],
        });
        let err = strip_oversize(&mut tiny, 100).unwrap_err();
        assert!(matches!(err, MatpipeError::DocumentTooLarge { .. }));
    }

    #[test]
    fn test_jsonl_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.jsonl");
        let mut store = JsonlStore::new(&path, &["task_id"]);

        store
            .update(vec![
                json!({"task_id": "mp-1", "energy": -1.0}),
                json!({"task_id": "mp-2", "energy": -2.0}),
            ])
            .unwrap();

        let reopened = JsonlStore::new(&path, &["task_id"]);
        assert_eq!(reopened.query(&BTreeMap::new()).unwrap().len(), 2);

        store.remove_docs(&["mp-1".to_string()]).unwrap();
        assert_eq!(reopened.query(&BTreeMap::new()).unwrap().len(), 1);
    }
}
