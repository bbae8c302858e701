//! Namespace management
//!
//! A space is a logically isolated storage unit: its own engine, its own
//! directory under the data dir, and its own access-control entries. The
//! manager owns engine lifecycles and the persistent catalog
//! (`metadata.json`, a JSON array of space descriptors).
//!
//! Per-space layout:
//! - key-value: `<data-dir>/<name>/{data.db, wal.db, index.dat}`
//! - vector:    `<data-dir>/<name>/{vectors.db, index.ann, wal.db}`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::kv::KvEngine;
use crate::vector::{Descriptor, Metric, VectorEngine};

/// Engine kind of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    KeyValue,
    Vector,
}

/// Engine handle for a space
#[derive(Clone)]
pub enum Engine {
    KeyValue(Arc<KvEngine>),
    Vector(Arc<VectorEngine>),
}

impl Engine {
    pub fn close(&self) -> Result<()> {
        match self {
            Engine::KeyValue(e) => e.close(),
            Engine::Vector(e) => e.close(),
        }
    }
}

/// Persisted description of a space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub name: String,
    pub engine_type: EngineKind,
    #[serde(default)]
    pub dimension: usize,
    #[serde(default)]
    pub index_type: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub wal_enabled: bool,
}

/// Parameters for creating a space
#[derive(Debug, Clone)]
pub struct CreateSpace {
    pub name: String,
    pub engine_type: EngineKind,
    pub dimension: usize,
    pub index_type: String,
    pub metric: String,
    /// None applies the engine-dependent default: WAL on for key-value,
    /// off for vector
    pub wal_enabled: Option<bool>,
}

struct Catalog {
    engines: HashMap<String, Engine>,
    metas: HashMap<String, SpaceMeta>,
}

/// Owns per-space engines and the persistent catalog
pub struct SpaceManager {
    base_dir: PathBuf,
    meta_path: PathBuf,
    engine_config: EngineConfig,
    catalog: RwLock<Catalog>,
}

impl SpaceManager {
    /// Open the manager, loading the catalog and every known space
    pub fn open(base_dir: impl AsRef<Path>, engine_config: EngineConfig) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        let meta_path = base_dir.join("metadata.json");

        let manager = Self {
            base_dir,
            meta_path,
            engine_config,
            catalog: RwLock::new(Catalog {
                engines: HashMap::new(),
                metas: HashMap::new(),
            }),
        };
        manager.load_catalog()?;
        Ok(manager)
    }

    fn load_catalog(&self) -> Result<()> {
        let data = match std::fs::read(&self.meta_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let metas: Vec<SpaceMeta> = serde_json::from_slice(&data)?;
        let mut catalog = self.catalog.write();

        for meta in metas {
            match self.open_engine(&meta) {
                Ok(engine) => {
                    catalog.engines.insert(meta.name.clone(), engine);
                }
                Err(e) => {
                    tracing::error!(space = %meta.name, error = %e, "failed to open space");
                }
            }
            catalog.metas.insert(meta.name.clone(), meta);
        }

        tracing::info!(spaces = catalog.metas.len(), "namespace catalog loaded");
        Ok(())
    }

    fn open_engine(&self, meta: &SpaceMeta) -> Result<Engine> {
        let space_dir = self.base_dir.join(&meta.name);
        std::fs::create_dir_all(&space_dir)?;

        match meta.engine_type {
            EngineKind::KeyValue => {
                let engine = KvEngine::open(
                    space_dir.join("data.db"),
                    space_dir.join("wal.db"),
                    space_dir.join("index.dat"),
                    self.engine_config.kv_flush_interval,
                )?;
                Ok(Engine::KeyValue(engine))
            }
            EngineKind::Vector => {
                let engine = VectorEngine::open(
                    space_dir.join("vectors.db"),
                    space_dir.join("index.ann"),
                    space_dir.join("wal.db"),
                    meta.dimension,
                    &meta.index_type,
                    &meta.metric,
                    meta.wal_enabled,
                    &self.engine_config,
                )?;
                Ok(Engine::Vector(engine))
            }
        }
    }

    /// Create a space: validate, build the engine, persist the catalog
    pub fn create_space(&self, params: CreateSpace) -> Result<()> {
        if params.name.is_empty() {
            return Err(DbError::validation("space name required"));
        }

        let meta = match params.engine_type {
            EngineKind::KeyValue => SpaceMeta {
                name: params.name.clone(),
                engine_type: EngineKind::KeyValue,
                dimension: 0,
                index_type: String::new(),
                metric: String::new(),
                wal_enabled: params.wal_enabled.unwrap_or(true),
            },
            EngineKind::Vector => {
                if params.dimension == 0 {
                    return Err(DbError::validation("dimension must be positive"));
                }
                let index_type = if params.index_type.is_empty() {
                    "Flat".to_string()
                } else {
                    params.index_type.clone()
                };
                let metric = if params.metric.is_empty() {
                    "L2".to_string()
                } else {
                    params.metric.clone()
                };
                Descriptor::parse(&index_type)?;
                Metric::parse(&metric)?;

                SpaceMeta {
                    name: params.name.clone(),
                    engine_type: EngineKind::Vector,
                    dimension: params.dimension,
                    index_type,
                    metric,
                    wal_enabled: params.wal_enabled.unwrap_or(false),
                }
            }
        };

        let mut catalog = self.catalog.write();
        if catalog.metas.contains_key(&params.name) {
            return Err(DbError::conflict("space already exists"));
        }

        let engine = self.open_engine(&meta)?;
        catalog.engines.insert(meta.name.clone(), engine);
        catalog.metas.insert(meta.name.clone(), meta);
        self.save_catalog(&catalog)?;

        tracing::info!(space = %params.name, "space created");
        Ok(())
    }

    /// Delete a space: close the engine, remove its directory, persist
    pub fn delete_space(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        if !catalog.metas.contains_key(name) {
            return Err(DbError::not_found("space does not exist"));
        }

        if let Some(engine) = catalog.engines.remove(name) {
            if let Err(e) = engine.close() {
                tracing::warn!(space = %name, error = %e, "engine close during delete failed");
            }
        }

        let space_dir = self.base_dir.join(name);
        if space_dir.exists() {
            std::fs::remove_dir_all(&space_dir)?;
        }

        catalog.metas.remove(name);
        self.save_catalog(&catalog)?;

        tracing::info!(space = %name, "space deleted");
        Ok(())
    }

    /// Look up the engine and metadata for a space
    pub fn get_space(&self, name: &str) -> Result<(Engine, SpaceMeta)> {
        let catalog = self.catalog.read();
        let engine = catalog
            .engines
            .get(name)
            .ok_or_else(|| DbError::not_found("space not found"))?;
        let meta = catalog
            .metas
            .get(name)
            .ok_or_else(|| DbError::not_found("space not found"))?;
        Ok((engine.clone(), meta.clone()))
    }

    /// Names of every known space
    pub fn list_spaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.read().metas.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every engine; used on server shutdown
    pub fn close_all(&self) {
        let mut catalog = self.catalog.write();
        for (name, engine) in catalog.engines.drain() {
            if let Err(e) = engine.close() {
                tracing::warn!(space = %name, error = %e, "engine close failed");
            }
        }
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        let mut metas: Vec<&SpaceMeta> = catalog.metas.values().collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        let data = serde_json::to_vec_pretty(&metas)?;
        std::fs::write(&self.meta_path, data)?;
        Ok(())
    }
}
