//! Convoy - control plane for a fleet of reverse-proxy instances
//!
//! This library keeps independently running proxy instances converged on one
//! logical configuration:
//! - Resolves layered settings (catalog defaults, global and per-service values)
//! - Watches a fleet source and re-applies the configuration when it changes
//! - Renders, pushes and reloads the configuration on every instance
//! - Runs plugin maintenance jobs on fixed cadences

pub mod api;
pub mod catalog;
pub mod config;
pub mod customconf;
pub mod db;
pub mod error;
pub mod fleet;
pub mod healthcheck;
pub mod model;
pub mod plugins;
pub mod reconciler;
pub mod render;
pub mod resolver;
pub mod scheduler;

use crate::api::Distributor;
use crate::catalog::Catalog;
use crate::db::Database;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Where the setting catalog is loaded from
#[derive(Debug, Clone)]
pub struct CatalogSources {
    pub core_settings: PathBuf,
    pub core_plugins: PathBuf,
    pub external_plugins: PathBuf,
}

/// Shared state handed to every component at construction
pub struct ControlContext {
    catalog: RwLock<Arc<Catalog>>,
    sources: Option<CatalogSources>,
    pub db: Database,
    pub distributor: Arc<dyn Distributor>,
    applying: AtomicBool,
}

impl ControlContext {
    pub fn new(catalog: Catalog, db: Database, distributor: Arc<dyn Distributor>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            sources: None,
            db,
            distributor,
            applying: AtomicBool::new(false),
        }
    }

    pub fn with_sources(mut self, sources: CatalogSources) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Current catalog. Callers keep the `Arc` for the duration of one operation.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Reload plugins from disk, sync them to the database and swap the catalog
    pub fn reload_catalog(&self) -> Result<Arc<Catalog>> {
        let sources = self
            .sources
            .as_ref()
            .context("No catalog sources configured")?;
        let ignore = self.catalog.read().ignores_regex_check();
        let catalog = Catalog::load(&sources.core_settings, &sources.core_plugins, &sources.external_plugins)
            .context("Failed to load setting catalog")?
            .with_ignore_regex_check(ignore);

        self.db
            .sync_plugins(catalog.plugins())
            .context("Failed to sync plugins to database")?;

        let catalog = Arc::new(catalog);
        *self.catalog.write() = catalog.clone();
        info!(plugins = catalog.plugins().len(), "Setting catalog reloaded");
        Ok(catalog)
    }

    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::SeqCst)
    }

    /// Mark an apply in progress until the guard drops
    pub fn begin_apply(&self) -> ApplyGuard<'_> {
        self.applying.store(true, Ordering::SeqCst);
        ApplyGuard { ctx: self }
    }
}

pub struct ApplyGuard<'a> {
    ctx: &'a ControlContext,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.ctx.applying.store(false, Ordering::SeqCst);
    }
}
