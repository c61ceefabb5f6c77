//! Top-level application component.
//!
//! The [`App`] owns every global service and is the composition root:
//! it wires the event subscribers that keep caches honest, runs the
//! startup scans, and spawns the long-lived background tasks (cache
//! GC, the post-receive hook listener, the HTTP server itself is bound
//! by the caller).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::acm::{AuthDefaults, SettingsCache};
use crate::branchdb::BranchDb;
use crate::builder::{BuildConfig, Builder};
use crate::config::Config;
use crate::events::EventBus;
use crate::filedb::FileDb;
use crate::fileset::FilesetCache;
use crate::gc::{self, GcConfig};
use crate::glob::GlobSet;
use crate::manifest::ManifestCache;
use crate::negotiator::Negotiator;
use crate::pipeline::PipelineRuntime;
use crate::search::{SearchConfig, SearchService};
use crate::util::NamedQueue;
use crate::vcr::GitAdapter;

/// Errors that can occur while assembling or starting the App.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("search error: {0}")]
    Search(#[from] crate::search::SearchError),

    #[error("branch db error: {0}")]
    BranchDb(#[from] crate::branchdb::BranchDbError),

    #[error("builder error: {0}")]
    Builder(#[from] crate::builder::BuilderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

// =============================================================================
// SyncSet
// =============================================================================

/// The branch-sync set: which `(branch key, group)` pairs have synced
/// since the last update event. Cleared per key on invalidation.
#[derive(Default)]
pub struct SyncSet {
    map: Mutex<HashMap<String, HashSet<String>>>,
}

impl SyncSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &str, group: &str) {
        self.map
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn contains(&self, key: &str, group: &str) -> bool {
        self.map
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|groups| groups.contains(group))
    }

    pub fn clear(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }
}

// =============================================================================
// App
// =============================================================================

/// The assembled application.
pub struct App {
    pub config: Config,
    pub events: Arc<EventBus>,
    pub vcr: GitAdapter,
    pub queues: Arc<NamedQueue>,
    pub manifests: Arc<ManifestCache>,
    pub filesets: Arc<FilesetCache>,
    pub branches: Arc<BranchDb>,
    pub settings: Arc<SettingsCache>,
    pub negotiator: Arc<Negotiator>,
    pub runtime: Arc<PipelineRuntime>,
    pub filedb: Arc<FileDb>,
    pub search: Arc<SearchService>,
    pub builder: Arc<Builder>,
    pub sync_set: Arc<SyncSet>,
}

impl App {
    /// Assemble all services and register the event subscribers.
    pub fn create(config: Config) -> Result<Arc<Self>> {
        let events = Arc::new(EventBus::new());
        let vcr = GitAdapter::new();
        let queues = Arc::new(NamedQueue::new());

        let manifests = Arc::new(ManifestCache::new(vcr.clone()));
        let filesets = Arc::new(FilesetCache::new(Arc::clone(&manifests)));
        let branches = Arc::new(BranchDb::new(
            config.content.repo_home.clone(),
            Arc::clone(&manifests),
            config.build.profiles.clone(),
        ));
        let settings = Arc::new(SettingsCache::new(
            AuthDefaults {
                method: config.auth.method.clone(),
                realm: config.auth.realm.clone(),
            },
            Arc::clone(&manifests),
            Arc::clone(&filesets),
        ));
        let negotiator = Arc::new(Negotiator::new(vcr.clone()));
        let runtime = Arc::new(PipelineRuntime::new(config.cache.dir.clone()));
        let filedb = Arc::new(FileDb::new(
            vcr.clone(),
            Arc::clone(&runtime),
            Arc::clone(&filesets),
        ));

        let mut search_config =
            SearchConfig::new(config.search.db_path.clone(), config.search.cache_dir.clone());
        search_config.quota_bytes = config.search.quota.0;
        let search = Arc::new(SearchService::new(
            search_config,
            vcr.clone(),
            Arc::clone(&manifests),
            Arc::clone(&filesets),
            Arc::clone(&queues),
        )?);

        let builder = Arc::new(Builder::new(
            BuildConfig {
                workspace_home: config.build.workspace_home.clone(),
                enabled: config.build.enabled,
                default_command: config.build.command.clone(),
            },
            Arc::clone(&branches),
            Arc::clone(&manifests),
            vcr.clone(),
            Arc::clone(&queues),
            Arc::clone(&events),
        ));

        let app = Arc::new(Self {
            config,
            events,
            vcr,
            queues,
            manifests,
            filesets,
            branches,
            settings,
            negotiator,
            runtime,
            filedb,
            search,
            builder,
            sync_set: Arc::new(SyncSet::new()),
        });
        app.wire_events();
        Ok(app)
    }

    /// Subscribe every cache to the repo-update signal. Subscribers run
    /// during the emit, so a returned emit means no stale entries.
    fn wire_events(self: &Arc<Self>) {
        let events = Arc::clone(&self.events);

        {
            let manifests = Arc::clone(&self.manifests);
            let filesets = Arc::clone(&self.filesets);
            let branches = Arc::clone(&self.branches);
            events.on_repo_update(move |event| {
                let repo_path = branches.repo_path(&event.account, &event.repo);
                manifests.invalidate_repo(&repo_path);
                filesets.invalidate_repo(&repo_path);
            });
        }
        {
            let filedb = Arc::clone(&self.filedb);
            events.on_repo_update(move |event| filedb.invalidate(&event.key));
        }
        {
            let settings = Arc::clone(&self.settings);
            events.on_repo_update(move |event| settings.invalidate(&event.key));
        }
        {
            let negotiator = Arc::clone(&self.negotiator);
            events.on_repo_update(move |event| negotiator.invalidate(&event.key));
        }
        {
            let sync_set = Arc::clone(&self.sync_set);
            events.on_repo_update(move |event| sync_set.clear(&event.key));
        }
        {
            let search = Arc::clone(&self.search);
            let branches = Arc::clone(&self.branches);
            events.on_repo_update(move |event| {
                search.invalidate_results(&event.account, &event.repo);
                if branches.is_public_branch(&event.account, &event.repo, &event.branch) {
                    let repo_path = branches.repo_path(&event.account, &event.repo);
                    search.schedule_index(&event.account, &event.repo, &event.branch, &repo_path);
                }
            });
        }
    }

    /// Startup work: discover repos, queue stale builds, index every
    /// public branch, start the cache sweeper.
    pub async fn start_background(self: &Arc<Self>) -> Result<()> {
        self.branches.scan().await?;
        self.builder.startup_scan().await?;

        for (entry, branch) in self.branches.list_public() {
            self.search
                .schedule_index(&entry.account, &entry.repo, &branch, &entry.repo_path);
        }

        let preserve = GlobSet::compile(&self.config.cache.gc_preserve)
            .map_err(|e| AppError::Config(e.to_string()))?;
        gc::spawn(GcConfig {
            cache_dir: self.config.cache.dir.clone(),
            interval: Duration::from_secs(self.config.cache.gc_interval_secs.max(1)),
            max_age: Duration::from_secs(self.config.cache.gc_max_age_days * 24 * 3600),
            preserve,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_set_marks_and_clears() {
        let set = SyncSet::new();
        assert!(!set.contains("a/r/b", "g1"));
        set.mark("a/r/b", "g1");
        assert!(set.contains("a/r/b", "g1"));
        assert!(!set.contains("a/r/b", "g2"));
        set.clear("a/r/b");
        assert!(!set.contains("a/r/b", "g1"));
    }
}
