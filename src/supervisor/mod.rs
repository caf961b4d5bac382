//! The process supervisor.
//!
//! A [`Supervisor`] owns the running set: every child inference server it has
//! started and not yet torn down. The set sits behind a synchronous mutex that
//! is only ever held for bookkeeping. Spawning, waiting, polling and sleeping
//! all happen with the lock released.
//!
//! Under the fixed port policy only one instance may exist, and loads and
//! unloads are additionally serialized by an async transition lock so that a
//! replacement is never spawned before its predecessor has released the port.

mod args;

pub use args::resolve_args;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ModelEntry, ScanOptions};
use crate::config::Config;
use crate::error::{Result, SupervisorError};
use crate::events::{Event, EventBus, LoggingHandler, NotificationHandler};
use crate::poller::{HealthProbe, HttpProbe, PollOutcome, PollSettings};
use crate::ports::PortAllocator;
use crate::process::{open_browser, ChildProcess, LaunchSpec, ProcessLauncher, TokioLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Ready,
    /// Running, but never reported ready within the readiness bound.
    Degraded,
    Stopping,
    Stopped,
    Crashed,
}

impl InstanceState {
    /// Counts as "loaded" for duplicate detection.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Ready | InstanceState::Degraded
        )
    }
}

/// Snapshot of one instance, safe to hand out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: u64,
    pub name: String,
    pub base_name: String,
    pub path: PathBuf,
    pub port: u16,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub instance: InstanceInfo,
    pub already_loaded: bool,
}

struct Instance {
    id: u64,
    entry: ModelEntry,
    port: u16,
    state: InstanceState,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    /// Asks the watcher to kill the child. Also ends the readiness poll.
    stop: CancellationToken,
    /// Cancelled by the watcher once the child has been reaped.
    exited: CancellationToken,
    /// Cancelled when a stop has fully completed and the entry is gone.
    released: CancellationToken,
}

impl Instance {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            name: self.entry.display.clone(),
            base_name: self.entry.base_name.clone(),
            path: self.entry.primary_path.clone(),
            port: self.port,
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
        }
    }
}

/// Everything a stop needs, taken from the running set when the stop is claimed.
struct Teardown {
    id: u64,
    port: u16,
    stop: CancellationToken,
    exited: CancellationToken,
    released: CancellationToken,
    info: InstanceInfo,
}

/// Removes a stopping instance from the running set and wakes waiting stoppers.
struct ReleaseGuard {
    inner: Arc<Inner>,
    id: u64,
    released: CancellationToken,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.inner.running.lock().remove(&self.id);
        self.released.cancel();
    }
}

struct Inner {
    config_path: Option<PathBuf>,
    config: RwLock<Config>,
    catalog: RwLock<Arc<Catalog>>,
    scan: ScanOptions,
    ports: PortAllocator,
    single_instance: bool,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    polls: PollSettings,
    events: Arc<EventBus>,
    notifications: Arc<AtomicBool>,
    running: Mutex<BTreeMap<u64, Instance>>,
    next_id: AtomicU64,
    transition: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

pub struct SupervisorBuilder {
    config: Config,
    catalog: Catalog,
    config_path: Option<PathBuf>,
    scan: Option<ScanOptions>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    probe: Option<Arc<dyn HealthProbe>>,
    polls: Option<PollSettings>,
    events: Option<Arc<EventBus>>,
}

impl SupervisorBuilder {
    /// File re-read before every load and unload.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn scan_options(mut self, scan: ScanOptions) -> Self {
        self.scan = Some(scan);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn poll_settings(mut self, polls: PollSettings) -> Self {
        self.polls = Some(polls);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let config = self.config;
        let scan = match self.scan {
            Some(scan) => scan,
            None => ScanOptions::from_config(&config)?,
        };
        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::new(config.host.clone())?),
        };
        let polls = self.polls.unwrap_or_else(|| PollSettings::from_config(&config));
        let notifications = Arc::new(AtomicBool::new(config.notifications));

        let events = self.events.unwrap_or_else(|| {
            let bus = EventBus::new();
            bus.subscribe(LoggingHandler);
            Arc::new(bus)
        });
        events.subscribe(NotificationHandler::new(notifications.clone()));

        let inner = Inner {
            config_path: self.config_path,
            catalog: RwLock::new(Arc::new(self.catalog)),
            scan,
            ports: PortAllocator::from_config(&config),
            single_instance: config.single_instance(),
            launcher: self.launcher.unwrap_or_else(|| Arc::new(TokioLauncher)),
            probe,
            polls,
            events,
            notifications,
            running: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            transition: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            config: RwLock::new(config),
        };
        Ok(Supervisor {
            inner: Arc::new(inner),
        })
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn builder(config: Config, catalog: Catalog) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            catalog,
            config_path: None,
            scan: None,
            launcher: None,
            probe: None,
            polls: None,
            events: None,
        }
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.inner.catalog.read().clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn single_instance(&self) -> bool {
        self.inner.single_instance
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Re-reads the config file and applies the fields that may change at runtime.
    /// A file that fails to load is logged and ignored.
    pub async fn refresh_config(&self) {
        let Some(path) = self.inner.config_path.clone() else {
            return;
        };
        let loaded = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || Config::load(&path)).await
        };
        match loaded {
            Ok(Ok(fresh)) => {
                self.inner.config.write().apply_runtime_fields(&fresh);
                self.inner
                    .notifications
                    .store(fresh.notifications, Ordering::Relaxed);
                tracing::debug!("Config reloaded from {}", path.display());
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to reload config, keeping previous settings: {}", e);
            }
            Err(e) => tracing::error!("Config reload task failed: {}", e),
        }
    }

    /// Rescans the model directory and swaps the catalog in one step.
    ///
    /// Blocking; call it from `spawn_blocking` inside async code. An empty
    /// rescan is rejected and the old catalog stays.
    pub fn reload_catalog(&self) -> Result<usize> {
        let dir = self.inner.config.read().model_dir_path();
        let catalog = Catalog::load(&dir, &self.inner.scan)?;
        let count = catalog.len();
        *self.inner.catalog.write() = Arc::new(catalog);
        tracing::info!("Model catalog reloaded: {} models", count);
        Ok(count)
    }

    /// All instances in the running set, oldest first.
    pub fn status(&self) -> Vec<InstanceInfo> {
        self.inner.running.lock().values().map(Instance::info).collect()
    }

    /// The most recently started live instance.
    pub fn current(&self) -> Option<InstanceInfo> {
        self.inner
            .running
            .lock()
            .values()
            .rev()
            .find(|i| i.state.is_live())
            .map(Instance::info)
    }

    /// Loads the catalog entry at `index`.
    ///
    /// Returns once the child is spawned; readiness is tracked in the
    /// background and shows up in [`Supervisor::status`].
    pub async fn load(&self, index: i64) -> Result<LoadOutcome> {
        let catalog = self.catalog();
        let entry = usize::try_from(index)
            .ok()
            .and_then(|i| catalog.get(i))
            .cloned()
            .ok_or(SupervisorError::InvalidIndex {
                index,
                len: catalog.len(),
            })?;
        self.load_entry(entry).await
    }

    pub async fn load_entry(&self, entry: ModelEntry) -> Result<LoadOutcome> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        self.refresh_config().await;

        let _transition = self.transition().await;

        if self.inner.single_instance {
            let previous: Vec<u64> = {
                let running = self.inner.running.lock();
                if let Some(existing) = find_live(&running, &entry) {
                    return Ok(already_loaded(existing));
                }
                running.keys().copied().collect()
            };
            for id in previous {
                tracing::info!(instance = id, "Stopping current instance before loading {}", entry.display);
                self.stop_instance(id).await;
            }
        }

        let (id, port, stop) = {
            let mut running = self.inner.running.lock();
            if self.is_shutting_down() {
                return Err(SupervisorError::ShuttingDown);
            }
            if let Some(existing) = find_live(&running, &entry) {
                return Ok(already_loaded(existing));
            }

            let port = self.inner.ports.allocate()?;
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let stop = CancellationToken::new();
            running.insert(
                id,
                Instance {
                    id,
                    entry: entry.clone(),
                    port,
                    state: InstanceState::Starting,
                    pid: None,
                    started_at: Utc::now(),
                    stop: stop.clone(),
                    exited: CancellationToken::new(),
                    released: CancellationToken::new(),
                },
            );
            (id, port, stop)
        };

        let (spec, open_web, host) = {
            let config = self.inner.config.read();
            let spec = LaunchSpec {
                program: config.server_binary.clone(),
                model_path: entry.primary_path.clone(),
                port,
                args: resolve_args(&config.default_args, &config.model_specific_args, &entry.base_name),
            };
            (spec, config.auto_open_web, config.host.clone())
        };

        tracing::info!(
            model = %entry.display,
            port,
            instance = id,
            "Starting {} {}",
            spec.program,
            spec.argv().join(" ")
        );

        let child = match self.inner.launcher.launch(&spec) {
            Ok(child) => child,
            Err(source) => {
                let removed = self.inner.running.lock().remove(&id);
                if let Some(instance) = removed {
                    instance.exited.cancel();
                    instance.released.cancel();
                }
                tracing::error!(model = %entry.display, port, instance = id, "Failed to start server: {}", source);
                self.inner.events.publish(Event::LoadFailed {
                    model: entry.display.clone(),
                    port,
                    error: source.to_string(),
                });
                return Err(SupervisorError::LoadFailed {
                    model: entry.display,
                    source,
                });
            }
        };

        let pid = child.id();
        let exited = {
            let mut running = self.inner.running.lock();
            running.get_mut(&id).map(|instance| {
                instance.pid = pid;
                instance.exited.clone()
            })
        }
        .unwrap_or_default();

        tracing::info!(model = %entry.display, port, instance = id, pid = ?pid, "Server process started");
        self.inner.events.publish(Event::ModelLoading {
            model: entry.display.clone(),
            port,
            instance: id,
        });

        self.spawn_watcher(id, child, stop.clone(), exited);
        self.spawn_readiness(id, port, entry.display.clone(), stop);

        if open_web {
            let url = format!("http://{}:{}", host, port);
            if let Err(e) = open_browser(&url) {
                tracing::warn!("Failed to open browser at {}: {}", url, e);
            }
        }

        let instance = self
            .inner
            .running
            .lock()
            .get(&id)
            .map(Instance::info)
            .unwrap_or(InstanceInfo {
                id,
                name: entry.display.clone(),
                base_name: entry.base_name.clone(),
                path: entry.primary_path.clone(),
                port,
                state: InstanceState::Crashed,
                pid,
                started_at: Utc::now(),
            });
        Ok(LoadOutcome {
            instance,
            already_loaded: false,
        })
    }

    /// Stops one instance, or every instance when `instance` is `None`.
    ///
    /// Unknown ids and an empty running set are a successful no-op. Returns
    /// the instances this call tore down.
    pub async fn unload(&self, instance: Option<u64>) -> Vec<InstanceInfo> {
        self.refresh_config().await;
        let _transition = self.transition().await;
        self.stop_many(instance).await
    }

    /// Stops everything and refuses further loads.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let _transition = self.transition().await;
        let stopped = self.stop_many(None).await;
        tracing::info!("Supervisor shut down, {} instances stopped", stopped.len());
    }

    /// Loads every model named in `autoLoadModels`.
    ///
    /// A name matches an entry whose display name equals or contains it, or
    /// whose primary file name contains it. Under the fixed port policy only
    /// the first match is loaded.
    pub async fn auto_load(&self) -> Vec<InstanceInfo> {
        let names = self.inner.config.read().auto_load_models.clone();
        let catalog = self.catalog();
        let mut loaded = Vec::new();

        for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            let Some(entry) = catalog.find_by_name(name) else {
                tracing::warn!("Auto-load model not found: {}", name);
                self.inner.events.publish(Event::AutoLoadNotFound {
                    name: name.to_string(),
                });
                continue;
            };

            if self.inner.single_instance && !loaded.is_empty() {
                tracing::warn!(
                    "Skipping auto-load of {}: only one model can run with a fixed port",
                    entry.display
                );
                continue;
            }

            tracing::info!("Auto-loading model: {} (matched '{}')", entry.display, name);
            match self.load_entry(entry.clone()).await {
                Ok(outcome) => loaded.push(outcome.instance),
                Err(e) => tracing::error!("Auto-load of {} failed: {}", entry.display, e),
            }
        }
        loaded
    }

    async fn transition(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.inner.single_instance {
            Some(self.inner.transition.lock().await)
        } else {
            None
        }
    }

    async fn stop_many(&self, instance: Option<u64>) -> Vec<InstanceInfo> {
        let ids: Vec<u64> = {
            let running = self.inner.running.lock();
            match instance {
                Some(id) => running.contains_key(&id).then_some(id).into_iter().collect(),
                None => running.keys().copied().collect(),
            }
        };
        if ids.is_empty() {
            tracing::debug!("Nothing to unload");
            return Vec::new();
        }

        let mut tasks = JoinSet::new();
        for id in ids {
            let supervisor = self.clone();
            tasks.spawn(async move { supervisor.stop_instance(id).await });
        }

        let mut stopped = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(info)) => stopped.push(info),
                Ok(None) => {}
                Err(e) => tracing::error!("Stop task failed: {}", e),
            }
        }
        stopped.sort_by_key(|i| i.id);
        stopped
    }

    /// Kill, reap, wait for the port to go quiet, settle, then forget.
    ///
    /// The teardown runs on its own task once the instance is claimed, so it
    /// always finishes even if this caller is dropped. If another caller is
    /// already stopping the instance this waits for that stop to finish and
    /// returns `None`.
    async fn stop_instance(&self, id: u64) -> Option<InstanceInfo> {
        let claim = {
            let mut running = self.inner.running.lock();
            let instance = running.get_mut(&id)?;
            if instance.state == InstanceState::Stopping {
                Err(instance.released.clone())
            } else {
                instance.state = InstanceState::Stopping;
                Ok(Teardown {
                    id,
                    port: instance.port,
                    stop: instance.stop.clone(),
                    exited: instance.exited.clone(),
                    released: instance.released.clone(),
                    info: instance.info(),
                })
            }
        };
        let teardown = match claim {
            Ok(teardown) => teardown,
            Err(released) => {
                released.cancelled().await;
                return None;
            }
        };

        let supervisor = self.clone();
        let released = teardown.released.clone();
        let handle = tokio::spawn(async move { supervisor.tear_down(teardown).await });
        match handle.await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!(instance = id, "Stop task failed: {}", e);
                released.cancelled().await;
                None
            }
        }
    }

    async fn tear_down(self, teardown: Teardown) -> InstanceInfo {
        let Teardown {
            id,
            port,
            stop,
            exited,
            released,
            info,
        } = teardown;
        // Forget the instance even if this task panics or is aborted.
        let release = ReleaseGuard {
            inner: self.inner.clone(),
            id,
            released,
        };

        tracing::info!(model = %info.name, port, instance = id, pid = ?info.pid, "Stopping server");
        stop.cancel();
        exited.cancelled().await;

        let probe = self.inner.probe.clone();
        let outcome = self
            .inner
            .polls
            .shutdown
            .run(&CancellationToken::new(), || {
                let probe = probe.clone();
                async move { !probe.is_listening(port).await }
            })
            .await;
        match outcome {
            PollOutcome::Satisfied => tracing::debug!(port, "Port released"),
            _ => tracing::warn!(
                port,
                instance = id,
                "Port still answering after {:?}, continuing anyway",
                self.inner.polls.shutdown.bound
            ),
        }
        tokio::time::sleep(self.inner.polls.settle).await;
        drop(release);

        tracing::info!(model = %info.name, port, instance = id, "Server stopped");
        self.inner.events.publish(Event::ModelStopped {
            model: info.name.clone(),
            port,
            instance: id,
        });
        InstanceInfo {
            state: InstanceState::Stopped,
            ..info
        }
    }

    /// Owns the child until it exits. An exit nobody asked for is a crash.
    fn spawn_watcher(
        &self,
        id: u64,
        mut child: Box<dyn ChildProcess>,
        stop: CancellationToken,
        exited: CancellationToken,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop.cancelled() => None,
            };
            let status = match status {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(instance = id, "Failed to kill server process: {}", e);
                    }
                    child.wait().await
                }
            };
            drop(child);
            exited.cancel();

            let code = match status {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(instance = id, "Failed to wait for server process: {}", e);
                    None
                }
            };

            // a stopping instance is removed by whoever is stopping it
            let crashed = {
                let mut running = supervisor.inner.running.lock();
                let unexpected = running
                    .get(&id)
                    .map_or(false, |i| i.state != InstanceState::Stopping);
                if unexpected {
                    running.remove(&id)
                } else {
                    None
                }
            };

            if let Some(instance) = crashed {
                instance.stop.cancel();
                instance.released.cancel();
                tracing::warn!(
                    model = %instance.entry.display,
                    port = instance.port,
                    instance = id,
                    code = ?code,
                    "Server exited unexpectedly"
                );
                supervisor.inner.events.publish(Event::ModelCrashed {
                    model: instance.entry.display.clone(),
                    port: instance.port,
                    instance: id,
                    code,
                });
            } else {
                tracing::debug!(instance = id, code = ?code, "Server process reaped");
            }
        });
    }

    fn spawn_readiness(&self, id: u64, port: u16, model: String, stop: CancellationToken) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let inner = &supervisor.inner;
            let probe = inner.probe.clone();
            let outcome = inner
                .polls
                .readiness
                .run(&stop, || {
                    let probe = probe.clone();
                    async move { probe.is_ready(port).await }
                })
                .await;

            let next = match outcome {
                PollOutcome::Satisfied => InstanceState::Ready,
                PollOutcome::TimedOut => InstanceState::Degraded,
                PollOutcome::Cancelled => return,
            };

            let changed = {
                let mut running = inner.running.lock();
                match running.get_mut(&id) {
                    Some(instance) if instance.state == InstanceState::Starting => {
                        instance.state = next;
                        true
                    }
                    _ => false,
                }
            };
            if !changed {
                return;
            }

            if next == InstanceState::Ready {
                tracing::info!(model = %model, port, instance = id, "Model ready");
                inner.events.publish(Event::ModelReady {
                    model,
                    port,
                    instance: id,
                });
            } else {
                let waited = inner.polls.readiness.bound;
                tracing::warn!(model = %model, port, instance = id, "Model not ready after {:?}", waited);
                inner.events.publish(Event::ModelDegraded {
                    model,
                    port,
                    instance: id,
                    waited_secs: waited.as_secs(),
                });
            }
        });
    }
}

fn find_live<'a>(running: &'a BTreeMap<u64, Instance>, entry: &ModelEntry) -> Option<&'a Instance> {
    running
        .values()
        .find(|i| i.state.is_live() && i.entry.primary_path == entry.primary_path)
}

fn already_loaded(instance: &Instance) -> LoadOutcome {
    tracing::info!(
        model = %instance.entry.display,
        port = instance.port,
        instance = instance.id,
        "Model already loaded"
    );
    LoadOutcome {
        instance: instance.info(),
        already_loaded: true,
    }
}
