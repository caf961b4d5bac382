#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use lmvisor::{
    Catalog, ChildProcess, Config, HealthProbe, LaunchSpec, PollSettings, Poller, PortPolicy,
    ProcessLauncher, ScanOptions, Supervisor,
};

pub const BASE_PORT: u16 = 18080;
pub const API_PORT: u16 = 19696;

#[derive(Debug, Default, Clone, Copy)]
struct PortState {
    listening: bool,
    ready: bool,
}

/// What an outside observer would see on each port.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    ports: Arc<Mutex<HashMap<u16, PortState>>>,
    linger: Arc<AtomicBool>,
}

impl FakeNetwork {
    pub fn is_listening(&self, port: u16) -> bool {
        self.ports.lock().get(&port).map_or(false, |s| s.listening)
    }

    pub fn set_ready(&self, port: u16) {
        self.ports.lock().entry(port).or_default().ready = true;
    }

    fn bind(&self, port: u16, ready: bool) -> io::Result<()> {
        let mut ports = self.ports.lock();
        let state = ports.entry(port).or_default();
        if state.listening {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("port {} in use", port)));
        }
        *state = PortState { listening: true, ready };
        Ok(())
    }

    /// While set, a port keeps answering after its process has exited.
    pub fn linger_after_exit(&self, linger: bool) {
        self.linger.store(linger, Ordering::SeqCst);
    }

    /// Drops whatever is still listening on `port`.
    pub fn close(&self, port: u16) {
        self.ports.lock().insert(port, PortState::default());
    }

    fn release(&self, port: u16) {
        if !self.linger.load(Ordering::SeqCst) {
            self.close(port);
        }
    }
}

pub struct FakeProbe {
    network: FakeNetwork,
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn is_ready(&self, port: u16) -> bool {
        self.network
            .ports
            .lock()
            .get(&port)
            .map_or(false, |s| s.listening && s.ready)
    }

    async fn is_listening(&self, port: u16) -> bool {
        self.network.is_listening(port)
    }
}

struct ChildHandle {
    port: u16,
    exit: CancellationToken,
    code: Arc<Mutex<Option<i32>>>,
    reaped: Arc<AtomicBool>,
}

/// Launches pretend servers that bind their port immediately and exit when
/// killed or when a test crashes them.
pub struct FakeLauncher {
    network: FakeNetwork,
    ready_on_spawn: bool,
    fail: AtomicBool,
    next_pid: AtomicU32,
    spawned: Mutex<Vec<LaunchSpec>>,
    children: Mutex<Vec<ChildHandle>>,
}

impl FakeLauncher {
    pub fn spawned(&self) -> Vec<LaunchSpec> {
        self.spawned.lock().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn fail_next_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Children not yet reaped by the supervisor.
    pub fn unreaped(&self) -> usize {
        self.children
            .lock()
            .iter()
            .filter(|c| !c.reaped.load(Ordering::SeqCst))
            .count()
    }

    /// Makes the n-th spawned child exit on its own.
    pub fn crash(&self, nth: usize, code: Option<i32>) {
        let children = self.children.lock();
        if let Some(child) = children.get(nth) {
            *child.code.lock() = code;
            child.exit.cancel();
        }
    }

    pub fn port_of(&self, nth: usize) -> Option<u16> {
        self.children.lock().get(nth).map(|c| c.port)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "llama-server not found"));
        }
        self.network.bind(spec.port, self.ready_on_spawn)?;
        self.spawned.lock().push(spec.clone());

        let exit = CancellationToken::new();
        let code = Arc::new(Mutex::new(Some(0)));
        let reaped = Arc::new(AtomicBool::new(false));
        self.children.lock().push(ChildHandle {
            port: spec.port,
            exit: exit.clone(),
            code: code.clone(),
            reaped: reaped.clone(),
        });

        Ok(Box::new(FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst) + 4000,
            port: spec.port,
            network: self.network.clone(),
            exit,
            code,
            reaped,
        }))
    }
}

struct FakeChild {
    pid: u32,
    port: u16,
    network: FakeNetwork,
    exit: CancellationToken,
    code: Arc<Mutex<Option<i32>>>,
    reaped: Arc<AtomicBool>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.exit.cancelled().await;
        self.network.release(self.port);
        self.reaped.store(true, Ordering::SeqCst);
        Ok(*self.code.lock())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        *self.code.lock() = None;
        self.exit.cancel();
        Ok(())
    }
}

pub fn fast_polls() -> PollSettings {
    PollSettings {
        readiness: Poller::new(Duration::from_millis(5), Duration::from_millis(300)),
        shutdown: Poller::new(Duration::from_millis(5), Duration::from_millis(300)),
        settle: Duration::from_millis(1),
    }
}

pub fn touch(dir: &Path, rel: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"GGUF").unwrap();
}

pub fn test_config(dir: &Path, policy: PortPolicy) -> Config {
    Config {
        model_dir: dir.join("models").to_string_lossy().into_owned(),
        base_port: BASE_PORT,
        api_port: API_PORT,
        port_policy: policy,
        default_args: vec!["--ctx-size".to_string(), "8192".to_string()],
        notifications: false,
        ..Config::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub supervisor: Supervisor,
    pub launcher: Arc<FakeLauncher>,
    pub network: FakeNetwork,
}

pub struct HarnessBuilder {
    policy: PortPolicy,
    files: Vec<String>,
    ready_on_spawn: bool,
    config_file: bool,
    tweak: Option<Box<dyn FnOnce(&mut Config)>>,
}

impl HarnessBuilder {
    pub fn files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.ready_on_spawn = false;
        self
    }

    /// Persist the config to disk and let the supervisor re-read it.
    pub fn with_config_file(mut self) -> Self {
        self.config_file = true;
        self
    }

    pub fn config(mut self, tweak: impl FnOnce(&mut Config) + 'static) -> Self {
        self.tweak = Some(Box::new(tweak));
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        fs::create_dir_all(&models).unwrap();
        for file in &self.files {
            touch(&models, file);
        }

        let mut config = test_config(dir.path(), self.policy);
        if let Some(tweak) = self.tweak {
            tweak(&mut config);
        }

        let catalog = Catalog::load(&models, &ScanOptions::from_config(&config).unwrap()).unwrap();
        let network = FakeNetwork::default();
        let launcher = Arc::new(FakeLauncher {
            network: network.clone(),
            ready_on_spawn: self.ready_on_spawn,
            fail: AtomicBool::new(false),
            next_pid: AtomicU32::new(0),
            spawned: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        });

        let mut builder = Supervisor::builder(config.clone(), catalog)
            .launcher(launcher.clone())
            .probe(Arc::new(FakeProbe {
                network: network.clone(),
            }))
            .poll_settings(fast_polls());
        if self.config_file {
            let path = dir.path().join("lmvisor.json");
            config.save(&path).unwrap();
            builder = builder.config_path(path);
        }

        Harness {
            dir,
            supervisor: builder.build().unwrap(),
            launcher,
            network,
        }
    }
}

pub fn harness(policy: PortPolicy) -> HarnessBuilder {
    HarnessBuilder {
        policy,
        files: vec!["alpha.gguf".to_string(), "beta.gguf".to_string()],
        ready_on_spawn: true,
        config_file: false,
        tweak: None,
    }
}

impl Harness {
    pub fn config_path(&self) -> std::path::PathBuf {
        self.dir.path().join("lmvisor.json")
    }

    pub fn models_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("models")
    }

    pub fn event_kinds(&self) -> Vec<&'static str> {
        self.supervisor
            .events()
            .history()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
