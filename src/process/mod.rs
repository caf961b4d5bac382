//! Child-process launching.
//!
//! The supervisor only ever talks to [`ProcessLauncher`] and [`ChildProcess`],
//! so tests can swap the real `tokio::process` backend for an in-memory one.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Everything needed to start one inference server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub model_path: PathBuf,
    pub port: u16,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// `-m <model> --port <port>` followed by the resolved argument list.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            "-m".to_string(),
            self.model_path.to_string_lossy().into_owned(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves once the process has exited and been reaped. Yields the exit
    /// code, `None` when it was ended by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Sends a single forceful terminate. Does not wait.
    fn start_kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(spec.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        tracing::debug!(program = %spec.program, args = ?spec.argv(), "Spawning child process");
        let child = command.spawn()?;
        Ok(Box::new(TokioChild(child)))
    }
}

struct TokioChild(Child);

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.0.wait().await.map(|status| status.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }
}

/// Opens `url` in the desktop's default browser.
pub fn open_browser(url: &str) -> io::Result<()> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", "start", "", url]);
        c
    } else if cfg!(target_os = "macos") {
        let mut c = Command::new("open");
        c.arg(url);
        c
    } else {
        let mut c = Command::new("xdg-open");
        c.arg(url);
        c
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}
