pub mod api;
pub mod catalog;
pub mod cmd;
pub mod config;
pub mod envconfig;
pub mod error;
pub mod events;
pub mod format;
pub mod middleware;
pub mod poller;
pub mod ports;
pub mod process;
pub mod server;
pub mod supervisor;

pub use catalog::{Catalog, ModelEntry, ScanOptions};
pub use config::{Config, PortPolicy};
pub use error::{Result, SupervisorError};
pub use events::{Event, EventBus, EventHandler};
pub use poller::{HealthProbe, HttpProbe, PollOutcome, PollSettings, Poller};
pub use ports::PortAllocator;
pub use process::{ChildProcess, LaunchSpec, ProcessLauncher, TokioLauncher};
pub use supervisor::{InstanceInfo, InstanceState, LoadOutcome, Supervisor};

pub use api::Client;
