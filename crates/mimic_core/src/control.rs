//! Synchronous command surface for an embedding host.
//!
//! Every command returns an empty string on success and the error text otherwise.

use std::sync::Arc;

use mimic_traits::Result;
use tokio::runtime::Runtime;
use tracing::{error, info};

use crate::supervisor::Supervisor;

pub const SMOKE_TEST_OUTPUT: &str = "smoke test success";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartProxy { intercept_addr: String, inspector_addr: String },
    StartEgress { listen_addr: String },
    Stop,
    SaveSettings { document: String },
    SmokeTest,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartProxy { .. } => "startProxy",
            Command::StartEgress { .. } => "startEgress",
            Command::Stop => "stop",
            Command::SaveSettings { .. } => "saveSettings",
            Command::SmokeTest => "smokeTest",
        }
    }
}

/// Drives a [`Supervisor`] on a runtime it owns, so callers need no async context.
pub struct ControlSurface {
    runtime: Runtime,
    supervisor: Arc<Supervisor>,
}

impl ControlSurface {
    pub fn new(supervisor: Arc<Supervisor>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("mimic-worker")
            .build()?;
        Ok(Self { runtime, supervisor })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn execute(&self, command: Command) -> String {
        let name = command.name();
        let result: Result<()> = match command {
            Command::StartProxy { intercept_addr, inspector_addr } => self
                .runtime
                .block_on(self.supervisor.start(&intercept_addr, &inspector_addr))
                .map(|_| ()),
            Command::StartEgress { listen_addr } => self
                .runtime
                .block_on(self.supervisor.start_egress(&listen_addr))
                .map(|_| ()),
            Command::Stop => {
                self.runtime.block_on(self.supervisor.stop());
                Ok(())
            }
            Command::SaveSettings { document } => {
                self.supervisor.apply_settings(&document).map(|_| ())
            }
            Command::SmokeTest => {
                println!("{SMOKE_TEST_OUTPUT}");
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                info!(command = name, "ok");
                String::new()
            }
            Err(e) => {
                error!(command = name, error = %e, "failed");
                e.to_string()
            }
        }
    }

    pub fn start_proxy(&self, intercept_addr: &str, inspector_addr: &str) -> String {
        self.execute(Command::StartProxy {
            intercept_addr: intercept_addr.to_string(),
            inspector_addr: inspector_addr.to_string(),
        })
    }

    pub fn start_egress(&self, listen_addr: &str) -> String {
        self.execute(Command::StartEgress {
            listen_addr: listen_addr.to_string(),
        })
    }

    pub fn stop(&self) -> String {
        self.execute(Command::Stop)
    }

    pub fn save_settings(&self, document: &str) -> String {
        self.execute(Command::SaveSettings {
            document: document.to_string(),
        })
    }

    pub fn smoke_test(&self) -> String {
        self.execute(Command::SmokeTest)
    }
}

impl Drop for ControlSurface {
    fn drop(&mut self) {
        self.runtime.block_on(self.supervisor.stop());
    }
}
