pub mod config;
pub mod control;
pub mod supervisor;

pub use config::SettingsStore;
pub use control::{Command, ControlSurface, SMOKE_TEST_OUTPUT};
pub use supervisor::Supervisor;

pub const DEFAULT_INTERCEPT_ADDR: &str = "127.0.0.1:8887";
pub const DEFAULT_INSPECTOR_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_EGRESS_ADDR: &str = "127.0.0.1:8888";
