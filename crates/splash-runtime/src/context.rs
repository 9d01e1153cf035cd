//! Launch context shared by every root object of a process.

use std::path::PathBuf;
use std::time::Duration;

use splash_link::{ChannelConfig, ChannelKind};

/// Everything a root needs to know at construction: where the
/// configuration lives, which transport to use, and how this process was
/// started. Built from the CLI by the binary, or by hand in tests.
#[derive(Debug, Clone)]
pub struct Context {
    pub configuration_file: Option<PathBuf>,
    /// True when this process is a Scene spawned by a World.
    pub child_process: bool,
    pub child_scene_name: String,
    pub spawn_subprocesses: bool,
    pub hide_windows: bool,
    pub log_to_file: bool,
    pub socket_prefix: String,
    pub channel: ChannelKind,
    /// Directory holding the IPC endpoints.
    pub endpoint_dir: PathBuf,
    /// Wait budget when connecting channels and launching scenes.
    pub connect_timeout: Duration,
    pub python_script: Option<PathBuf>,
    /// Target rate of the main loop, frames per second.
    pub frame_rate: u64,
    /// Log per-step timings of the main loop.
    pub show_timings: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            configuration_file: None,
            child_process: false,
            child_scene_name: "scene".to_string(),
            spawn_subprocesses: true,
            hide_windows: false,
            log_to_file: false,
            socket_prefix: std::process::id().to_string(),
            channel: ChannelKind::default(),
            endpoint_dir: PathBuf::from("/tmp"),
            connect_timeout: Duration::from_secs(5),
            python_script: None,
            frame_rate: 60,
            show_timings: false,
        }
    }
}

impl Context {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            kind: self.channel,
            prefix: self.socket_prefix.clone(),
            base_dir: self.endpoint_dir.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    /// Duration of one frame at the target rate.
    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate.max(1))
    }
}
