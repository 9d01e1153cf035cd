//! Splash launcher. One binary, two roles: started plainly it becomes the
//! World and brings up its Scenes; started with `--child` it is one of
//! those Scenes.

// crate-specific lint exceptions:
//#![allow()]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgEnum, Parser};
use splash_link::ChannelKind;
use splash_runtime::{Context, Scene, World};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "/var/log/splash.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
enum ChannelArg {
    Socket,
    Shmem,
}

#[derive(Parser, Debug)]
#[clap(name = "splash")]
#[clap(about = "Modular video-mapping engine", version, author)]
struct Cli {
    /// Configuration file to open
    #[clap(short = 'o', long = "open", value_name = "FILE")]
    open: Option<PathBuf>,

    /// Run as a child scene, named by the positional argument
    #[clap(short = 'c', long = "child")]
    child: bool,

    /// Verbose debug logs
    #[clap(short = 'd', long = "debug")]
    debug: bool,

    /// Only log errors
    #[clap(short = 's', long = "silent", conflicts_with = "debug")]
    silent: bool,

    /// Log main loop timings
    #[clap(short = 't', long = "timer")]
    timer: bool,

    /// Socket prefix, to distinguish concurrent sessions
    #[clap(short = 'p', long = "prefix", value_name = "PREFIX")]
    prefix: Option<String>,

    /// Python script to attach to the session
    #[clap(short = 'P', long = "python", value_name = "SCRIPT")]
    python: Option<PathBuf>,

    /// Hide all windows
    #[clap(short = 'H', long = "hide")]
    hide: bool,

    /// Do not spawn scene subprocesses, the caller does
    #[clap(short = 'x', long = "no-spawn")]
    no_spawn: bool,

    /// Log to /var/log/splash.log
    #[clap(short = 'l', long = "log2file")]
    log_to_file: bool,

    /// Transport carrying messages and buffers between processes
    #[clap(long = "channel", arg_enum, default_value = "socket")]
    channel: ChannelArg,

    /// Configuration file, or the scene name with --child
    #[clap(value_name = "FILE|SCENE")]
    target: Option<String>,
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.silent {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cli.log_to_file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_FILE)
        {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Arc::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(err) => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                warn!(path = LOG_FILE, error = %err, "cannot open log file, logging to stderr");
                return;
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_context(cli: &Cli) -> Context {
    let configuration_file = cli
        .open
        .clone()
        .or_else(|| (!cli.child).then(|| cli.target.clone().map(PathBuf::from)).flatten());

    Context {
        configuration_file,
        child_process: cli.child,
        child_scene_name: cli
            .target
            .clone()
            .filter(|_| cli.child)
            .unwrap_or_else(|| "scene".to_string()),
        spawn_subprocesses: !cli.no_spawn,
        hide_windows: cli.hide,
        log_to_file: cli.log_to_file,
        socket_prefix: cli
            .prefix
            .clone()
            .unwrap_or_else(|| std::process::id().to_string()),
        channel: match cli.channel {
            ChannelArg::Socket => ChannelKind::Socket,
            ChannelArg::Shmem => ChannelKind::Memory,
        },
        python_script: cli.python.clone(),
        show_timings: cli.timer,
        ..Context::default()
    }
}

fn run_world(context: Context) -> ExitCode {
    let mut world = World::new(context);

    if let Some(path) = world.root().context().configuration_file.clone() {
        if let Err(err) = world.load_configuration(&path) {
            error!(error = %err, "configuration load failed");
            return ExitCode::FAILURE;
        }
        info!(path = %path.display(), "configuration loaded");
    }

    if world.root().context().python_script.is_some() {
        warn!("python scripting is not available in this build");
    }

    let failed_scenes = world.apply_configuration();
    world.run();

    if failed_scenes > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_scene(context: Context) -> ExitCode {
    let name = context.child_scene_name.clone();
    let mut scene = Scene::new(&name, context);

    if !scene.announce() {
        error!(scene = %name, "cannot reach the world process");
        return ExitCode::FAILURE;
    }
    scene.run();
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let context = build_context(&cli);
    if cli.child {
        run_scene(context)
    } else {
        run_world(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_flags_onto_the_context() {
        let cli = Cli::parse_from([
            "splash", "-x", "-H", "-p", "demo", "--channel", "shmem", "show.json",
        ]);
        let context = build_context(&cli);

        assert!(!context.spawn_subprocesses);
        assert!(context.hide_windows);
        assert_eq!(context.socket_prefix, "demo");
        assert_eq!(context.channel, ChannelKind::Memory);
        assert_eq!(
            context.configuration_file,
            Some(PathBuf::from("show.json"))
        );
        assert!(!context.child_process);
    }

    #[test]
    fn child_invocations_name_the_scene() {
        let cli = Cli::parse_from(["splash", "--child", "--prefix", "1234", "left"]);
        let context = build_context(&cli);

        assert!(context.child_process);
        assert_eq!(context.child_scene_name, "left");
        assert_eq!(context.socket_prefix, "1234");
        assert_eq!(context.configuration_file, None);
    }
}
