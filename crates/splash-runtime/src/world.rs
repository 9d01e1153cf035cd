//! The master role: owns the configuration, spawns Scenes, broadcasts
//! buffers.

use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use splash_config::{ConfigDocument, ConfigError, SceneConfig};
use splash_core::{Value, Values};
use splash_link::ALL_PEERS;
use splash_tree::Seed;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::attribute::{Attribute, AttributeOutcome};
use crate::context::Context;
use crate::root::RootObject;

#[derive(Error, Debug)]
pub enum WorldError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = WorldError> = std::result::Result<T, E>;

/// Scenes that announced themselves, keyed by name.
struct Launched {
    scenes: Mutex<HashMap<String, Seed>>,
    condition: Condvar,
}

/// The master process: a root object plus scene lifecycle management.
pub struct World {
    root: RootObject,
    children: Vec<(String, Child)>,
    launched: Arc<Launched>,
    configuration: Option<ConfigDocument>,
}

impl World {
    pub fn new(context: Context) -> Self {
        let root = RootObject::new("world", context);
        // Unroutable buffers are fanned back out to every scene.
        root.core().set_rebroadcast_unroutable(true);

        let launched = Arc::new(Launched {
            scenes: Mutex::new(HashMap::new()),
            condition: Condvar::new(),
        });

        let announce = launched.clone();
        let this = Arc::downgrade(root.core());
        root.core().base().add_attribute(
            "sceneLaunched",
            Attribute::new()
                .args("si")
                .doc("Announcement sent by a scene once its link is up")
                .force_sync()
                .setter(move |args| {
                    let Some(core) = this.upgrade() else {
                        return AttributeOutcome::Rejected;
                    };
                    let scene = args[0].as_string();
                    let seed = args[1].as_int() as Seed;
                    info!(scene = %scene, "scene announced itself");

                    core.add_peer(&scene, seed);
                    core.queue_message(
                        &scene,
                        "registerPeer",
                        vec![
                            Value::from("world"),
                            Value::from(core.tree().seed() as i64),
                        ],
                    );

                    announce.scenes.lock().unwrap().insert(scene, seed);
                    announce.condition.notify_all();
                    AttributeOutcome::Updated
                }),
        );

        Self {
            root,
            children: Vec::new(),
            launched,
            configuration: None,
        }
    }

    pub fn root(&self) -> &RootObject {
        &self.root
    }

    /// Load a configuration document; the previous one is kept on failure.
    pub fn load_configuration(&mut self, path: &std::path::Path) -> Result<()> {
        let document = splash_config::load_configuration(path)?;
        self.configuration = Some(document);
        Ok(())
    }

    /// Walk the loaded configuration: apply world attributes, bring every
    /// scene up, then populate it. A scene that fails to spawn or to
    /// announce itself is skipped; the others proceed. Returns the number
    /// of scenes that could not be brought up.
    pub fn apply_configuration(&mut self) -> usize {
        let mut failed = 0;
        let Some(document) = self.configuration.clone() else {
            return failed;
        };

        for (attribute, args) in document.world_attributes() {
            if attribute == "version" {
                continue;
            }
            self.root.core().base().set_attribute(&attribute, &args);
        }

        for scene_name in document.scene_names() {
            let Some(scene) = document.scene(&scene_name) else {
                continue;
            };

            if scene.spawn() && self.root.context().spawn_subprocesses {
                match self.spawn_scene(&scene_name) {
                    Ok(child) => self.children.push((scene_name.clone(), child)),
                    Err(err) => {
                        error!(scene = %scene_name, error = %err, "scene spawn failed, skipped");
                        failed += 1;
                        continue;
                    }
                }
            }

            if !self.wait_scene_launched(&scene_name, self.root.context().connect_timeout) {
                error!(scene = %scene_name, "scene never announced itself, skipped");
                failed += 1;
                continue;
            }
            self.root.link().connect_to(&scene_name);
            self.root.flush_outbox();

            for (object_name, type_name, attributes) in scene.objects() {
                self.add_object(&scene_name, &type_name, &object_name, &attributes);
            }
            for (source, destination) in scene.links() {
                self.root.send_message(
                    &scene_name,
                    "link",
                    &vec![Value::from(source), Value::from(destination)],
                );
            }
            for (attribute, args) in scene.attributes() {
                self.root.send_message(&scene_name, &attribute, &args);
            }
        }
        failed
    }

    /// Load a partial configuration: existing savable objects are disposed
    /// of and rebuilt from the project file, on every scene at once.
    pub fn load_project(&mut self, path: &std::path::Path) -> Result<()> {
        let document = splash_config::load_configuration(path)?;
        if !document.is_project() {
            return Err(ConfigError::InvalidDocument(format!(
                "{} is not a project file",
                path.display()
            ))
            .into());
        }

        for (_, object) in self.root.core().snapshot() {
            if object.core().is_savable() {
                self.root.core().dispose_object(&object.core().name());
            }
        }
        self.root.step_begin();

        // A project holds the same objects/links subset as a scene entry.
        let view = SceneConfig {
            json: &document.json,
        };
        for (object_name, type_name, attributes) in view.objects() {
            self.add_object(ALL_PEERS, &type_name, &object_name, &attributes);
            if let Some(object) = self.root.core().get_object(&object_name) {
                object.core().set_savable(true);
            }
        }
        for (source, destination) in view.links() {
            self.root.send_message(
                ALL_PEERS,
                "link",
                &vec![Value::from(source), Value::from(destination)],
            );
        }
        info!(path = %path.display(), "project loaded");
        Ok(())
    }

    /// Create the scene-side object, and a local shadow for buffer-carrying
    /// types so the World can feed them.
    fn add_object(&self, scene: &str, type_name: &str, name: &str, attributes: &[(String, Values)]) {
        if self.root.core().factory().is_buffer_type(type_name) {
            self.root.core().create_object(type_name, name);
        }
        self.root.send_message(
            scene,
            "addObject",
            &vec![Value::from(type_name), Value::from(name)],
        );

        for (attribute, args) in attributes {
            if let Some(shadow) = self.root.core().get_object(name) {
                shadow.core().set_attribute(attribute, args);
            }
            self.root.send_message(name, attribute, args);
        }
    }

    fn spawn_scene(&self, name: &str) -> std::io::Result<Child> {
        let executable = std::env::current_exe()?;
        let context = self.root.context();
        let mut command = std::process::Command::new(executable);
        command
            .arg("--child")
            .arg("--prefix")
            .arg(&context.socket_prefix);
        if context.channel == splash_link::ChannelKind::Memory {
            command.args(["--channel", "shmem"]);
        }
        if context.hide_windows {
            command.arg("--hide");
        }
        command.arg(name);
        let child = command.spawn()?;
        info!(scene = name, pid = child.id(), "scene process spawned");
        Ok(child)
    }

    /// Wait for `sceneLaunched` from the given scene.
    fn wait_scene_launched(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut scenes = self.launched.scenes.lock().unwrap();
        while !scenes.contains_key(name) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, wait) = self.launched.condition.wait_timeout(scenes, left).unwrap();
            scenes = guard;
            if wait.timed_out() && !scenes.contains_key(name) {
                return false;
            }
        }
        true
    }

    /// Main loop: step until asked to quit, then tear the session down.
    pub fn run(&mut self) {
        let show_timings = self.root.context().show_timings;
        while !self.root.core().should_quit() {
            let start = Instant::now();
            self.root.step_begin();
            self.root.distribute_buffers();
            self.root.step_end();
            if show_timings {
                info!(step_us = start.elapsed().as_micros() as u64, "world step");
            }
            self.root.wait_frame();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!("world shutting down");
        self.root.send_message(ALL_PEERS, "quit", &Vec::new());
        self.root
            .link()
            .wait_for_buffer_sending(Duration::from_millis(200));

        let deadline = Instant::now() + Duration::from_secs(2);
        for (name, child) in &mut self.children {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(scene = %name, %status, "scene exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Ok(None) => {
                        warn!(scene = %name, "scene unresponsive, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Err(err) => {
                        warn!(scene = %name, error = %err, "cannot reap scene");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splash_link::ChannelKind;

    fn test_context(dir: &std::path::Path) -> Context {
        Context {
            endpoint_dir: dir.to_path_buf(),
            socket_prefix: format!("world{}", std::process::id()),
            channel: ChannelKind::Socket,
            spawn_subprocesses: false,
            connect_timeout: Duration::from_millis(100),
            ..Context::default()
        }
    }

    #[test]
    fn world_applies_its_configuration_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new(test_context(dir.path()));

        let path = dir.path().join("splash.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "description": splash_config::FILE_CONFIGURATION,
                "version": splash_config::SCHEMA_VERSION,
                "world": {"framerate": 30},
                "scenes": {}
            })
            .to_string(),
        )
        .unwrap();

        assert!(world.load_configuration(&path).is_ok());
        world.apply_configuration();
    }

    #[test]
    fn a_failed_load_keeps_the_previous_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new(test_context(dir.path()));

        let good = dir.path().join("good.json");
        std::fs::write(
            &good,
            serde_json::json!({
                "description": splash_config::FILE_CONFIGURATION,
                "version": splash_config::SCHEMA_VERSION,
                "world": {},
                "scenes": {}
            })
            .to_string(),
        )
        .unwrap();
        assert!(world.load_configuration(&good).is_ok());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(world.load_configuration(&bad).is_err());
        assert!(world.configuration.is_some());
    }

    #[test]
    fn projects_replace_savable_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new(test_context(dir.path()));

        world.root().core().create_object("image", "old").unwrap();
        world
            .root()
            .core()
            .get_object("old")
            .unwrap()
            .core()
            .set_savable(true);

        let path = dir.path().join("show.project");
        std::fs::write(
            &path,
            serde_json::json!({
                "description": splash_config::FILE_PROJECT,
                "version": splash_config::SCHEMA_VERSION,
                "objects": {"img": {"type": "image"}},
                "links": []
            })
            .to_string(),
        )
        .unwrap();

        world.load_project(&path).unwrap();
        assert!(world.root().core().get_object("old").is_none());
        let replacement = world.root().core().get_object("img").unwrap();
        assert!(replacement.core().is_savable());

        // A full configuration is not a valid project.
        let config = dir.path().join("config.json");
        std::fs::write(
            &config,
            serde_json::json!({
                "description": splash_config::FILE_CONFIGURATION,
                "version": splash_config::SCHEMA_VERSION,
                "world": {},
                "scenes": {}
            })
            .to_string(),
        )
        .unwrap();
        assert!(world.load_project(&config).is_err());
    }

    #[test]
    fn scenes_that_never_announce_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = World::new(test_context(dir.path()));

        let path = dir.path().join("splash.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "description": splash_config::FILE_CONFIGURATION,
                "version": splash_config::SCHEMA_VERSION,
                "world": {},
                "scenes": {
                    "ghost": {"spawn": false, "objects": {"img": {"type": "image"}}}
                }
            })
            .to_string(),
        )
        .unwrap();
        world.load_configuration(&path).unwrap();
        // No child is spawned and nothing announces "ghost": the scene is
        // skipped without creating its objects.
        world.apply_configuration();
        assert!(world.root().core().get_object("img").is_none());
    }
}
