//! The worker role: receives tree updates and buffers, drives one render
//! pipeline.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use splash_core::Value;
use tracing::{debug, info};

use crate::attribute::{Attribute, AttributeOutcome};
use crate::context::Context;
use crate::root::RootObject;

/// A worker process: a root object plus the render-side message surface.
pub struct Scene {
    root: RootObject,
    run_in_background: Arc<AtomicBool>,
    swap_interval: Arc<AtomicI64>,
}

impl Scene {
    pub fn new(name: &str, context: Context) -> Self {
        let root = RootObject::new(name, context);
        let run_in_background = Arc::new(AtomicBool::new(false));
        let swap_interval = Arc::new(AtomicI64::new(1));
        register_scene_attributes(&root, &run_in_background, &swap_interval);

        Self {
            root,
            run_in_background,
            swap_interval,
        }
    }

    pub fn root(&self) -> &RootObject {
        &self.root
    }

    pub fn swap_interval(&self) -> i64 {
        self.swap_interval.load(Ordering::SeqCst)
    }

    pub fn runs_in_background(&self) -> bool {
        self.run_in_background.load(Ordering::SeqCst)
    }

    /// Open the link towards the World and announce this scene. The World
    /// answers with its own peer registration.
    pub fn announce(&self) -> bool {
        if !self.root.link().connect_to("world") {
            return false;
        }
        let announced = self.root.send_message(
            "world",
            "sceneLaunched",
            &vec![
                Value::from(self.root.name()),
                Value::from(self.root.core().tree().seed() as i64),
            ],
        );
        if announced {
            info!(scene = %self.root.name(), "announced to world");
        }
        announced
    }

    /// One iteration of the main loop, without the frame wait.
    pub fn step(&self) {
        self.root.step_begin();
        self.render();
        self.root.step_end();
    }

    /// Main loop: step, render, repeat until asked to quit.
    pub fn run(&mut self) {
        while !self.root.core().should_quit() {
            self.step();
            self.root.wait_frame();
        }
        info!(scene = %self.root.name(), "scene leaving its main loop");
    }

    /// The render pass proper is carried by the GPU backends; here it
    /// reduces to walking the buffer objects in priority order and holding
    /// their read locks, which is the contract renderers rely on.
    fn render(&self) {
        let mut objects = self.root.core().snapshot();
        objects.sort_by_key(|(_, object)| object.priority());

        for (_, object) in objects {
            let Some(buffer) = object.as_buffer() else {
                continue;
            };
            if buffer.buffer_core().was_updated() {
                let _read = buffer.buffer_core().read_lock();
                debug!(object = %object.core().name(), "consumed updated buffer");
            }
        }
    }
}

fn register_scene_attributes(
    root: &RootObject,
    run_in_background: &Arc<AtomicBool>,
    swap_interval: &Arc<AtomicI64>,
) {
    let core = root.core();

    let this = Arc::downgrade(core);
    core.base().add_attribute(
        "addObject",
        Attribute::new()
            .args("ss")
            .doc("Create an object of the given type and name")
            .force_sync()
            .setter(move |args| {
                let Some(core) = this.upgrade() else {
                    return AttributeOutcome::Rejected;
                };
                match core.create_object(&args[0].as_string(), &args[1].as_string()) {
                    Some(_) => AttributeOutcome::Updated,
                    None => AttributeOutcome::Rejected,
                }
            }),
    );

    let this = Arc::downgrade(core);
    core.base().add_attribute(
        "deleteObject",
        Attribute::new()
            .args("s")
            .doc("Dispose of the named object at the next step")
            .setter(move |args| {
                let Some(core) = this.upgrade() else {
                    return AttributeOutcome::Rejected;
                };
                core.dispose_object(&args[0].as_string());
                AttributeOutcome::Updated
            }),
    );

    core.base().add_attribute(
        "start",
        Attribute::new()
            .doc("Start rendering")
            .setter(|_| AttributeOutcome::Updated),
    );

    // The upload fence: wake the render side so freshly deserialized
    // buffers are consumed on the very next frame.
    let signal = core.signal().clone();
    core.base().add_attribute(
        "uploadTextures",
        Attribute::new()
            .doc("Fence broadcast by the world after a buffer batch")
            .force_sync()
            .setter(move |_| {
                signal.signal();
                AttributeOutcome::Updated
            }),
    );

    let background = run_in_background.clone();
    core.base().add_attribute(
        "runInBackground",
        Attribute::new()
            .args("b")
            .doc("Keep rendering without a visible window")
            .setter(move |args| {
                background.store(args[0].as_bool(), Ordering::SeqCst);
                AttributeOutcome::Updated
            }),
    );

    let interval = swap_interval.clone();
    core.base().add_attribute(
        "swapInterval",
        Attribute::new()
            .args("i")
            .doc("Framebuffer swap interval, 0 for immediate")
            .setter(move |args| {
                interval.store(args[0].as_int(), Ordering::SeqCst);
                AttributeOutcome::Updated
            }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GraphObject;
    use splash_link::ChannelKind;
    use std::time::Duration;

    fn test_context(dir: &std::path::Path, prefix: &str) -> Context {
        Context {
            endpoint_dir: dir.to_path_buf(),
            socket_prefix: format!("{prefix}{}", std::process::id()),
            channel: ChannelKind::Socket,
            connect_timeout: Duration::from_millis(300),
            ..Context::default()
        }
    }

    #[test]
    fn scene_creates_objects_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let scene = Scene::new("scene", test_context(dir.path(), "sc"));

        assert!(scene.root().core().set(
            "scene",
            "addObject",
            &vec![Value::from("image"), Value::from("img")],
            false,
        ));
        assert!(scene.root().core().get_object("img").is_some());

        scene.root().core().set(
            "scene",
            "swapInterval",
            &vec![Value::from(0)],
            false,
        );
        assert_eq!(scene.swap_interval(), 0);
    }

    #[test]
    fn broadcast_messages_reach_every_scene_root() {
        use crate::world::World;
        use splash_link::ALL_PEERS;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();

        let world = World::new(test_context(dir.path(), "bw"));
        let scene_a = Scene::new("sceneA", test_context(dir.path(), "bw"));
        let scene_b = Scene::new("sceneB", test_context(dir.path(), "bw"));
        assert!(scene_a.announce());
        assert!(scene_b.announce());
        assert!(world.root().link().connect_to("sceneA"));
        assert!(world.root().link().connect_to("sceneB"));

        assert!(world
            .root()
            .send_message(ALL_PEERS, "swapInterval", &vec![Value::from(0)]));

        let deadline = Instant::now() + Duration::from_secs(2);
        while (scene_a.swap_interval() != 0 || scene_b.swap_interval() != 0)
            && Instant::now() < deadline
        {
            scene_a.root().step_begin();
            scene_b.root().step_begin();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(scene_a.swap_interval(), 0);
        assert_eq!(scene_b.swap_interval(), 0);
    }

    #[test]
    fn end_to_end_image_transfer_between_world_and_scene() {
        use crate::buffer::BufferObject;
        use crate::image::Image;
        use crate::world::World;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        let world = World::new(test_context(dir.path(), "e2e"));
        let scene = Scene::new("scene", test_context(dir.path(), "e2e"));
        assert!(scene.announce());
        assert!(world.root().link().connect_to("scene"));

        // Scene-side receiver.
        scene
            .root()
            .core()
            .create_object("image", "img")
            .expect("image created");

        // World-side producer.
        let producer = Image::with_spec(32, 32, 4);
        producer.core().set_name("img");
        assert!(producer.set_pixels(&vec![7; 32 * 32 * 4]));
        let frame = producer.serialize();
        assert!(world.root().link().send_buffer(frame));

        let deadline = Instant::now() + Duration::from_secs(2);
        let scene_key = scene.root().core().get_key("img").unwrap();
        loop {
            let object = scene.root().core().object(scene_key).unwrap();
            let landed = {
                let buffer = object.as_buffer().unwrap();
                buffer.buffer_core().timestamp() == producer.buffer_core().timestamp()
                    && buffer.buffer_core().timestamp() != 0
            };
            if landed {
                break;
            }
            assert!(Instant::now() < deadline, "buffer never reached the scene");
            scene.step();
            std::thread::sleep(Duration::from_millis(10));
        }
        scene.step();
    }
}
