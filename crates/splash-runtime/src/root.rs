//! Root objects: the per-process container owning the object registry, the
//! replicated tree and the link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;
use slotmap::SlotMap;
use splash_core::{SerializedObject, Value, Values};
use splash_link::{Link, LinkHandler, ALL_PEERS};
use splash_tree::{Command, Seed, Tree};
use tracing::{debug, info, warn};

use crate::attribute::{Attribute, AttributeOutcome, SyncPolicy};
use crate::buffer::{run_deserialize, stage_serialized, UpdateSignal};
use crate::context::Context;
use crate::factory::Factory;
use crate::object::{GraphObject, ObjectCore};

slotmap::new_key_type! {
    /// Stable handle to an object owned by a root. Dereference through the
    /// owning [`RootCore`]; a disposed object simply stops resolving.
    pub struct ObjectKey;
}

/// Attribute name carrying batched tree commands between roots.
const TREE_COMMAND_ATTR: &str = "treeCommand";

/// Meta-commands a root executes from its tree partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeCommandKind {
    CallObject,
    CallRoot,
}

impl TreeCommandKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::CallObject => "callObject",
            Self::CallRoot => "callRoot",
        }
    }
}

#[derive(Default)]
struct AnswerState {
    expected: String,
    received: Option<Values>,
}

/// Rendezvous for [`RootObject::send_message_with_answer`].
struct Answer {
    state: Mutex<AnswerState>,
    condition: Condvar,
    /// Serializes outstanding queries.
    serialize: Mutex<()>,
}

struct Registry {
    slab: SlotMap<ObjectKey, Arc<dyn GraphObject>>,
    names: IndexMap<String, ObjectKey>,
}

pub(crate) enum WorkerJob {
    Deserialize(ObjectKey),
    Terminate,
}

/// The shareable part of a root: everything the link threads and attribute
/// closures may touch. The [`RootObject`] wraps it together with the link
/// and the main-loop methods.
pub struct RootCore {
    name: String,
    base: ObjectCore,
    tree: Tree,
    factory: Factory,
    registry: Mutex<Registry>,
    pending_dispose: Mutex<Vec<String>>,
    signal: Arc<UpdateSignal>,
    tree_inbox: Mutex<Vec<Command>>,
    /// Messages queued by attribute handlers, flushed by the main loop.
    outbox: Mutex<Vec<(String, String, Values)>>,
    /// Buffers for targets this root does not own.
    unroutable: Mutex<Vec<SerializedObject>>,
    /// World sets this: unroutable buffers are re-sent to every peer
    /// instead of dropped.
    rebroadcast_unroutable: AtomicBool,
    answer: Arc<Answer>,
    quit: Arc<AtomicBool>,
    peers: Mutex<IndexMap<String, Seed>>,
    object_links: Mutex<Vec<(String, String)>>,
    deser_tx: Sender<WorkerJob>,
    command_counter: AtomicU64,
}

impl RootCore {
    fn new(name: &str, factory: Factory) -> (Arc<Self>, Receiver<WorkerJob>) {
        let (deser_tx, deser_rx) = unbounded();
        let base = ObjectCore::new();
        base.set_name(name);

        let core = Arc::new(Self {
            name: name.to_string(),
            base,
            tree: Tree::new(),
            factory,
            registry: Mutex::new(Registry {
                slab: SlotMap::with_key(),
                names: IndexMap::new(),
            }),
            pending_dispose: Mutex::new(Vec::new()),
            signal: UpdateSignal::new(),
            tree_inbox: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            unroutable: Mutex::new(Vec::new()),
            rebroadcast_unroutable: AtomicBool::new(false),
            answer: Arc::new(Answer {
                state: Mutex::new(AnswerState::default()),
                condition: Condvar::new(),
                serialize: Mutex::new(()),
            }),
            quit: Arc::new(AtomicBool::new(false)),
            peers: Mutex::new(IndexMap::new()),
            object_links: Mutex::new(Vec::new()),
            deser_tx,
            command_counter: AtomicU64::new(0),
        });

        let _ = core.tree.create_branch_at(&format!("/{name}/commands"));
        core.register_root_attributes();
        (core, deser_rx)
    }

    fn register_root_attributes(self: &Arc<Self>) {
        let answer = self.answer.clone();
        self.base.add_attribute(
            "answerMessage",
            Attribute::new()
                .doc("Rendezvous for queries awaiting an answer")
                .force_sync()
                .setter(move |args| {
                    let mut state = answer.state.lock().unwrap();
                    if args.is_empty() || args[0].as_string() != state.expected {
                        return AttributeOutcome::Rejected;
                    }
                    state.received = Some(args.clone());
                    answer.condition.notify_one();
                    AttributeOutcome::Updated
                }),
        );

        let quit = self.quit.clone();
        self.base.add_attribute(
            "quit",
            Attribute::new()
                .doc("Ask this root to leave its main loop")
                .force_sync()
                .setter(move |_| {
                    quit.store(true, Ordering::SeqCst);
                    AttributeOutcome::Updated
                }),
        );

        let this = Arc::downgrade(self);
        self.base.add_attribute(
            "registerPeer",
            Attribute::new()
                .args("si")
                .doc("Declare a peer root and its tree seed")
                .force_sync()
                .setter(move |args| {
                    let Some(core) = this.upgrade() else {
                        return AttributeOutcome::Rejected;
                    };
                    core.add_peer(&args[0].as_string(), args[1].as_int() as Seed);
                    AttributeOutcome::Updated
                }),
        );

        let this = Arc::downgrade(self);
        self.base.add_attribute(
            "link",
            Attribute::new()
                .args("ss")
                .doc("Connect two objects of this root")
                .setter(move |args| {
                    let Some(core) = this.upgrade() else {
                        return AttributeOutcome::Rejected;
                    };
                    let pair = (args[0].as_string(), args[1].as_string());
                    let mut links = core.object_links.lock().unwrap();
                    if links.contains(&pair) {
                        return AttributeOutcome::NoChange;
                    }
                    links.push(pair);
                    AttributeOutcome::Updated
                }),
        );

        let this = Arc::downgrade(self);
        self.base.add_attribute(
            "unlink",
            Attribute::new()
                .args("ss")
                .doc("Disconnect two objects of this root")
                .setter(move |args| {
                    let Some(core) = this.upgrade() else {
                        return AttributeOutcome::Rejected;
                    };
                    let pair = (args[0].as_string(), args[1].as_string());
                    let mut links = core.object_links.lock().unwrap();
                    let before = links.len();
                    links.retain(|existing| *existing != pair);
                    if links.len() == before {
                        AttributeOutcome::NoChange
                    } else {
                        AttributeOutcome::Updated
                    }
                }),
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root's own attribute map and task queues.
    pub fn base(&self) -> &ObjectCore {
        &self.base
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    pub fn signal(&self) -> &Arc<UpdateSignal> {
        &self.signal
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn ask_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// World-role switch: forward buffers for unknown targets instead of
    /// dropping them.
    pub fn set_rebroadcast_unroutable(&self, enabled: bool) {
        self.rebroadcast_unroutable.store(enabled, Ordering::SeqCst);
    }

    pub fn add_peer(&self, peer: &str, seed: Seed) {
        self.tree.add_seed(seed);
        let known = self
            .peers
            .lock()
            .unwrap()
            .insert(peer.to_string(), seed)
            .is_some();
        if !known {
            info!(root = %self.name, peer, seed, "registered peer root");
        }
    }

    pub fn peers(&self) -> Vec<(String, Seed)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, seed)| (name.clone(), *seed))
            .collect()
    }

    pub fn object_links(&self) -> Vec<(String, String)> {
        self.object_links.lock().unwrap().clone()
    }

    /// Queue a message for the main loop to send through the link. Used by
    /// attribute handlers, which never touch the link directly.
    pub fn queue_message(&self, target: &str, attribute: &str, args: Values) {
        self.outbox
            .lock()
            .unwrap()
            .push((target.to_string(), attribute.to_string(), args));
    }

    pub(crate) fn take_outbox(&self) -> Vec<(String, String, Values)> {
        std::mem::take(&mut self.outbox.lock().unwrap())
    }

    pub(crate) fn take_unroutable(&self) -> Vec<SerializedObject> {
        std::mem::take(&mut self.unroutable.lock().unwrap())
    }

    /// Create an object, or return the existing one when the type matches.
    pub fn create_object(&self, type_name: &str, name: &str) -> Option<ObjectKey> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(&key) = registry.names.get(name) {
            let existing = registry.slab[key].clone();
            if existing.type_name() == type_name {
                return Some(key);
            }
            warn!(
                root = %self.name,
                name,
                existing = existing.type_name(),
                requested = type_name,
                "object exists with a different type"
            );
            return None;
        }

        let object = self.factory.create(type_name, name)?;
        object.core().set_savable(false);
        if let Some(buffer) = object.as_buffer() {
            buffer.buffer_core().attach_signal(self.signal.clone());
        }
        let key = registry.slab.insert(object);
        registry.names.insert(name.to_string(), key);
        debug!(root = %self.name, type_name, name, "object created");
        Some(key)
    }

    /// Mark for deferred deletion; the erase happens at the next step, so
    /// no task holding the object sees it vanish mid-run.
    pub fn dispose_object(&self, name: &str) {
        self.pending_dispose.lock().unwrap().push(name.to_string());
    }

    pub(crate) fn run_disposals(&self) {
        let names = std::mem::take(&mut *self.pending_dispose.lock().unwrap());
        if names.is_empty() {
            return;
        }
        let mut registry = self.registry.lock().unwrap();
        for name in names {
            if let Some(key) = registry.names.shift_remove(&name) {
                registry.slab.remove(key);
                debug!(root = %self.name, name, "object disposed");
            }
        }
    }

    pub fn get_object(&self, name: &str) -> Option<Arc<dyn GraphObject>> {
        let registry = self.registry.lock().unwrap();
        let key = *registry.names.get(name)?;
        Some(registry.slab[key].clone())
    }

    pub fn get_key(&self, name: &str) -> Option<ObjectKey> {
        self.registry.lock().unwrap().names.get(name).copied()
    }

    /// Resolve a handle; `None` once the object has been disposed.
    pub fn object(&self, key: ObjectKey) -> Option<Arc<dyn GraphObject>> {
        self.registry.lock().unwrap().slab.get(key).cloned()
    }

    /// All live objects in insertion order.
    pub fn snapshot(&self) -> Vec<(ObjectKey, Arc<dyn GraphObject>)> {
        let registry = self.registry.lock().unwrap();
        registry
            .names
            .values()
            .map(|&key| (key, registry.slab[key].clone()))
            .collect()
    }

    /// Route an attribute set. Self and `__ALL__` land on the root's own
    /// attributes; `force_sync` attributes run inline regardless of
    /// `async_set`.
    pub fn set(&self, name: &str, attribute: &str, args: &Values, async_set: bool) -> bool {
        if name == self.name || name == ALL_PEERS {
            return self.base.set_attribute(attribute, args).is_ok();
        }

        let Some(object) = self.get_object(name) else {
            debug!(root = %self.name, name, attribute, "set on unknown object");
            return false;
        };
        let force_sync = object.core().attribute_policy(attribute) == SyncPolicy::ForceSync;
        if async_set && !force_sync {
            let attribute = attribute.to_string();
            let args = args.clone();
            self.base.add_task(move || {
                object.core().set_attribute(&attribute, &args);
            });
            true
        } else {
            object.core().set_attribute(attribute, args).is_ok()
        }
    }

    /// Route an inbound serialized buffer to its object for asynchronous
    /// deserialization, or hand it to the role fallback.
    pub fn set_from_serialized(&self, name: &str, buffer: SerializedObject) -> bool {
        let found = {
            let registry = self.registry.lock().unwrap();
            registry
                .names
                .get(name)
                .map(|&key| (key, registry.slab[key].clone()))
        };

        match found {
            Some((key, object)) => {
                let Some(buffer_object) = object.as_buffer() else {
                    warn!(root = %self.name, name, "buffer aimed at a non-buffer object");
                    return false;
                };
                if stage_serialized(buffer_object, buffer) {
                    let _ = self.deser_tx.send(WorkerJob::Deserialize(key));
                    true
                } else {
                    // One deserialization at a time; the frame is dropped.
                    false
                }
            }
            None => {
                if self.rebroadcast_unroutable.load(Ordering::SeqCst) {
                    self.unroutable.lock().unwrap().push(buffer);
                    self.signal.signal();
                    true
                } else {
                    debug!(root = %self.name, name, "buffer for unknown target dropped");
                    false
                }
            }
        }
    }

    /// Write a meta-command into `target`'s tree partition; replication
    /// carries it over and the target executes it on its next step.
    pub fn add_tree_command(&self, target: &str, command: TreeCommandKind, args: &Values) -> bool {
        let id = self.command_counter.fetch_add(1, Ordering::SeqCst);
        let path = format!("/{target}/commands/cmd_{}_{id}", self.tree.seed());
        let mut list = vec![Value::from(command.as_str())];
        list.extend(args.iter().cloned());
        self.tree
            .create_leaf_at(&path, Some(Value::new_values(list)))
            .is_ok()
    }

    pub(crate) fn process_tree_inbox(&self) {
        let commands = std::mem::take(&mut *self.tree_inbox.lock().unwrap());
        self.tree.apply_commands(commands);
    }

    pub(crate) fn execute_tree_commands(&self) {
        let base_path = format!("/{}/commands", self.name);
        let Ok(leaves) = self.tree.get_leaf_list_at(&base_path) else {
            return;
        };

        for leaf in leaves {
            let path = format!("{base_path}/{leaf}");
            let Some(value) = self.tree.get_value_at(&path) else {
                continue;
            };
            let _ = self.tree.remove_leaf_at(&path);

            let Some(args) = value.elements() else {
                continue;
            };
            match args.first().map(Value::as_string).as_deref() {
                Some("callObject") if args.len() >= 3 => {
                    let object = args[1].as_string();
                    let attribute = args[2].as_string();
                    self.set(&object, &attribute, &args[3..].to_vec(), false);
                }
                Some("callRoot") if args.len() >= 2 => {
                    let attribute = args[1].as_string();
                    let name = self.name.clone();
                    self.set(&name, &attribute, &args[2..].to_vec(), false);
                }
                other => {
                    warn!(root = %self.name, command = ?other, "unknown tree command");
                }
            }
        }
    }

    /// Mirror every dirty object's attributes into the tree.
    pub(crate) fn update_tree_from_objects(&self) {
        for (_, object) in self.snapshot() {
            if !object.was_updated() {
                continue;
            }
            object.set_not_updated();

            let name = object.core().name();
            for attribute in object.core().attributes_list() {
                let Some(values) = object.core().get_attribute(&attribute) else {
                    continue;
                };
                let path = format!("/{}/objects/{}/attributes/{}", self.name, name, attribute);
                if !self.tree.has_leaf_at(&path) {
                    let _ = self.tree.create_leaf_at(&path, None);
                }
                let _ = self.tree.set_value_at(&path, Value::new_values(values), None);
            }
        }
    }
}

impl LinkHandler for RootCore {
    fn handle_message(&self, target: &str, attribute: &str, args: Values) {
        if attribute == TREE_COMMAND_ATTR {
            if target == self.name || target == ALL_PEERS {
                let commands = args.iter().filter_map(Command::from_value);
                self.tree_inbox.lock().unwrap().extend(commands);
            }
            return;
        }
        if !self.set(target, attribute, &args, true) {
            debug!(root = %self.name, dest = target, attribute, "inbound message not applied");
        }
    }

    fn handle_buffer(&self, target: &str, buffer: SerializedObject) {
        self.set_from_serialized(target, buffer);
    }
}

fn spawn_deserialize_worker(core: &Arc<RootCore>, jobs: Receiver<WorkerJob>) -> JoinHandle<()> {
    let weak: Weak<RootCore> = Arc::downgrade(core);
    std::thread::Builder::new()
        .name("splash-deserialize".into())
        .spawn(move || {
            for job in jobs {
                let key = match job {
                    WorkerJob::Terminate => break,
                    WorkerJob::Deserialize(key) => key,
                };
                let Some(core) = weak.upgrade() else { break };
                let Some(object) = core.object(key) else {
                    continue;
                };
                if let Some(buffer) = object.as_buffer() {
                    if !run_deserialize(buffer) {
                        warn!(object = %object.core().name(), "deserialization failed");
                    }
                }
            }
        })
        .expect("thread spawn")
}

/// A root bound to its link: the full per-process container. World and
/// Scene compose this with their role behavior.
pub struct RootObject {
    core: Arc<RootCore>,
    link: Link,
    context: Context,
    worker: Option<JoinHandle<()>>,
}

impl RootObject {
    pub fn new(name: &str, context: Context) -> Self {
        let (core, jobs) = RootCore::new(name, Factory::new());
        let link = Link::new(name, context.channel_config(), core.clone());
        let worker = spawn_deserialize_worker(&core, jobs);
        Self {
            core,
            link,
            context,
            worker: Some(worker),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn core(&self) -> &Arc<RootCore> {
        &self.core
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Head of a step: replay inbound tree commands, execute meta-commands,
    /// settle disposals, drain task queues, refresh producers.
    pub fn step_begin(&self) {
        self.core.process_tree_inbox();
        self.core.execute_tree_commands();
        self.core.run_disposals();
        self.core.base().run_tasks();
        for (_, object) in self.core.snapshot() {
            object.core().run_tasks();
            object.update();
        }
        self.flush_outbox();
    }

    /// Serialize every updated buffer object, fence the previous batch with
    /// an `uploadTextures` broadcast, and publish. World-side behavior.
    pub fn distribute_buffers(&self) {
        let mut frames = Vec::new();
        for (_, object) in self.core.snapshot() {
            let Some(buffer) = object.as_buffer() else {
                continue;
            };
            if buffer.buffer_core().was_updated() {
                let _read = buffer.buffer_core().read_lock();
                frames.push(buffer.serialize());
            }
        }

        self.link
            .wait_for_buffer_sending(Duration::from_millis(20));
        if !frames.is_empty() {
            self.link.send_message(ALL_PEERS, "uploadTextures", &Vec::new());
        }
        for frame in self.core.take_unroutable() {
            self.link.send_buffer(frame);
        }
        for frame in frames {
            self.link.send_buffer(frame);
        }
    }

    /// Tail of a step: push dirty attributes into the tree and replicate it.
    pub fn step_end(&self) {
        self.flush_outbox();
        self.core.update_tree_from_objects();
        self.propagate_tree();
    }

    /// Block until a buffer object reports an update, bounded by the frame
    /// budget. Returns true when woken by an update.
    pub fn wait_frame(&self) -> bool {
        let budget = self.context.frame_budget();
        self.core.signal().wait(budget.as_micros() as u64)
    }

    pub(crate) fn flush_outbox(&self) {
        for (target, attribute, args) in self.core.take_outbox() {
            self.link.send_message(&target, &attribute, &args);
        }
    }

    fn propagate_tree(&self) {
        for (peer, seed) in self.core.peers() {
            let Ok(commands) = self.core.tree().drain_commands_for(seed) else {
                continue;
            };
            if commands.is_empty() {
                continue;
            }
            let args: Values = commands.iter().map(Command::to_value).collect();
            self.link.send_message(&peer, TREE_COMMAND_ATTR, &args);
        }
    }

    pub fn send_message(&self, target: &str, attribute: &str, args: &Values) -> bool {
        self.link.send_message(target, attribute, args)
    }

    /// Send and wait for the matching `answerMessage`. A zero timeout waits
    /// indefinitely; on timeout the returned list is empty.
    pub fn send_message_with_answer(
        &self,
        target: &str,
        attribute: &str,
        args: &Values,
        timeout_us: u64,
    ) -> Values {
        let answer = self.core.answer.clone();
        let _only_one = answer.serialize.lock().unwrap();

        {
            let mut state = answer.state.lock().unwrap();
            state.expected = attribute.to_string();
            state.received = None;
        }
        self.link.send_message(target, attribute, args);

        let deadline = (timeout_us > 0).then(|| Instant::now() + Duration::from_micros(timeout_us));
        let mut state = answer.state.lock().unwrap();
        while state.received.is_none() {
            match deadline {
                Some(deadline) => {
                    let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                        break;
                    };
                    let (guard, _) = answer.condition.wait_timeout(state, left).unwrap();
                    state = guard;
                }
                None => state = answer.condition.wait(state).unwrap(),
            }
        }
        let received = state.received.take().unwrap_or_default();
        state.expected.clear();
        received
    }
}

impl Drop for RootObject {
    fn drop(&mut self) {
        self.core.ask_quit();
        let _ = self.core.deser_tx.send(WorkerJob::Terminate);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferObject;
    use splash_link::ChannelKind;

    fn test_context(dir: &std::path::Path) -> Context {
        Context {
            endpoint_dir: dir.to_path_buf(),
            socket_prefix: format!("test{}", std::process::id()),
            channel: ChannelKind::Socket,
            connect_timeout: Duration::from_millis(200),
            ..Context::default()
        }
    }

    #[test]
    fn objects_are_created_set_and_disposed_through_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = RootObject::new("world", test_context(dir.path()));

        let key = root.core().create_object("image", "img").unwrap();
        assert!(root
            .core()
            .set("img", "alias", &vec![Value::from("newAlias")], true));
        root.step_begin();
        root.step_end();

        let object = root.core().object(key).unwrap();
        assert_eq!(object.core().alias(), "newAlias");

        // Creating again with the same type returns the same handle; with
        // another type, nothing.
        assert_eq!(root.core().create_object("image", "img"), Some(key));
        assert_eq!(root.core().create_object("mesh", "img"), None);

        root.core().dispose_object("img");
        root.step_begin();
        assert!(root.core().object(key).is_none());
        assert!(root.core().get_object("img").is_none());
    }

    #[test]
    fn dirty_objects_are_mirrored_into_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = RootObject::new("world", test_context(dir.path()));

        root.core().create_object("image", "img").unwrap();
        root.core()
            .set("img", "size", &vec![Value::from(64), Value::from(32)], false);
        root.step_begin();
        root.step_end();

        let size = root
            .core()
            .tree()
            .get_value_at("/world/objects/img/attributes/size")
            .unwrap();
        assert_eq!(size.as_values()[0].as_int(), 64);
    }

    #[test]
    fn staged_buffers_deserialize_asynchronously() {
        use crate::buffer::BufferObject;
        use crate::image::Image;

        let dir = tempfile::tempdir().unwrap();
        let root = RootObject::new("scene", test_context(dir.path()));

        let source = Image::with_spec(16, 16, 4);
        source.core().set_name("img");
        assert!(source.set_pixels(&vec![42; 16 * 16 * 4]));
        let frame = source.serialize();

        let key = root.core().create_object("image", "img").unwrap();
        assert!(root.core().set_from_serialized("img", frame));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let object = root.core().object(key).unwrap();
            let done = {
                let buffer = object.as_buffer().unwrap();
                !buffer.buffer_core().has_serialized_waiting()
                    && buffer.buffer_core().timestamp() == source.buffer_core().timestamp()
            };
            if done {
                break;
            }
            assert!(Instant::now() < deadline, "deserialization never landed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(root.core().signal().wait(1));
    }

    #[test]
    fn at_most_one_deserialization_is_staged() {
        use crate::buffer::stage_serialized;
        use crate::image::Image;

        let image = Image::with_spec(4, 4, 4);
        image.core().set_name("img");
        let frame_a = image.serialize();
        let frame_b = image.serialize();

        assert!(stage_serialized(&image, frame_a));
        assert!(image.buffer_core().has_serialized_waiting());
        // Second frame dropped while the slot is claimed.
        assert!(!stage_serialized(&image, frame_b));

        assert!(run_deserialize(&image));
        assert!(!image.buffer_core().has_serialized_waiting());
    }

    #[test]
    fn message_queries_rendezvous_with_their_answer() {
        use std::sync::atomic::AtomicBool;

        let dir = tempfile::tempdir().unwrap();
        let a = RootObject::new("A", test_context(dir.path()));
        let b = Arc::new(RootObject::new("B", test_context(dir.path())));
        assert!(a.link().connect_to("B"));
        assert!(b.link().connect_to("A"));

        let this = Arc::downgrade(b.core());
        b.core().base().add_attribute(
            "ping",
            Attribute::new().force_sync().setter(move |_| {
                let Some(core) = this.upgrade() else {
                    return AttributeOutcome::Rejected;
                };
                core.queue_message(
                    "A",
                    "answerMessage",
                    vec![Value::from("ping"), Value::from(42)],
                );
                AttributeOutcome::Updated
            }),
        );

        let done = Arc::new(AtomicBool::new(false));
        let stepper = {
            let b = b.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    b.step_begin();
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };

        let answer = a.send_message_with_answer("B", "ping", &Vec::new(), 2_000_000);
        done.store(true, Ordering::SeqCst);
        stepper.join().unwrap();

        assert_eq!(answer.get(1).map(Value::as_int), Some(42));

        // An unanswered query times out with an empty result.
        let silence = a.send_message_with_answer("B", "noSuchQuery", &Vec::new(), 50_000);
        assert!(silence.is_empty());
    }

    #[test]
    fn tree_commands_execute_against_objects_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = RootObject::new("world", test_context(dir.path()));
        root.core().create_object("image", "img").unwrap();

        assert!(root.core().add_tree_command(
            "world",
            TreeCommandKind::CallObject,
            &vec![
                Value::from("img"),
                Value::from("alias"),
                Value::from("fromTree")
            ],
        ));
        assert!(root.core().add_tree_command(
            "world",
            TreeCommandKind::CallRoot,
            &vec![Value::from("quit")],
        ));

        root.step_begin();
        assert_eq!(root.core().get_object("img").unwrap().core().alias(), "fromTree");
        assert!(root.core().should_quit());
        // Executed commands are consumed.
        assert!(root
            .core()
            .tree()
            .get_leaf_list_at("/world/commands")
            .unwrap()
            .is_empty());
    }
}
