//! Base state shared by every entity of the object graph.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use splash_core::{Value, Values};
use tracing::warn;

use crate::attribute::{Attribute, AttributeOutcome, SyncPolicy};
use crate::buffer::BufferObject;

/// Single-shot deferred work, run at the owner's next step.
pub type Task = Box<dyn FnOnce() + Send>;

struct PeriodicTask {
    callback: Box<dyn FnMut() + Send>,
    interval: Duration,
    last_run: Option<Instant>,
}

/// Coarse classification used by the factory and the World shadow logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Image,
    Mesh,
    Texture,
    Misc,
}

/// Position of an object in the scene render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RenderPriority {
    PreCamera,
    Media,
    Blending,
    Filter,
    Camera,
    Window,
    Gui,
    NoRender,
}

/// Named, typed entity with attributes and deferred tasks.
///
/// Implementations embed an [`ObjectCore`] and go through it for all shared
/// behavior; the trait carries only what varies per type.
pub trait GraphObject: Send + Sync {
    fn core(&self) -> &ObjectCore;

    fn type_name(&self) -> &str;

    fn category(&self) -> Category {
        Category::Misc
    }

    fn priority(&self) -> RenderPriority {
        RenderPriority::Media
    }

    /// Producer hook, called once per root step before serialization.
    fn update(&self) {}

    fn as_buffer(&self) -> Option<&dyn BufferObject> {
        None
    }

    /// Cooperative dirty flag, checked by the root to decide whether this
    /// object's attributes are pushed back into the tree.
    fn was_updated(&self) -> bool {
        self.core().was_updated()
    }

    fn set_not_updated(&self) {
        self.core().set_not_updated();
    }
}

/// The shared core: name, attribute map, task queues, flags.
pub struct ObjectCore {
    name: Mutex<String>,
    alias: Arc<Mutex<String>>,
    attributes: Mutex<IndexMap<String, Attribute>>,
    tasks: Mutex<Vec<Task>>,
    periodic: Mutex<IndexMap<String, PeriodicTask>>,
    dirty: AtomicBool,
    savable: Arc<AtomicBool>,
}

impl ObjectCore {
    pub fn new() -> Self {
        let core = Self {
            name: Mutex::new(String::new()),
            alias: Arc::new(Mutex::new(String::new())),
            attributes: Mutex::new(IndexMap::new()),
            tasks: Mutex::new(Vec::new()),
            periodic: Mutex::new(IndexMap::new()),
            dirty: AtomicBool::new(false),
            savable: Arc::new(AtomicBool::new(true)),
        };
        core.register_base_attributes();
        core
    }

    fn register_base_attributes(&self) {
        let alias = self.alias.clone();
        let alias_get = self.alias.clone();
        self.add_attribute(
            "alias",
            Attribute::new()
                .args("s")
                .doc("Alternative name for the object")
                .setter(move |args| {
                    let next = args[0].as_string();
                    let mut alias = alias.lock().unwrap();
                    if *alias == next {
                        return AttributeOutcome::NoChange;
                    }
                    *alias = next;
                    AttributeOutcome::Updated
                })
                .getter(move || vec![Value::from(alias_get.lock().unwrap().clone())]),
        );

        let savable = self.savable.clone();
        let savable_get = self.savable.clone();
        self.add_attribute(
            "savable",
            Attribute::new()
                .args("b")
                .doc("If true, the object is saved in the configuration")
                .setter(move |args| {
                    savable.store(args[0].as_bool(), Ordering::SeqCst);
                    AttributeOutcome::Updated
                })
                .getter(move || vec![Value::from(savable_get.load(Ordering::SeqCst))]),
        );
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn alias(&self) -> String {
        let alias = self.alias.lock().unwrap();
        if alias.is_empty() {
            self.name()
        } else {
            alias.clone()
        }
    }

    pub fn add_attribute(&self, name: &str, attribute: Attribute) {
        self.attributes
            .lock()
            .unwrap()
            .insert(name.to_string(), attribute);
    }

    pub fn set_attribute(&self, name: &str, args: &Values) -> AttributeOutcome {
        let attributes = self.attributes.lock().unwrap();
        let Some(attribute) = attributes.get(name) else {
            warn!(object = %self.name(), attribute = name, "set on unknown attribute");
            return AttributeOutcome::Rejected;
        };
        let outcome = attribute.set(args);
        if outcome == AttributeOutcome::Updated {
            self.dirty.store(true, Ordering::SeqCst);
        }
        outcome
    }

    /// Runs the getter; `None` when the attribute is unknown or write-only.
    pub fn get_attribute(&self, name: &str) -> Option<Values> {
        self.attributes.lock().unwrap().get(name)?.get()
    }

    pub fn attribute_policy(&self, name: &str) -> SyncPolicy {
        self.attributes
            .lock()
            .unwrap()
            .get(name)
            .map_or(SyncPolicy::Async, Attribute::policy)
    }

    pub fn attributes_list(&self) -> Vec<String> {
        self.attributes.lock().unwrap().keys().cloned().collect()
    }

    pub fn attributes_descriptions(&self) -> Vec<(String, String)> {
        self.attributes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, attribute)| (name.clone(), attribute.description().to_string()))
            .collect()
    }

    pub fn lock_attribute(&self, name: &str, locked: bool) -> bool {
        match self.attributes.lock().unwrap().get_mut(name) {
            Some(attribute) => {
                attribute.set_locked(locked);
                true
            }
            None => false,
        }
    }

    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks.lock().unwrap().push(Box::new(task));
    }

    /// Register or replace a named periodic task. A zero interval runs it on
    /// every step.
    pub fn add_periodic_task(
        &self,
        name: &str,
        callback: impl FnMut() + Send + 'static,
        interval: Duration,
    ) {
        self.periodic.lock().unwrap().insert(
            name.to_string(),
            PeriodicTask {
                callback: Box::new(callback),
                interval,
                last_run: None,
            },
        );
    }

    pub fn remove_periodic_task(&self, name: &str) -> bool {
        self.periodic.lock().unwrap().shift_remove(name).is_some()
    }

    /// Drain the single-shot queue, then run due periodic tasks. The queue
    /// is swapped out first so tasks may enqueue follow-ups.
    pub fn run_tasks(&self) {
        let drained: Vec<Task> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in drained {
            task();
        }

        let now = Instant::now();
        let mut periodic = self.periodic.lock().unwrap();
        for task in periodic.values_mut() {
            let due = task
                .last_run
                .map_or(true, |last| now.duration_since(last) >= task.interval);
            if due {
                (task.callback)();
                task.last_run = Some(now);
            }
        }
    }

    pub fn was_updated(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_not_updated(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_savable(&self) -> bool {
        self.savable.load(Ordering::SeqCst)
    }

    pub fn set_savable(&self, savable: bool) {
        self.savable.store(savable, Ordering::SeqCst);
    }
}

impl Default for ObjectCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_round_trips_and_marks_dirty() {
        let core = ObjectCore::new();
        core.set_name("img");
        assert_eq!(core.alias(), "img");

        let outcome = core.set_attribute("alias", &vec![Value::from("newAlias")]);
        assert_eq!(outcome, AttributeOutcome::Updated);
        assert_eq!(core.alias(), "newAlias");
        assert!(core.was_updated());

        // Same value again: idempotent, no dirty transition.
        core.set_not_updated();
        let outcome = core.set_attribute("alias", &vec![Value::from("newAlias")]);
        assert_eq!(outcome, AttributeOutcome::NoChange);
        assert!(!core.was_updated());
    }

    #[test]
    fn tasks_run_once_and_periodic_tasks_replace_by_name() {
        use std::sync::atomic::AtomicI64;

        let core = ObjectCore::new();
        let counter = Arc::new(AtomicI64::new(0));

        let c = counter.clone();
        core.add_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        core.run_tasks();
        core.run_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        core.add_periodic_task(
            "tick",
            move || {
                c.fetch_add(10, Ordering::SeqCst);
            },
            Duration::ZERO,
        );
        let c = counter.clone();
        core.add_periodic_task(
            "tick",
            move || {
                c.fetch_add(100, Ordering::SeqCst);
            },
            Duration::ZERO,
        );
        core.run_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 101);
    }
}
