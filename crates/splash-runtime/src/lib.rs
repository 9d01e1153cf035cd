//! The distributed object graph of Splash.
//!
//! A process hosts one root object, which owns an arena of named graph
//! objects, the replicated attribute tree and the IPC link. The World root
//! loads the configuration, spawns Scene processes and feeds them
//! serialized buffers; each Scene root receives tree updates and buffers
//! and drives its rendering backend.

// crate-specific lint exceptions:
//#![allow()]

pub mod attribute;
pub mod buffer;
pub mod context;
pub mod factory;
pub mod image;
pub mod mesh;
pub mod object;
pub mod root;
pub mod scene;
pub mod world;

pub use attribute::{Attribute, AttributeOutcome, SyncPolicy};
pub use buffer::{BufferCore, BufferObject, UpdateSignal};
pub use context::Context;
pub use factory::Factory;
pub use image::Image;
pub use mesh::Mesh;
pub use object::{Category, GraphObject, ObjectCore, RenderPriority};
pub use root::{ObjectKey, RootCore, RootObject, TreeCommandKind};
pub use scene::Scene;
pub use world::World;
