//! Object factory: type names to constructors, plus per-type defaults.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use splash_core::Values;
use tracing::{info, warn};

use crate::image::Image;
use crate::mesh::Mesh;
use crate::object::{Category, GraphObject};

/// Environment variable pointing to a JSON file of per-type default
/// attribute values, applied at creation.
pub const DEFAULTS_FILE_ENV: &str = "SPLASH_DEFAULTS";

type Constructor = Box<dyn Fn() -> Arc<dyn GraphObject> + Send + Sync>;

pub struct Factory {
    constructors: IndexMap<String, (Category, Constructor)>,
    defaults: HashMap<String, Vec<(String, Values)>>,
}

impl Factory {
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: IndexMap::new(),
            defaults: HashMap::new(),
        };
        factory.register("image", Category::Image, || Arc::new(Image::new()));
        factory.register("mesh", Category::Mesh, || Arc::new(Mesh::new()));
        factory.load_defaults();
        factory
    }

    pub fn register(
        &mut self,
        type_name: &str,
        category: Category,
        constructor: impl Fn() -> Arc<dyn GraphObject> + Send + Sync + 'static,
    ) {
        self.constructors
            .insert(type_name.to_string(), (category, Box::new(constructor)));
    }

    /// Instantiate `type_name`, apply its configured defaults, and name it.
    pub fn create(&self, type_name: &str, name: &str) -> Option<Arc<dyn GraphObject>> {
        let (_, constructor) = self.constructors.get(type_name)?;
        let object = constructor();
        object.core().set_name(name);

        if let Some(defaults) = self.defaults.get(type_name) {
            for (attribute, args) in defaults {
                if !object.core().set_attribute(attribute, args).is_ok() {
                    warn!(
                        type_name,
                        attribute, "default attribute value rejected at creation"
                    );
                }
            }
        }
        Some(object)
    }

    pub fn object_types(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn category(&self, type_name: &str) -> Option<Category> {
        self.constructors
            .get(type_name)
            .map(|(category, _)| *category)
    }

    /// Types whose payload travels as serialized buffers; the World keeps a
    /// local shadow of these.
    pub fn is_buffer_type(&self, type_name: &str) -> bool {
        matches!(
            self.category(type_name),
            Some(Category::Image | Category::Mesh)
        )
    }

    fn load_defaults(&mut self) {
        let Ok(path) = std::env::var(DEFAULTS_FILE_ENV) else {
            return;
        };
        let json = match splash_config::load_json_file(std::path::Path::new(&path)) {
            Ok(json) => json,
            Err(err) => {
                warn!(path, error = %err, "cannot load defaults file");
                return;
            }
        };
        let Some(types) = json.as_object() else {
            warn!(path, "defaults file is not an object");
            return;
        };

        for (type_name, attributes) in types {
            let Some(attributes) = attributes.as_object() else {
                continue;
            };
            let parsed = attributes
                .iter()
                .map(|(name, value)| (name.clone(), splash_config::json_to_values(value)))
                .collect();
            self.defaults.insert(type_name.clone(), parsed);
        }
        info!(path, "loaded per-type attribute defaults");
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_type_constructs() {
        let factory = Factory::new();
        for type_name in factory.object_types() {
            let object = factory
                .create(&type_name, "probe")
                .unwrap_or_else(|| panic!("factory cannot build {type_name}"));
            assert_eq!(object.type_name(), type_name);
            assert_eq!(object.core().name(), "probe");
        }
    }

    #[test]
    fn readable_attributes_round_trip_unchanged() {
        use crate::attribute::AttributeOutcome;

        let factory = Factory::new();
        for type_name in factory.object_types() {
            let object = factory.create(&type_name, "probe").unwrap();
            for attribute in object.core().attributes_list() {
                let Some(current) = object.core().get_attribute(&attribute) else {
                    continue;
                };
                let outcome = object.core().set_attribute(&attribute, &current);
                assert!(
                    matches!(outcome, AttributeOutcome::NoChange | AttributeOutcome::Updated),
                    "{type_name}.{attribute} rejected its own value"
                );
                assert_eq!(
                    object.core().get_attribute(&attribute).unwrap(),
                    current,
                    "{type_name}.{attribute} changed by re-setting its value"
                );
            }
        }
    }

    #[test]
    fn buffer_types_are_flagged_for_world_shadows() {
        let factory = Factory::new();
        assert!(factory.is_buffer_type("image"));
        assert!(factory.is_buffer_type("mesh"));
        assert!(!factory.is_buffer_type("window"));
    }
}
