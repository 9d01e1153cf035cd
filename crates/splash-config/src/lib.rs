//! Configuration and project documents.
//!
//! A configuration file is a JSON document describing the world, the scenes
//! to spawn and the objects each scene hosts. Older schema versions are
//! lifted to the current one by a chain of upgrade transformations applied
//! at load time; see [`upgrade`].

// crate-specific lint exceptions:
//#![allow()]

pub mod upgrade;

use std::path::Path;

use serde_json::Value as Json;
use splash_core::{Value, Values};
use thiserror::Error;
use tracing::warn;

/// Top-level `description` of a full configuration.
pub const FILE_CONFIGURATION: &str = "splashConfiguration";
/// Top-level `description` of a partial (project) configuration.
pub const FILE_PROJECT: &str = "splashProject";

/// Schema version written back into upgraded documents.
pub const SCHEMA_VERSION: &str = "0.10.21";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidDocument(String),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Load and parse a JSON file, without interpreting it.
pub fn load_json_file(path: &Path) -> Result<Json> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load a configuration document: parse, check the description, upgrade.
pub fn load_configuration(path: &Path) -> Result<ConfigDocument> {
    let mut json = load_json_file(path)?;
    let description = json
        .get("description")
        .and_then(Json::as_str)
        .unwrap_or(FILE_CONFIGURATION)
        .to_string();
    if description != FILE_CONFIGURATION && description != FILE_PROJECT {
        return Err(ConfigError::InvalidDocument(format!(
            "unknown description {description:?}"
        )));
    }
    upgrade::check_and_upgrade(&mut json);
    Ok(ConfigDocument { json })
}

/// An upgraded, schema-checked configuration or project document.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    pub json: Json,
}

impl ConfigDocument {
    pub fn from_json(mut json: Json) -> Self {
        upgrade::check_and_upgrade(&mut json);
        Self { json }
    }

    pub fn is_project(&self) -> bool {
        self.json
            .get("description")
            .and_then(Json::as_str)
            .map_or(false, |description| description == FILE_PROJECT)
    }

    /// World attributes, in document order.
    pub fn world_attributes(&self) -> Vec<(String, Values)> {
        attributes_of(self.json.get("world"))
    }

    pub fn scene_names(&self) -> Vec<String> {
        self.json
            .get("scenes")
            .and_then(Json::as_object)
            .map(|scenes| scenes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn scene(&self, name: &str) -> Option<SceneConfig<'_>> {
        self.json
            .get("scenes")
            .and_then(|scenes| scenes.get(name))
            .map(|json| SceneConfig { json })
    }
}

/// View over one scene entry.
pub struct SceneConfig<'a> {
    pub json: &'a Json,
}

/// Scene keys that are not plain attributes.
const SCENE_RESERVED: &[&str] = &["address", "display", "spawn", "objects", "links"];

impl SceneConfig<'_> {
    pub fn address(&self) -> String {
        self.json
            .get("address")
            .and_then(Json::as_str)
            .unwrap_or("localhost")
            .to_string()
    }

    pub fn display(&self) -> Option<String> {
        self.json
            .get("display")
            .and_then(Json::as_str)
            .map(str::to_string)
    }

    pub fn spawn(&self) -> bool {
        self.json.get("spawn").map_or(true, json_truthy)
    }

    /// Objects as `(name, type, attributes)`, in document order. Entries
    /// without a type are skipped with a warning.
    pub fn objects(&self) -> Vec<(String, String, Vec<(String, Values)>)> {
        let Some(objects) = self.json.get("objects").and_then(Json::as_object) else {
            return Vec::new();
        };
        objects
            .iter()
            .filter_map(|(name, object)| {
                let Some(type_name) = object.get("type").and_then(Json::as_str) else {
                    warn!(object = %name, "configured object has no type, skipped");
                    return None;
                };
                let attributes = object
                    .as_object()
                    .map(|fields| {
                        fields
                            .iter()
                            .filter(|(key, _)| key.as_str() != "type")
                            .map(|(key, value)| (key.clone(), json_to_values(value)))
                            .collect()
                    })
                    .unwrap_or_default();
                Some((name.clone(), type_name.to_string(), attributes))
            })
            .collect()
    }

    /// Links as `(source, destination)` pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        let Some(links) = self.json.get("links").and_then(Json::as_array) else {
            return Vec::new();
        };
        links
            .iter()
            .filter_map(|link| {
                let pair = link.as_array()?;
                let src = pair.first()?.as_str()?;
                let dst = pair.get(1)?.as_str()?;
                Some((src.to_string(), dst.to_string()))
            })
            .collect()
    }

    /// Scene-level attributes, excluding the reserved keys.
    pub fn attributes(&self) -> Vec<(String, Values)> {
        let Some(fields) = self.json.as_object() else {
            return Vec::new();
        };
        fields
            .iter()
            .filter(|(key, _)| !SCENE_RESERVED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), json_to_values(value)))
            .collect()
    }
}

fn attributes_of(json: Option<&Json>) -> Vec<(String, Values)> {
    json.and_then(Json::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(key, value)| (key.clone(), json_to_values(value)))
                .collect()
        })
        .unwrap_or_default()
}

fn json_truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        Json::Array(items) => items.first().map_or(false, json_truthy),
        _ => false,
    }
}

/// Map a JSON value onto attribute argument lists: a scalar becomes a
/// single-element list, an array its elements, an object a list of named
/// values.
pub fn json_to_values(json: &Json) -> Values {
    fn single(json: &Json) -> Value {
        match json {
            Json::Bool(b) => Value::from(*b),
            Json::Number(n) => {
                if let Some(int) = n.as_i64() {
                    Value::from(int)
                } else {
                    Value::from(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::from(s.as_str()),
            Json::Array(_) | Json::Object(_) => Value::new_values(json_to_values(json)),
            Json::Null => Value::new_values(vec![]),
        }
    }

    match json {
        Json::Array(items) => items.iter().map(single).collect(),
        Json::Object(fields) => fields
            .iter()
            .map(|(name, value)| single(value).with_name(name.clone()))
            .collect(),
        other => vec![single(other)],
    }
}

/// Inverse mapping, used when saving object attributes back to a document.
pub fn values_to_json(values: &Values) -> Json {
    fn single(value: &Value) -> Json {
        use splash_core::ValueKind;
        match value.kind() {
            ValueKind::Boolean => Json::Bool(value.as_bool()),
            ValueKind::Integer => Json::from(value.as_int()),
            ValueKind::Real => Json::from(value.as_real()),
            ValueKind::String => Json::from(value.as_string()),
            ValueKind::Values | ValueKind::Tuple => {
                values_to_json(&value.elements().unwrap_or(&[]).to_vec())
            }
        }
    }

    if values.len() == 1 && values[0].name().is_none() {
        single(&values[0])
    } else if values.iter().all(|value| value.name().is_some()) && !values.is_empty() {
        Json::Object(
            values
                .iter()
                .map(|value| (value.name().unwrap_or_default().to_string(), single(value)))
                .collect(),
        )
    } else {
        Json::Array(values.iter().map(single).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scene_views_expose_objects_and_links_in_order() {
        let document = ConfigDocument::from_json(json!({
            "description": FILE_CONFIGURATION,
            "version": SCHEMA_VERSION,
            "world": {"framerate": 60},
            "scenes": {
                "local": {
                    "address": "localhost",
                    "spawn": true,
                    "objects": {
                        "img": {"type": "image", "size": [512, 512]},
                        "screen": {"type": "mesh"}
                    },
                    "links": [["img", "screen"]]
                }
            }
        }));

        assert_eq!(document.scene_names(), vec!["local"]);
        let scene = document.scene("local").unwrap();
        assert!(scene.spawn());

        let objects = scene.objects();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].0, "img");
        assert_eq!(objects[0].1, "image");
        let size = &objects[0].2[0];
        assert_eq!(size.0, "size");
        assert_eq!(size.1[0].as_int(), 512);

        assert_eq!(scene.links(), vec![("img".to_string(), "screen".to_string())]);
    }

    #[test]
    fn json_values_round_trip() {
        let json = json!({"width": 512, "enabled": true, "name": "out"});
        let values = json_to_values(&json);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].name(), Some("width"));
        assert_eq!(values[0].as_int(), 512);

        let back = values_to_json(&values);
        assert_eq!(back, json);
    }

    #[test]
    fn unknown_descriptions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"description": "somethingElse"}"#).unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::InvalidDocument(_))
        ));
    }

    #[test]
    fn missing_files_error_out() {
        assert!(matches!(
            load_configuration(Path::new("/nonexistent/splash.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
