//! Schema upgrade chain for older configuration files.
//!
//! Each transformation lifts documents older than a given version and is
//! idempotent, so replaying the chain over an already-upgraded document is
//! harmless. The chain ends by stamping the current schema version.

use serde_json::{json, Map, Value as Json};
use tracing::warn;

use crate::{FILE_CONFIGURATION, SCHEMA_VERSION};

type Version = (u32, u32, u32);

fn parse_version(version: &str) -> Version {
    let mut parts = version.split('.').map(|part| part.parse::<u32>());
    let mut next = || match parts.next() {
        Some(Ok(number)) => number,
        Some(Err(_)) => {
            warn!(version, "invalid version number in configuration");
            0
        }
        None => 0,
    };
    (next(), next(), next())
}

/// Apply every upgrade the document's version calls for, then stamp the
/// current schema version.
pub fn check_and_upgrade(configuration: &mut Json) {
    let version = configuration
        .get("version")
        .and_then(Json::as_str)
        .map_or((0, 0, 0), parse_version);

    if version < (0, 7, 15) {
        lift_flat_layout(configuration);
    }
    if version < (0, 7, 21) {
        default_window_layouts(configuration);
    }
    if version < (0, 8, 20) {
        coerce_boolean_attributes(configuration);
    }
    if version < (0, 10, 1) {
        rename_sideness(configuration);
    }
    if version < (0, 10, 21) {
        window_fullscreen_defaults(configuration);
    }

    configuration["version"] = Json::from(SCHEMA_VERSION);
}

/// `< 0.7.15`: the legacy layout kept scenes as an array of `{name, ...}`
/// records and scattered each scene's objects in a top-level entry named
/// after the scene. Lift everything into the `scenes` hierarchy.
fn lift_flat_layout(configuration: &mut Json) {
    let Some(scenes) = configuration.get("scenes").and_then(Json::as_array).cloned() else {
        return;
    };

    let mut upgraded = json!({
        "description": FILE_CONFIGURATION,
        "world": configuration.get("world").cloned().unwrap_or(json!({})),
        "scenes": {},
    });

    let mut scene_names = Vec::new();
    for scene in &scenes {
        let Some(name) = scene.get("name").and_then(Json::as_str) else {
            continue;
        };
        scene_names.push(name.to_string());

        let mut entry = Map::new();
        for (attribute, value) in scene.as_object().into_iter().flatten() {
            if attribute != "name" {
                entry.insert(attribute.clone(), value.clone());
            }
        }
        upgraded["scenes"][name] = Json::Object(entry);
    }

    for name in scene_names {
        let Some(members) = configuration.get(&name).and_then(Json::as_object) else {
            continue;
        };
        for (attribute, value) in members {
            if attribute == "links" {
                upgraded["scenes"][&name]["links"] = value.clone();
            } else {
                upgraded["scenes"][&name]["objects"][attribute] = value.clone();
            }
        }
    }

    *configuration = upgraded;
}

/// `< 0.7.21`: windows gained an explicit texture layout.
fn default_window_layouts(configuration: &mut Json) {
    for_each_object(configuration, |_, object| {
        if object.get("type").and_then(Json::as_str) == Some("window") {
            object["layout"] = json!([0, 1, 2, 3]);
        }
    });
}

/// Attributes that became JSON booleans in 0.8.20.
const BOOL_ATTRIBUTES: &[&str] = &[
    "16bits",
    "decorated",
    "flip",
    "flop",
    "forceRealtime",
    "looseClock",
    "fullscreen",
    "guiOnly",
    "hide",
    "invertChannels",
    "keepRatio",
    "pattern",
    "savable",
    "srgb",
    "weightedCalibrationPoints",
];

fn coerce_to_bool(value: &mut Json) {
    match value {
        Json::Number(number) => {
            if let Some(number) = number.as_f64() {
                *value = Json::Bool(number != 0.0);
            }
        }
        Json::Array(items) => {
            if let Some(first) = items.first_mut() {
                coerce_to_bool(first);
            }
        }
        // Strings and the rest are left as they are, like the original
        // loader which skipped values it could not coerce.
        _ => {}
    }
}

/// `< 0.8.20`: a known set of attributes is coerced to JSON booleans, on
/// objects and on the world block.
fn coerce_boolean_attributes(configuration: &mut Json) {
    for_each_object(configuration, |_, object| {
        let Some(fields) = object.as_object_mut() else {
            return;
        };
        for (attribute, value) in fields.iter_mut() {
            if BOOL_ATTRIBUTES.contains(&attribute.as_str()) {
                coerce_to_bool(value);
            }
        }
    });

    if let Some(world) = configuration.get_mut("world").and_then(Json::as_object_mut) {
        for (attribute, value) in world.iter_mut() {
            if BOOL_ATTRIBUTES.contains(&attribute.as_str()) {
                coerce_to_bool(value);
            }
        }
    }
}

/// `< 0.10.1`: `sideness` was renamed to `culling`.
fn rename_sideness(configuration: &mut Json) {
    for_each_object(configuration, |_, object| {
        let Some(fields) = object.as_object_mut() else {
            return;
        };
        if let Some(sideness) = fields.remove("sideness") {
            fields.insert("culling".to_string(), sideness);
        }
    });
}

/// `< 0.10.21`: windows get `fullscreen = "windowed"` when missing, and
/// gui-only windows disappear from the document.
fn window_fullscreen_defaults(configuration: &mut Json) {
    let Some(scenes) = configuration.get_mut("scenes").and_then(Json::as_object_mut) else {
        return;
    };
    for scene in scenes.values_mut() {
        let Some(objects) = scene.get_mut("objects").and_then(Json::as_object_mut) else {
            continue;
        };

        let mut to_delete = Vec::new();
        for (name, object) in objects.iter_mut() {
            if object.get("type").and_then(Json::as_str) != Some("window") {
                continue;
            }
            if object.get("fullscreen").is_none() {
                object["fullscreen"] = Json::from("windowed");
            }
            let gui_only = match object.get("guiOnly") {
                Some(Json::Array(items)) => items.first().map_or(false, truthy),
                Some(value) => truthy(value),
                None => false,
            };
            if gui_only {
                to_delete.push(name.clone());
            }
        }
        for name in to_delete {
            objects.remove(&name);
        }
    }
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        _ => false,
    }
}

fn for_each_object(configuration: &mut Json, mut apply: impl FnMut(&str, &mut Json)) {
    let Some(scenes) = configuration.get_mut("scenes").and_then(Json::as_object_mut) else {
        return;
    };
    for scene in scenes.values_mut() {
        let Some(objects) = scene.get_mut("objects").and_then(Json::as_object_mut) else {
            continue;
        };
        for (name, object) in objects.iter_mut() {
            apply(name, object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_flat_layout_is_lifted() {
        let mut config = json!({
            "description": FILE_CONFIGURATION,
            "version": "0.7.0",
            "world": {"framerate": 60},
            "scenes": [
                {"name": "local", "address": "localhost"}
            ],
            "local": {
                "img": {"type": "image"},
                "win": {"type": "window"},
                "links": [["img", "win"]]
            }
        });
        check_and_upgrade(&mut config);

        assert_eq!(config["version"], SCHEMA_VERSION);
        let scenes = config["scenes"].as_object().unwrap();
        assert_eq!(scenes.keys().collect::<Vec<_>>(), vec!["local"]);
        assert_eq!(config["scenes"]["local"]["address"], "localhost");
        assert_eq!(config["scenes"]["local"]["objects"]["img"]["type"], "image");
        assert_eq!(config["scenes"]["local"]["links"][0][0], "img");
        // Later steps of the chain also applied to the lifted document.
        assert_eq!(config["scenes"]["local"]["objects"]["win"]["layout"], json!([0, 1, 2, 3]));
        assert_eq!(
            config["scenes"]["local"]["objects"]["win"]["fullscreen"],
            "windowed"
        );
    }

    #[test]
    fn boolean_attributes_are_coerced() {
        let mut config = json!({
            "description": FILE_CONFIGURATION,
            "version": "0.8.0",
            "world": {"looseClock": 1},
            "scenes": {
                "local": {
                    "objects": {
                        "img": {"type": "image", "flip": 1, "flop": [0]}
                    }
                }
            }
        });
        check_and_upgrade(&mut config);
        assert_eq!(config["world"]["looseClock"], json!(true));
        assert_eq!(config["scenes"]["local"]["objects"]["img"]["flip"], json!(true));
        assert_eq!(config["scenes"]["local"]["objects"]["img"]["flop"], json!([false]));
    }

    #[test]
    fn sideness_becomes_culling_and_gui_windows_disappear() {
        let mut config = json!({
            "description": FILE_CONFIGURATION,
            "version": "0.9.0",
            "world": {},
            "scenes": {
                "local": {
                    "objects": {
                        "model": {"type": "object", "sideness": 2},
                        "gui": {"type": "window", "guiOnly": true},
                        "out": {"type": "window"}
                    }
                }
            }
        });
        check_and_upgrade(&mut config);

        let objects = &config["scenes"]["local"]["objects"];
        assert_eq!(objects["model"]["culling"], json!(2));
        assert!(objects["model"].get("sideness").is_none());
        assert!(objects.get("gui").is_none());
        assert_eq!(objects["out"]["fullscreen"], "windowed");
    }

    #[test]
    fn upgrades_are_idempotent() {
        let mut config = json!({
            "description": FILE_CONFIGURATION,
            "version": "0.7.0",
            "world": {},
            "scenes": [{"name": "local"}],
            "local": {"win": {"type": "window"}}
        });
        check_and_upgrade(&mut config);
        let once = config.clone();
        check_and_upgrade(&mut config);
        assert_eq!(config, once);
    }
}
