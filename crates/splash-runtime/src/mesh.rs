//! Mesh buffer object: projection surface geometry.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use splash_core::{codec, SerializedObject};
use tracing::warn;

use crate::buffer::{BufferCore, BufferObject};
use crate::object::{Category, GraphObject, ObjectCore};

/// Vertices are xyzw, uvs are two components, normals xyzw.
struct Geometry {
    vertices: Vec<f32>,
    uvs: Vec<f32>,
    normals: Vec<f32>,
}

impl Geometry {
    /// A unit quad made of two triangles, the default projection surface.
    fn quad() -> Self {
        #[rustfmt::skip]
        let vertices = vec![
            -1.0, -1.0, 0.0, 1.0,
             1.0, -1.0, 0.0, 1.0,
             1.0,  1.0, 0.0, 1.0,
            -1.0, -1.0, 0.0, 1.0,
             1.0,  1.0, 0.0, 1.0,
            -1.0,  1.0, 0.0, 1.0,
        ];
        #[rustfmt::skip]
        let uvs = vec![
            0.0, 0.0,  1.0, 0.0,  1.0, 1.0,
            0.0, 0.0,  1.0, 1.0,  0.0, 1.0,
        ];
        let normals = (0..6).flat_map(|_| [0.0, 0.0, 1.0, 0.0]).collect();
        Self {
            vertices,
            uvs,
            normals,
        }
    }
}

pub struct Mesh {
    core: ObjectCore,
    buffer: BufferCore,
    geometry: Arc<Mutex<Geometry>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            core: ObjectCore::new(),
            buffer: BufferCore::new(),
            geometry: Arc::new(Mutex::new(Geometry::quad())),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.geometry.lock().unwrap().vertices.len() / 4
    }

    /// Replace the geometry. Component counts must be consistent: xyzw
    /// vertices and normals, two-component uvs, all for the same number of
    /// vertices.
    pub fn set_geometry(&self, vertices: Vec<f32>, uvs: Vec<f32>, normals: Vec<f32>) -> bool {
        if vertices.len() % 4 != 0
            || uvs.len() / 2 != vertices.len() / 4
            || normals.len() != vertices.len()
        {
            warn!(object = %self.core.name(), "inconsistent geometry arrays");
            return false;
        }
        *self.geometry.lock().unwrap() = Geometry {
            vertices,
            uvs,
            normals,
        };
        self.buffer.update_timestamp(None);
        true
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphObject for Mesh {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "mesh"
    }

    fn category(&self) -> Category {
        Category::Mesh
    }

    fn as_buffer(&self) -> Option<&dyn BufferObject> {
        Some(self)
    }

    fn was_updated(&self) -> bool {
        self.buffer.was_updated() || self.core.was_updated()
    }

    fn set_not_updated(&self) {
        self.buffer.set_not_updated();
        self.core.set_not_updated();
    }
}

fn write_f32s(out: &mut Vec<u8>, data: &[f32]) {
    out.write_u64::<LittleEndian>(data.len() as u64)
        .expect("infallible write");
    for component in data {
        out.write_f32::<LittleEndian>(*component)
            .expect("infallible write");
    }
}

fn read_f32s(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<f32>> {
    let count = cursor.read_u64::<LittleEndian>()? as usize;
    let mut data = Vec::with_capacity(count);
    for _ in 0..count {
        data.push(cursor.read_f32::<LittleEndian>()?);
    }
    Ok(data)
}

impl BufferObject for Mesh {
    fn buffer_core(&self) -> &BufferCore {
        &self.buffer
    }

    fn serialize(&self) -> SerializedObject {
        let geometry = self.geometry.lock().unwrap();
        let mut out = Vec::with_capacity(
            64 + 4 * (geometry.vertices.len() + geometry.uvs.len() + geometry.normals.len()),
        );
        codec::write_buffer_header(&mut out, &self.distant_name());
        out.write_i64::<LittleEndian>(self.buffer.timestamp())
            .expect("infallible write");
        write_f32s(&mut out, &geometry.vertices);
        write_f32s(&mut out, &geometry.uvs);
        write_f32s(&mut out, &geometry.normals);
        SerializedObject::from_vec(out)
    }

    fn deserialize(&self, buffer: &SerializedObject) -> bool {
        let Ok((_, offset)) = codec::peek_target(buffer.data()) else {
            warn!(object = %self.core.name(), "mesh frame has no header");
            return false;
        };
        let mut cursor = Cursor::new(&buffer.data()[offset..]);

        let parsed = (|| -> std::io::Result<(i64, Geometry)> {
            let timestamp = cursor.read_i64::<LittleEndian>()?;
            let vertices = read_f32s(&mut cursor)?;
            let uvs = read_f32s(&mut cursor)?;
            let normals = read_f32s(&mut cursor)?;
            if vertices.len() % 4 != 0
                || uvs.len() / 2 != vertices.len() / 4
                || normals.len() != vertices.len()
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "inconsistent geometry arrays",
                ));
            }
            Ok((
                timestamp,
                Geometry {
                    vertices,
                    uvs,
                    normals,
                },
            ))
        })();

        match parsed {
            Ok((timestamp, geometry)) => {
                *self.geometry.lock().unwrap() = geometry;
                self.buffer.update_timestamp(Some(timestamp));
                true
            }
            Err(err) => {
                warn!(object = %self.core.name(), error = %err, "mesh deserialization failed");
                false
            }
        }
    }
}
