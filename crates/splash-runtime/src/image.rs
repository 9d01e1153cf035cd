//! Image buffer object: the canonical pixel producer.

use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use splash_core::{codec, SerializedObject, Value};
use tracing::warn;

use crate::attribute::{Attribute, AttributeOutcome};
use crate::buffer::{BufferCore, BufferObject};
use crate::object::{Category, GraphObject, ObjectCore};

#[derive(Default)]
struct ImageSpec {
    width: u32,
    height: u32,
    channels: u32,
    pixels: Vec<u8>,
}

impl ImageSpec {
    fn with_size(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
            pixels: vec![0; (width * height * channels) as usize],
        }
    }
}

/// A width x height x channels pixel buffer.
pub struct Image {
    core: ObjectCore,
    buffer: BufferCore,
    spec: Arc<Mutex<ImageSpec>>,
}

impl Image {
    pub fn new() -> Self {
        Self::with_spec(0, 0, 4)
    }

    pub fn with_spec(width: u32, height: u32, channels: u32) -> Self {
        let image = Self {
            core: ObjectCore::new(),
            buffer: BufferCore::new(),
            spec: Arc::new(Mutex::new(ImageSpec::with_size(width, height, channels))),
        };
        image.register_attributes();
        image
    }

    fn register_attributes(&self) {
        let spec = self.spec.clone();
        let spec_get = self.spec.clone();
        self.core.add_attribute(
            "size",
            Attribute::new()
                .args("ii")
                .doc("Dimensions of the image, in pixels")
                .setter(move |args| {
                    let width = args[0].as_int().max(0) as u32;
                    let height = args[1].as_int().max(0) as u32;
                    let mut spec = spec.lock().unwrap();
                    if spec.width == width && spec.height == height {
                        return AttributeOutcome::NoChange;
                    }
                    let channels = spec.channels;
                    *spec = ImageSpec::with_size(width, height, channels);
                    AttributeOutcome::Updated
                })
                .getter(move || {
                    let spec = spec_get.lock().unwrap();
                    vec![Value::from(spec.width), Value::from(spec.height)]
                }),
        );

        let spec = self.spec.clone();
        let spec_get = self.spec.clone();
        self.core.add_attribute(
            "channels",
            Attribute::new()
                .args("i")
                .doc("Channel count per pixel")
                .setter(move |args| {
                    let channels = args[0].as_int().clamp(1, 4) as u32;
                    let mut spec = spec.lock().unwrap();
                    if spec.channels == channels {
                        return AttributeOutcome::NoChange;
                    }
                    let (width, height) = (spec.width, spec.height);
                    *spec = ImageSpec::with_size(width, height, channels);
                    AttributeOutcome::Updated
                })
                .getter(move || vec![Value::from(spec_get.lock().unwrap().channels)]),
        );
    }

    pub fn width(&self) -> u32 {
        self.spec.lock().unwrap().width
    }

    pub fn height(&self) -> u32 {
        self.spec.lock().unwrap().height
    }

    pub fn channels(&self) -> u32 {
        self.spec.lock().unwrap().channels
    }

    /// Replace the pixel content. The slice length must match the current
    /// spec; the timestamp is bumped and the owning root woken.
    pub fn set_pixels(&self, pixels: &[u8]) -> bool {
        {
            let mut spec = self.spec.lock().unwrap();
            if pixels.len() != (spec.width * spec.height * spec.channels) as usize {
                warn!(
                    object = %self.core.name(),
                    expected = (spec.width * spec.height * spec.channels),
                    got = pixels.len(),
                    "pixel buffer size mismatch"
                );
                return false;
            }
            spec.pixels.copy_from_slice(pixels);
        }
        self.buffer.update_timestamp(None);
        true
    }

    pub fn pixel(&self, x: u32, y: u32, channel: u32) -> u8 {
        let spec = self.spec.lock().unwrap();
        spec.pixels[((y * spec.width + x) * spec.channels + channel) as usize]
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphObject for Image {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "image"
    }

    fn category(&self) -> Category {
        Category::Image
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

impl BufferObject for Image {
    fn buffer_core(&self) -> &BufferCore {
        &self.buffer
    }

    fn serialize(&self) -> SerializedObject {
        let spec = self.spec.lock().unwrap();
        let mut out = Vec::with_capacity(64 + spec.pixels.len());
        codec::write_buffer_header(&mut out, &self.distant_name());
        out.write_u32::<LittleEndian>(spec.width).expect("infallible write");
        out.write_u32::<LittleEndian>(spec.height).expect("infallible write");
        out.write_u32::<LittleEndian>(spec.channels).expect("infallible write");
        out.write_i64::<LittleEndian>(self.buffer.timestamp())
            .expect("infallible write");
        out.write_u64::<LittleEndian>(spec.pixels.len() as u64)
            .expect("infallible write");
        out.extend_from_slice(&spec.pixels);
        SerializedObject::from_vec(out)
    }

    fn deserialize(&self, buffer: &SerializedObject) -> bool {
        let Ok((_, offset)) = codec::peek_target(buffer.data()) else {
            warn!(object = %self.core.name(), "image frame has no header");
            return false;
        };
        let mut cursor = Cursor::new(&buffer.data()[offset..]);

        let parsed = (|| -> std::io::Result<(ImageSpec, i64)> {
            let width = cursor.read_u32::<LittleEndian>()?;
            let height = cursor.read_u32::<LittleEndian>()?;
            let channels = cursor.read_u32::<LittleEndian>()?;
            let timestamp = cursor.read_i64::<LittleEndian>()?;
            let len = cursor.read_u64::<LittleEndian>()? as usize;
            if len != (width as usize) * (height as usize) * (channels as usize) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "pixel count does not match the spec",
                ));
            }
            let mut pixels = vec![0; len];
            cursor.read_exact(&mut pixels)?;
            Ok((
                ImageSpec {
                    width,
                    height,
                    channels,
                    pixels,
                },
                timestamp,
            ))
        })();

        match parsed {
            Ok((spec, timestamp)) => {
                *self.spec.lock().unwrap() = spec;
                self.buffer.update_timestamp(Some(timestamp));
                true
            }
            Err(err) => {
                warn!(object = %self.core.name(), error = %err, "image deserialization failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_image_round_trips() {
        let source = Image::with_spec(8, 4, 4);
        source.core().set_name("img");
        let pixels: Vec<u8> = (0..8 * 4 * 4).map(|i| i as u8).collect();
        assert!(source.set_pixels(&pixels));

        let frame = source.serialize();
        let sink = Image::new();
        sink.core().set_name("img");
        assert!(sink.deserialize(&frame));

        assert_eq!(sink.width(), 8);
        assert_eq!(sink.height(), 4);
        assert_eq!(sink.channels(), 4);
        assert_eq!(sink.pixel(1, 1, 0), pixels[(1 * 8 + 1) * 4] );
        assert_eq!(sink.buffer_core().timestamp(), source.buffer_core().timestamp());
    }

    #[test]
    fn corrupt_frames_leave_the_previous_payload_intact() {
        let sink = Image::with_spec(2, 2, 4);
        let before: Vec<u8> = vec![7; 16];
        assert!(sink.set_pixels(&before));

        let mut bytes = Vec::new();
        codec::write_buffer_header(&mut bytes, "img");
        bytes.extend_from_slice(&[1, 2, 3]); // truncated spec
        assert!(!sink.deserialize(&SerializedObject::from_vec(bytes)));
        assert_eq!(sink.width(), 2);
        assert_eq!(sink.pixel(0, 0, 0), 7);
    }

    #[test]
    fn size_attribute_reallocates() {
        let image = Image::new();
        assert_eq!(
            image
                .core()
                .set_attribute("size", &vec![Value::from(16), Value::from(9)]),
            AttributeOutcome::Updated
        );
        assert_eq!(image.width(), 16);
        assert_eq!(image.height(), 9);
        let sizes = image.core().get_attribute("size").unwrap();
        assert_eq!(sizes[0].as_int(), 16);
        assert_eq!(sizes[1].as_int(), 9);
    }
}
