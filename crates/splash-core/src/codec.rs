//! Length-prefixed wire codec shared by message and buffer frames.
//!
//! A value is framed as `{u8 tag, u32 name length, name bytes, payload}`,
//! scalars in native little-endian, strings and lists with a `u32` length or
//! count prefix. A message frame is `{target, attribute, arguments}`; a
//! buffer frame starts with its target name so the link can route it without
//! decoding the payload.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::value::{Value, Values};

const TAG_BOOLEAN: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_VALUES: u8 = 4;
const TAG_TUPLE: u8 = 5;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated frame: {0}")]
    Io(#[from] io::Error),
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("frame holds invalid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("frame too large: {0} bytes")]
    Oversized(u64),
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

/// A decoded attribute message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFrame {
    pub target: String,
    pub attribute: String,
    pub args: Values,
}

/// Ceiling on any single length prefix, to reject corrupted frames before
/// allocating.
const MAX_FIELD_LEN: u32 = 1 << 30;

fn write_string(out: &mut impl Write, s: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string(input: &mut impl Read) -> Result<String> {
    let len = input.read_u32::<LittleEndian>()?;
    if len > MAX_FIELD_LEN {
        return Err(CodecError::Oversized(u64::from(len)));
    }
    let mut bytes = vec![0; len as usize];
    input.read_exact(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn write_value(out: &mut impl Write, value: &Value) -> Result<()> {
    let tag = match value.kind() {
        crate::ValueKind::Boolean => TAG_BOOLEAN,
        crate::ValueKind::Integer => TAG_INTEGER,
        crate::ValueKind::Real => TAG_REAL,
        crate::ValueKind::String => TAG_STRING,
        crate::ValueKind::Values => TAG_VALUES,
        crate::ValueKind::Tuple => TAG_TUPLE,
    };
    out.write_u8(tag)?;
    write_string(out, value.name().unwrap_or(""))?;

    match value.kind() {
        crate::ValueKind::Boolean => out.write_u8(u8::from(value.as_bool()))?,
        crate::ValueKind::Integer => out.write_i64::<LittleEndian>(value.as_int())?,
        crate::ValueKind::Real => out.write_f64::<LittleEndian>(value.as_real())?,
        crate::ValueKind::String => write_string(out, &value.as_string())?,
        crate::ValueKind::Values | crate::ValueKind::Tuple => {
            let elements = value.elements().unwrap_or(&[]);
            out.write_u32::<LittleEndian>(elements.len() as u32)?;
            for element in elements {
                write_value(out, element)?;
            }
        }
    }
    Ok(())
}

pub fn read_value(input: &mut impl Read) -> Result<Value> {
    let tag = input.read_u8()?;
    let name = read_string(input)?;

    let mut value = match tag {
        TAG_BOOLEAN => Value::new_bool(input.read_u8()? != 0),
        TAG_INTEGER => Value::new_int(input.read_i64::<LittleEndian>()?),
        TAG_REAL => Value::new_real(input.read_f64::<LittleEndian>()?),
        TAG_STRING => Value::new_string(read_string(input)?),
        TAG_VALUES | TAG_TUPLE => {
            let count = input.read_u32::<LittleEndian>()?;
            if count > MAX_FIELD_LEN {
                return Err(CodecError::Oversized(u64::from(count)));
            }
            let mut elements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elements.push(read_value(input)?);
            }
            if tag == TAG_VALUES {
                Value::new_values(elements)
            } else {
                Value::new_tuple(elements)
            }
        }
        other => return Err(CodecError::UnknownTag(other)),
    };

    if !name.is_empty() {
        value.set_name(name);
    }
    Ok(value)
}

/// Encode an attribute message for the wire.
pub fn encode_message(target: &str, attribute: &str, args: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    // Writes to a Vec cannot fail.
    write_string(&mut out, target).expect("infallible write");
    write_string(&mut out, attribute).expect("infallible write");
    out.write_u32::<LittleEndian>(args.len() as u32)
        .expect("infallible write");
    for value in args {
        write_value(&mut out, value).expect("infallible write");
    }
    out
}

pub fn decode_message(bytes: &[u8]) -> Result<MessageFrame> {
    let mut cursor = Cursor::new(bytes);
    let target = read_string(&mut cursor)?;
    let attribute = read_string(&mut cursor)?;
    let count = cursor.read_u32::<LittleEndian>()?;
    if count > MAX_FIELD_LEN {
        return Err(CodecError::Oversized(u64::from(count)));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(read_value(&mut cursor)?);
    }
    Ok(MessageFrame {
        target,
        attribute,
        args,
    })
}

/// Prefix written at the head of every serialized buffer, read back by
/// [`peek_target`].
pub fn write_buffer_header(out: &mut Vec<u8>, target: &str) {
    write_string(out, target).expect("infallible write");
}

/// Read the routing target of a buffer frame without touching the payload.
///
/// Returns the target name and the offset at which the payload starts.
pub fn peek_target(bytes: &[u8]) -> Result<(String, usize)> {
    let mut cursor = Cursor::new(bytes);
    let target = read_string(&mut cursor)?;
    Ok((target, cursor.position() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_round_trip() {
        let args = vec![Value::from(1), Value::from("two")];
        let bytes = encode_message("X", "Y", &args);
        let frame = decode_message(&bytes).unwrap();
        assert_eq!(frame.target, "X");
        assert_eq!(frame.attribute, "Y");
        assert_eq!(frame.args, args);
    }

    #[test]
    fn nested_named_values_round_trip() {
        let value = Value::new_tuple(vec![
            Value::from(512).with_name("width"),
            Value::new_values(vec![Value::from(0.25), Value::from(false)]).with_name("flags"),
        ])
        .with_name("spec");

        let mut bytes = Vec::new();
        write_value(&mut bytes, &value).unwrap();
        let decoded = read_value(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn peek_target_leaves_payload_untouched() {
        let mut bytes = Vec::new();
        write_buffer_header(&mut bytes, "image");
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let (target, offset) = peek_target(&bytes).unwrap();
        assert_eq!(target, "image");
        assert_eq!(&bytes[offset..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = encode_message("X", "Y", &[Value::from(1)]);
        assert!(decode_message(&bytes[..bytes.len() - 2]).is_err());
        assert!(matches!(
            decode_message(&[0xFF; 3]),
            Err(CodecError::Io(_) | CodecError::Oversized(_))
        ));
    }
}
