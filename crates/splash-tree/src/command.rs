//! Mutation commands, the replication unit of the tree.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use splash_core::codec::{self, CodecError};
use splash_core::Value;

use crate::Seed;

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub seed: Seed,
    pub timestamp: i64,
    pub op: CommandOp,
    pub path: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    AddBranch,
    RemoveBranch,
    AddLeaf,
    RemoveLeaf,
    SetLeaf,
}

impl CommandOp {
    fn to_u8(self) -> u8 {
        match self {
            Self::AddBranch => 0,
            Self::RemoveBranch => 1,
            Self::AddLeaf => 2,
            Self::RemoveLeaf => 3,
            Self::SetLeaf => 4,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::AddBranch),
            1 => Some(Self::RemoveBranch),
            2 => Some(Self::AddLeaf),
            3 => Some(Self::RemoveLeaf),
            4 => Some(Self::SetLeaf),
            _ => None,
        }
    }
}

impl Command {
    /// Frame the command with the same primitives as attribute messages.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.path.len());
        out.write_u8(self.op.to_u8()).expect("infallible write");
        out.write_u64::<LittleEndian>(self.seed)
            .expect("infallible write");
        out.write_i64::<LittleEndian>(self.timestamp)
            .expect("infallible write");
        out.write_u32::<LittleEndian>(self.path.len() as u32)
            .expect("infallible write");
        out.extend_from_slice(self.path.as_bytes());
        match &self.value {
            Some(value) => {
                out.write_u8(1).expect("infallible write");
                codec::write_value(&mut out, value).expect("infallible write");
            }
            None => out.write_u8(0).expect("infallible write"),
        }
        out
    }

    /// Pack the command into a value list, for transport inside an
    /// attribute message.
    pub fn to_value(&self) -> Value {
        let mut items = vec![
            Value::from(i64::from(self.op.to_u8())),
            Value::from(self.seed as i64),
            Value::from(self.timestamp),
            Value::from(self.path.as_str()),
        ];
        if let Some(value) = &self.value {
            items.push(value.clone());
        }
        Value::new_values(items)
    }

    /// Inverse of [`to_value`](Self::to_value).
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.elements()?;
        if items.len() < 4 {
            return None;
        }
        let op = CommandOp::from_u8(items[0].as_int() as u8)?;
        Some(Self {
            seed: items[1].as_int() as u64,
            timestamp: items[2].as_int(),
            op,
            path: items[3].as_string(),
            value: items.get(4).cloned(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let op = cursor.read_u8()?;
        let op = CommandOp::from_u8(op).ok_or(CodecError::UnknownTag(op))?;
        let seed = cursor.read_u64::<LittleEndian>()?;
        let timestamp = cursor.read_i64::<LittleEndian>()?;
        let path_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut path = vec![0; path_len];
        cursor.read_exact(&mut path)?;
        let path = String::from_utf8(path)?;
        let value = if cursor.read_u8()? != 0 {
            Some(codec::read_value(&mut cursor)?)
        } else {
            None
        };
        Ok(Self {
            seed,
            timestamp,
            op,
            path,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cmd = Command {
            seed: 42,
            timestamp: 1_000_000,
            op: CommandOp::SetLeaf,
            path: "/world/objects/img/attributes/alias".into(),
            value: Some(Value::from("newAlias")),
        };
        let decoded = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn command_value_round_trip() {
        let cmd = Command {
            seed: u64::MAX - 3,
            timestamp: 77,
            op: CommandOp::AddLeaf,
            path: "/scene/commands/cmd_1".into(),
            value: Some(Value::new_values(vec![Value::from("callRoot")])),
        };
        assert_eq!(Command::from_value(&cmd.to_value()).unwrap(), cmd);
    }

    #[test]
    fn valueless_command_round_trip() {
        let cmd = Command {
            seed: 7,
            timestamp: 5,
            op: CommandOp::RemoveBranch,
            path: "/a/b".into(),
            value: None,
        };
        assert_eq!(Command::from_bytes(&cmd.to_bytes()).unwrap(), cmd);
    }
}
