//! The owned byte buffer that carries a buffer object between processes.

/// Wire representation of a buffer object payload.
///
/// Move-only on purpose: a serialized frame is handed over to the transport,
/// never duplicated. [`take_data`](Self::take_data) releases the underlying
/// storage and leaves the object empty.
#[derive(Debug, Default)]
pub struct SerializedObject {
    data: Vec<u8>,
}

impl SerializedObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero-filled buffer of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resize(&mut self, size: usize) {
        self.data.resize(size, 0);
    }

    /// Release ownership of the storage; the object is empty afterwards.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl From<Vec<u8>> for SerializedObject {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_data_leaves_the_object_empty() {
        let mut obj = SerializedObject::from_slice(&[1, 2, 3]);
        assert_eq!(obj.size(), 3);

        let data = obj.take_data();
        assert_eq!(data, vec![1, 2, 3]);
        assert!(obj.is_empty());
        assert_eq!(obj.size(), 0);
    }

    #[test]
    fn size_tracks_storage_across_moves() {
        let obj = SerializedObject::with_size(16);
        let moved = obj;
        assert_eq!(moved.size(), 16);
        assert_eq!(moved.data().len(), 16);
    }
}
