//! IPC link between the World process and its Scenes.
//!
//! A [`Link`] owns one outbound and one inbound channel over a single
//! transport, selected once at construction: unix domain sockets
//! ([`ChannelKind::Socket`]) or shared-memory rings
//! ([`ChannelKind::Memory`]). Messages are small framed attribute tuples
//! fanned out to every connected peer; buffers are large serialized payloads
//! routed by the target name written at their head.

// crate-specific lint exceptions:
//#![allow()]

mod channel;
mod shmem;
mod socket;

pub use channel::{ChannelConfig, ChannelInput, ChannelKind, ChannelOutput};

use std::sync::Arc;
use std::time::Duration;

use splash_core::{codec, SerializedObject, Values};
use tracing::{debug, warn};

/// Broadcast target understood by every receiving root.
pub const ALL_PEERS: &str = "__ALL__";

/// Receiver side of a [`Link`]: decoded messages and routed buffers end up
/// here, called from the channel consume threads.
pub trait LinkHandler: Send + Sync + 'static {
    fn handle_message(&self, target: &str, attribute: &str, args: Values);
    fn handle_buffer(&self, target: &str, buffer: SerializedObject);
}

/// Channel pair manager owned by each root object.
pub struct Link {
    name: String,
    output: ChannelOutput,
    input: ChannelInput,
}

impl Link {
    /// Open the link for the root named `name`, with `handler` receiving
    /// everything the input channel produces.
    pub fn new(name: &str, config: ChannelConfig, handler: Arc<dyn LinkHandler>) -> Self {
        let message_handler = handler.clone();
        let message_cb = Arc::new(move |bytes: Vec<u8>| match codec::decode_message(&bytes) {
            Ok(frame) => message_handler.handle_message(&frame.target, &frame.attribute, frame.args),
            Err(err) => warn!(error = %err, "dropping undecodable message"),
        });

        let buffer_cb = Arc::new(move |buffer: SerializedObject| {
            match codec::peek_target(buffer.data()) {
                Ok((target, _)) => handler.handle_buffer(&target, buffer),
                Err(err) => warn!(error = %err, "dropping buffer with unreadable target"),
            }
        });

        let output = ChannelOutput::new(&config, name);
        let input = ChannelInput::new(&config, name, message_cb, buffer_cb);

        Self {
            name: name.to_string(),
            output,
            input,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.output.is_ready()
    }

    /// Connect both channel halves to `peer`. On the socket transport the
    /// writer initiates and the input half has nothing to do; on the
    /// shared-memory transport the reader attaches to the peer's endpoints.
    pub fn connect_to(&self, peer: &str) -> bool {
        let output_ok = self.output.connect_to(peer);
        let input_ok = self.input.connect_to(peer);
        output_ok && input_ok
    }

    pub fn disconnect_from(&self, peer: &str) -> bool {
        let output_ok = self.output.disconnect_from(peer);
        let input_ok = self.input.disconnect_from(peer);
        output_ok || input_ok
    }

    /// Encode and publish an attribute message to every connected peer.
    pub fn send_message(&self, target: &str, attribute: &str, args: &Values) -> bool {
        let frame = codec::encode_message(target, attribute, args);
        let result = self.output.send_message(&frame);
        if target != ALL_PEERS {
            debug!(dest = target, attribute, "link message sent");
        }
        result
    }

    /// Publish a serialized buffer. The buffer must already carry its target
    /// name as written by [`codec::write_buffer_header`].
    pub fn send_buffer(&self, buffer: SerializedObject) -> bool {
        self.output.send_buffer(buffer)
    }

    /// Block until all outbound buffers drained or `maximum_wait` expired.
    pub fn wait_for_buffer_sending(&self, maximum_wait: Duration) -> bool {
        self.output.wait_for_buffer_sending(maximum_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splash_core::Value;
    use std::sync::Mutex;

    struct Recorder {
        messages: Mutex<Vec<(String, String, Values)>>,
        buffers: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                buffers: Mutex::new(Vec::new()),
            })
        }
    }

    impl LinkHandler for Recorder {
        fn handle_message(&self, target: &str, attribute: &str, args: Values) {
            self.messages
                .lock()
                .unwrap()
                .push((target.to_string(), attribute.to_string(), args));
        }

        fn handle_buffer(&self, target: &str, buffer: SerializedObject) {
            self.buffers
                .lock()
                .unwrap()
                .push((target.to_string(), buffer.data().to_vec()));
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn link_pair(kind: ChannelKind, dir: &std::path::Path) -> (Link, Link, Arc<Recorder>) {
        let config = ChannelConfig {
            kind,
            prefix: String::from("test"),
            base_dir: dir.to_path_buf(),
            connect_timeout: Duration::from_secs(5),
        };
        let recorder = Recorder::new();
        let receiver = Link::new("B", config.clone(), recorder.clone());
        let sender = Link::new("A", config, Recorder::new());
        (sender, receiver, recorder)
    }

    #[test]
    fn socket_link_delivers_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _receiver, recorder) = link_pair(ChannelKind::Socket, dir.path());

        assert!(sender.connect_to("B"));
        assert!(sender.send_message("X", "Y", &vec![Value::from(1), Value::from("two")]));

        assert!(wait_until(|| !recorder.messages.lock().unwrap().is_empty()));
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(
            messages[0],
            (
                "X".to_string(),
                "Y".to_string(),
                vec![Value::from(1), Value::from("two")]
            )
        );
    }

    #[test]
    fn memory_link_delivers_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver, recorder) = link_pair(ChannelKind::Memory, dir.path());

        // Shared memory: the reader side attaches to the writer's endpoints.
        assert!(receiver.connect_to("A"));
        assert!(sender.connect_to("B"));

        let mut frame = Vec::new();
        codec::write_buffer_header(&mut frame, "target");
        frame.extend_from_slice(&[0x01, 0x02, 0x03]);
        assert!(sender.send_buffer(SerializedObject::from_vec(frame.clone())));
        assert!(sender.wait_for_buffer_sending(Duration::from_secs(1)));

        assert!(wait_until(|| !recorder.buffers.lock().unwrap().is_empty()));
        let buffers = recorder.buffers.lock().unwrap();
        assert_eq!(buffers[0].0, "target");
        assert_eq!(buffers[0].1, frame);
        let payload = &buffers[0].1[codec::peek_target(&buffers[0].1).unwrap().1..];
        assert_eq!(payload, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn socket_link_delivers_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _receiver, recorder) = link_pair(ChannelKind::Socket, dir.path());

        assert!(sender.connect_to("B"));
        let mut frame = Vec::new();
        codec::write_buffer_header(&mut frame, "img");
        frame.extend_from_slice(&[9, 8, 7]);
        assert!(sender.send_buffer(SerializedObject::from_vec(frame)));
        assert!(sender.wait_for_buffer_sending(Duration::from_secs(1)));

        assert!(wait_until(|| !recorder.buffers.lock().unwrap().is_empty()));
        assert_eq!(recorder.buffers.lock().unwrap()[0].0, "img");
    }

    #[test]
    fn sends_on_disconnected_channel_fail_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            kind: ChannelKind::Socket,
            prefix: String::from("lonely"),
            base_dir: dir.path().to_path_buf(),
            connect_timeout: Duration::from_millis(100),
        };
        let link = Link::new("A", config, Recorder::new());
        assert!(!link.connect_to("nobody"));
        assert!(!link.send_message("X", "Y", &vec![]));
    }
}
