//! Transport selection and dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use splash_core::SerializedObject;

use crate::shmem::{ShmemInput, ShmemOutput};
use crate::socket::{SocketInput, SocketOutput};

/// Callback invoked with every received message frame.
pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
/// Callback invoked with every received buffer, ownership moved in.
pub type BufferCallback = Arc<dyn Fn(SerializedObject) + Send + Sync>;

/// Which transport a link runs on. Resolved once at construction; the
/// channel enums below dispatch statically from there on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Unix domain stream sockets, the messaging-socket transport.
    Socket,
    /// Shared-memory rings mapped from files.
    Memory,
}

impl Default for ChannelKind {
    fn default() -> Self {
        Self::Socket
    }
}

/// Endpoint naming and timing knobs shared by both transports.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    /// Distinguishes concurrent Splash sessions; defaults to the master pid.
    pub prefix: String,
    /// Directory holding socket files and shared-memory files.
    pub base_dir: PathBuf,
    /// How long to wait for a peer when connecting.
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::default(),
            prefix: std::process::id().to_string(),
            base_dir: PathBuf::from("/tmp"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// `<base>/splash_<prefix>_msg_<name>`, matching the on-disk layout of
    /// both transports.
    pub fn endpoint(&self, stream: EndpointStream, name: &str) -> PathBuf {
        let stream = match stream {
            EndpointStream::Message => "msg",
            EndpointStream::Buffer => "buf",
        };
        let file = if self.prefix.is_empty() {
            format!("splash_{stream}_{name}")
        } else {
            format!("splash_{}_{stream}_{name}", self.prefix)
        };
        self.base_dir.join(file)
    }
}

/// The two byte streams every channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStream {
    Message,
    Buffer,
}

/// Producer half of a channel.
pub enum ChannelOutput {
    Socket(SocketOutput),
    Memory(ShmemOutput),
}

impl ChannelOutput {
    pub fn new(config: &ChannelConfig, name: &str) -> Self {
        match config.kind {
            ChannelKind::Socket => Self::Socket(SocketOutput::new(config.clone())),
            ChannelKind::Memory => Self::Memory(ShmemOutput::new(config.clone(), name)),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Socket(out) => out.is_ready(),
            Self::Memory(out) => out.is_ready(),
        }
    }

    pub fn connect_to(&self, target: &str) -> bool {
        match self {
            Self::Socket(out) => out.connect_to(target),
            Self::Memory(out) => out.connect_to(target),
        }
    }

    pub fn disconnect_from(&self, target: &str) -> bool {
        match self {
            Self::Socket(out) => out.disconnect_from(target),
            Self::Memory(out) => out.disconnect_from(target),
        }
    }

    pub fn send_message(&self, frame: &[u8]) -> bool {
        match self {
            Self::Socket(out) => out.send_message(frame),
            Self::Memory(out) => out.send_message(frame),
        }
    }

    pub fn send_buffer(&self, buffer: SerializedObject) -> bool {
        match self {
            Self::Socket(out) => out.send_buffer(buffer),
            Self::Memory(out) => out.send_buffer(buffer),
        }
    }

    pub fn wait_for_buffer_sending(&self, maximum_wait: Duration) -> bool {
        match self {
            Self::Socket(out) => out.wait_for_buffer_sending(maximum_wait),
            Self::Memory(out) => out.wait_for_buffer_sending(maximum_wait),
        }
    }
}

/// Consumer half of a channel. Received frames are handed to the callbacks
/// from the consume threads.
pub enum ChannelInput {
    Socket(SocketInput),
    Memory(ShmemInput),
}

impl ChannelInput {
    pub fn new(
        config: &ChannelConfig,
        name: &str,
        message_cb: MessageCallback,
        buffer_cb: BufferCallback,
    ) -> Self {
        match config.kind {
            ChannelKind::Socket => {
                Self::Socket(SocketInput::new(config.clone(), name, message_cb, buffer_cb))
            }
            ChannelKind::Memory => {
                Self::Memory(ShmemInput::new(config.clone(), message_cb, buffer_cb))
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Socket(input) => input.is_ready(),
            Self::Memory(_) => true,
        }
    }

    /// Attach to `peer`. Only meaningful on the shared-memory transport,
    /// where the reader initiates; the socket input accepts connections
    /// instead and reports success unconditionally.
    pub fn connect_to(&self, peer: &str) -> bool {
        match self {
            Self::Socket(_) => true,
            Self::Memory(input) => input.connect_to(peer),
        }
    }

    pub fn disconnect_from(&self, peer: &str) -> bool {
        match self {
            Self::Socket(_) => false,
            Self::Memory(input) => input.disconnect_from(peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_paths_embed_prefix_stream_and_name() {
        let config = ChannelConfig {
            kind: ChannelKind::Socket,
            prefix: "1234".into(),
            base_dir: PathBuf::from("/tmp"),
            connect_timeout: Duration::from_secs(5),
        };
        assert_eq!(
            config.endpoint(EndpointStream::Message, "world"),
            PathBuf::from("/tmp/splash_1234_msg_world")
        );
        assert_eq!(
            config.endpoint(EndpointStream::Buffer, "scene"),
            PathBuf::from("/tmp/splash_1234_buf_scene")
        );

        let bare = ChannelConfig {
            prefix: String::new(),
            ..config
        };
        assert_eq!(
            bare.endpoint(EndpointStream::Message, "world"),
            PathBuf::from("/tmp/splash_msg_world")
        );
    }
}
