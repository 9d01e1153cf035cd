//! The messaging-socket transport, over unix domain stream sockets.
//!
//! The input half binds one listening socket per stream (messages, buffers)
//! and accepts any number of producers; the output half connects to its
//! peers' listeners, so the writer initiates. Frames are u32-length-prefixed.
//! Each connected peer gets two writer threads fed by bounded queues: 1000
//! frames for messages, a single slot for buffers that keeps the freshest.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use splash_core::SerializedObject;
use tracing::{debug, warn};

use crate::channel::{BufferCallback, ChannelConfig, EndpointStream, MessageCallback};

const MESSAGE_QUEUE_DEPTH: usize = 1000;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Count of buffers enqueued but not yet written to a peer socket.
#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self, maximum_wait: Duration) -> bool {
        let deadline = Instant::now() + maximum_wait;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, timeout) = self.drained.wait_timeout(count, left).unwrap();
            count = guard;
            if timeout.timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }
}

struct Peer {
    msg_tx: Sender<Vec<u8>>,
    buf_tx: Sender<Arc<Vec<u8>>>,
    buf_rx: Receiver<Arc<Vec<u8>>>,
    threads: Vec<JoinHandle<()>>,
}

/// Producer half.
pub struct SocketOutput {
    config: ChannelConfig,
    peers: Mutex<HashMap<String, Peer>>,
    inflight: Arc<Inflight>,
}

impl SocketOutput {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
            inflight: Arc::new(Inflight::default()),
        }
    }

    pub fn is_ready(&self) -> bool {
        true
    }

    /// Connect both streams to `target`, retrying until the peer's listeners
    /// appear or the connect timeout expires.
    pub fn connect_to(&self, target: &str) -> bool {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(target) {
            return false;
        }

        let deadline = Instant::now() + self.config.connect_timeout;
        let msg_path = self.config.endpoint(EndpointStream::Message, target);
        let buf_path = self.config.endpoint(EndpointStream::Buffer, target);
        let Some(msg_stream) = connect_with_retry(&msg_path, deadline) else {
            warn!(peer = target, path = %msg_path.display(), "could not reach peer message socket");
            return false;
        };
        let Some(buf_stream) = connect_with_retry(&buf_path, deadline) else {
            warn!(peer = target, path = %buf_path.display(), "could not reach peer buffer socket");
            return false;
        };

        let (msg_tx, msg_rx) = bounded::<Vec<u8>>(MESSAGE_QUEUE_DEPTH);
        let (buf_tx, buf_rx) = bounded::<Arc<Vec<u8>>>(1);

        let msg_thread = spawn_named("splash-msg-out", {
            let mut stream = msg_stream;
            move || {
                for frame in msg_rx {
                    if let Err(err) = write_frame(&mut stream, &frame) {
                        debug!(error = %err, "message writer stopping");
                        break;
                    }
                }
            }
        });

        let buf_thread = spawn_named("splash-buf-out", {
            let mut stream = Some(buf_stream);
            let inflight = self.inflight.clone();
            let rx = buf_rx.clone();
            move || {
                for payload in rx {
                    if let Some(active) = stream.as_mut() {
                        if let Err(err) = write_frame(active, &payload) {
                            debug!(error = %err, "buffer writer degraded");
                            stream = None;
                        }
                    }
                    inflight.done();
                }
            }
        });

        peers.insert(
            target.to_string(),
            Peer {
                msg_tx,
                buf_tx,
                buf_rx,
                threads: vec![msg_thread, buf_thread],
            },
        );
        true
    }

    pub fn disconnect_from(&self, target: &str) -> bool {
        let peer = self.peers.lock().unwrap().remove(target);
        match peer {
            Some(peer) => {
                let Peer {
                    msg_tx,
                    buf_tx,
                    buf_rx,
                    threads,
                } = peer;
                drop(msg_tx);
                drop(buf_tx);
                drop(buf_rx);
                for thread in threads {
                    let _ = thread.join();
                }
                true
            }
            None => false,
        }
    }

    /// Deliver an opaque frame to every connected peer.
    pub fn send_message(&self, frame: &[u8]) -> bool {
        let peers = self.peers.lock().unwrap();
        if peers.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for (name, peer) in peers.iter() {
            match peer.msg_tx.try_send(frame.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %name, "message queue full, dropping frame");
                    all_ok = false;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!(peer = %name, "message channel closed");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Deliver a buffer to every connected peer, consuming it. A peer whose
    /// slot is occupied drops the stale buffer and keeps this freshest one.
    pub fn send_buffer(&self, mut buffer: SerializedObject) -> bool {
        let payload = Arc::new(buffer.take_data());
        let peers = self.peers.lock().unwrap();
        if peers.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for (name, peer) in peers.iter() {
            let mut pending = payload.clone();
            let mut sent = false;
            for _ in 0..2 {
                match peer.buf_tx.try_send(pending) {
                    Ok(()) => {
                        self.inflight.add();
                        sent = true;
                        break;
                    }
                    Err(TrySendError::Full(rejected)) => {
                        // Evict the stale slot, then retry with ours.
                        if peer.buf_rx.try_recv().is_ok() {
                            self.inflight.done();
                        }
                        pending = rejected;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!(peer = %name, "buffer channel closed");
                        break;
                    }
                }
            }
            if !sent {
                debug!(peer = %name, "buffer slot contended, frame dropped");
                all_ok = false;
            }
        }
        all_ok
    }

    pub fn wait_for_buffer_sending(&self, maximum_wait: Duration) -> bool {
        self.inflight.wait_drained(maximum_wait)
    }
}

impl Drop for SocketOutput {
    fn drop(&mut self) {
        let names: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.disconnect_from(&name);
        }
    }
}

/// Consumer half: binds the endpoint sockets and feeds received frames to
/// the stored callbacks, synchronously from the consume threads.
pub struct SocketInput {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    owned_paths: Vec<PathBuf>,
    ready: bool,
}

impl SocketInput {
    pub fn new(
        config: ChannelConfig,
        name: &str,
        message_cb: MessageCallback,
        buffer_cb: BufferCallback,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        let mut owned_paths = Vec::new();
        let mut ready = true;

        let msg_path = config.endpoint(EndpointStream::Message, name);
        let buf_path = config.endpoint(EndpointStream::Buffer, name);

        match bind_listener(&msg_path) {
            Ok(listener) => {
                owned_paths.push(msg_path);
                let stop = stop.clone();
                threads.push(spawn_named("splash-msg-in", move || {
                    accept_loop(&listener, &stop, move |bytes| message_cb.as_ref()(bytes));
                }));
            }
            Err(err) => {
                warn!(path = %msg_path.display(), error = %err, "cannot bind message socket");
                ready = false;
            }
        }

        match bind_listener(&buf_path) {
            Ok(listener) => {
                owned_paths.push(buf_path);
                let stop = stop.clone();
                threads.push(spawn_named("splash-buf-in", move || {
                    accept_loop(&listener, &stop, move |bytes| {
                        buffer_cb.as_ref()(SerializedObject::from_vec(bytes));
                    });
                }));
            }
            Err(err) => {
                warn!(path = %buf_path.display(), error = %err, "cannot bind buffer socket");
                ready = false;
            }
        }

        Self {
            stop,
            threads,
            owned_paths,
            ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Drop for SocketInput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        for path in &self.owned_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    // A stale socket file from a dead process would make the bind fail.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    listener: &UnixListener,
    stop: &Arc<AtomicBool>,
    on_frame: impl Fn(Vec<u8>) + Send + Sync + 'static,
) {
    let on_frame = Arc::new(on_frame);
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let stop = stop.clone();
                let on_frame = on_frame.clone();
                // Reader threads are detached; they observe the same stop
                // flag and exit within one poll cycle.
                let _ = thread::Builder::new()
                    .name("splash-frame-reader".into())
                    .spawn(move || read_loop(stream, &stop, on_frame.as_ref()));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                warn!(error = %err, "socket accept failed, input stopping");
                break;
            }
        }
    }
}

fn read_loop(mut stream: UnixStream, stop: &AtomicBool, on_frame: &(impl Fn(Vec<u8>) + ?Sized)) {
    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(POLL_INTERVAL)).is_err()
    {
        return;
    }

    let mut header = [0_u8; 4];
    loop {
        match read_exact_stop(&mut stream, &mut header, stop) {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        let len = LittleEndian::read_u32(&header) as usize;
        let mut frame = vec![0; len];
        match read_exact_stop(&mut stream, &mut frame, stop) {
            Ok(true) => on_frame(frame),
            Ok(false) => return,
            Err(err) => {
                warn!(error = %err, "frame read failed");
                return;
            }
        }
    }
}

/// Fill `buf` from the stream, polling the stop flag between partial reads.
/// Returns `Ok(false)` on stop or clean EOF.
fn read_exact_stop(stream: &mut UnixStream, buf: &mut [u8], stop: &AtomicBool) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if stop.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    let mut header = [0_u8; 4];
    LittleEndian::write_u32(&mut header, payload.len() as u32);
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn connect_with_retry(path: &Path, deadline: Instant) -> Option<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Some(stream),
            Err(_) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Err(_) => return None,
        }
    }
}

fn spawn_named(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(body)
        .expect("thread spawn")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> ChannelConfig {
        ChannelConfig {
            kind: crate::ChannelKind::Socket,
            prefix: "sock".into(),
            base_dir: dir.to_path_buf(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn frames_survive_the_socket_pair() {
        let dir = tempfile::tempdir().unwrap();
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = received.clone();

        let _input = SocketInput::new(
            config(dir.path()),
            "B",
            Arc::new(move |bytes| sink.lock().unwrap().push(bytes)),
            Arc::new(|_| {}),
        );
        let output = SocketOutput::new(config(dir.path()));
        assert!(output.connect_to("B"));
        assert!(output.send_message(&[1, 2, 3, 4, 5]));

        let deadline = Instant::now() + Duration::from_secs(2);
        while received.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn buffer_slot_keeps_the_freshest() {
        let dir = tempfile::tempdir().unwrap();
        let output = SocketOutput::new(config(dir.path()));

        // Peer exists but nobody reads: the single slot must churn without
        // blocking the sender.
        let _input = SocketInput::new(config(dir.path()), "B", Arc::new(|_| {}), Arc::new(|_| {}));
        assert!(output.connect_to("B"));
        for i in 0..16_u8 {
            output.send_buffer(SerializedObject::from_slice(&[i; 8]));
        }
        assert!(output.wait_for_buffer_sending(Duration::from_secs(2)));
    }

    #[test]
    fn connect_to_missing_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.connect_timeout = Duration::from_millis(50);
        let output = SocketOutput::new(cfg);
        assert!(!output.connect_to("ghost"));
        assert!(!output.send_message(&[1]));
    }
}
