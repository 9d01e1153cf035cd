//! The shared-memory transport.
//!
//! Each writer endpoint is a file mapped by one producer and any number of
//! followers. The file holds a small header and a ring of seqlocked slots:
//! the writer invalidates a slot (`seq = 0`), copies the frame, then
//! publishes it by storing the frame index; followers poll the published
//! counter and copy frames out, re-checking the slot sequence after the copy
//! to detect a concurrent overwrite. The message ring keeps 64 slots; the
//! buffer ring is a single slot that always holds the freshest frame and
//! grows on demand.
//!
//! Followers register themselves in the header's attach counter, which is
//! what the producer's `connect_to("world")` waits on.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use splash_core::SerializedObject;
use tracing::{debug, warn};

use crate::channel::{BufferCallback, ChannelConfig, EndpointStream, MessageCallback};

const MAGIC: u64 = 0x53504C_4153_484D_31;

const OFF_MAGIC: usize = 0;
const OFF_SLOT_COUNT: usize = 8;
const OFF_SLOT_SIZE: usize = 16;
const OFF_FRAME_COUNTER: usize = 24;
const OFF_FOLLOWERS: usize = 32;
const HEADER_SIZE: usize = 64;

/// Per-slot header: sequence then length.
const SLOT_HEADER: usize = 16;

const MESSAGE_SLOT_COUNT: u64 = 64;
const MESSAGE_SLOT_SIZE: u64 = 64 * 1024;
const BUFFER_SLOT_SIZE: u64 = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// View a u64 field of the mapped header or a slot as an atomic.
///
/// The offsets used throughout are 8-byte aligned and inside the mapping;
/// the mapping itself is page aligned.
#[allow(unsafe_code)]
fn atom(map: &MmapMut, offset: usize) -> &AtomicU64 {
    debug_assert!(offset % 8 == 0 && offset + 8 <= map.len());
    unsafe { &*map.as_ptr().add(offset).cast::<AtomicU64>() }
}

fn slot_offset(index: u64, slot_count: u64, slot_size: u64) -> usize {
    let stride = SLOT_HEADER as u64 + slot_size;
    HEADER_SIZE + ((index % slot_count) * stride) as usize
}

fn file_len(slot_count: u64, slot_size: u64) -> u64 {
    HEADER_SIZE as u64 + slot_count * (SLOT_HEADER as u64 + slot_size)
}

struct RingWriter {
    map: MmapMut,
    file: File,
    slot_count: u64,
    slot_size: u64,
    growable: bool,
}

#[allow(unsafe_code)]
impl RingWriter {
    fn create(path: &Path, slot_count: u64, slot_size: u64, growable: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(file_len(slot_count, slot_size))?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let writer = Self {
            map,
            file,
            slot_count,
            slot_size,
            growable,
        };
        atom(&writer.map, OFF_SLOT_COUNT).store(slot_count, Ordering::SeqCst);
        atom(&writer.map, OFF_SLOT_SIZE).store(slot_size, Ordering::SeqCst);
        atom(&writer.map, OFF_FRAME_COUNTER).store(0, Ordering::SeqCst);
        atom(&writer.map, OFF_FOLLOWERS).store(0, Ordering::SeqCst);
        atom(&writer.map, OFF_MAGIC).store(MAGIC, Ordering::SeqCst);
        Ok(writer)
    }

    fn followers(&self) -> u64 {
        atom(&self.map, OFF_FOLLOWERS).load(Ordering::SeqCst)
    }

    fn grow(&mut self, needed: u64) -> io::Result<()> {
        let new_size = needed.next_power_of_two().max(BUFFER_SLOT_SIZE);
        self.file.set_len(file_len(self.slot_count, new_size))?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.slot_size = new_size;
        // Published after the remap so followers never read past the file.
        atom(&self.map, OFF_SLOT_SIZE).store(new_size, Ordering::SeqCst);
        Ok(())
    }

    fn publish(&mut self, payload: &[u8]) -> bool {
        if payload.len() as u64 > self.slot_size {
            if !self.growable {
                warn!(len = payload.len(), "frame exceeds shm slot size, dropped");
                return false;
            }
            if let Err(err) = self.grow(payload.len() as u64) {
                warn!(error = %err, "failed to grow shm ring");
                return false;
            }
        }

        let next = atom(&self.map, OFF_FRAME_COUNTER).load(Ordering::SeqCst) + 1;
        let offset = slot_offset(next - 1, self.slot_count, self.slot_size);

        atom(&self.map, offset).store(0, Ordering::SeqCst);
        atom(&self.map, offset + 8).store(payload.len() as u64, Ordering::SeqCst);
        let data_start = offset + SLOT_HEADER;
        self.map[data_start..data_start + payload.len()].copy_from_slice(payload);
        atom(&self.map, offset).store(next, Ordering::SeqCst);
        atom(&self.map, OFF_FRAME_COUNTER).store(next, Ordering::SeqCst);
        true
    }
}

/// Producer side: owns the two ring files named after this process.
pub struct ShmemOutput {
    config: ChannelConfig,
    message: Mutex<Option<RingWriter>>,
    buffer: Mutex<Option<RingWriter>>,
    paths: Vec<PathBuf>,
    targets: Mutex<HashSet<String>>,
    ready: bool,
}

impl ShmemOutput {
    pub fn new(config: ChannelConfig, name: &str) -> Self {
        let msg_path = config.endpoint(EndpointStream::Message, name);
        let buf_path = config.endpoint(EndpointStream::Buffer, name);

        let message = RingWriter::create(&msg_path, MESSAGE_SLOT_COUNT, MESSAGE_SLOT_SIZE, false);
        let buffer = RingWriter::create(&buf_path, 1, BUFFER_SLOT_SIZE, true);
        let ready = message.is_ok() && buffer.is_ok();
        if let Err(err) = &message {
            warn!(path = %msg_path.display(), error = %err, "cannot create shm message ring");
        }
        if let Err(err) = &buffer {
            warn!(path = %buf_path.display(), error = %err, "cannot create shm buffer ring");
        }

        Self {
            config,
            message: Mutex::new(message.ok()),
            buffer: Mutex::new(buffer.ok()),
            paths: vec![msg_path, buf_path],
            targets: Mutex::new(HashSet::new()),
            ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Connecting to the world waits for its follower to attach, up to the
    /// configured timeout; any other target registers immediately since
    /// followers find our rings on their own.
    pub fn connect_to(&self, target: &str) -> bool {
        if !self.targets.lock().unwrap().insert(target.to_string()) {
            return false;
        }
        if target != "world" {
            return true;
        }

        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let attached = self
                .message
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, RingWriter::followers);
            if attached > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("no follower attached to shm rings before timeout");
                self.targets.lock().unwrap().remove(target);
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn disconnect_from(&self, target: &str) -> bool {
        self.targets.lock().unwrap().remove(target)
    }

    pub fn send_message(&self, frame: &[u8]) -> bool {
        match self.message.lock().unwrap().as_mut() {
            Some(ring) => ring.publish(frame),
            None => false,
        }
    }

    pub fn send_buffer(&self, mut buffer: SerializedObject) -> bool {
        let payload = buffer.take_data();
        match self.buffer.lock().unwrap().as_mut() {
            Some(ring) => ring.publish(&payload),
            None => false,
        }
    }

    /// Publishing copies the frame into the ring synchronously, so there is
    /// never an outbound queue to drain.
    pub fn wait_for_buffer_sending(&self, _maximum_wait: Duration) -> bool {
        true
    }
}

impl Drop for ShmemOutput {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct Follower {
    map: MmapMut,
    file: File,
    slot_count: u64,
    slot_size: u64,
    next_frame: u64,
}

#[allow(unsafe_code)]
impl Follower {
    /// Attach to a ring, retrying until the producer has created and
    /// initialized it or the deadline passes.
    fn attach(path: &Path, deadline: Instant) -> io::Result<Self> {
        loop {
            match Self::try_attach(path) {
                Ok(follower) => return Ok(follower),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn try_attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < HEADER_SIZE || atom(&map, OFF_MAGIC).load(Ordering::SeqCst) != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a splash shm ring",
            ));
        }

        let slot_count = atom(&map, OFF_SLOT_COUNT).load(Ordering::SeqCst);
        let slot_size = atom(&map, OFF_SLOT_SIZE).load(Ordering::SeqCst);
        // Start from the current head: only frames published after the
        // attach are delivered.
        let next_frame = atom(&map, OFF_FRAME_COUNTER).load(Ordering::SeqCst) + 1;
        atom(&map, OFF_FOLLOWERS).fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            map,
            file,
            slot_count,
            slot_size,
            next_frame,
        })
    }

    fn remap_if_grown(&mut self) -> io::Result<()> {
        let published = atom(&self.map, OFF_SLOT_SIZE).load(Ordering::SeqCst);
        if published != self.slot_size {
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
            self.slot_size = published;
        }
        Ok(())
    }

    /// Deliver every frame published since the last poll.
    fn poll(&mut self, deliver: &dyn Fn(Vec<u8>)) {
        if self.remap_if_grown().is_err() {
            return;
        }

        loop {
            let head = atom(&self.map, OFF_FRAME_COUNTER).load(Ordering::SeqCst);
            if self.next_frame > head {
                return;
            }

            let offset = slot_offset(self.next_frame - 1, self.slot_count, self.slot_size);
            let seq = atom(&self.map, offset).load(Ordering::SeqCst);
            if seq == 0 || seq < self.next_frame {
                // Slot is being rewritten; retry on the next poll.
                return;
            }
            if seq > self.next_frame {
                // The writer lapped us: resume at the oldest surviving frame.
                debug!(missed = seq - self.next_frame, "shm follower lapped");
                self.next_frame = seq;
                continue;
            }

            let len = atom(&self.map, offset + 8).load(Ordering::SeqCst) as usize;
            if len > self.slot_size as usize {
                // Written under a larger geometry than we have mapped.
                if self.remap_if_grown().is_err() {
                    return;
                }
                continue;
            }
            let data_start = offset + SLOT_HEADER;
            let frame = self.map[data_start..data_start + len].to_vec();
            if atom(&self.map, offset).load(Ordering::SeqCst) == self.next_frame {
                deliver(frame);
            }
            self.next_frame += 1;
        }
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        atom(&self.map, OFF_FOLLOWERS).fetch_sub(1, Ordering::SeqCst);
    }
}

struct PeerFollowers {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

/// Consumer side: attaches follower threads to peers' rings.
pub struct ShmemInput {
    config: ChannelConfig,
    message_cb: MessageCallback,
    buffer_cb: BufferCallback,
    peers: Mutex<HashMap<String, PeerFollowers>>,
}

impl ShmemInput {
    pub fn new(config: ChannelConfig, message_cb: MessageCallback, buffer_cb: BufferCallback) -> Self {
        Self {
            config,
            message_cb,
            buffer_cb,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Attach to both of `peer`'s rings and start their consume threads.
    pub fn connect_to(&self, peer: &str) -> bool {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(peer) {
            return false;
        }

        let deadline = Instant::now() + self.config.connect_timeout;
        let msg_path = self.config.endpoint(EndpointStream::Message, peer);
        let buf_path = self.config.endpoint(EndpointStream::Buffer, peer);

        let msg_follower = match Follower::attach(&msg_path, deadline) {
            Ok(follower) => follower,
            Err(err) => {
                warn!(peer, path = %msg_path.display(), error = %err, "cannot attach to shm ring");
                return false;
            }
        };
        let buf_follower = match Follower::attach(&buf_path, deadline) {
            Ok(follower) => follower,
            Err(err) => {
                warn!(peer, path = %buf_path.display(), error = %err, "cannot attach to shm ring");
                return false;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let threads = vec![
            spawn_follower("splash-shm-msg", msg_follower, stop.clone(), {
                let cb = self.message_cb.clone();
                move |bytes| cb.as_ref()(bytes)
            }),
            spawn_follower("splash-shm-buf", buf_follower, stop.clone(), {
                let cb = self.buffer_cb.clone();
                move |bytes| cb.as_ref()(SerializedObject::from_vec(bytes))
            }),
        ];

        peers.insert(peer.to_string(), PeerFollowers { stop, threads });
        true
    }

    pub fn disconnect_from(&self, peer: &str) -> bool {
        let followers = self.peers.lock().unwrap().remove(peer);
        match followers {
            Some(followers) => {
                followers.stop.store(true, Ordering::SeqCst);
                for thread in followers.threads {
                    let _ = thread.join();
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for ShmemInput {
    fn drop(&mut self) {
        let names: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.disconnect_from(&name);
        }
    }
}

fn spawn_follower(
    name: &str,
    mut follower: Follower,
    stop: Arc<AtomicBool>,
    deliver: impl Fn(Vec<u8>) + Send + 'static,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                follower.poll(&deliver);
                thread::sleep(POLL_INTERVAL);
            }
        })
        .expect("thread spawn")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> ChannelConfig {
        ChannelConfig {
            kind: crate::ChannelKind::Memory,
            prefix: "shm".into(),
            base_dir: dir.to_path_buf(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn wait_for<T>(received: &Mutex<Vec<T>>, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if received.lock().unwrap().len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn messages_flow_through_the_ring() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShmemOutput::new(config(dir.path()), "A");
        assert!(output.is_ready());

        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = received.clone();
        let input = ShmemInput::new(
            config(dir.path()),
            Arc::new(move |bytes| sink.lock().unwrap().push(bytes)),
            Arc::new(|_| {}),
        );
        assert!(input.connect_to("A"));

        for i in 0..5_u8 {
            assert!(output.send_message(&[i, i, i]));
        }
        assert!(wait_for(&received, 5));
        assert_eq!(received.lock().unwrap()[4], vec![4, 4, 4]);
    }

    #[test]
    fn buffer_ring_grows_past_its_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShmemOutput::new(config(dir.path()), "A");

        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = received.clone();
        let input = ShmemInput::new(
            config(dir.path()),
            Arc::new(|_| {}),
            Arc::new(move |buffer: SerializedObject| sink.lock().unwrap().push(buffer.data().to_vec())),
        );
        assert!(input.connect_to("A"));

        let big = vec![0xAB_u8; (BUFFER_SLOT_SIZE as usize) * 2];
        assert!(output.send_buffer(SerializedObject::from_slice(&big)));
        assert!(wait_for(&received, 1));
        assert_eq!(received.lock().unwrap()[0], big);
    }

    #[test]
    fn world_connect_waits_for_a_follower() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.connect_timeout = Duration::from_millis(100);
        let output = ShmemOutput::new(cfg.clone(), "scene");

        // Nobody attached yet: the wait must time out.
        assert!(!output.connect_to("world"));

        let input = ShmemInput::new(cfg, Arc::new(|_| {}), Arc::new(|_| {}));
        assert!(input.connect_to("scene"));
        assert!(output.connect_to("world"));
    }
}
