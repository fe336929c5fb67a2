//! Binary Connection
//!
//! One `BinaryConnection` owns one socket: its read buffer, its bounded
//! write queue, its message queue and its protocol state. Reading happens
//! on the connection task; dispatch happens on a pool runner that is
//! scheduled only while messages remain (`running` guards against double
//! scheduling). All parsing state lives here; the `remote` and
//! `replication` modules only see `(type, payload)` messages.
//!
//! Read modes:
//! - `Buf`: framed messages, with the two sentinel escapes;
//! - `FileType`: exactly one compressor tag byte;
//! - `File`: `(varint length, block)` pairs into a temp file until the
//!   zero-length terminator.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};

use super::codec::{self, FILE_FOLLOWS, SWITCH_TO_REPL};
use super::compress::{CompressorKind, FILE_BLOCK_SIZE};
use super::{remote, replication};
use crate::context::{NodeContext, ShutdownPhase};
use crate::error::{Error, Result};

pub const WRITE_QUEUE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    InitRemote,
    RemoteServer,
    InitReplication,
    ReplicationServer,
    ReplicationClient,
}

#[derive(Debug)]
pub struct QueuedMessage {
    pub type_byte: u8,
    pub payload: Bytes,
}

struct Inner {
    queue: VecDeque<QueuedMessage>,
    running: bool,
}

/// Outbound byte buffers with position tracking, bounded at
/// `WRITE_QUEUE_SIZE`. A writer task drains it; enqueue never blocks.
pub struct WriteQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    enqueued_bytes: AtomicU64,
    written_bytes: Arc<AtomicU64>,
    inflight: Arc<AtomicUsize>,
}

impl WriteQueue {
    fn start(
        mut write_half: OwnedWriteHalf,
        closed: Arc<AtomicBool>,
        closed_notify: Arc<Notify>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_SIZE);
        let written_bytes = Arc::new(AtomicU64::new(0));
        let inflight = Arc::new(AtomicUsize::new(0));

        let written = written_bytes.clone();
        let inflight_task = inflight.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(buf) = rx.recv().await {
                match write_half.write_all(&buf).await {
                    Ok(()) => {
                        written.fetch_add(buf.len() as u64, Ordering::SeqCst);
                        inflight_task.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::debug!("Write failed: {}", e);
                        closed.store(true, Ordering::SeqCst);
                        closed_notify.notify_waiters();
                        return;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            enqueued_bytes: AtomicU64::new(0),
            written_bytes,
            inflight,
        }
    }

    fn enqueue(&self, buf: Bytes) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(Error::ClientDisconnect("write queue closed".to_string()));
        };
        let len = buf.len() as u64;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(buf) {
            Ok(()) => {
                self.enqueued_bytes.fetch_add(len, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                Err(Error::QuotaExceeded("write queue full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                Err(Error::ClientDisconnect("write queue closed".to_string()))
            }
        }
    }

    /// Waiting enqueue for file streams: suspends on queue capacity so a
    /// transfer paces itself to the socket instead of tripping the bound.
    async fn enqueue_wait(&self, buf: Bytes) -> Result<()> {
        let tx = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    return Err(Error::ClientDisconnect("write queue closed".to_string()));
                }
            }
        };
        let len = buf.len() as u64;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        match tx.send(buf).await {
            Ok(()) => {
                self.enqueued_bytes.fetch_add(len, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                Err(Error::ClientDisconnect("write queue closed".to_string()))
            }
        }
    }

    fn close(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0
    }

    pub fn enqueued_bytes(&self) -> u64 {
        self.enqueued_bytes.load(Ordering::SeqCst)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::SeqCst)
    }
}

/// State of an outbound replication pull, present only on
/// `REPLICATION_CLIENT` connections.
pub(crate) struct ReplClient {
    pub index_path: String,
    pub pending_filename: Option<String>,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Default)]
enum ReadMode {
    #[default]
    Buf,
    FileType,
    File,
}

#[derive(Default)]
struct FileReadState {
    mode: ReadMode,
    inner_type: u8,
    compressor: Option<CompressorKind>,
    file: Option<std::fs::File>,
    path: Option<tempfile::TempPath>,
}

pub struct BinaryConnection {
    pub peer: SocketAddr,
    pub ctx: NodeContext,
    state: std::sync::Mutex<ConnState>,
    inner: std::sync::Mutex<Inner>,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<Notify>,
    waiting: AtomicBool,
    writer: WriteQueue,
    /// Last frame types each way, for diagnostics. Relaxed on purpose.
    last_sent: AtomicU8,
    last_received: AtomicU8,
    temp_dir: std::sync::Mutex<Option<tempfile::TempDir>>,
    temp_files: std::sync::Mutex<Vec<tempfile::TempPath>>,
    pub(crate) repl: std::sync::Mutex<Option<ReplClient>>,
}

impl BinaryConnection {
    /// Accept-side constructor: the connection starts serving the remote
    /// protocol and immediately schedules the runner that emits the
    /// initial update.
    pub fn spawn(stream: TcpStream, ctx: NodeContext) -> Arc<Self> {
        let conn = Self::build(stream, ctx, ConnState::InitRemote, None);
        {
            let mut inner = conn.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.running = true;
        }
        conn.schedule_runner();
        conn
    }

    /// Initiator-side constructor for a replication pull. The caller sends
    /// the switch frame itself; replies drive `ReplClient` to completion.
    pub(crate) fn spawn_replication(
        stream: TcpStream,
        ctx: NodeContext,
        repl: ReplClient,
    ) -> Arc<Self> {
        let conn = Self::build(stream, ctx, ConnState::InitReplication, Some(repl));
        conn.waiting.store(true, Ordering::SeqCst);
        conn
    }

    fn build(
        stream: TcpStream,
        ctx: NodeContext,
        state: ConnState,
        repl: Option<ReplClient>,
    ) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let (read_half, write_half) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_notify = Arc::new(Notify::new());
        let writer = WriteQueue::start(write_half, closed.clone(), closed_notify.clone());

        ctx.stats.binary_clients.fetch_add(1, Ordering::SeqCst);
        ctx.stats.total_clients_served.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "New binary client {} ({} connected)",
            peer,
            ctx.stats.binary_clients.load(Ordering::SeqCst)
        );

        let conn = Arc::new(Self {
            peer,
            ctx,
            state: std::sync::Mutex::new(state),
            inner: std::sync::Mutex::new(Inner {
                queue: VecDeque::new(),
                running: false,
            }),
            closed,
            closed_notify,
            waiting: AtomicBool::new(false),
            writer,
            last_sent: AtomicU8::new(0xFF),
            last_received: AtomicU8::new(0xFF),
            temp_dir: std::sync::Mutex::new(None),
            temp_files: std::sync::Mutex::new(Vec::new()),
            repl: std::sync::Mutex::new(repl),
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            reader.read_loop(read_half).await;
        });

        conn
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idle means reapable: nothing queued in either direction, no runner
    /// scheduled, nothing awaited.
    pub fn is_idle(&self) -> bool {
        if self.waiting.load(Ordering::SeqCst) {
            return false;
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !inner.running && inner.queue.is_empty() && self.writer.is_empty()
    }

    pub fn last_sent(&self) -> u8 {
        self.last_sent.load(Ordering::Relaxed)
    }

    pub fn last_received(&self) -> u8 {
        self.last_received.load(Ordering::Relaxed)
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.writer
    }

    // ── Write path ───────────────────────────────────────────────────────

    pub fn send_message(&self, type_byte: u8, payload: &[u8]) -> Result<()> {
        self.last_sent.store(type_byte, Ordering::Relaxed);
        let frame = codec::encode_frame(type_byte, payload);
        self.writer.enqueue(frame.freeze())
    }

    /// Enqueue an already-framed buffer (used for the switch sentinel).
    pub(crate) fn send_frame_bytes(&self, frame: Bytes) -> Result<()> {
        if let Some(type_byte) = frame.first() {
            self.last_sent.store(*type_byte, Ordering::Relaxed);
        }
        self.writer.enqueue(frame)
    }

    /// Stream a file: `[FILE_FOLLOWS][inner type][compressor tag]`, then
    /// `(varint length, block)` pairs, then the zero-length terminator.
    /// Suspends on write backpressure; fails if the bytes read disagree
    /// with the file's reported size.
    pub async fn send_file(&self, inner_type: u8, path: &Path) -> Result<()> {
        self.send_file_with(inner_type, path, CompressorKind::Lz4).await
    }

    pub async fn send_file_with(
        &self,
        inner_type: u8,
        path: &Path,
        kind: CompressorKind,
    ) -> Result<()> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| Error::StorageError(format!("open {}: {}", path.display(), e)))?;
        let expected = file
            .metadata()
            .map_err(|e| Error::StorageError(e.to_string()))?
            .len();

        self.last_sent.store(inner_type, Ordering::Relaxed);

        let mut header = BytesMut::with_capacity(3);
        header.put_u8(FILE_FOLLOWS);
        header.put_u8(inner_type);
        header.put_u8(kind.tag());
        self.writer.enqueue_wait(header.freeze()).await?;

        let mut total: u64 = 0;
        let mut chunk = vec![0u8; FILE_BLOCK_SIZE];
        loop {
            let n = file
                .read(&mut chunk)
                .map_err(|e| Error::StorageError(format!("read {}: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            let block = kind.compress_block(&chunk[..n]);
            let mut frame = BytesMut::with_capacity(block.len() + 10);
            codec::encode_length(&mut frame, block.len() as u64);
            frame.put_slice(&block);
            self.writer.enqueue_wait(frame.freeze()).await?;
        }

        let mut terminator = BytesMut::new();
        codec::encode_length(&mut terminator, 0);
        self.writer.enqueue_wait(terminator.freeze()).await?;

        if total != expected {
            return Err(Error::StorageError(format!(
                "file {} changed while sending ({} != {})",
                path.display(),
                total,
                expected
            )));
        }
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buffer = BytesMut::with_capacity(4096);
        let mut file_state = FileReadState::default();
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                read = read_half.read_buf(&mut buffer) => match read {
                    Ok(0) => {
                        tracing::debug!("Received EOF from {}", self.peer);
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = self.process_buffer(&mut buffer, &mut file_state) {
                            tracing::warn!("Closing {}: {}", self.peer, e);
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("Read error from {}: {}", self.peer, e);
                        break;
                    }
                },
                _ = self.closed_notify.notified() => break,
                _ = shutdown.changed() => {
                    let phase = *shutdown.borrow();
                    if phase == ShutdownPhase::Now
                        || (phase == ShutdownPhase::Asap && self.is_idle())
                    {
                        break;
                    }
                }
            }
        }
        self.destroy();
    }

    fn process_buffer(
        self: &Arc<Self>,
        buffer: &mut BytesMut,
        fs: &mut FileReadState,
    ) -> Result<()> {
        loop {
            match fs.mode {
                ReadMode::Buf => {
                    if buffer.len() < 2 {
                        return Ok(());
                    }
                    let type_byte = buffer[0];
                    match type_byte {
                        SWITCH_TO_REPL => {
                            let Some((len, consumed)) = codec::decode_length(&buffer[1..])? else {
                                return Ok(());
                            };
                            if buffer.len() < 1 + consumed + len as usize {
                                return Ok(());
                            }
                            buffer.advance(1 + consumed);
                            let payload = buffer.split_to(len as usize).freeze();
                            self.set_state(ConnState::ReplicationServer);
                            tracing::debug!("Switched {} to replication protocol", self.peer);
                            if len > 0 {
                                self.enqueue_message(
                                    codec::ReplicationMessageType::GetChangesets as u8,
                                    payload,
                                );
                            }
                        }
                        FILE_FOLLOWS => {
                            fs.inner_type = buffer[1];
                            buffer.advance(2);
                            fs.mode = ReadMode::FileType;
                        }
                        _ => {
                            let Some((len, consumed)) = codec::decode_length(&buffer[1..])? else {
                                return Ok(());
                            };
                            if buffer.len() < 1 + consumed + len as usize {
                                return Ok(());
                            }
                            buffer.advance(1 + consumed);
                            let payload = buffer.split_to(len as usize).freeze();
                            self.enqueue_message(type_byte, payload);
                        }
                    }
                }
                ReadMode::FileType => {
                    if buffer.is_empty() {
                        return Ok(());
                    }
                    let tag = buffer[0];
                    buffer.advance(1);
                    let Some(kind) = CompressorKind::from_tag(tag) else {
                        return Err(Error::ProtocolViolation(format!(
                            "unknown compressor tag {:#04x}",
                            tag
                        )));
                    };
                    // The temp file only materialises once the tag is valid.
                    self.begin_file_receive(fs)?;
                    fs.compressor = Some(kind);
                    fs.mode = ReadMode::File;
                }
                ReadMode::File => {
                    let Some((len, consumed)) = codec::decode_length(buffer)? else {
                        return Ok(());
                    };
                    if len == 0 {
                        buffer.advance(consumed);
                        self.finish_file_receive(fs)?;
                        *fs = FileReadState::default();
                        continue;
                    }
                    if buffer.len() < consumed + len as usize {
                        return Ok(());
                    }
                    buffer.advance(consumed);
                    let block = buffer.split_to(len as usize);
                    let kind = fs.compressor.ok_or_else(|| {
                        Error::ProtocolViolation("file block before compressor tag".to_string())
                    })?;
                    let bytes = kind.decompress_block(&block)?;
                    let file = fs.file.as_mut().ok_or_else(|| {
                        Error::ProtocolViolation("file block without open file".to_string())
                    })?;
                    file.write_all(&bytes)
                        .map_err(|e| Error::StorageError(format!("write temp file: {}", e)))?;
                }
            }
        }
    }

    fn begin_file_receive(&self, fs: &mut FileReadState) -> Result<()> {
        let mut dir_guard = self.temp_dir.lock().unwrap_or_else(|e| e.into_inner());
        if dir_guard.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("search-node.")
                .tempdir()
                .map_err(|e| Error::StorageError(format!("create temp dir: {}", e)))?;
            *dir_guard = Some(dir);
        }
        let dir = dir_guard.as_ref().unwrap();

        let named = tempfile::NamedTempFile::new_in(dir.path())
            .map_err(|e| Error::StorageError(format!("create temp file: {}", e)))?;
        let (file, path) = named.into_parts();
        tracing::debug!("Receiving file into {}", path.display());
        fs.file = Some(file);
        fs.path = Some(path);
        Ok(())
    }

    fn finish_file_receive(self: &Arc<Self>, fs: &mut FileReadState) -> Result<()> {
        if let Some(file) = fs.file.take() {
            file.sync_all()
                .map_err(|e| Error::StorageError(format!("sync temp file: {}", e)))?;
        }
        let path = fs.path.take().ok_or_else(|| {
            Error::ProtocolViolation("file terminator without open file".to_string())
        })?;
        let payload = Bytes::from(path.to_string_lossy().into_owned().into_bytes());
        {
            let mut files = self.temp_files.lock().unwrap_or_else(|e| e.into_inner());
            files.push(path);
        }
        self.enqueue_message(fs.inner_type, payload);
        Ok(())
    }

    // ── Message queue & runner ───────────────────────────────────────────

    pub(crate) fn enqueue_message(self: &Arc<Self>, type_byte: u8, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        let schedule = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.queue.push_back(QueuedMessage { type_byte, payload });
            if inner.running {
                false
            } else {
                inner.running = true;
                true
            }
        };
        if schedule {
            self.schedule_runner();
        }
    }

    fn schedule_runner(self: &Arc<Self>) {
        let conn = self.clone();
        if self
            .ctx
            .executor
            .try_submit(async move {
                conn.run().await;
            })
            .is_err()
        {
            tracing::warn!("Runner pool refused {}, dropping connection", self.peer);
            self.clear_running();
            self.destroy();
        }
    }

    fn clear_running(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.running = false;
    }

    async fn run(self: Arc<Self>) {
        let entering = self.state();
        match entering {
            ConnState::InitRemote => {
                self.set_state(ConnState::RemoteServer);
                if let Err(e) = remote::send_update(&self) {
                    tracing::debug!("Initial update to {} failed: {}", self.peer, e);
                    self.clear_running();
                    self.destroy();
                    return;
                }
            }
            ConnState::InitReplication => {
                self.set_state(ConnState::ReplicationClient);
            }
            _ => {}
        }

        loop {
            let msg = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if self.is_closed() || inner.queue.is_empty() {
                    inner.running = false;
                    None
                } else {
                    inner.queue.pop_front()
                }
            };
            let Some(msg) = msg else {
                break;
            };

            self.last_received.store(msg.type_byte, Ordering::Relaxed);

            let result = match self.state() {
                ConnState::RemoteServer => {
                    remote::dispatch(&self, msg.type_byte, &msg.payload).await
                }
                ConnState::ReplicationServer => {
                    replication::server_dispatch(&self, msg.type_byte, &msg.payload).await
                }
                ConnState::ReplicationClient => {
                    replication::client_dispatch(&self, msg.type_byte, &msg.payload).await
                }
                ConnState::InitRemote | ConnState::InitReplication => Err(
                    Error::ProtocolViolation("message before protocol init".to_string()),
                ),
            };

            if let Err(e) = result {
                tracing::warn!("Dispatch failed for {}: {}", self.peer, e);
                self.clear_running();
                self.destroy();
                return;
            }
        }

        if self.ctx.shutdown_phase() != ShutdownPhase::Running && self.is_idle() {
            tracing::debug!("Runner for {} ended due shutdown", self.peer);
            self.destroy();
        }
    }

    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    /// Idempotent teardown: close the socket halves, drop queued buffers,
    /// fail any pending replication pull and release temp files.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_notify.notify_waiters();
        self.writer.close();

        let pending = {
            let mut repl = self.repl.lock().unwrap_or_else(|e| e.into_inner());
            repl.take()
        };
        if let Some(mut repl) = pending {
            if let Some(done) = repl.done.take() {
                let _ = done.send(Err(Error::ClientDisconnect(
                    "connection destroyed".to_string(),
                )));
            }
        }

        self.ctx.stats.binary_clients.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            "Destroyed binary client {} ({} left)",
            self.peer,
            self.ctx.stats.binary_clients.load(Ordering::SeqCst)
        );
    }
}
