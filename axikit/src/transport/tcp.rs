//! TCP flavors of the two transports.
//!
//! The command side is a plain client socket speaking the virtual-register
//! frame protocol. The stream side is a host-side server: the device dials
//! in and pushes samples, a receiver thread files them into the target
//! buffer, and the caller blocks on the buffer's completion event.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::api::KitConfig;
use crate::sync::Event;
use crate::transport::{
    read_reply, Backing, BufBacking, CmdTransport, ReplyMode, StreamTransport,
};
use crate::{Error, Result};

const CMD_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_TIMEOUT: Duration = Duration::from_secs(15);
// Socket-level poll granularity inside the deadline loops.
const POLL: Duration = Duration::from_millis(100);
const DEFAULT_STREAM_PORT: u16 = 6001;
const RECV_CHUNK: usize = 1024;

/// Stream server port for a device address: tens digit of the last octet,
/// two zeros, units digit (`10.0.0.23` serves on 2003, `192.168.1.7` on 7).
/// Anything that is not a dotted IPv4 quad falls back to 6001.
pub fn derive_stream_port(ip: &str) -> u16 {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return DEFAULT_STREAM_PORT;
    }
    let mut last = 0u32;
    for (i, octet) in octets.iter().enumerate() {
        match octet.parse::<u8>() {
            Ok(v) if !octet.is_empty() => {
                if i == 3 {
                    last = v as u32;
                }
            }
            _ => return DEFAULT_STREAM_PORT,
        }
    }
    ((last / 10) % 10 * 1000 + last % 10) as u16
}

fn send_all(stream: &mut TcpStream, data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut sent = 0;
    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "peer closed the connection",
                )))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if Instant::now() >= deadline {
                    return Err(Error::SendTimeout {
                        sent,
                        want: data.len(),
                    });
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn recv_exact(stream: &mut TcpStream, len: usize, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut out = vec![0u8; len];
    let mut got = 0;
    while got < len {
        match stream.read(&mut out[got..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )))
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if Instant::now() >= deadline {
                    return Err(Error::RecvTimeout { got, want: len });
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(out)
}

/// Command transport over a client TCP socket.
pub struct TcpCmd {
    link: Mutex<Option<TcpStream>>,
    timeout: Mutex<Duration>,
    serial: AtomicU32,
}

impl TcpCmd {
    pub fn new() -> TcpCmd {
        TcpCmd {
            link: Mutex::new(None),
            timeout: Mutex::new(CMD_TIMEOUT),
            serial: AtomicU32::new(0),
        }
    }
}

impl Default for TcpCmd {
    fn default() -> Self {
        TcpCmd::new()
    }
}

impl CmdTransport for TcpCmd {
    fn accept(&self, cfg: &KitConfig) -> Result<()> {
        let timeout = *self.timeout.lock().unwrap();
        let addr = (cfg.cmd_ip.as_str(), cfg.cmd_tcp_port)
            .to_socket_addrs()
            .map_err(|e| Error::Connect(format!("{}:{}: {}", cfg.cmd_ip, cfg.cmd_tcp_port, e)))?
            .next()
            .ok_or_else(|| Error::Connect(format!("{} does not resolve", cfg.cmd_ip)))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::Connect(format!("{}: {}", addr, e)))?;
        stream.set_read_timeout(Some(POLL))?;
        stream.set_write_timeout(Some(POLL))?;
        let mut link = self.link.lock().unwrap();
        if let Some(old) = link.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        *link = Some(stream);
        log::info!("cmd link up at {}", addr);
        Ok(())
    }

    fn close(&self) {
        if let Some(stream) = self.link.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut link = self.link.lock().unwrap();
        let stream = link
            .as_mut()
            .ok_or_else(|| Error::Connect("cmd link is not up".to_string()))?;
        send_all(stream, data, *self.timeout.lock().unwrap())?;
        Ok(data.len())
    }

    fn recv_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut link = self.link.lock().unwrap();
        let stream = link
            .as_mut()
            .ok_or_else(|| Error::Connect("cmd link is not up".to_string()))?;
        recv_exact(stream, len, *self.timeout.lock().unwrap())
    }

    fn transact(&self, request: &[u8], mode: ReplyMode) -> Result<Vec<u8>> {
        // One lock acquisition for the whole exchange.
        let mut link = self.link.lock().unwrap();
        let stream = link
            .as_mut()
            .ok_or_else(|| Error::Connect("cmd link is not up".to_string()))?;
        let timeout = *self.timeout.lock().unwrap();
        send_all(stream, request, timeout)?;
        read_reply(|n| recv_exact(stream, n, timeout), request, mode)
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }
}

// --- stream side -------------------------------------------------------------

enum WordStore {
    Owned(Mutex<Vec<u32>>),
    // caller memory registered through BufBacking::raw
    Raw { addr: usize, len_words: usize },
}

impl WordStore {
    fn len_words(&self) -> usize {
        match self {
            WordStore::Owned(v) => v.lock().unwrap().len(),
            WordStore::Raw { len_words, .. } => *len_words,
        }
    }

    fn write(&self, offset_words: usize, words: &[u32]) {
        match self {
            WordStore::Owned(v) => {
                v.lock().unwrap()[offset_words..offset_words + words.len()].copy_from_slice(words)
            }
            WordStore::Raw { addr, .. } => unsafe {
                std::ptr::copy_nonoverlapping(
                    words.as_ptr(),
                    (*addr as *mut u32).add(offset_words),
                    words.len(),
                );
            },
        }
    }

    fn read(&self, len_words: usize) -> Vec<u32> {
        match self {
            WordStore::Owned(v) => v.lock().unwrap()[..len_words].to_vec(),
            WordStore::Raw { addr, .. } => unsafe {
                std::slice::from_raw_parts(*addr as *const u32, len_words).to_vec()
            },
        }
    }
}

struct Memory {
    store: WordStore,
    size_words: usize,
    using_bytes: Mutex<usize>,
    done: Event,
    in_use: AtomicBool,
}

/// Upstream-only stream transport: a single-connection TCP server filled by
/// the device. Downstream has no wire protocol here and is rejected.
pub struct TcpChnl {
    conn: Mutex<Option<TcpStream>>,
    memories: Mutex<HashMap<u32, Arc<Memory>>>,
    next_id: AtomicU32,
    stop: Arc<AtomicBool>,
    receiver: Mutex<Option<(u32, JoinHandle<()>)>>,
    timeout: Mutex<Duration>,
}

impl TcpChnl {
    pub fn new() -> TcpChnl {
        TcpChnl {
            conn: Mutex::new(None),
            memories: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            timeout: Mutex::new(STREAM_TIMEOUT),
        }
    }

    fn memory(&self, buf: u32) -> Result<Arc<Memory>> {
        self.memories
            .lock()
            .unwrap()
            .get(&buf)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))
    }

    /// The receive loop: pull byte chunks off the socket, repack them as
    /// little-endian words into the target buffer, count what landed.
    fn recv_into(
        conn: &mut TcpStream,
        mem: &Memory,
        byte_len: usize,
        offset_words: usize,
        stop: &AtomicBool,
    ) {
        let mut pending: Vec<u8> = Vec::with_capacity(RECV_CHUNK + 4);
        let mut delivered = 0usize;
        let mut chunk = [0u8; RECV_CHUNK];
        while delivered < byte_len {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let want = (byte_len - delivered).min(RECV_CHUNK);
            match conn.read(&mut chunk[..want]) {
                Ok(0) => {
                    log::warn!("stream peer closed after {} of {} bytes", delivered, byte_len);
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    let full_words = pending.len() / 4;
                    if full_words > 0 {
                        let words: Vec<u32> = pending[..full_words * 4]
                            .chunks_exact(4)
                            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                            .collect();
                        mem.store.write(offset_words + delivered / 4, &words);
                        pending.drain(..full_words * 4);
                        delivered += full_words * 4;
                        *mem.using_bytes.lock().unwrap() = delivered;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("stream receive failed: {}", e);
                    break;
                }
            }
        }
        mem.in_use.store(false, Ordering::Release);
        mem.done.set();
    }
}

impl Default for TcpChnl {
    fn default() -> Self {
        TcpChnl::new()
    }
}

impl StreamTransport for TcpChnl {
    fn accept(&self, cfg: &KitConfig) -> Result<()> {
        if self.conn.lock().unwrap().is_some() {
            return Ok(());
        }
        let port = if cfg.stream_tcp_port != 0 {
            cfg.stream_tcp_port
        } else {
            derive_stream_port(&cfg.stream_ip)
        };
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Connect(format!("bind port {}: {}", port, e)))?;
        listener.set_nonblocking(true)?;
        log::info!("stream server listening on {}", port);
        // Wait for the single device connection.
        let deadline = Instant::now() + *self.timeout.lock().unwrap();
        let (conn, peer) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Connect(format!(
                            "no device dialed in on port {}",
                            port
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(Error::Connect(format!("accept: {}", e))),
            }
        };
        conn.set_nonblocking(false)?;
        conn.set_read_timeout(Some(POLL))?;
        log::info!("stream device connected from {}", peer);
        *self.conn.lock().unwrap() = Some(conn);
        Ok(())
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some((_, handle)) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.stop.store(false, Ordering::Relaxed);
        if let Some(conn) = self.conn.lock().unwrap().take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    fn alloc_buffer(&self, byte_len: usize, backing: Option<BufBacking>) -> Result<u32> {
        if byte_len == 0 || byte_len % 4 != 0 {
            return Err(Error::Schema(format!(
                "buffer length {} is not a positive word multiple",
                byte_len
            )));
        }
        let words = byte_len / 4;
        let store = match backing {
            None => WordStore::Owned(Mutex::new(vec![0u32; words])),
            Some(BufBacking(Backing::Words(v))) => {
                if v.len() < words {
                    return Err(Error::Schema(format!(
                        "backing of {} words is smaller than the requested {}",
                        v.len(),
                        words
                    )));
                }
                WordStore::Owned(Mutex::new(v))
            }
            Some(BufBacking(Backing::Raw { addr, len_words })) => {
                if len_words < words {
                    return Err(Error::Schema(format!(
                        "backing of {} words is smaller than the requested {}",
                        len_words, words
                    )));
                }
                WordStore::Raw { addr, len_words }
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memories.lock().unwrap().insert(
            id,
            Arc::new(Memory {
                store,
                size_words: words,
                using_bytes: Mutex::new(0),
                done: Event::new(),
                in_use: AtomicBool::new(false),
            }),
        );
        Ok(id)
    }

    fn free_buffer(&self, buf: u32) -> Result<()> {
        let mut memories = self.memories.lock().unwrap();
        match memories.get(&buf) {
            Some(mem) if mem.in_use.load(Ordering::Acquire) => Err(Error::BufferBusy(buf)),
            Some(_) => {
                memories.remove(&buf);
                Ok(())
            }
            None => Err(Error::Schema(format!("unknown buffer {}", buf))),
        }
    }

    fn get_buffer(&self, buf: u32, byte_len: usize) -> Result<Vec<u32>> {
        let mem = self.memory(buf)?;
        if byte_len % 4 != 0 || byte_len / 4 > mem.size_words {
            return Err(Error::Schema(format!(
                "view of {} bytes does not fit the buffer",
                byte_len
            )));
        }
        Ok(mem.store.read(byte_len / 4))
    }

    fn open_send(&self, _chnl: u32, _buf: u32, _byte_len: usize, _byte_offset: usize) -> Result<()> {
        Err(Error::Unsupported("downstream over the TCP stream transport"))
    }

    fn open_recv(&self, _chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        let mem = self.memory(buf)?;
        if byte_len % 4 != 0 || byte_offset % 4 != 0 {
            return Err(Error::Schema(
                "stream length and offset must be word multiples".to_string(),
            ));
        }
        if (byte_len + byte_offset) / 4 > mem.size_words {
            return Err(Error::Schema(format!(
                "{} bytes at offset {} exceed the buffer",
                byte_len, byte_offset
            )));
        }
        let mut receiver = self.receiver.lock().unwrap();
        if let Some((active, handle)) = receiver.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                *receiver = Some((active, handle));
                return Err(Error::BufferBusy(active));
            }
        }
        if mem
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::BufferBusy(buf));
        }
        *mem.using_bytes.lock().unwrap() = 0;
        mem.done.clear();
        let mut conn = match self.conn.lock().unwrap().as_ref() {
            Some(c) => c.try_clone()?,
            None => {
                mem.in_use.store(false, Ordering::Release);
                return Err(Error::Connect("stream link is not up".to_string()));
            }
        };
        let stop = self.stop.clone();
        let mem2 = mem.clone();
        let spawned = thread::Builder::new()
            .name("tcp-stream-recv".to_string())
            .spawn(move || Self::recv_into(&mut conn, &mem2, byte_len, byte_offset / 4, &stop));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                mem.in_use.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        *receiver = Some((buf, handle));
        Ok(())
    }

    fn wait_stream(&self, buf: u32, timeout: Duration) -> Result<usize> {
        let mem = self.memory(buf)?;
        mem.done.wait_timeout(timeout);
        let bytes = *mem.using_bytes.lock().unwrap();
        Ok(bytes)
    }

    fn break_stream(&self, buf: u32) -> Result<usize> {
        let mem = self.memory(buf)?;
        let mut receiver = self.receiver.lock().unwrap();
        if let Some((active, handle)) = receiver.take() {
            if active == buf {
                self.stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
                self.stop.store(false, Ordering::Relaxed);
            } else {
                *receiver = Some((active, handle));
            }
        }
        let bytes = *mem.using_bytes.lock().unwrap();
        Ok(bytes)
    }
}
