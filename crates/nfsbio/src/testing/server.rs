//! In-memory NFS server.
//!
//! Each regular file keeps two copies: what the server currently serves,
//! and what would survive a crash. Unstable writes touch only the first;
//! file-sync writes and commits copy into the second. [`MemServer::reboot`]
//! throws away everything not yet stable and changes the write verifier,
//! which is exactly the situation the commit protocol exists for.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::context::Credential;
use crate::error::{BioError, BioResult};
use crate::rpc::{
    Attributes, CommitReply, DirCookie, FileId, FileKind, NfsRpc, ReadDirReply, ReadReply,
    StableHow, WriteReply, WriteVerifier,
};

/// Bytes per encoded directory entry.
pub const DIRENT_SIZE: usize = 32;

/// RPC selector for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// READ
    Read,
    /// WRITE
    Write,
    /// COMMIT
    Commit,
    /// READDIR
    ReadDir,
    /// READLINK
    ReadLink,
    /// GETATTR
    GetAttr,
}

/// RPCs served so far, including failed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcCounts {
    /// READ calls.
    pub reads: u64,
    /// WRITE calls asking for unstable storage.
    pub unstable_writes: u64,
    /// WRITE calls asking for data-sync or file-sync storage.
    pub filesync_writes: u64,
    /// COMMIT calls.
    pub commits: u64,
    /// READDIR calls.
    pub readdirs: u64,
    /// READLINK calls.
    pub readlinks: u64,
    /// GETATTR calls.
    pub getattrs: u64,
}

impl RpcCounts {
    /// All WRITE calls.
    pub fn write_rpcs(&self) -> u64 {
        self.unstable_writes + self.filesync_writes
    }
}

#[derive(Debug)]
struct ServerFile {
    kind: FileKind,
    data: Vec<u8>,
    stable: Vec<u8>,
    entries: Vec<String>,
    generation: u32,
    mtime: SystemTime,
}

impl ServerFile {
    fn new(kind: FileKind, data: &[u8], mtime: SystemTime) -> Self {
        Self {
            kind,
            data: data.to_vec(),
            stable: data.to_vec(),
            entries: Vec::new(),
            generation: 0,
            mtime,
        }
    }

    fn size(&self) -> u64 {
        match self.kind {
            FileKind::Directory => (self.entries.len() * DIRENT_SIZE) as u64,
            _ => self.data.len() as u64,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    files: HashMap<FileId, ServerFile>,
    verifier: u64,
    ticks: u64,
    faults: HashMap<Op, VecDeque<BioError>>,
    counts: RpcCounts,
    writes_held: bool,
}

impl ServerState {
    fn tick(&mut self) -> SystemTime {
        self.ticks += 1;
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(self.ticks)
    }

    fn fault(&mut self, op: Op) -> BioResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn file(&mut self, id: FileId, kind: FileKind) -> BioResult<&mut ServerFile> {
        let file = self
            .files
            .get_mut(&id)
            .ok_or(BioError::Server(libc::ENOENT))?;
        if file.kind == kind {
            Ok(file)
        } else if file.kind == FileKind::Directory {
            Err(BioError::Server(libc::EISDIR))
        } else {
            Err(BioError::Server(libc::EINVAL))
        }
    }
}

/// A single-export NFS server held in memory.
#[derive(Debug)]
pub struct MemServer {
    state: Mutex<ServerState>,
    writes_cv: Condvar,
}

impl Default for MemServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemServer {
    /// An empty server.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                files: HashMap::new(),
                verifier: 1,
                ticks: 0,
                faults: HashMap::new(),
                counts: RpcCounts::default(),
                writes_held: false,
            }),
            writes_cv: Condvar::new(),
        }
    }

    /// Creates or replaces a regular file holding stable `contents`.
    pub fn create_file(&self, id: FileId, contents: &[u8]) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        st.files
            .insert(id, ServerFile::new(FileKind::Regular, contents, mtime));
    }

    /// Creates an empty directory.
    pub fn create_dir(&self, id: FileId) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        st.files
            .insert(id, ServerFile::new(FileKind::Directory, b"", mtime));
    }

    /// Creates a symlink pointing at `target`.
    pub fn create_symlink(&self, id: FileId, target: &[u8]) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        st.files
            .insert(id, ServerFile::new(FileKind::Symlink, target, mtime));
    }

    /// Current contents as served, stable or not.
    pub fn contents(&self, id: FileId) -> Vec<u8> {
        self.state
            .lock()
            .files
            .get(&id)
            .map(|f| f.data.clone())
            .unwrap_or_default()
    }

    /// Contents that would survive a reboot.
    pub fn stable_contents(&self, id: FileId) -> Vec<u8> {
        self.state
            .lock()
            .files
            .get(&id)
            .map(|f| f.stable.clone())
            .unwrap_or_default()
    }

    /// Server modification time of `id`.
    pub fn mtime(&self, id: FileId) -> Option<SystemTime> {
        self.state.lock().files.get(&id).map(|f| f.mtime)
    }

    /// Sets the size of a file durably, as a SETATTR would.
    pub fn truncate(&self, id: FileId, size: u64) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        if let Some(file) = st.files.get_mut(&id) {
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            file.data.resize(size, 0);
            file.stable.resize(size, 0);
            file.mtime = mtime;
        }
    }

    /// Replaces a file's contents as another client would.
    pub fn mutate_externally(&self, id: FileId, contents: &[u8]) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        if let Some(file) = st.files.get_mut(&id) {
            file.data = contents.to_vec();
            file.stable = contents.to_vec();
            file.mtime = mtime;
        }
    }

    /// Appends a directory entry. Names are cut to fit one record.
    pub fn add_entry(&self, dir: FileId, name: &str) {
        let mut st = self.state.lock();
        let mtime = st.tick();
        if let Some(file) = st.files.get_mut(&dir) {
            file.entries.push(name.to_owned());
            file.mtime = mtime;
        }
    }

    /// Invalidates every cookie handed out for `dir` without changing its
    /// modification time, as a server reorganizing its directory would.
    pub fn invalidate_cookies(&self, dir: FileId) {
        if let Some(file) = self.state.lock().files.get_mut(&dir) {
            file.generation += 1;
        }
    }

    /// Simulates a crash and restart: unstable data is lost and the write
    /// verifier changes.
    pub fn reboot(&self) {
        let mut st = self.state.lock();
        for file in st.files.values_mut() {
            file.data.clone_from(&file.stable);
        }
        st.verifier += 1;
    }

    /// Current write verifier.
    pub fn verifier(&self) -> WriteVerifier {
        WriteVerifier(self.state.lock().verifier)
    }

    /// Makes the next call of `op` fail with `error`. Queued errors are
    /// consumed in order.
    pub fn inject(&self, op: Op, error: BioError) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Blocks every WRITE until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.state.lock().writes_held = true;
    }

    /// Lets held WRITEs proceed.
    pub fn release_writes(&self) {
        self.state.lock().writes_held = false;
        self.writes_cv.notify_all();
    }

    /// RPC counters.
    pub fn counts(&self) -> RpcCounts {
        self.state.lock().counts
    }
}

impl NfsRpc for MemServer {
    fn read(
        &self,
        file: FileId,
        offset: u64,
        buf: &mut [u8],
        _cred: &Credential,
    ) -> BioResult<ReadReply> {
        let mut st = self.state.lock();
        st.counts.reads += 1;
        st.fault(Op::Read)?;
        let f = st.file(file, FileKind::Regular)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(f.data.len());
        let count = (f.data.len() - start).min(buf.len());
        buf[..count].copy_from_slice(&f.data[start..start + count]);
        Ok(ReadReply {
            count,
            eof: start + count >= f.data.len(),
        })
    }

    fn write(
        &self,
        file: FileId,
        offset: u64,
        data: &[u8],
        stable: StableHow,
        _cred: &Credential,
    ) -> BioResult<WriteReply> {
        let mut st = self.state.lock();
        while st.writes_held {
            self.writes_cv.wait(&mut st);
        }
        if stable == StableHow::Unstable {
            st.counts.unstable_writes += 1;
        } else {
            st.counts.filesync_writes += 1;
        }
        st.fault(Op::Write)?;
        let mtime = st.tick();
        let verifier = WriteVerifier(st.verifier);
        let f = st.file(file, FileKind::Regular)?;
        let start = usize::try_from(offset).map_err(|_| BioError::FileTooLarge)?;
        let end = start + data.len();
        if f.data.len() < end {
            f.data.resize(end, 0);
        }
        f.data[start..end].copy_from_slice(data);
        if stable != StableHow::Unstable {
            if f.stable.len() < end {
                f.stable.resize(end, 0);
            }
            f.stable[start..end].copy_from_slice(data);
        }
        f.mtime = mtime;
        Ok(WriteReply {
            count: data.len(),
            committed: stable,
            verifier,
            mtime: Some(mtime),
        })
    }

    fn commit(
        &self,
        file: FileId,
        offset: u64,
        count: u64,
        _cred: &Credential,
    ) -> BioResult<CommitReply> {
        let mut st = self.state.lock();
        st.counts.commits += 1;
        st.fault(Op::Commit)?;
        let verifier = WriteVerifier(st.verifier);
        let f = st.file(file, FileKind::Regular)?;
        let len = f.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        // A zero count commits through end of file.
        let end = if count == 0 {
            len
        } else {
            usize::try_from(offset.saturating_add(count))
                .unwrap_or(usize::MAX)
                .min(len)
        };
        if f.stable.len() < end {
            f.stable.resize(end, 0);
        }
        f.stable[start..end].copy_from_slice(&f.data[start..end]);
        Ok(CommitReply {
            verifier,
            mtime: Some(f.mtime),
        })
    }

    fn readdir(
        &self,
        dir: FileId,
        cookie: DirCookie,
        buf: &mut [u8],
        _cred: &Credential,
    ) -> BioResult<ReadDirReply> {
        let mut st = self.state.lock();
        st.counts.readdirs += 1;
        st.fault(Op::ReadDir)?;
        let f = st.file(dir, FileKind::Directory)?;
        let start = if cookie == DirCookie::START {
            0
        } else if (cookie.0 >> 32) as u32 == f.generation {
            (cookie.0 & u64::from(u32::MAX)) as usize
        } else {
            return Err(BioError::BadDirectoryCookie);
        };

        let fit = buf.len() / DIRENT_SIZE;
        let end = (start + fit).min(f.entries.len());
        let mut count = 0;
        for name in &f.entries[start.min(end)..end] {
            encode_dirent(name, &mut buf[count..count + DIRENT_SIZE]);
            count += DIRENT_SIZE;
        }
        Ok(ReadDirReply {
            count,
            next_cookie: DirCookie((u64::from(f.generation) << 32) | end as u64),
            eof: end >= f.entries.len(),
        })
    }

    fn readlink(&self, link: FileId, buf: &mut [u8], _cred: &Credential) -> BioResult<usize> {
        let mut st = self.state.lock();
        st.counts.readlinks += 1;
        st.fault(Op::ReadLink)?;
        let f = st.file(link, FileKind::Symlink)?;
        let n = f.data.len().min(buf.len());
        buf[..n].copy_from_slice(&f.data[..n]);
        Ok(n)
    }

    fn getattr(&self, file: FileId, _cred: &Credential) -> BioResult<Attributes> {
        let mut st = self.state.lock();
        st.counts.getattrs += 1;
        st.fault(Op::GetAttr)?;
        let f = st.files.get(&file).ok_or(BioError::Server(libc::ENOENT))?;
        Ok(Attributes {
            kind: f.kind,
            size: f.size(),
            mtime: f.mtime,
        })
    }
}

fn encode_dirent(name: &str, record: &mut [u8]) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(DIRENT_SIZE - 1);
    record.fill(0);
    record[0] = n as u8;
    record[1..=n].copy_from_slice(&bytes[..n]);
}

/// Decodes directory bytes returned by a read of a directory. Zero
/// padding between blocks is skipped.
pub fn decode_dirents(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks_exact(DIRENT_SIZE)
        .filter(|record| record[0] != 0)
        .map(|record| {
            let n = usize::from(record[0]).min(DIRENT_SIZE - 1);
            String::from_utf8_lossy(&record[1..=n]).into_owned()
        })
        .collect()
}
