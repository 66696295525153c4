//! A small 9P2000.L wire client.
//!
//! There's no public client library to reuse for this protocol. The CLI's
//! `mount`/`unmount`/`shutdown`/`listeners` subcommands and the subprocess IPC handshake in
//! [`crate::ipc`] all need to *be* a 9P client, so this speaks the handful of messages they need
//! directly against the wire, sharing the framing primitives in [`crate::wire`] with the
//! connection dispatch loop on the server side.

use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::wire::{put_str, put_u16, put_u32, put_u64, ty, Reader, DT_DIR, MSIZE, NOFID, VERSION};

enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(buf).await,
            Self::Unix(s) => s.write_all(buf).await,
        }
    }
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
            Self::Unix(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }
}

/// One 9P2000.L connection to a daemon. Not `Clone`; the whole point of a fid table and a tag
/// counter is that a single task owns them.
pub struct Client {
    sock: Mutex<Sock>,
    next_tag: AtomicU16,
    next_fid: AtomicU32,
}

impl Client {
    pub async fn connect_tcp(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ListenFailed { addr: addr.to_owned(), source: e.into() })?;
        let client = Self { sock: Mutex::new(Sock::Tcp(stream)), next_tag: AtomicU16::new(0), next_fid: AtomicU32::new(0) };
        client.handshake().await?;
        Ok(client)
    }

    pub async fn connect_unix(path: &Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::ListenFailed { addr: path.display().to_string(), source: e.into() })?;
        let client = Self { sock: Mutex::new(Sock::Unix(stream)), next_tag: AtomicU16::new(0), next_fid: AtomicU32::new(0) };
        client.handshake().await?;
        Ok(client)
    }

    fn alloc_fid(&self) -> u32 {
        self.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one 9P message and returns its reply's type byte and body (the bytes after the
    /// size/type/tag header). `Rlerror` is translated into an `Error` rather than returned as a
    /// success body.
    async fn roundtrip(&self, msg_type: u8, body: &[u8]) -> Result<(u8, Vec<u8>), Error> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut frame = Vec::with_capacity(7 + body.len());
        put_u32(&mut frame, (7 + body.len()) as u32);
        frame.push(msg_type);
        put_u16(&mut frame, tag);
        frame.extend_from_slice(body);

        let mut sock = self.sock.lock().await;
        sock.write_all(&frame).await.map_err(Error::from_io)?;

        let mut header = [0u8; 7];
        sock.read_exact(&mut header).await.map_err(Error::from_io)?;
        let size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let reply_type = header[4];
        let mut payload = vec![0u8; size - 7];
        sock.read_exact(&mut payload).await.map_err(Error::from_io)?;
        drop(sock);

        if reply_type == ty::RLERROR {
            let errno = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            return Err(Error::RemoteErrno(errno as libc::c_int));
        }
        Ok((reply_type, payload))
    }

    async fn handshake(&self) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, MSIZE);
        put_str(&mut body, VERSION);
        self.roundtrip(ty::TVERSION, &body).await?;
        Ok(())
    }

    /// Attaches and returns the fid bound to the attach root.
    pub async fn attach(&self, uname: &str) -> Result<u32, Error> {
        let fid = self.alloc_fid();
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u32(&mut body, NOFID);
        put_str(&mut body, uname);
        put_str(&mut body, "");
        put_u32(&mut body, 0);
        self.roundtrip(ty::TATTACH, &body).await?;
        Ok(fid)
    }

    /// Walks `names` from `fid`, binding the result to a freshly allocated fid. Returns the new
    /// fid and the number of path components actually resolved (a partial walk on `ENOENT`'s
    /// boundary, matching 9P semantics).
    pub async fn walk(&self, fid: u32, names: &[&str]) -> Result<(u32, usize), Error> {
        let newfid = self.alloc_fid();
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u32(&mut body, newfid);
        put_u16(&mut body, names.len() as u16);
        for name in names {
            put_str(&mut body, name);
        }
        let (_, payload) = self.roundtrip(ty::TWALK, &body).await?;
        let mut r = Reader::new(&payload);
        let nwqid = r.u16() as usize;
        for _ in 0..nwqid {
            r.bytes(13); // qid: type(1) + version(4) + path(8)
        }
        Ok((newfid, nwqid))
    }

    pub async fn mkdir(&self, dfid: u32, name: &str, mode: u32) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, dfid);
        put_str(&mut body, name);
        put_u32(&mut body, mode);
        put_u32(&mut body, 0);
        self.roundtrip(ty::TMKDIR, &body).await?;
        Ok(())
    }

    /// Creates `name` under `dfid` and leaves `dfid` itself open on the new file, matching
    /// `Tlcreate`'s semantics.
    pub async fn create(&self, dfid: u32, name: &str, mode: u32) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, dfid);
        put_str(&mut body, name);
        put_u32(&mut body, libc::O_RDWR as u32);
        put_u32(&mut body, mode);
        put_u32(&mut body, 0);
        self.roundtrip(ty::TLCREATE, &body).await?;
        Ok(())
    }

    pub async fn lopen(&self, fid: u32, flags: u32) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u32(&mut body, flags);
        self.roundtrip(ty::TLOPEN, &body).await?;
        Ok(())
    }

    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32, Error> {
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u64(&mut body, offset);
        put_u32(&mut body, data.len() as u32);
        body.extend_from_slice(data);
        let (_, payload) = self.roundtrip(ty::TWRITE, &body).await?;
        Ok(Reader::new(&payload).u32())
    }

    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u64(&mut body, offset);
        put_u32(&mut body, count);
        let (_, payload) = self.roundtrip(ty::TREAD, &body).await?;
        let mut r = Reader::new(&payload);
        let len = r.u32() as usize;
        Ok(r.bytes(len).to_vec())
    }

    /// Reads one `Treaddir` response and decodes each entry's name and directory-or-not type,
    /// discarding the qids and offsets a real walk of the directory would also need.
    pub async fn readdir_entries(&self, fid: u32) -> Result<Vec<(String, bool)>, Error> {
        self.lopen(fid, libc::O_RDONLY as u32).await?;
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        put_u64(&mut body, 0);
        put_u32(&mut body, MSIZE);
        let (_, payload) = self.roundtrip(ty::TREADDIR, &body).await?;
        let mut r = Reader::new(&payload);
        let len = r.u32() as usize;
        let mut entries = Reader::new(r.bytes(len));
        let mut out = Vec::new();
        while !entries.remaining().is_empty() {
            entries.bytes(13); // qid
            entries.u64(); // offset
            let is_dir = entries.bytes(1)[0] == DT_DIR;
            out.push((entries.str(), is_dir));
        }
        Ok(out)
    }

    pub async fn unlinkat(&self, dfid: u32, name: &str) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, dfid);
        put_str(&mut body, name);
        put_u32(&mut body, 0);
        self.roundtrip(ty::TUNLINKAT, &body).await?;
        Ok(())
    }

    pub async fn clunk(&self, fid: u32) -> Result<(), Error> {
        let mut body = Vec::new();
        put_u32(&mut body, fid);
        self.roundtrip(ty::TCLUNK, &body).await?;
        Ok(())
    }
}

/// The operations the CLI and the subprocess IPC handshake actually need, phrased in terms of
/// the control-plane tree's fixed layout rather than raw fids.
pub struct FsdClient {
    inner: Client,
    root: u32,
}

impl FsdClient {
    pub async fn attach_tcp(addr: &str) -> Result<Self, Error> {
        let inner = Client::connect_tcp(addr).await?;
        let root = inner.attach("fsd").await?;
        Ok(Self { inner, root })
    }

    pub async fn attach_unix(path: &Path) -> Result<Self, Error> {
        let inner = Client::connect_unix(path).await?;
        let root = inner.attach("fsd").await?;
        Ok(Self { inner, root })
    }

    /// Mounts `guest_tag`/`guest_config` onto `host_tag`/`host_config` by creating
    /// `/mounts/<host_tag>/<guest_tag>/<name>.json` and writing each driver's own configuration
    /// fields into it. The tags themselves live only in the path; [`crate::mount::parse`] reads
    /// them back from the committing file's ancestry, not from the body. Returns that path,
    /// rooted at `/mounts`.
    pub async fn mount(
        &self,
        host_tag: &str,
        host_config: serde_json::Value,
        guest_tag: &str,
        guest_config: serde_json::Value,
    ) -> Result<String, Error> {
        let name = crate::mount::generate_name();
        let body = json!({ "host": host_config, "guest": guest_config });
        let bytes = serde_json::to_vec(&body).expect("Value always serializes");

        let dir_fid = self.mkdir_path(&["mounts", host_tag, guest_tag]).await?;
        self.inner.create(dir_fid, &name, 0o644).await?;
        self.inner.write(dir_fid, 0, &bytes).await?;
        self.inner.clunk(dir_fid).await?;
        Ok(format!("{host_tag}/{guest_tag}/{name}"))
    }

    /// Unmounts the mount point file at `path` (as returned by [`FsdClient::mount`]), rooted at
    /// `/mounts`.
    pub async fn unmount(&self, path: &str) -> Result<(), Error> {
        let mut components: Vec<&str> = path.split('/').collect();
        let name = components.pop().ok_or_else(|| Error::NotFound(path.to_owned()))?;
        let mut full = vec!["mounts"];
        full.extend(components);
        let (dir_fid, resolved) = self.inner.walk(self.root, &full).await?;
        if resolved != full.len() {
            return Err(Error::NotFound(path.to_owned()));
        }
        self.inner.unlinkat(dir_fid, name).await?;
        self.inner.clunk(dir_fid).await
    }

    /// Walks down `components` one at a time from the attach root, `Tmkdir`-ing whichever
    /// component doesn't resolve yet, and returns a fid bound to the final directory. Walking
    /// one component per call (rather than the whole path at once) keeps every intermediate fid
    /// bound, since a partial multi-component walk leaves its destination fid unbound.
    async fn mkdir_path(&self, components: &[&str]) -> Result<u32, Error> {
        let mut current = self.root;
        let mut owned = None;
        for name in components {
            let (next_fid, resolved) = self.inner.walk(current, &[*name]).await?;
            let bound_fid = if resolved == 1 {
                next_fid
            } else {
                self.inner.clunk(next_fid).await?;
                self.inner.mkdir(current, name, 0o755).await?;
                let (created_fid, created_resolved) = self.inner.walk(current, &[*name]).await?;
                if created_resolved != 1 {
                    return Err(Error::NotFound((*name).to_owned()));
                }
                created_fid
            };
            if let Some(previous) = owned.take() {
                self.inner.clunk(previous).await?;
            }
            owned = Some(bound_fid);
            current = bound_fid;
        }
        owned.ok_or_else(|| Error::NotFound("mounts".to_owned()))
    }

    /// Lists every mirrored listener address under `/listeners`, descending through the nested
    /// directories a `tcp`/`unix` address's components are mirrored as and joining them back
    /// into one string per leaf.
    pub async fn listeners(&self) -> Result<Vec<String>, Error> {
        let (root_fid, resolved) = self.inner.walk(self.root, &["listeners"]).await?;
        if resolved != 1 {
            return Err(Error::NotFound("listeners".to_owned()));
        }
        let mut out = Vec::new();
        self.collect_listener_paths(root_fid, Vec::new(), &mut out).await?;
        self.inner.clunk(root_fid).await?;
        Ok(out)
    }

    /// Recurses into `dfid`, accumulating `prefix` path components; a directory with no
    /// subdirectories left is a leaf, i.e. one full listener address.
    fn collect_listener_paths<'a>(
        &'a self,
        dfid: u32,
        prefix: Vec<String>,
        out: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + 'a>> {
        Box::pin(async move {
            let entries = self.inner.readdir_entries(dfid).await?;
            let subdirs: Vec<&String> = entries.iter().filter(|(_, is_dir)| *is_dir).map(|(name, _)| name).collect();
            if subdirs.is_empty() {
                if !prefix.is_empty() {
                    out.push(prefix.join("/"));
                }
                return Ok(());
            }
            for (name, is_dir) in &entries {
                if !is_dir {
                    continue;
                }
                let (child_fid, resolved) = self.inner.walk(dfid, &[name]).await?;
                if resolved != 1 {
                    continue;
                }
                let mut child_prefix = prefix.clone();
                child_prefix.push(name.clone());
                self.collect_listener_paths(child_fid, child_prefix, out).await?;
                self.inner.clunk(child_fid).await?;
            }
            Ok(())
        })
    }

    /// Requests a shutdown at `disposition` by writing its byte to `/control/shutdown`.
    pub async fn shutdown(&self, disposition: crate::shutdown::Disposition) -> Result<(), Error> {
        let (fid, resolved) = self.inner.walk(self.root, &["control", "shutdown"]).await?;
        if resolved != 2 {
            return Err(Error::NotFound("control/shutdown".to_owned()));
        }
        self.inner.lopen(fid, libc::O_WRONLY as u32).await?;
        self.inner.write(fid, 0, &[disposition as u8]).await?;
        self.inner.clunk(fid).await
    }

    /// Writes the end-of-transmission byte to `/control/release`, the subprocess IPC handshake
    /// that tells the daemon its launching parent is detaching without wanting it killed.
    pub async fn release(&self) -> Result<(), Error> {
        let (fid, resolved) = self.inner.walk(self.root, &["control", "release"]).await?;
        if resolved != 2 {
            return Err(Error::NotFound("control/release".to_owned()));
        }
        self.inner.lopen(fid, libc::O_WRONLY as u32).await?;
        self.inner.write(fid, 0, &[0x04]).await?;
        self.inner.clunk(fid).await
    }

    /// Reads the per-session error ring at `err`, the reserved name only resolvable from the
    /// attach root.
    pub async fn last_error(&self) -> Result<String, Error> {
        let (fid, resolved) = self.inner.walk(self.root, &["err"]).await?;
        if resolved != 1 {
            return Err(Error::NotFound("err".to_owned()));
        }
        self.inner.lopen(fid, libc::O_RDONLY as u32).await?;
        let bytes = self.inner.read(fid, 0, MSIZE).await?;
        self.inner.clunk(fid).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
