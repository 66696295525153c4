//! Drives one 9P2000.L connection directly: reads a frame, decodes the request, calls the
//! matching [`ControlPlane`] operation, encodes the reply (or an `Rlerror`), and writes it back.
//! Runs until the peer closes the connection or the shared [`CancellationToken`] fires, which is
//! what lets a `Short`/`Immediate` shutdown force a connection down instead of waiting for the
//! client to go away on its own.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::fs_impl::ControlPlane;
use crate::wire::{put_str, put_u16, put_u32, put_u64, put_u8, ty, Reader, DT_DIR, GETATTR_ALL, MSIZE, QTDIR};

enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
            Self::Unix(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(buf).await,
            Self::Unix(s) => s.write_all(buf).await,
        }
    }
}

pub async fn serve_tcp(stream: TcpStream, plane: ControlPlane, last_activity: Arc<Mutex<Instant>>, token: CancellationToken) {
    serve(Conn::Tcp(stream), plane, last_activity, token).await
}

pub async fn serve_unix(stream: UnixStream, plane: ControlPlane, last_activity: Arc<Mutex<Instant>>, token: CancellationToken) {
    serve(Conn::Unix(stream), plane, last_activity, token).await
}

#[instrument(level = "debug", skip_all)]
async fn serve(mut conn: Conn, plane: ControlPlane, last_activity: Arc<Mutex<Instant>>, token: CancellationToken) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("connection cancelled by shutdown governor");
                return;
            }
            frame = read_frame(&mut conn) => frame,
        };
        let Some((msg_type, tag, body)) = frame else {
            return;
        };
        *last_activity.lock().unwrap() = Instant::now();

        let out = dispatch_one(&plane, tag, msg_type, &body).await;
        if conn.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Reads one `size[4] type[1] tag[2] body...` frame. `None` means the connection closed, either
/// cleanly (EOF on the header) or because the peer dropped mid-frame.
async fn read_frame(conn: &mut Conn) -> Option<(u8, u16, Vec<u8>)> {
    let mut header = [0u8; 7];
    conn.read_exact(&mut header).await.ok()?;
    let size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let msg_type = header[4];
    let tag = u16::from_le_bytes(header[5..7].try_into().unwrap());
    let mut body = vec![0u8; size.saturating_sub(7)];
    conn.read_exact(&mut body).await.ok()?;
    Some((msg_type, tag, body))
}

fn encode_frame(msg_type: u8, tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + payload.len());
    put_u32(&mut frame, (7 + payload.len()) as u32);
    frame.push(msg_type);
    put_u16(&mut frame, tag);
    frame.extend_from_slice(payload);
    frame
}

fn encode_rlerror(tag: u16, errno: libc::c_int) -> Vec<u8> {
    let mut payload = Vec::new();
    put_u32(&mut payload, errno as u32);
    encode_frame(ty::RLERROR, tag, &payload)
}

async fn dispatch_one(plane: &ControlPlane, tag: u16, msg_type: u8, body: &[u8]) -> Vec<u8> {
    match handle(plane, msg_type, body).await {
        Ok((reply_type, payload)) => encode_frame(reply_type, tag, &payload),
        Err(errno) => encode_rlerror(tag, errno),
    }
}

/// Decodes one request body, calls the matching [`ControlPlane`] operation, and encodes its
/// reply. An unrecognized message type is rejected rather than silently ignored.
async fn handle(plane: &ControlPlane, msg_type: u8, body: &[u8]) -> Result<(u8, Vec<u8>), libc::c_int> {
    let mut r = Reader::new(body);
    match msg_type {
        ty::TVERSION => {
            let msize = r.u32();
            let _version = r.str();
            let mut payload = Vec::new();
            put_u32(&mut payload, msize.min(MSIZE));
            put_str(&mut payload, crate::wire::VERSION);
            Ok((ty::RVERSION, payload))
        }

        ty::TATTACH => {
            let fid = r.u32();
            let _afid = r.u32();
            let _uname = r.str();
            let _aname = r.str();
            let _n_uname = r.u32();
            let qid = plane.attach(fid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            qid.encode(&mut payload);
            Ok((ty::RATTACH, payload))
        }

        ty::TWALK => {
            let fid = r.u32();
            let newfid = r.u32();
            let nwname = r.u16() as usize;
            let wnames: Vec<String> = (0..nwname).map(|_| r.str()).collect();
            let qids = plane.walk(fid, newfid, &wnames).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            put_u16(&mut payload, qids.len() as u16);
            for qid in &qids {
                qid.encode(&mut payload);
            }
            Ok((ty::RWALK, payload))
        }

        ty::TGETATTR => {
            let fid = r.u32();
            let _request_mask = r.u64();
            let (qid, attr) = plane.getattr(fid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            put_u64(&mut payload, GETATTR_ALL);
            qid.encode(&mut payload);
            put_u32(&mut payload, attr.mode);
            put_u32(&mut payload, attr.uid);
            put_u32(&mut payload, attr.gid);
            put_u64(&mut payload, attr.nlink);
            put_u64(&mut payload, attr.rdev);
            put_u64(&mut payload, attr.size);
            put_u64(&mut payload, attr.blksize);
            put_u64(&mut payload, attr.blocks);
            put_u64(&mut payload, attr.atime_sec);
            put_u64(&mut payload, attr.atime_nsec);
            put_u64(&mut payload, attr.mtime_sec);
            put_u64(&mut payload, attr.mtime_nsec);
            put_u64(&mut payload, attr.mtime_sec); // ctime mirrors mtime: this tree doesn't track it separately
            put_u64(&mut payload, attr.mtime_nsec);
            put_u64(&mut payload, 0); // btime_sec
            put_u64(&mut payload, 0); // btime_nsec
            put_u64(&mut payload, 0); // gen
            put_u64(&mut payload, 0); // data_version
            Ok((ty::RGETATTR, payload))
        }

        ty::TSETATTR => {
            let fid = r.u32();
            let valid = r.u32();
            let _mode = r.u32();
            let _uid = r.u32();
            let _gid = r.u32();
            let size = r.u64();
            let _atime_sec = r.u64();
            let _atime_nsec = r.u64();
            let _mtime_sec = r.u64();
            let _mtime_nsec = r.u64();
            plane.setattr(fid, valid, size).await.map_err(|e| plane.fail(e))?;
            Ok((ty::RSETATTR, Vec::new()))
        }

        ty::TLOPEN => {
            let fid = r.u32();
            let _flags = r.u32();
            let qid = plane.lopen(fid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            qid.encode(&mut payload);
            put_u32(&mut payload, 0); // iounit: no preferred I/O size
            Ok((ty::RLOPEN, payload))
        }

        ty::TREADDIR => {
            let fid = r.u32();
            let offset = r.u64();
            let count = r.u32();
            let entries = plane.readdir(fid, offset, count).await.map_err(|e| plane.fail(e))?;
            let mut data = Vec::new();
            for (i, (name, qid)) in entries.iter().enumerate() {
                qid.encode(&mut data);
                put_u64(&mut data, offset + i as u64 + 1);
                put_u8(&mut data, if qid.typ == QTDIR { DT_DIR } else { 0 });
                put_str(&mut data, name);
            }
            let mut payload = Vec::new();
            put_u32(&mut payload, data.len() as u32);
            payload.extend_from_slice(&data);
            Ok((ty::RREADDIR, payload))
        }

        ty::TREAD => {
            let fid = r.u32();
            let offset = r.u64();
            let count = r.u32();
            let data = plane.read(fid, offset, count).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            put_u32(&mut payload, data.len() as u32);
            payload.extend_from_slice(&data);
            Ok((ty::RREAD, payload))
        }

        ty::TWRITE => {
            let fid = r.u32();
            let offset = r.u64();
            let count = r.u32() as usize;
            let data = r.bytes(count);
            let written = plane.write(fid, offset, data).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            put_u32(&mut payload, written);
            Ok((ty::RWRITE, payload))
        }

        ty::TLCREATE => {
            let fid = r.u32();
            let name = r.str();
            let _flags = r.u32();
            let mode = r.u32();
            let gid = r.u32();
            let qid = plane.lcreate(fid, &name, mode, gid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            qid.encode(&mut payload);
            put_u32(&mut payload, 0); // iounit
            Ok((ty::RLCREATE, payload))
        }

        ty::TMKDIR => {
            let fid = r.u32();
            let name = r.str();
            let mode = r.u32();
            let gid = r.u32();
            let qid = plane.mkdir(fid, &name, mode, gid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            qid.encode(&mut payload);
            Ok((ty::RMKDIR, payload))
        }

        ty::TUNLINKAT => {
            let fid = r.u32();
            let name = r.str();
            let _flags = r.u32();
            plane.unlinkat(fid, &name).await.map_err(|e| plane.fail(e))?;
            Ok((ty::RUNLINKAT, Vec::new()))
        }

        ty::TCLUNK => {
            let fid = r.u32();
            plane.clunk(fid).await.map_err(|e| plane.fail(e))?;
            Ok((ty::RCLUNK, Vec::new()))
        }

        ty::TSTATFS => {
            let fid = r.u32();
            plane.statfs(fid).await.map_err(|e| plane.fail(e))?;
            let mut payload = Vec::new();
            put_u32(&mut payload, 0x0102_1997); // V9FS_MAGIC, the conventional 9P2000.L filesystem magic number
            put_u32(&mut payload, 4096);
            for _ in 0..6 {
                put_u64(&mut payload, 0); // blocks, bfree, bavail, files, ffree, fsid
            }
            put_u32(&mut payload, 255);
            Ok((ty::RSTATFS, payload))
        }

        ty::TFLUSH => Ok((ty::RFLUSH, Vec::new())),

        _ => Err(libc::EOPNOTSUPP),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::fs_impl::ControlPlane;
    use crate::mount::MountTable;
    use crate::shutdown::ShutdownGovernor;
    use crate::tree::Tree;

    async fn connected_plane() -> (ControlPlane, Arc<Mutex<Instant>>, TcpStream) {
        let tree = Tree::new();
        ControlPlane::ensure_layout(&tree).unwrap();
        let last_activity = Arc::new(Mutex::new(Instant::now() - Duration::from_secs(3600)));
        let plane = ControlPlane::new(
            tree,
            MountTable::new(),
            crate::listener::ListenerTable::new(),
            ShutdownGovernor::new(),
            last_activity.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = plane.clone();
        let serving_activity = last_activity.clone();
        let token = serving.governor.cancellation_token();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_tcp(stream, serving, serving_activity, token).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        (plane, last_activity, client)
    }

    async fn send_tversion(client: &mut TcpStream) {
        let mut body = Vec::new();
        put_u32(&mut body, MSIZE);
        put_str(&mut body, crate::wire::VERSION);
        client.write_all(&encode_frame(ty::TVERSION, 0, &body)).await.unwrap();

        let mut header = [0u8; 7];
        client.read_exact(&mut header).await.unwrap();
        let size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; size - 7];
        client.read_exact(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn serving_a_request_resets_the_shared_activity_clock() {
        let (_plane, last_activity, mut client) = connected_plane().await;
        send_tversion(&mut client).await;
        assert!(last_activity.lock().unwrap().elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelling_the_token_drops_the_connection_without_a_reply() {
        let (plane, _last_activity, mut client) = connected_plane().await;
        plane.governor.cancellation_token().cancel();

        let mut body = Vec::new();
        put_u32(&mut body, MSIZE);
        put_str(&mut body, crate::wire::VERSION);
        // The loop may observe the cancellation before or after reading this frame; either way
        // no reply should ever arrive and the socket should close.
        let _ = client.write_all(&encode_frame(ty::TVERSION, 0, &body)).await;
        let mut header = [0u8; 7];
        let result = tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut header)).await.unwrap();
        assert!(result.is_err(), "expected the connection to close without a reply, got {result:?}");
    }
}
