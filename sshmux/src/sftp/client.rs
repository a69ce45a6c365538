//! SFTP client: request-reply RPC over a channel running the `sftp`
//! subsystem, responses matched to requests by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelMsg};
use crate::{Buffer, Error};

use super::*;

/// A decoded reply frame, positioned just past the request id.
struct Response {
    typ: u8,
    buf: Buffer,
}

struct Inner {
    channel: Arc<Channel>,
    version: OnceLock<u32>,
    extensions: OnceLock<Vec<(String, Vec<u8>)>>,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Response>>>,
}

/// An SFTP client over one channel. Cheap to clone; requests may be
/// issued concurrently and are matched to replies by request id.
#[derive(Clone)]
pub struct SftpClient {
    inner: Arc<Inner>,
}

impl SftpClient {
    /// Negotiate the protocol over an already-opened channel on which
    /// the `sftp` subsystem has been requested. Asks for version
    /// [`MAX_VERSION`] and accepts whatever the server answers within
    /// [`MIN_VERSION`]..=[`MAX_VERSION`].
    pub async fn new(
        channel: Arc<Channel>,
        msgs: UnboundedReceiver<ChannelMsg>,
    ) -> Result<SftpClient, Error> {
        let inner = Arc::new(Inner {
            channel,
            version: OnceLock::new(),
            extensions: OnceLock::new(),
            next_request_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        });
        let (version_tx, version_rx) = oneshot::channel();
        tokio::spawn(read_loop(Arc::clone(&inner), msgs, version_tx));

        let mut init = Buffer::new();
        init.put_u32(5);
        init.put_u8(SSH_FXP_INIT);
        init.put_u32(MAX_VERSION);
        inner.channel.data(init.payload()).await?;

        let (version, extensions) = version_rx.await.map_err(|_| Error::Disconnect)?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(Error::SftpVersion(version));
        }
        debug!("negotiated SFTP version {version}, {} extensions", extensions.len());
        let _ = inner.version.set(version);
        let _ = inner.extensions.set(extensions);
        Ok(SftpClient { inner })
    }

    pub fn version(&self) -> u32 {
        self.inner.version.get().copied().unwrap_or(MIN_VERSION)
    }

    /// The data blob of a server extension, if announced.
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.inner
            .extensions
            .get()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    async fn request(
        &self,
        typ: u8,
        body: impl FnOnce(&mut Buffer),
    ) -> Result<Response, Error> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .map_err(|_| Error::Inconsistent)?
            .insert(id, tx);

        let mut buf = Buffer::new();
        buf.put_u32(0); // patched below
        buf.put_u8(typ);
        buf.put_u32(id);
        body(&mut buf);
        let len = (buf.wpos() - 4) as u32;
        buf.patch_u32(0, len)?;
        trace!("sftp request type={typ} id={id} len={len}");
        self.inner.channel.data(buf.payload()).await?;

        rx.await.map_err(|_| Error::Disconnect)
    }

    // Response-shape checkers.

    fn status_of(mut resp: Response) -> Result<(u32, String), Error> {
        if resp.typ != SSH_FXP_STATUS {
            return Err(Error::Inconsistent);
        }
        let code = resp.buf.get_u32()?;
        let message = resp.buf.get_str()?;
        let _lang = resp.buf.get_str()?;
        Ok((code, message))
    }

    /// Expect a `STATUS` reply and require `SSH_FX_OK`.
    fn check_status(resp: Response) -> Result<(), Error> {
        let (code, message) = Self::status_of(resp)?;
        if code == SSH_FX_OK {
            Ok(())
        } else {
            Err(Error::Sftp {
                status: code,
                message,
            })
        }
    }

    /// Expect a `HANDLE` reply.
    fn check_handle(mut resp: Response) -> Result<Vec<u8>, Error> {
        match resp.typ {
            SSH_FXP_HANDLE => resp.buf.get_string(),
            SSH_FXP_STATUS => {
                let (code, message) = Self::status_of(resp)?;
                Err(Error::Sftp {
                    status: code,
                    message,
                })
            }
            _ => Err(Error::Inconsistent),
        }
    }

    /// Expect an `ATTRS` reply.
    fn check_attrs(&self, mut resp: Response) -> Result<Attrs, Error> {
        match resp.typ {
            SSH_FXP_ATTRS => Attrs::decode(&mut resp.buf, self.version()),
            SSH_FXP_STATUS => {
                let (code, message) = Self::status_of(resp)?;
                Err(Error::Sftp {
                    status: code,
                    message,
                })
            }
            _ => Err(Error::Inconsistent),
        }
    }

    /// Expect a `NAME` reply carrying exactly one name.
    fn check_one_name(&self, mut resp: Response) -> Result<String, Error> {
        match resp.typ {
            SSH_FXP_NAME => {
                let count = resp.buf.get_u32()?;
                if count != 1 {
                    return Err(Error::Inconsistent);
                }
                let name = resp.buf.get_str()?;
                if self.version() == 3 {
                    let _longname = resp.buf.get_str()?;
                }
                let _attrs = Attrs::decode(&mut resp.buf, self.version())?;
                Ok(name)
            }
            SSH_FXP_STATUS => {
                let (code, message) = Self::status_of(resp)?;
                Err(Error::Sftp {
                    status: code,
                    message,
                })
            }
            _ => Err(Error::Inconsistent),
        }
    }

    // Operations.

    /// Open a file. The intent is translated to the negotiated
    /// version's encoding: the classic pflags bitmask under v3, a
    /// disposition value from v4 on, plus the `ACE4_*` access word
    /// from v5 on.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<CloseableHandle, Error> {
        // Consistent with std::fs - nothing specified means read.
        let mode = if mode.is_empty() { OpenMode::READ } else { mode };
        let version = self.version();
        let resp = self
            .request(SSH_FXP_OPEN, |b| {
                b.put_str(path);
                if version == 3 {
                    let mut pflags = 0;
                    if mode.contains(OpenMode::READ) {
                        pflags |= SSH_FXF_READ;
                    }
                    if mode.contains(OpenMode::WRITE) {
                        pflags |= SSH_FXF_WRITE;
                    }
                    if mode.contains(OpenMode::APPEND) {
                        pflags |= SSH_FXF_APPEND;
                    }
                    if mode.contains(OpenMode::CREATE) {
                        pflags |= SSH_FXF_CREAT;
                    }
                    if mode.contains(OpenMode::TRUNCATE) {
                        pflags |= SSH_FXF_TRUNC;
                    }
                    if mode.contains(OpenMode::EXCLUSIVE) {
                        pflags |= SSH_FXF_EXCL;
                    }
                    b.put_u32(pflags);
                } else {
                    if version >= 5 {
                        let mut access = 0;
                        if mode.contains(OpenMode::READ) {
                            access |= ACE4_READ_DATA | ACE4_READ_ATTRIBUTES;
                        }
                        if mode.contains(OpenMode::WRITE) {
                            access |= ACE4_WRITE_DATA | ACE4_WRITE_ATTRIBUTES;
                        }
                        if mode.contains(OpenMode::APPEND) {
                            access |= ACE4_APPEND_DATA;
                        }
                        b.put_u32(access);
                    }
                    let disposition = if mode.contains(OpenMode::CREATE | OpenMode::EXCLUSIVE) {
                        SSH_FXF_CREATE_NEW
                    } else if mode.contains(OpenMode::CREATE | OpenMode::TRUNCATE) {
                        SSH_FXF_CREATE_TRUNCATE
                    } else if mode.contains(OpenMode::CREATE) {
                        SSH_FXF_OPEN_OR_CREATE
                    } else if mode.contains(OpenMode::TRUNCATE) {
                        SSH_FXF_TRUNCATE_EXISTING
                    } else {
                        SSH_FXF_OPEN_EXISTING
                    };
                    b.put_u32(disposition);
                }
                Attrs::default().encode(b, version);
            })
            .await?;
        Ok(CloseableHandle::new(self.clone(), Self::check_handle(resp)?))
    }

    pub(crate) async fn close_handle(&self, handle: &[u8]) -> Result<(), Error> {
        let resp = self.request(SSH_FXP_CLOSE, |b| b.put_string(handle)).await?;
        Self::check_status(resp)
    }

    /// Read at `offset` into `out`. `Ok(None)` signals end of file.
    pub async fn read(
        &self,
        handle: &CloseableHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<Option<usize>, Error> {
        let mut resp = self
            .request(SSH_FXP_READ, |b| {
                b.put_string(handle.identifier());
                b.put_u64(offset);
                b.put_u32(out.len() as u32);
            })
            .await?;
        match resp.typ {
            SSH_FXP_DATA => {
                let data = resp.buf.get_string()?;
                let n = data.len().min(out.len());
                #[allow(clippy::indexing_slicing)] // n <= both lengths
                out[..n].copy_from_slice(&data[..n]);
                Ok(Some(n))
            }
            SSH_FXP_STATUS => {
                let (code, message) = Self::status_of(resp)?;
                if code == SSH_FX_EOF {
                    Ok(None)
                } else {
                    Err(Error::Sftp {
                        status: code,
                        message,
                    })
                }
            }
            _ => Err(Error::Inconsistent),
        }
    }

    pub async fn write(
        &self,
        handle: &CloseableHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let resp = self
            .request(SSH_FXP_WRITE, |b| {
                b.put_string(handle.identifier());
                b.put_u64(offset);
                b.put_string(data);
            })
            .await?;
        Self::check_status(resp)
    }

    pub async fn remove(&self, path: &str) -> Result<(), Error> {
        let resp = self.request(SSH_FXP_REMOVE, |b| b.put_str(path)).await?;
        Self::check_status(resp)
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), Error> {
        let version = self.version();
        let resp = self
            .request(SSH_FXP_RENAME, |b| {
                b.put_str(old_path);
                b.put_str(new_path);
                if version >= 5 {
                    b.put_u32(0);
                }
            })
            .await?;
        Self::check_status(resp)
    }

    pub async fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), Error> {
        let version = self.version();
        let resp = self
            .request(SSH_FXP_MKDIR, |b| {
                b.put_str(path);
                attrs.encode(b, version);
            })
            .await?;
        Self::check_status(resp)
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), Error> {
        let resp = self.request(SSH_FXP_RMDIR, |b| b.put_str(path)).await?;
        Self::check_status(resp)
    }

    pub async fn opendir(&self, path: &str) -> Result<CloseableHandle, Error> {
        let resp = self.request(SSH_FXP_OPENDIR, |b| b.put_str(path)).await?;
        Ok(CloseableHandle::new(self.clone(), Self::check_handle(resp)?))
    }

    /// One batch of directory entries; `Ok(None)` is the end of the
    /// iteration.
    pub async fn read_dir(
        &self,
        handle: &CloseableHandle,
    ) -> Result<Option<Vec<DirEntry>>, Error> {
        let mut resp = self
            .request(SSH_FXP_READDIR, |b| b.put_string(handle.identifier()))
            .await?;
        match resp.typ {
            SSH_FXP_NAME => {
                let count = resp.buf.get_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let filename = resp.buf.get_str()?;
                    let longname = if self.version() == 3 {
                        Some(resp.buf.get_str()?)
                    } else {
                        None
                    };
                    let attrs = Attrs::decode(&mut resp.buf, self.version())?;
                    entries.push(DirEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Ok(Some(entries))
            }
            SSH_FXP_STATUS => {
                let (code, message) = Self::status_of(resp)?;
                if code == SSH_FX_EOF {
                    Ok(None)
                } else {
                    Err(Error::Sftp {
                        status: code,
                        message,
                    })
                }
            }
            _ => Err(Error::Inconsistent),
        }
    }

    pub async fn stat(&self, path: &str) -> Result<Attrs, Error> {
        let resp = self.request(SSH_FXP_STAT, |b| b.put_str(path)).await?;
        self.check_attrs(resp)
    }

    pub async fn lstat(&self, path: &str) -> Result<Attrs, Error> {
        let resp = self.request(SSH_FXP_LSTAT, |b| b.put_str(path)).await?;
        self.check_attrs(resp)
    }

    pub async fn fstat(&self, handle: &CloseableHandle) -> Result<Attrs, Error> {
        let resp = self
            .request(SSH_FXP_FSTAT, |b| b.put_string(handle.identifier()))
            .await?;
        self.check_attrs(resp)
    }

    pub async fn setstat(&self, path: &str, attrs: &Attrs) -> Result<(), Error> {
        let version = self.version();
        let resp = self
            .request(SSH_FXP_SETSTAT, |b| {
                b.put_str(path);
                attrs.encode(b, version);
            })
            .await?;
        Self::check_status(resp)
    }

    pub async fn realpath(&self, path: &str) -> Result<String, Error> {
        let resp = self.request(SSH_FXP_REALPATH, |b| b.put_str(path)).await?;
        self.check_one_name(resp)
    }

    pub async fn readlink(&self, path: &str) -> Result<String, Error> {
        let resp = self.request(SSH_FXP_READLINK, |b| b.put_str(path)).await?;
        self.check_one_name(resp)
    }

    pub async fn symlink(&self, link_path: &str, target_path: &str) -> Result<(), Error> {
        self.link(link_path, target_path, true).await
    }

    /// Create a link. Hard links need protocol v6; under v3-v5 a
    /// non-symbolic link is refused locally.
    ///
    /// The target goes on the wire before the link name: OpenSSH's
    /// sftp-server reads the arguments in that order.
    pub async fn link(
        &self,
        link_path: &str,
        target_path: &str,
        symbolic: bool,
    ) -> Result<(), Error> {
        let version = self.version();
        let resp = if version >= 6 {
            self.request(SSH_FXP_LINK, |b| {
                b.put_str(target_path);
                b.put_str(link_path);
                b.put_bool(symbolic);
            })
            .await?
        } else {
            if !symbolic {
                return Err(Error::SftpVersion(version));
            }
            self.request(SSH_FXP_SYMLINK, |b| {
                b.put_str(target_path);
                b.put_str(link_path);
            })
            .await?
        };
        Self::check_status(resp)
    }
}

/// Pull frames off the channel stream: the `VERSION` reply goes to the
/// waiting `new()`, everything else is matched to its pending request.
async fn read_loop(
    inner: Arc<Inner>,
    mut msgs: UnboundedReceiver<ChannelMsg>,
    version_tx: oneshot::Sender<(u32, Vec<(String, Vec<u8>)>)>,
) {
    let mut version_tx = Some(version_tx);
    let mut frames = FrameBuffer::default();
    while let Some(msg) = msgs.recv().await {
        match msg {
            ChannelMsg::Data { data } => {
                frames.push(&data);
                while let Some(mut frame) = frames.next_frame() {
                    let Ok(typ) = frame.get_u8() else { continue };
                    if typ == SSH_FXP_VERSION {
                        match parse_version(&mut frame) {
                            Ok(v) => {
                                if let Some(tx) = version_tx.take() {
                                    let _ = tx.send(v);
                                }
                            }
                            Err(e) => warn!("bad SFTP version reply: {e:?}"),
                        }
                        continue;
                    }
                    let Ok(id) = frame.get_u32() else {
                        warn!("truncated SFTP reply, type {typ}");
                        continue;
                    };
                    let waiter = inner
                        .pending
                        .lock()
                        .ok()
                        .and_then(|mut p| p.remove(&id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Response { typ, buf: frame });
                        }
                        None => warn!("SFTP reply for unknown request id {id}"),
                    }
                }
            }
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }
    // Outstanding requests resolve with Disconnect when their
    // senders drop here.
    if let Ok(mut pending) = inner.pending.lock() {
        pending.clear();
    }
}

fn parse_version(frame: &mut Buffer) -> Result<(u32, Vec<(String, Vec<u8>)>), Error> {
    let version = frame.get_u32()?;
    let mut extensions = Vec::new();
    while frame.available() > 0 {
        let name = frame.get_str()?;
        let data = frame.get_string()?;
        extensions.push((name, data));
    }
    Ok((version, extensions))
}

/// An opaque server-issued handle that closes itself through its
/// client when dropped.
pub struct CloseableHandle {
    client: SftpClient,
    identifier: Vec<u8>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CloseableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseableHandle")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl CloseableHandle {
    fn new(client: SftpClient, identifier: Vec<u8>) -> CloseableHandle {
        CloseableHandle {
            client,
            identifier,
            closed: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.close_handle(&self.identifier).await
    }
}

impl Drop for CloseableHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let client = self.client.clone();
            let identifier = std::mem::take(&mut self.identifier);
            tokio::spawn(async move {
                let _ = client.close_handle(&identifier).await;
            });
        }
    }
}
