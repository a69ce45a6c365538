//! Server half of the SFTP RPC: decodes requests, drives a
//! filesystem-backend trait, encodes replies. The actual filesystem
//! I/O lives behind [`SftpFileSystem`].

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{Channel, ChannelMsg};
use crate::{Buffer, Error};

use super::*;

/// A failed filesystem operation, mapped to an `SSH_FXP_STATUS` reply.
#[derive(Debug, Clone)]
pub struct StatusError {
    pub code: u32,
    pub message: String,
}

impl StatusError {
    pub fn new(code: u32, message: impl Into<String>) -> StatusError {
        StatusError {
            code,
            message: message.into(),
        }
    }

    pub fn no_such_file(path: &str) -> StatusError {
        StatusError::new(SSH_FX_NO_SUCH_FILE, format!("No such file: {path}"))
    }

    pub fn unsupported() -> StatusError {
        StatusError::new(SSH_FX_OP_UNSUPPORTED, "Operation unsupported")
    }
}

impl From<std::io::Error> for StatusError {
    fn from(e: std::io::Error) -> StatusError {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => SSH_FX_NO_SUCH_FILE,
            std::io::ErrorKind::PermissionDenied => SSH_FX_PERMISSION_DENIED,
            _ => SSH_FX_FAILURE,
        };
        StatusError::new(code, e.to_string())
    }
}

/// The filesystem operations the subsystem dispatches to. Handles are
/// opaque byte strings of the implementation's choosing. Everything
/// defaults to `SSH_FX_OP_UNSUPPORTED` so a backend only implements
/// what it serves.
#[allow(unused_variables)]
#[async_trait]
pub trait SftpFileSystem: Send + Sync {
    async fn open(
        &self,
        path: &str,
        mode: OpenMode,
        attrs: &Attrs,
    ) -> Result<Vec<u8>, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn close(&self, handle: &[u8]) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    /// `Ok(None)` means end of file.
    async fn read(
        &self,
        handle: &[u8],
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn remove(&self, path: &str) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn rmdir(&self, path: &str) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn opendir(&self, path: &str) -> Result<Vec<u8>, StatusError> {
        Err(StatusError::unsupported())
    }

    /// One batch of entries; `Ok(None)` ends the iteration.
    async fn readdir(&self, handle: &[u8]) -> Result<Option<Vec<DirEntry>>, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn stat(&self, path: &str) -> Result<Attrs, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn lstat(&self, path: &str) -> Result<Attrs, StatusError> {
        self.stat(path).await
    }

    async fn fstat(&self, handle: &[u8]) -> Result<Attrs, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn setstat(&self, path: &str, attrs: &Attrs) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn fsetstat(&self, handle: &[u8], attrs: &Attrs) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }

    async fn realpath(&self, path: &str) -> Result<String, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn readlink(&self, path: &str) -> Result<String, StatusError> {
        Err(StatusError::unsupported())
    }

    async fn link(
        &self,
        link_path: &str,
        target_path: &str,
        symbolic: bool,
    ) -> Result<(), StatusError> {
        Err(StatusError::unsupported())
    }
}

/// The `sftp` subsystem running on one server-side session channel.
pub struct SftpSubsystem {
    channel: Arc<Channel>,
    fs: Arc<dyn SftpFileSystem>,
    version: u32,
    max_version: u32,
}

impl SftpSubsystem {
    pub fn new(channel: Arc<Channel>, fs: Arc<dyn SftpFileSystem>) -> SftpSubsystem {
        Self::with_max_version(channel, fs, MAX_VERSION)
    }

    /// A subsystem that will not negotiate past `max_version`, for
    /// deployments that want to pin the protocol down.
    pub fn with_max_version(
        channel: Arc<Channel>,
        fs: Arc<dyn SftpFileSystem>,
        max_version: u32,
    ) -> SftpSubsystem {
        SftpSubsystem {
            channel,
            fs,
            version: MIN_VERSION,
            max_version: max_version.clamp(MIN_VERSION, MAX_VERSION),
        }
    }

    /// Serve until the peer sends EOF or closes the channel.
    pub async fn run(mut self, mut msgs: UnboundedReceiver<ChannelMsg>) -> Result<(), Error> {
        let mut frames = FrameBuffer::default();
        while let Some(msg) = msgs.recv().await {
            match msg {
                ChannelMsg::Data { data } => {
                    frames.push(&data);
                    while let Some(frame) = frames.next_frame() {
                        self.dispatch(frame).await?;
                    }
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        debug!("sftp subsystem finished");
        self.channel.close()?;
        Ok(())
    }

    async fn send(&self, typ: u8, body: impl FnOnce(&mut Buffer)) -> Result<(), Error> {
        let mut buf = Buffer::new();
        buf.put_u32(0);
        buf.put_u8(typ);
        body(&mut buf);
        let len = (buf.wpos() - 4) as u32;
        buf.patch_u32(0, len)?;
        self.channel.data(buf.payload()).await
    }

    async fn send_status(&self, id: u32, code: u32, message: &str) -> Result<(), Error> {
        trace!("sftp status id={id} code={code} {message}");
        self.send(SSH_FXP_STATUS, |b| {
            b.put_u32(id);
            b.put_u32(code);
            b.put_str(message);
            b.put_str("en");
        })
        .await
    }

    async fn reply<T>(
        &self,
        id: u32,
        result: Result<T, StatusError>,
        ok: impl FnOnce(&Self, T) -> Result<(u8, Buffer), Error>,
    ) -> Result<(), Error> {
        match result {
            Ok(value) => {
                let (typ, body) = ok(self, value)?;
                self.send(typ, |b| {
                    b.put_u32(id);
                    b.put_raw(body.payload());
                })
                .await
            }
            Err(e) => self.send_status(id, e.code, &e.message).await,
        }
    }

    fn ok_status<T>(_: &Self, _: T) -> Result<(u8, Buffer), Error> {
        let mut b = Buffer::new();
        b.put_u32(SSH_FX_OK);
        b.put_str("Success");
        b.put_str("en");
        Ok((SSH_FXP_STATUS, b))
    }

    fn decode_open_mode(&self, buf: &mut Buffer) -> Result<OpenMode, Error> {
        if self.version == 3 {
            let pflags = buf.get_u32()?;
            let mut mode = OpenMode::empty();
            if pflags & SSH_FXF_READ != 0 {
                mode |= OpenMode::READ;
            }
            if pflags & SSH_FXF_WRITE != 0 {
                mode |= OpenMode::WRITE;
            }
            if pflags & SSH_FXF_APPEND != 0 {
                mode |= OpenMode::APPEND;
            }
            if pflags & SSH_FXF_CREAT != 0 {
                mode |= OpenMode::CREATE;
            }
            if pflags & SSH_FXF_TRUNC != 0 {
                mode |= OpenMode::TRUNCATE;
            }
            if pflags & SSH_FXF_EXCL != 0 {
                mode |= OpenMode::EXCLUSIVE;
            }
            Ok(mode)
        } else {
            let access = if self.version >= 5 {
                buf.get_u32()?
            } else {
                ACE4_READ_DATA | ACE4_WRITE_DATA
            };
            let flags = buf.get_u32()?;
            let mut mode = OpenMode::empty();
            if access & (ACE4_READ_DATA | ACE4_READ_ATTRIBUTES) != 0 {
                mode |= OpenMode::READ;
            }
            if access & (ACE4_WRITE_DATA | ACE4_WRITE_ATTRIBUTES) != 0 {
                mode |= OpenMode::WRITE;
            }
            if access & ACE4_APPEND_DATA != 0 {
                mode |= OpenMode::APPEND;
            }
            match flags & SSH_FXF_ACCESS_DISPOSITION {
                SSH_FXF_CREATE_NEW => mode |= OpenMode::CREATE | OpenMode::EXCLUSIVE,
                SSH_FXF_CREATE_TRUNCATE => mode |= OpenMode::CREATE | OpenMode::TRUNCATE,
                SSH_FXF_OPEN_OR_CREATE => mode |= OpenMode::CREATE,
                SSH_FXF_TRUNCATE_EXISTING => mode |= OpenMode::TRUNCATE,
                _ => {}
            }
            Ok(mode)
        }
    }

    fn name_reply(&self, entries: &[DirEntry]) -> Result<(u8, Buffer), Error> {
        let mut b = Buffer::new();
        b.put_u32(entries.len() as u32);
        for entry in entries {
            b.put_str(&entry.filename);
            if self.version == 3 {
                // v3 wants an ls -l style line; synthesize one if the
                // backend didn't provide it.
                match &entry.longname {
                    Some(l) => b.put_str(l),
                    None => b.put_str(&entry.filename),
                }
            }
            entry.attrs.encode(&mut b, self.version);
        }
        Ok((SSH_FXP_NAME, b))
    }

    async fn dispatch(&mut self, mut frame: Buffer) -> Result<(), Error> {
        let typ = frame.get_u8()?;
        if typ == SSH_FXP_INIT {
            let client_version = frame.get_u32()?;
            self.version = client_version.clamp(MIN_VERSION, self.max_version);
            debug!("sftp: client asked for version {client_version}, serving {}", self.version);
            let version = self.version;
            return self.send(SSH_FXP_VERSION, |b| b.put_u32(version)).await;
        }

        let id = frame.get_u32()?;
        match typ {
            SSH_FXP_OPEN => {
                let path = frame.get_str()?;
                let mode = self.decode_open_mode(&mut frame)?;
                let attrs = Attrs::decode(&mut frame, self.version)?;
                let result = self.fs.open(&path, mode, &attrs).await;
                self.reply(id, result, |_, handle| {
                    let mut b = Buffer::new();
                    b.put_string(&handle);
                    Ok((SSH_FXP_HANDLE, b))
                })
                .await
            }
            SSH_FXP_CLOSE => {
                let handle = frame.get_string()?;
                let result = self.fs.close(&handle).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_READ => {
                let handle = frame.get_string()?;
                let offset = frame.get_u64()?;
                let len = frame.get_u32()?;
                match self.fs.read(&handle, offset, len).await {
                    Ok(Some(data)) => {
                        self.send(SSH_FXP_DATA, |b| {
                            b.put_u32(id);
                            b.put_string(&data);
                        })
                        .await
                    }
                    Ok(None) => self.send_status(id, SSH_FX_EOF, "End of file").await,
                    Err(e) => self.send_status(id, e.code, &e.message).await,
                }
            }
            SSH_FXP_WRITE => {
                let handle = frame.get_string()?;
                let offset = frame.get_u64()?;
                let data = frame.get_string()?;
                let result = self.fs.write(&handle, offset, &data).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_REMOVE => {
                let path = frame.get_str()?;
                let result = self.fs.remove(&path).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_RENAME => {
                let old_path = frame.get_str()?;
                let new_path = frame.get_str()?;
                if self.version >= 5 && frame.available() >= 4 {
                    let _flags = frame.get_u32()?;
                }
                let result = self.fs.rename(&old_path, &new_path).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_MKDIR => {
                let path = frame.get_str()?;
                let attrs = Attrs::decode(&mut frame, self.version)?;
                let result = self.fs.mkdir(&path, &attrs).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_RMDIR => {
                let path = frame.get_str()?;
                let result = self.fs.rmdir(&path).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_OPENDIR => {
                let path = frame.get_str()?;
                let result = self.fs.opendir(&path).await;
                self.reply(id, result, |_, handle| {
                    let mut b = Buffer::new();
                    b.put_string(&handle);
                    Ok((SSH_FXP_HANDLE, b))
                })
                .await
            }
            SSH_FXP_READDIR => {
                let handle = frame.get_string()?;
                match self.fs.readdir(&handle).await {
                    Ok(Some(entries)) => {
                        let (typ, body) = self.name_reply(&entries)?;
                        self.send(typ, |b| {
                            b.put_u32(id);
                            b.put_raw(body.payload());
                        })
                        .await
                    }
                    Ok(None) => self.send_status(id, SSH_FX_EOF, "End of directory").await,
                    Err(e) => self.send_status(id, e.code, &e.message).await,
                }
            }
            SSH_FXP_STAT | SSH_FXP_LSTAT => {
                let path = frame.get_str()?;
                let result = if typ == SSH_FXP_STAT {
                    self.fs.stat(&path).await
                } else {
                    self.fs.lstat(&path).await
                };
                self.reply(id, result, |this, attrs| {
                    let mut b = Buffer::new();
                    attrs.encode(&mut b, this.version);
                    Ok((SSH_FXP_ATTRS, b))
                })
                .await
            }
            SSH_FXP_FSTAT => {
                let handle = frame.get_string()?;
                let result = self.fs.fstat(&handle).await;
                self.reply(id, result, |this, attrs| {
                    let mut b = Buffer::new();
                    attrs.encode(&mut b, this.version);
                    Ok((SSH_FXP_ATTRS, b))
                })
                .await
            }
            SSH_FXP_SETSTAT => {
                let path = frame.get_str()?;
                let attrs = Attrs::decode(&mut frame, self.version)?;
                let result = self.fs.setstat(&path, &attrs).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_FSETSTAT => {
                let handle = frame.get_string()?;
                let attrs = Attrs::decode(&mut frame, self.version)?;
                let result = self.fs.fsetstat(&handle, &attrs).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_REALPATH => {
                let path = frame.get_str()?;
                let result = self.fs.realpath(&path).await;
                self.reply(id, result, |this, name| {
                    this.name_reply(&[DirEntry {
                        filename: name,
                        longname: None,
                        attrs: Attrs::default(),
                    }])
                })
                .await
            }
            SSH_FXP_READLINK => {
                let path = frame.get_str()?;
                let result = self.fs.readlink(&path).await;
                self.reply(id, result, |this, name| {
                    this.name_reply(&[DirEntry {
                        filename: name,
                        longname: None,
                        attrs: Attrs::default(),
                    }])
                })
                .await
            }
            SSH_FXP_SYMLINK => {
                // Target first, then link name, matching OpenSSH's
                // sftp-server argument order.
                let target_path = frame.get_str()?;
                let link_path = frame.get_str()?;
                let result = self.fs.link(&link_path, &target_path, true).await;
                self.reply(id, result, Self::ok_status).await
            }
            SSH_FXP_LINK => {
                let target_path = frame.get_str()?;
                let link_path = frame.get_str()?;
                let symbolic = frame.get_bool()?;
                let result = self.fs.link(&link_path, &target_path, symbolic).await;
                self.reply(id, result, Self::ok_status).await
            }
            other => {
                warn!("sftp: unsupported request type {other}");
                self.send_status(id, SSH_FX_OP_UNSUPPORTED, "Operation unsupported")
                    .await
            }
        }
    }
}
