use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{Channel, ChannelEvent, ChannelMsg};
use crate::connection::ChannelFactory;
use crate::sftp::{
    Attrs, DirEntry, FileType, FrameBuffer, OpenMode, SftpClient, SftpFileSystem, SftpSubsystem,
    StatusError, SFTP_SUBSYSTEM, SSH_FXP_INIT, SSH_FXP_LINK, SSH_FXP_STATUS, SSH_FXP_SYMLINK,
    SSH_FXP_VERSION, SSH_FX_OK, SSH_FX_OP_UNSUPPORTED,
};
use crate::{msg, Buffer, ChannelId, Config, Error, OpenChannelError, SessionHandle};

use super::connection_pair;

enum HandleState {
    File(String),
    Dir { path: String, done: bool },
}

/// A toy filesystem: flat path map, opaque numeric handles.
#[derive(Default)]
struct MemFs {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<HashSet<String>>,
    links: Mutex<HashMap<String, String>>,
    handles: Mutex<HashMap<Vec<u8>, HandleState>>,
    next_handle: AtomicU32,
}

impl MemFs {
    fn seeded() -> Arc<MemFs> {
        let fs = MemFs::default();
        fs.dirs.lock().unwrap().insert("/tmp".to_string());
        fs.files
            .lock()
            .unwrap()
            .insert("/tmp/x".to_string(), b"0123456789ABCDEF".to_vec());
        Arc::new(fs)
    }

    fn new_handle(&self, state: HandleState) -> Vec<u8> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = id.to_be_bytes().to_vec();
        self.handles.lock().unwrap().insert(handle.clone(), state);
        handle
    }

    fn file_path(&self, handle: &[u8]) -> Result<String, StatusError> {
        match self.handles.lock().unwrap().get(handle) {
            Some(HandleState::File(path)) => Ok(path.clone()),
            _ => Err(StatusError::new(
                crate::sftp::SSH_FX_FAILURE,
                "Invalid handle",
            )),
        }
    }

    fn attrs_of(&self, path: &str) -> Result<Attrs, StatusError> {
        if let Some(data) = self.files.lock().unwrap().get(path) {
            return Ok(Attrs {
                kind: FileType::Regular,
                size: Some(data.len() as u64),
                perms: Some(0o644),
                ..Attrs::default()
            });
        }
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(Attrs {
                kind: FileType::Directory,
                perms: Some(0o755),
                ..Attrs::default()
            });
        }
        Err(StatusError::no_such_file(path))
    }
}

#[async_trait]
impl SftpFileSystem for MemFs {
    async fn open(
        &self,
        path: &str,
        mode: OpenMode,
        _attrs: &Attrs,
    ) -> Result<Vec<u8>, StatusError> {
        let mut files = self.files.lock().unwrap();
        let exists = files.contains_key(path);
        if !exists {
            if !mode.contains(OpenMode::CREATE) {
                return Err(StatusError::no_such_file(path));
            }
            files.insert(path.to_string(), Vec::new());
        } else if mode.contains(OpenMode::EXCLUSIVE) {
            return Err(StatusError::new(
                crate::sftp::SSH_FX_FAILURE,
                format!("Already exists: {path}"),
            ));
        } else if mode.contains(OpenMode::TRUNCATE) {
            files.insert(path.to_string(), Vec::new());
        }
        drop(files);
        Ok(self.new_handle(HandleState::File(path.to_string())))
    }

    async fn close(&self, handle: &[u8]) -> Result<(), StatusError> {
        self.handles.lock().unwrap().remove(handle);
        Ok(())
    }

    async fn read(
        &self,
        handle: &[u8],
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StatusError> {
        let path = self.file_path(handle)?;
        let files = self.files.lock().unwrap();
        let data = files.get(&path).ok_or_else(|| StatusError::no_such_file(&path))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(None);
        }
        let end = (offset + len as usize).min(data.len());
        Ok(Some(data[offset..end].to_vec()))
    }

    async fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> Result<(), StatusError> {
        let path = self.file_path(handle)?;
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&path).ok_or_else(|| StatusError::no_such_file(&path))?;
        let offset = offset as usize;
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StatusError> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StatusError::no_such_file(path))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), StatusError> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .remove(old_path)
            .ok_or_else(|| StatusError::no_such_file(old_path))?;
        files.insert(new_path.to_string(), data);
        Ok(())
    }

    async fn mkdir(&self, path: &str, _attrs: &Attrs) -> Result<(), StatusError> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), StatusError> {
        if self.dirs.lock().unwrap().remove(path) {
            Ok(())
        } else {
            Err(StatusError::no_such_file(path))
        }
    }

    async fn opendir(&self, path: &str) -> Result<Vec<u8>, StatusError> {
        if !self.dirs.lock().unwrap().contains(path) {
            return Err(StatusError::no_such_file(path));
        }
        Ok(self.new_handle(HandleState::Dir {
            path: path.to_string(),
            done: false,
        }))
    }

    async fn readdir(&self, handle: &[u8]) -> Result<Option<Vec<DirEntry>>, StatusError> {
        let mut handles = self.handles.lock().unwrap();
        match handles.get_mut(handle) {
            Some(HandleState::Dir { path, done }) => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                let prefix = format!("{path}/");
                let files = self.files.lock().unwrap();
                let entries = files
                    .iter()
                    .filter(|(p, _)| {
                        p.starts_with(&prefix) && !p[prefix.len()..].contains('/')
                    })
                    .map(|(p, data)| DirEntry {
                        filename: p[prefix.len()..].to_string(),
                        longname: Some(format!("-rw-r--r-- {p}")),
                        attrs: Attrs {
                            kind: FileType::Regular,
                            size: Some(data.len() as u64),
                            ..Attrs::default()
                        },
                    })
                    .collect();
                Ok(Some(entries))
            }
            _ => Err(StatusError::new(
                crate::sftp::SSH_FX_FAILURE,
                "Invalid handle",
            )),
        }
    }

    async fn stat(&self, path: &str) -> Result<Attrs, StatusError> {
        self.attrs_of(path)
    }

    async fn fstat(&self, handle: &[u8]) -> Result<Attrs, StatusError> {
        let path = self.file_path(handle)?;
        self.attrs_of(&path)
    }

    async fn realpath(&self, path: &str) -> Result<String, StatusError> {
        if path.starts_with('/') {
            Ok(path.to_string())
        } else {
            Ok(format!("/{path}"))
        }
    }

    async fn readlink(&self, path: &str) -> Result<String, StatusError> {
        self.links
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StatusError::no_such_file(path))
    }

    async fn link(
        &self,
        link_path: &str,
        target_path: &str,
        symbolic: bool,
    ) -> Result<(), StatusError> {
        if symbolic {
            self.links
                .lock()
                .unwrap()
                .insert(link_path.to_string(), target_path.to_string());
            Ok(())
        } else {
            let mut files = self.files.lock().unwrap();
            let data = files
                .get(target_path)
                .cloned()
                .ok_or_else(|| StatusError::no_such_file(target_path))?;
            files.insert(link_path.to_string(), data);
            Ok(())
        }
    }
}

/// Server-side session factory: waits for the `sftp` subsystem request
/// and hands the channel over to the subsystem.
struct SftpSession {
    fs: Arc<MemFs>,
    max_version: u32,
}

#[async_trait]
impl ChannelFactory for SftpSession {
    fn name(&self) -> &str {
        "session"
    }

    async fn open(
        &self,
        channel: Arc<Channel>,
        mut msgs: UnboundedReceiver<ChannelMsg>,
        _extra: &mut Buffer,
    ) -> Result<(), OpenChannelError> {
        let fs = Arc::clone(&self.fs);
        let max_version = self.max_version;
        tokio::spawn(async move {
            while let Some(msg) = msgs.recv().await {
                match msg {
                    ChannelMsg::RequestSubsystem { name, .. } if name == SFTP_SUBSYSTEM => {
                        let subsystem =
                            SftpSubsystem::with_max_version(Arc::clone(&channel), fs, max_version);
                        let _ = subsystem.run(msgs).await;
                        return;
                    }
                    ChannelMsg::Close => return,
                    _ => {}
                }
            }
        });
        Ok(())
    }
}

async fn sftp_client(max_server_version: u32) -> (SftpClient, Arc<MemFs>) {
    let fs = MemFs::seeded();
    let (server, client) = connection_pair(Config::default(), Config::default());
    server.service.lock().await.add_channel_factory(Arc::new(SftpSession {
        fs: Arc::clone(&fs),
        max_version: max_server_version,
    }));

    let (channel, msgs) = client.service.lock().await.open_session().unwrap();
    channel
        .wait_for(ChannelEvent::OPENED, Some(Duration::from_secs(5)))
        .await;
    channel.request_subsystem(true, SFTP_SUBSYSTEM).unwrap();
    let sftp = SftpClient::new(channel, msgs).await.unwrap();
    (sftp, fs)
}

#[tokio::test]
async fn open_read_close_v6() {
    let (sftp, _fs) = sftp_client(6).await;
    assert_eq!(sftp.version(), 6);

    let handle = sftp.open("/tmp/x", OpenMode::READ).await.unwrap();
    let mut buf = [0u8; 16];
    let n = sftp.read(&handle, 0, &mut buf).await.unwrap();
    assert_eq!(n, Some(16));
    assert_eq!(&buf, b"0123456789ABCDEF");

    // Reading past the end surfaces FX_EOF as None, not an error.
    assert_eq!(sftp.read(&handle, 16, &mut buf).await.unwrap(), None);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn write_stat_rename_remove() {
    let (sftp, _fs) = sftp_client(6).await;

    let handle = sftp
        .open("/tmp/new", OpenMode::CREATE | OpenMode::WRITE)
        .await
        .unwrap();
    sftp.write(&handle, 0, b"hello").await.unwrap();
    let attrs = sftp.fstat(&handle).await.unwrap();
    assert_eq!(attrs.size, Some(5));
    assert!(attrs.is_regular());
    handle.close().await.unwrap();

    sftp.rename("/tmp/new", "/tmp/renamed").await.unwrap();
    assert_eq!(sftp.stat("/tmp/renamed").await.unwrap().size, Some(5));
    assert!(matches!(
        sftp.stat("/tmp/new").await,
        Err(Error::Sftp { status, .. }) if status == crate::sftp::SSH_FX_NO_SUCH_FILE
    ));
    sftp.remove("/tmp/renamed").await.unwrap();

    // Exclusive create of an existing path is refused.
    assert!(sftp
        .open("/tmp/x", OpenMode::CREATE | OpenMode::WRITE | OpenMode::EXCLUSIVE)
        .await
        .is_err());
}

#[tokio::test]
async fn readdir_iterates_then_ends() {
    let (sftp, _fs) = sftp_client(6).await;

    let dir = sftp.opendir("/tmp").await.unwrap();
    let entries = sftp.read_dir(&dir).await.unwrap().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "x");
    assert_eq!(entries[0].attrs.size, Some(16));
    // v4+ has no longname field.
    assert_eq!(entries[0].longname, None);

    assert!(sftp.read_dir(&dir).await.unwrap().is_none());
    dir.close().await.unwrap();
}

#[tokio::test]
async fn hardlink_requires_version_6() {
    let (sftp, fs) = sftp_client(6).await;
    sftp.link("/tmp/hard", "/tmp/x", false).await.unwrap();
    assert_eq!(
        fs.files.lock().unwrap().get("/tmp/hard").map(Vec::len),
        Some(16)
    );

    let (sftp, _fs) = sftp_client(3).await;
    assert_eq!(sftp.version(), 3);
    assert!(matches!(
        sftp.link("/tmp/hard", "/tmp/x", false).await,
        Err(Error::SftpVersion(3))
    ));
}

#[tokio::test]
async fn v3_negotiation_and_longnames() {
    let (sftp, _fs) = sftp_client(3).await;
    assert_eq!(sftp.version(), 3);

    // The v3 open path uses the classic pflags bitmask.
    let handle = sftp.open("/tmp/x", OpenMode::READ).await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(sftp.read(&handle, 0, &mut buf).await.unwrap(), Some(8));
    assert_eq!(&buf, b"01234567");
    handle.close().await.unwrap();

    // v3 NAME replies carry the ls -l style longname.
    let dir = sftp.opendir("/tmp").await.unwrap();
    let entries = sftp.read_dir(&dir).await.unwrap().unwrap();
    assert_eq!(entries[0].longname.as_deref(), Some("-rw-r--r-- /tmp/x"));
    dir.close().await.unwrap();

    // Symlinks still work below v6.
    sftp.symlink("/tmp/lnk", "/tmp/x").await.unwrap();
    assert_eq!(sftp.readlink("/tmp/lnk").await.unwrap(), "/tmp/x");

    // setstat is not implemented by this backend.
    assert!(matches!(
        sftp.setstat("/tmp/x", &Attrs::default()).await,
        Err(Error::Sftp { status, .. }) if status == SSH_FX_OP_UNSUPPORTED
    ));
}

/// A client over a bare channel with no subsystem behind it: the
/// returned task answers `INIT` with `server_version` and the next
/// request with `FX_OK`, handing back that request's type and raw body
/// so tests can assert the literal bytes on the wire.
async fn raw_client(
    server_version: u32,
) -> (SftpClient, tokio::task::JoinHandle<(u8, Buffer)>) {
    let _ = env_logger::try_init();
    let (session, mut out) = SessionHandle::new();
    let (channel, msgs) = Channel::server(ChannelId(0), 0, 1 << 21, 32768, session, 1 << 21, 32768);
    channel.confirm_local();

    let responder_channel = Arc::clone(&channel);
    let responder = tokio::spawn(async move {
        let mut frames = FrameBuffer::default();
        loop {
            let packet = out.recv().await.expect("client hung up");
            let payload = packet.payload().to_vec();
            let mut buf = Buffer::from_slice(&payload);
            if buf.get_u8().unwrap() != msg::CHANNEL_DATA {
                continue;
            }
            let _recipient = buf.get_u32().unwrap();
            frames.push(&buf.get_string().unwrap());
            while let Some(mut frame) = frames.next_frame() {
                let typ = frame.get_u8().unwrap();
                if typ == SSH_FXP_INIT {
                    let mut reply = Buffer::new();
                    reply.put_u32(5);
                    reply.put_u8(SSH_FXP_VERSION);
                    reply.put_u32(server_version);
                    responder_channel.handle_data(reply.payload().to_vec()).unwrap();
                    continue;
                }
                let id = frame.get_u32().unwrap();
                let mut reply = Buffer::new();
                reply.put_u32(0);
                reply.put_u8(SSH_FXP_STATUS);
                reply.put_u32(id);
                reply.put_u32(SSH_FX_OK);
                reply.put_str("Success");
                reply.put_str("en");
                let len = (reply.wpos() - 4) as u32;
                reply.patch_u32(0, len).unwrap();
                responder_channel.handle_data(reply.payload().to_vec()).unwrap();
                return (typ, frame);
            }
        }
    });

    let client = SftpClient::new(channel, msgs).await.unwrap();
    assert_eq!(client.version(), server_version);
    (client, responder)
}

#[tokio::test]
async fn symlink_wire_order_is_target_then_link() {
    let (sftp, responder) = raw_client(3).await;
    sftp.symlink("/tmp/lnk", "/tmp/x").await.unwrap();

    let (typ, mut frame) = responder.await.unwrap();
    assert_eq!(typ, SSH_FXP_SYMLINK);
    // OpenSSH's sftp-server reads the target before the link name.
    assert_eq!(frame.get_str().unwrap(), "/tmp/x");
    assert_eq!(frame.get_str().unwrap(), "/tmp/lnk");
    assert_eq!(frame.available(), 0);
}

#[tokio::test]
async fn hardlink_wire_order_is_target_then_link() {
    let (sftp, responder) = raw_client(6).await;
    sftp.link("/tmp/lnk", "/tmp/x", false).await.unwrap();

    let (typ, mut frame) = responder.await.unwrap();
    assert_eq!(typ, SSH_FXP_LINK);
    assert_eq!(frame.get_str().unwrap(), "/tmp/x");
    assert_eq!(frame.get_str().unwrap(), "/tmp/lnk");
    assert!(!frame.get_bool().unwrap());
    assert_eq!(frame.available(), 0);
}

#[tokio::test]
async fn realpath_normalizes() {
    let (sftp, _fs) = sftp_client(6).await;
    assert_eq!(sftp.realpath("tmp/x").await.unwrap(), "/tmp/x");
    sftp.mkdir("/tmp/sub", &Attrs::default()).await.unwrap();
    sftp.rmdir("/tmp/sub").await.unwrap();
}
