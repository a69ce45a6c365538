//! The sparse SFTP attribute record and its two wire layouts: the v3
//! classic form and the v4+ form with a type byte, owner/group strings
//! and split timestamps.

use crate::{Buffer, Error};

use super::*;

/// File type, explicit in v4+ and derivable from the permission bits
/// under v3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Special,
    #[default]
    Unknown,
}

impl FileType {
    pub fn to_byte(self) -> u8 {
        match self {
            FileType::Regular => SSH_FILEXFER_TYPE_REGULAR,
            FileType::Directory => SSH_FILEXFER_TYPE_DIRECTORY,
            FileType::Symlink => SSH_FILEXFER_TYPE_SYMLINK,
            FileType::Special => SSH_FILEXFER_TYPE_SPECIAL,
            FileType::Unknown => SSH_FILEXFER_TYPE_UNKNOWN,
        }
    }

    pub fn from_byte(b: u8) -> FileType {
        match b {
            SSH_FILEXFER_TYPE_REGULAR => FileType::Regular,
            SSH_FILEXFER_TYPE_DIRECTORY => FileType::Directory,
            SSH_FILEXFER_TYPE_SYMLINK => FileType::Symlink,
            SSH_FILEXFER_TYPE_SPECIAL => FileType::Special,
            _ => FileType::Unknown,
        }
    }

    /// The `S_IF*` bits this type contributes to the permission field.
    fn perm_bits(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            _ => 0,
        }
    }
}

/// A timestamp in seconds, with optional sub-second precision (v4+
/// `SSH_FILEXFER_ATTR_SUBSECOND_TIMES`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanos: Option<u32>,
}

impl Timestamp {
    pub fn from_seconds(seconds: u64) -> Timestamp {
        Timestamp {
            seconds,
            nanos: None,
        }
    }
}

/// A sparse attribute record; `None` fields are absent from the wire.
///
/// Under v3 `uid_gid` and the `atime`/`mtime` pair are encodable;
/// under v4+ `owner_group`, the split times and the file type are. The
/// v4+ decoder folds the type byte into `perms` as `S_IF*` bits so
/// callers can test permissions uniformly across versions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attrs {
    pub kind: FileType,
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub owner_group: Option<(String, String)>,
    pub perms: Option<u32>,
    pub acl: Option<Vec<u8>>,
    pub atime: Option<Timestamp>,
    pub create_time: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
}

impl Attrs {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
            || self.perms.map(|p| p & S_IFDIR == S_IFDIR).unwrap_or(false)
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileType::Regular
            || self.perms.map(|p| p & S_IFREG == S_IFREG).unwrap_or(false)
    }

    fn subsecond_times(&self) -> bool {
        [self.atime, self.create_time, self.mtime]
            .iter()
            .any(|t| t.map(|t| t.nanos.is_some()).unwrap_or(false))
    }

    pub fn encode(&self, buf: &mut Buffer, version: u32) {
        if version == 3 {
            self.encode_v3(buf)
        } else {
            self.encode_v4(buf)
        }
    }

    fn encode_v3(&self, buf: &mut Buffer) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.perms.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(perms) = self.perms {
            buf.put_u32(perms);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime.seconds as u32);
            buf.put_u32(mtime.seconds as u32);
        }
    }

    fn encode_v4(&self, buf: &mut Buffer) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.owner_group.is_some() {
            flags |= SSH_FILEXFER_ATTR_OWNERGROUP;
        }
        if self.perms.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACCESSTIME;
        }
        if self.create_time.is_some() {
            flags |= SSH_FILEXFER_ATTR_CREATETIME;
        }
        if self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_MODIFYTIME;
        }
        if self.acl.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACL;
        }
        let subsecond = self.subsecond_times();
        if subsecond {
            flags |= SSH_FILEXFER_ATTR_SUBSECOND_TIMES;
        }
        buf.put_u32(flags);
        buf.put_u8(self.kind.to_byte());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((owner, group)) = &self.owner_group {
            buf.put_str(owner);
            buf.put_str(group);
        }
        if let Some(perms) = self.perms {
            buf.put_u32(perms);
        }
        for time in [self.atime, self.create_time, self.mtime].into_iter().flatten() {
            buf.put_u64(time.seconds);
            if subsecond {
                buf.put_u32(time.nanos.unwrap_or(0));
            }
        }
        if let Some(acl) = &self.acl {
            buf.put_string(acl);
        }
    }

    pub fn decode(buf: &mut Buffer, version: u32) -> Result<Attrs, Error> {
        if version == 3 {
            Self::decode_v3(buf)
        } else {
            Self::decode_v4(buf)
        }
    }

    fn decode_v3(buf: &mut Buffer) -> Result<Attrs, Error> {
        let flags = buf.get_u32()?;
        let mut attrs = Attrs::default();
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(buf.get_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid_gid = Some((buf.get_u32()?, buf.get_u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.perms = Some(buf.get_u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(Timestamp::from_seconds(u64::from(buf.get_u32()?)));
            attrs.mtime = Some(Timestamp::from_seconds(u64::from(buf.get_u32()?)));
        }
        Ok(attrs)
    }

    fn decode_v4(buf: &mut Buffer) -> Result<Attrs, Error> {
        let flags = buf.get_u32()?;
        let mut attrs = Attrs {
            kind: FileType::from_byte(buf.get_u8()?),
            ..Attrs::default()
        };
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(buf.get_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
            attrs.owner_group = Some((buf.get_str()?, buf.get_str()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.perms = Some(buf.get_u32()?);
        }
        // Fold the type byte into the permission bits so v3 and v4+
        // attributes can be inspected the same way.
        if attrs.kind.perm_bits() != 0 {
            attrs.perms = Some(attrs.perms.unwrap_or(0) | attrs.kind.perm_bits());
        }
        let subsecond = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;
        let mut read_time = |buf: &mut Buffer| -> Result<Timestamp, Error> {
            let seconds = buf.get_u64()?;
            let nanos = if subsecond { Some(buf.get_u32()?) } else { None };
            Ok(Timestamp { seconds, nanos })
        };
        if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
            attrs.atime = Some(read_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_CREATETIME != 0 {
            attrs.create_time = Some(read_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_MODIFYTIME != 0 {
            attrs.mtime = Some(read_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACL != 0 {
            attrs.acl = Some(buf.get_string()?);
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    fn fields(mask: u32, subsecond: bool) -> Attrs {
        let time = |s: u64| Timestamp {
            seconds: s,
            nanos: subsecond.then_some(500_000_000),
        };
        Attrs {
            kind: FileType::Regular,
            size: (mask & 1 != 0).then_some(42),
            uid_gid: (mask & 2 != 0).then_some((1000, 100)),
            owner_group: (mask & 2 != 0).then_some(("user".into(), "group".into())),
            perms: (mask & 4 != 0).then_some(0o644),
            acl: None,
            atime: (mask & 8 != 0).then(|| time(1)),
            create_time: (mask & 16 != 0).then(|| time(2)),
            mtime: (mask & 8 != 0).then(|| time(3)),
        }
    }

    #[test]
    fn v3_round_trips_every_flag_combination() {
        // v3 carries size, uid/gid, perms and the atime/mtime pair.
        for mask in 0..16u32 {
            let mut a = fields(mask, false);
            a.kind = FileType::Unknown;
            a.owner_group = None;
            a.create_time = None;
            let mut buf = Buffer::new();
            a.encode(&mut buf, 3);
            let back = Attrs::decode(&mut buf, 3).unwrap();
            assert_eq!(back, a, "mask {mask:#b}");
        }
    }

    #[test]
    fn v4_round_trips_every_flag_combination() {
        for version in [4, 5, 6] {
            for subsecond in [false, true] {
                for mask in 0..32u32 {
                    let mut a = fields(mask, subsecond);
                    a.uid_gid = None; // not expressible past v3
                    let mut buf = Buffer::new();
                    a.encode(&mut buf, version);
                    let mut back = Attrs::decode(&mut buf, version).unwrap();
                    // The decoder augments perms with the type bits.
                    assert_eq!(
                        back.perms,
                        Some(a.perms.unwrap_or(0) | S_IFREG),
                        "mask {mask:#b}"
                    );
                    back.perms = a.perms;
                    assert_eq!(back, a, "v{version} mask {mask:#b} subsecond {subsecond}");
                }
            }
        }
    }

    #[test]
    fn v4_type_byte_augments_permissions() {
        let dir = Attrs {
            kind: FileType::Directory,
            perms: Some(0o755),
            ..Attrs::default()
        };
        let mut buf = Buffer::new();
        dir.encode(&mut buf, 6);
        let back = Attrs::decode(&mut buf, 6).unwrap();
        assert!(back.is_dir());
        assert_eq!(back.perms, Some(0o755 | S_IFDIR));

        let link = Attrs {
            kind: FileType::Symlink,
            ..Attrs::default()
        };
        let mut buf = Buffer::new();
        link.encode(&mut buf, 4);
        let back = Attrs::decode(&mut buf, 4).unwrap();
        assert_eq!(back.perms, Some(S_IFLNK));
    }

    #[test]
    fn acl_blob_round_trips() {
        let a = Attrs {
            acl: Some(b"\x00\x00\x00\x01".to_vec()),
            ..Attrs::default()
        };
        let mut buf = Buffer::new();
        a.encode(&mut buf, 5);
        let back = Attrs::decode(&mut buf, 5).unwrap();
        assert_eq!(back.acl, a.acl);
    }
}
