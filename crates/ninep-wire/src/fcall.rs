//! 9P2000.L protocol data types and constants (spec.md §3, §6).

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000.L version string.
pub const P92000L: &str = "9P2000.L";

/// Version string returned by `Rversion` when the client's version string
/// is not `9P2000.L`.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Reserved tag value used by `Tversion`/`Rversion`.
pub const NOTAG: u16 = !0;

/// Sentinel `afid` meaning "no authentication fid".
pub const NOFID: u32 = !0;

/// Sentinel `n_uname` meaning "no uid specified".
pub const NONUNAME: u32 = !0;

/// Maximum number of `wname` elements in a single `Twalk` (spec.md §6).
pub const MAXWELEM: usize = 16;

bitflags! {
    #[derive(Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockType: u8 {
        const RDLCK = 0;
        const WRLCK = 1;
        const UNLCK = 2;
    }
}

bitflags! {
    #[derive(Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockFlag: u32 {
        const BLOCK   = 1;
        const RECLAIM = 2;
    }
}

bitflags! {
    #[derive(Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockStatus: u8 {
        const SUCCESS = 0;
        const BLOCKED = 1;
        const ERROR   = 2;
        const GRACE   = 3;
    }
}

bitflags! {
    /// Bits in `Qid.typ` (spec.md §3 / §6). Unlike the legacy 9P2000.u
    /// qid type, there is no mount bit here: mount-point crossing is
    /// tracked on the `Fid` (see `ninepd::fid::FidFlags::MOUNTPT`), not
    /// minted into the qid itself.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        const DIR     = 0x80;
        const APPEND  = 0x40;
        const EXCL    = 0x20;
        const AUTH    = 0x08;
        const TMP     = 0x04;
        const SYMLINK = 0x02;
        const FILE    = 0x00;
    }
}

impl From<std::fs::FileType> for QidType {
    fn from(typ: std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl From<&std::fs::FileType> for QidType {
    fn from(typ: &std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        let mut t = QidType::FILE;
        if typ.is_dir() {
            t.insert(QidType::DIR);
        }
        if typ.is_symlink() {
            t.insert(QidType::SYMLINK);
        }
        let _ = typ.is_socket(); // keep FileTypeExt import meaningful
        t
    }
}

bitflags! {
    /// Bits in `mask`/`valid` of `Tgetattr`/`Rgetattr` (spec.md §6).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct GetAttrMask: u64 {
        const MODE         = 0x0000_0001;
        const NLINK        = 0x0000_0002;
        const UID          = 0x0000_0004;
        const GID          = 0x0000_0008;
        const RDEV         = 0x0000_0010;
        const ATIME        = 0x0000_0020;
        const MTIME        = 0x0000_0040;
        const CTIME        = 0x0000_0080;
        const INO          = 0x0000_0100;
        const SIZE         = 0x0000_0200;
        const BLOCKS       = 0x0000_0400;
        const BTIME        = 0x0000_0800;
        const GEN          = 0x0000_1000;
        const DATA_VERSION = 0x0000_2000;
        const BASIC        = 0x0000_07ff;
        const ALL          = 0x0000_3fff;
    }
}

bitflags! {
    /// Bits in `valid` of `Tsetattr` (spec.md §6).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SetAttrMask: u32 {
        const MODE      = 0x0000_0001;
        const UID       = 0x0000_0002;
        const GID       = 0x0000_0004;
        const SIZE      = 0x0000_0008;
        const ATIME     = 0x0000_0010;
        const MTIME     = 0x0000_0020;
        const CTIME     = 0x0000_0040;
        const ATIME_SET = 0x0000_0080;
        const MTIME_SET = 0x0000_0100;
    }
}

/// Server-minted file identifier, stable across a session (spec.md §3).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub const WIRE_SIZE: usize = 1 + 4 + 8;
}

/// `struct statfs`-equivalent filesystem information (spec.md §6).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatFs {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// Seconds+nanoseconds timestamp, as used in `Rgetattr`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

/// `struct stat`-equivalent attribute set returned by `Rgetattr`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

/// Subset of attributes carried by `Tsetattr`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// One entry of a `Rreaddir` payload (spec.md §4.1).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub qid: Qid,
    pub offset: u64,
    pub typ: u8,
    pub name: String,
}

impl DirEntry {
    pub fn wire_size(&self) -> u32 {
        (Qid::WIRE_SIZE + 8 + 1 + 2 + self.name.len()) as u32
    }
}

/// A sequence of directory entries, as assembled by `Treaddir` handlers.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntryData {
    pub data: Vec<DirEntry>,
}

impl DirEntryData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DirEntry) {
        self.data.push(entry);
    }

    /// Total wire size of all entries (without the outer `count` prefix).
    pub fn byte_len(&self) -> u32 {
        self.data.iter().map(DirEntry::wire_size).sum()
    }
}

/// Raw byte payload used by `Tread`/`Rread`/`Twrite`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// BSD-`flock`-style whole file lock request (`Tlock`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Flock {
    pub typ: LockType,
    pub flags: LockFlag,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

/// Lock query used by `Tgetlock`/`Rgetlock`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Getlock {
    pub typ: LockType,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

enum_from_primitive! {
    /// Wire message type, matching the full 9P2000.L `.L` set plus the
    /// legacy framing ops still carried on the 9P2000 base (spec.md §6).
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TlError      = 6, // illegal, never sent
        RlError,
        TStatFs      = 8,
        RStatFs,
        TlOpen       = 12,
        RlOpen,
        TlCreate     = 14,
        RlCreate,
        TSymlink     = 16,
        RSymlink,
        TMkNod       = 18,
        RMkNod,
        TRename      = 20,
        RRename,
        TReadLink    = 22,
        RReadLink,
        TGetAttr     = 24,
        RGetAttr,
        TSetAttr     = 26,
        RSetAttr,
        TxAttrWalk   = 30,
        RxAttrWalk,
        TxAttrCreate = 32,
        RxAttrCreate,
        TReadDir     = 40,
        RReadDir,
        TFSync       = 50,
        RFSync,
        TLock        = 52,
        RLock,
        TGetLock     = 54,
        RGetLock,
        TLink        = 70,
        RLink,
        TMkDir       = 72,
        RMkDir,
        TRenameAt    = 74,
        RRenameAt,
        TUnlinkAt    = 76,
        RUnlinkAt,

        TVersion     = 100,
        RVersion,
        TAuth        = 102,
        RAuth,
        TAttach      = 104,
        RAttach,
        TFlush       = 108,
        RFlush,
        TWalk        = 110,
        RWalk,
        TRead        = 116,
        RRead,
        TWrite       = 118,
        RWrite,
        TClunk       = 120,
        RClunk,
        TRemove      = 122,
        RRemove,
    }
}

impl MsgType {
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            RlError
                | RStatFs
                | RlOpen
                | RlCreate
                | RSymlink
                | RMkNod
                | RRename
                | RReadLink
                | RGetAttr
                | RSetAttr
                | RxAttrWalk
                | RxAttrCreate
                | RReadDir
                | RFSync
                | RLock
                | RGetLock
                | RLink
                | RMkDir
                | RRenameAt
                | RUnlinkAt
                | RVersion
                | RAuth
                | RAttach
                | RFlush
                | RWalk
                | RRead
                | RWrite
                | RClunk
                | RRemove
        )
    }
}

impl From<&Fcall> for MsgType {
    fn from(fcall: &Fcall) -> MsgType {
        match *fcall {
            Fcall::RlError { .. } => MsgType::RlError,
            Fcall::TStatFs { .. } => MsgType::TStatFs,
            Fcall::RStatFs { .. } => MsgType::RStatFs,
            Fcall::TlOpen { .. } => MsgType::TlOpen,
            Fcall::RlOpen { .. } => MsgType::RlOpen,
            Fcall::TlCreate { .. } => MsgType::TlCreate,
            Fcall::RlCreate { .. } => MsgType::RlCreate,
            Fcall::TSymlink { .. } => MsgType::TSymlink,
            Fcall::RSymlink { .. } => MsgType::RSymlink,
            Fcall::TMkNod { .. } => MsgType::TMkNod,
            Fcall::RMkNod { .. } => MsgType::RMkNod,
            Fcall::TRename { .. } => MsgType::TRename,
            Fcall::RRename => MsgType::RRename,
            Fcall::TReadLink { .. } => MsgType::TReadLink,
            Fcall::RReadLink { .. } => MsgType::RReadLink,
            Fcall::TGetAttr { .. } => MsgType::TGetAttr,
            Fcall::RGetAttr { .. } => MsgType::RGetAttr,
            Fcall::TSetAttr { .. } => MsgType::TSetAttr,
            Fcall::RSetAttr => MsgType::RSetAttr,
            Fcall::TxAttrWalk { .. } => MsgType::TxAttrWalk,
            Fcall::RxAttrWalk { .. } => MsgType::RxAttrWalk,
            Fcall::TxAttrCreate { .. } => MsgType::TxAttrCreate,
            Fcall::RxAttrCreate => MsgType::RxAttrCreate,
            Fcall::TReadDir { .. } => MsgType::TReadDir,
            Fcall::RReadDir { .. } => MsgType::RReadDir,
            Fcall::TFSync { .. } => MsgType::TFSync,
            Fcall::RFSync => MsgType::RFSync,
            Fcall::TLock { .. } => MsgType::TLock,
            Fcall::RLock { .. } => MsgType::RLock,
            Fcall::TGetLock { .. } => MsgType::TGetLock,
            Fcall::RGetLock { .. } => MsgType::RGetLock,
            Fcall::TLink { .. } => MsgType::TLink,
            Fcall::RLink => MsgType::RLink,
            Fcall::TMkDir { .. } => MsgType::TMkDir,
            Fcall::RMkDir { .. } => MsgType::RMkDir,
            Fcall::TRenameAt { .. } => MsgType::TRenameAt,
            Fcall::RRenameAt => MsgType::RRenameAt,
            Fcall::TUnlinkAt { .. } => MsgType::TUnlinkAt,
            Fcall::RUnlinkAt => MsgType::RUnlinkAt,
            Fcall::TAuth { .. } => MsgType::TAuth,
            Fcall::RAuth { .. } => MsgType::RAuth,
            Fcall::TAttach { .. } => MsgType::TAttach,
            Fcall::RAttach { .. } => MsgType::RAttach,
            Fcall::TVersion { .. } => MsgType::TVersion,
            Fcall::RVersion { .. } => MsgType::RVersion,
            Fcall::TFlush { .. } => MsgType::TFlush,
            Fcall::RFlush => MsgType::RFlush,
            Fcall::TWalk { .. } => MsgType::TWalk,
            Fcall::RWalk { .. } => MsgType::RWalk,
            Fcall::TRead { .. } => MsgType::TRead,
            Fcall::RRead { .. } => MsgType::RRead,
            Fcall::TWrite { .. } => MsgType::TWrite,
            Fcall::RWrite { .. } => MsgType::RWrite,
            Fcall::TClunk { .. } => MsgType::TClunk,
            Fcall::RClunk => MsgType::RClunk,
            Fcall::TRemove { .. } => MsgType::TRemove,
            Fcall::RRemove => MsgType::RRemove,
        }
    }
}

/// The full set of 9P2000.L messages this server speaks (spec.md §6).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    RlError { ecode: u32 },
    TStatFs { fid: u32 },
    RStatFs { statfs: StatFs },
    TlOpen { fid: u32, flags: u32 },
    RlOpen { qid: Qid, iounit: u32 },
    TlCreate { fid: u32, name: String, flags: u32, mode: u32, gid: u32 },
    RlCreate { qid: Qid, iounit: u32 },
    TSymlink { fid: u32, name: String, symtgt: String, gid: u32 },
    RSymlink { qid: Qid },
    TMkNod { dfid: u32, name: String, mode: u32, major: u32, minor: u32, gid: u32 },
    RMkNod { qid: Qid },
    TRename { fid: u32, dfid: u32, name: String },
    RRename,
    TReadLink { fid: u32 },
    RReadLink { target: String },
    TGetAttr { fid: u32, req_mask: GetAttrMask },
    RGetAttr { valid: GetAttrMask, qid: Qid, stat: Stat },
    TSetAttr { fid: u32, valid: SetAttrMask, stat: SetAttr },
    RSetAttr,
    TxAttrWalk { fid: u32, newfid: u32, name: String },
    RxAttrWalk { size: u64 },
    TxAttrCreate { fid: u32, name: String, attr_size: u64, flags: u32 },
    RxAttrCreate,
    TReadDir { fid: u32, offset: u64, count: u32 },
    RReadDir { data: DirEntryData },
    TFSync { fid: u32 },
    RFSync,
    TLock { fid: u32, flock: Flock },
    RLock { status: LockStatus },
    TGetLock { fid: u32, flock: Getlock },
    RGetLock { flock: Getlock },
    TLink { dfid: u32, fid: u32, name: String },
    RLink,
    TMkDir { dfid: u32, name: String, mode: u32, gid: u32 },
    RMkDir { qid: Qid },
    TRenameAt { olddirfid: u32, oldname: String, newdirfid: u32, newname: String },
    RRenameAt,
    TUnlinkAt { dirfd: u32, name: String, flags: u32 },
    RUnlinkAt,
    TAuth { afid: u32, uname: String, aname: String, n_uname: u32 },
    RAuth { aqid: Qid },
    TAttach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 },
    RAttach { qid: Qid },
    TVersion { msize: u32, version: String },
    RVersion { msize: u32, version: String },
    TFlush { oldtag: u16 },
    RFlush,
    TWalk { fid: u32, newfid: u32, wnames: Vec<String> },
    RWalk { wqids: Vec<Qid> },
    TRead { fid: u32, offset: u64, count: u32 },
    RRead { data: Data },
    TWrite { fid: u32, offset: u64, data: Data },
    RWrite { count: u32 },
    TClunk { fid: u32 },
    RClunk,
    TRemove { fid: u32 },
    RRemove,
}

impl Fcall {
    /// Fids this message references, in preprocessing order (spec.md §9
    /// "Preprocess": fid, dfid, afid, olddirfid, dirfid).
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            Fcall::TStatFs { fid } => vec![fid],
            Fcall::TlOpen { fid, .. } => vec![fid],
            Fcall::TlCreate { fid, .. } => vec![fid],
            Fcall::TSymlink { fid, .. } => vec![fid],
            Fcall::TMkNod { dfid, .. } => vec![dfid],
            Fcall::TRename { fid, dfid, .. } => vec![fid, dfid],
            Fcall::TReadLink { fid } => vec![fid],
            Fcall::TGetAttr { fid, .. } => vec![fid],
            Fcall::TSetAttr { fid, .. } => vec![fid],
            Fcall::TxAttrWalk { fid, .. } => vec![fid],
            Fcall::TxAttrCreate { fid, .. } => vec![fid],
            Fcall::TReadDir { fid, .. } => vec![fid],
            Fcall::TFSync { fid, .. } => vec![fid],
            Fcall::TLock { fid, .. } => vec![fid],
            Fcall::TGetLock { fid, .. } => vec![fid],
            Fcall::TLink { dfid, fid, .. } => vec![dfid, fid],
            Fcall::TMkDir { dfid, .. } => vec![dfid],
            Fcall::TRenameAt { olddirfid, newdirfid, .. } => vec![olddirfid, newdirfid],
            Fcall::TUnlinkAt { dirfd, .. } => vec![dirfd],
            Fcall::TAttach { afid, .. } if afid != NOFID => vec![afid],
            Fcall::TWalk { fid, .. } => vec![fid],
            Fcall::TRead { fid, .. } => vec![fid],
            Fcall::TWrite { fid, .. } => vec![fid],
            Fcall::TClunk { fid } => vec![fid],
            Fcall::TRemove { fid } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// The `newfid`/`afid`/`fid` a message *creates* rather than references,
    /// if any (spec.md §4.7: Tauth/Tattach special-case fresh fid creation).
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            Fcall::TxAttrWalk { newfid, .. } => Some(newfid),
            Fcall::TAuth { afid, .. } => Some(afid),
            Fcall::TAttach { fid, .. } => Some(fid),
            Fcall::TWalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }
}

/// Envelope for every 9P message: a client-chosen `tag` plus the body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: Fcall,
}
