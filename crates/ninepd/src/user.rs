//! User identity lookup and cache (spec.md §3 "User", §5 "Timeouts").
//!
//! Grounded on `examples/original_source/src/libnpfs/user-linux.c`: the
//! original keeps a uid/uname-keyed cache of `Npuser` records with
//! supplementary group lists resolved once per lookup. Here the platform
//! passwd lookup is `nix::unistd::User`; supplementary groups come from
//! `libc::getgrouplist`, the same call the C implementation uses under
//! the hood via `initgroups(3)`.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{errno, Error, Result};

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct UserInner {
    pub uname: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

/// Refcounted, cacheable user identity (spec.md §3 "User").
#[derive(Clone, Debug)]
pub struct User(Arc<UserInner>);

impl User {
    pub fn uname(&self) -> &str {
        &self.0.uname
    }
    pub fn uid(&self) -> u32 {
        self.0.uid
    }
    pub fn gid(&self) -> u32 {
        self.0.gid
    }
    pub fn groups(&self) -> &[u32] {
        &self.0.groups
    }

    /// A user synthesized when there is no passwd database to consult
    /// (spec.md §3: "no user DB" mode): gid equals uid, sole supplementary
    /// group is itself.
    pub fn synthesize(uid: u32, uname: &str) -> User {
        User(Arc::new(UserInner {
            uname: uname.to_owned(),
            uid,
            gid: uid,
            groups: vec![uid],
        }))
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.0.uid == other.0.uid
    }
}

enum Key {
    Uid(u32),
    Name(String),
}

struct Entry {
    user: User,
    expires: Instant,
}

/// Server-wide user cache, 60-second TTL (spec.md §3, §5).
pub struct UserCache {
    by_uid: Mutex<HashMap<u32, Entry>>,
    by_name: Mutex<HashMap<String, Entry>>,
    no_user_db: bool,
}

impl UserCache {
    pub fn new(no_user_db: bool) -> Self {
        UserCache {
            by_uid: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            no_user_db,
        }
    }

    pub fn by_uid(&self, uid: u32) -> Result<User> {
        if let Some(u) = self.lookup_cached(Key::Uid(uid)) {
            return Ok(u);
        }
        let user = self.resolve_uid(uid)?;
        self.insert(user.clone());
        Ok(user)
    }

    pub fn by_name(&self, name: &str) -> Result<User> {
        if let Some(u) = self.lookup_cached(Key::Name(name.to_owned())) {
            return Ok(u);
        }
        let user = self.resolve_name(name)?;
        self.insert(user.clone());
        Ok(user)
    }

    fn lookup_cached(&self, key: Key) -> Option<User> {
        let now = Instant::now();
        match key {
            Key::Uid(uid) => {
                let mut map = self.by_uid.lock().unwrap();
                match map.get(&uid) {
                    Some(e) if e.expires > now => Some(e.user.clone()),
                    Some(_) => {
                        map.remove(&uid);
                        None
                    }
                    None => None,
                }
            }
            Key::Name(name) => {
                let mut map = self.by_name.lock().unwrap();
                match map.get(&name) {
                    Some(e) if e.expires > now => Some(e.user.clone()),
                    Some(_) => {
                        map.remove(&name);
                        None
                    }
                    None => None,
                }
            }
        }
    }

    fn insert(&self, user: User) {
        let expires = Instant::now() + CACHE_TTL;
        self.by_uid.lock().unwrap().insert(
            user.uid(),
            Entry {
                user: user.clone(),
                expires,
            },
        );
        self.by_name.lock().unwrap().insert(
            user.uname().to_owned(),
            Entry { user, expires },
        );
    }

    fn resolve_uid(&self, uid: u32) -> Result<User> {
        if self.no_user_db {
            return Ok(User::synthesize(uid, &uid.to_string()));
        }
        match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map_err(crate::error::from_nix)?
        {
            Some(pw) => Ok(build_user(pw)),
            None => Err(Error::No(errno::EPERM)),
        }
    }

    fn resolve_name(&self, name: &str) -> Result<User> {
        if self.no_user_db {
            let uid: u32 = name.parse().map_err(|_| Error::No(errno::EPERM))?;
            return Ok(User::synthesize(uid, name));
        }
        match nix::unistd::User::from_name(name).map_err(crate::error::from_nix)? {
            Some(pw) => Ok(build_user(pw)),
            None => Err(Error::No(errno::EPERM)),
        }
    }
}

fn build_user(pw: nix::unistd::User) -> User {
    let uid = pw.uid.as_raw();
    let gid = pw.gid.as_raw();
    let groups = supplementary_groups(&pw.name, gid).unwrap_or_else(|| vec![gid]);
    User(Arc::new(UserInner {
        uname: pw.name,
        uid,
        gid,
        groups,
    }))
}

/// `getgrouplist(3)`: the same call `initgroups` uses, and the one the
/// original C implementation relies on to populate `Npuser.sg`.
fn supplementary_groups(uname: &str, gid: u32) -> Option<Vec<u32>> {
    let cname = CString::new(uname).ok()?;
    let mut ngroups: libc::c_int = 32;
    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; ngroups as usize];
        let mut count = ngroups;
        let rc = unsafe {
            libc::getgrouplist(
                cname.as_ptr(),
                gid as libc::gid_t,
                groups.as_mut_ptr(),
                &mut count,
            )
        };
        if rc >= 0 {
            groups.truncate(count as usize);
            return Some(groups.into_iter().map(|g| g as u32).collect());
        }
        if count <= ngroups {
            return None;
        }
        ngroups = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_user_is_self_grouped() {
        let u = User::synthesize(4242, "4242");
        assert_eq!(u.gid(), 4242);
        assert_eq!(u.groups(), &[4242]);
    }

    #[test]
    fn no_user_db_cache_roundtrips() {
        let cache = UserCache::new(true);
        let u = cache.by_uid(77).unwrap();
        assert_eq!(u.uid(), 77);
        assert_eq!(u.gid(), 77);
    }
}
