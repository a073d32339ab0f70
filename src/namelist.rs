//! SSH comma separated name lists.
//!
//! Wire format is "name-list" from [RFC4251](https://tools.ietf.org/html/rfc4251) section 5.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use ascii::{AsciiChar::Comma, AsciiStr};

use crate::*;
use heapless::Vec;
use sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireResult};

/// Max count of [`LocalNames`] entries.
///
/// Kex has the most: curve25519-sha256 and its libssh.org alias.
pub const MAX_LOCAL_NAMES: usize = 4;

/// A name list received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNames<'a>(pub &'a AsciiStr);

/// Our own preference ordered list of names. Can only be encoded.
///
/// Deliberately `'static` since it should only come from the hardcoded
/// `SSH_NAME_*` strings in [`crate::sshnames`].
#[derive(Debug, Default, Clone)]
pub struct LocalNames(pub Vec<&'static str, MAX_LOCAL_NAMES>);

/// Either form, as carried in packets. Decoding always gives `Remote`.
#[derive(Debug, Clone)]
pub enum NameList<'a> {
    Remote(RemoteNames<'a>),
    Local(&'a LocalNames),
}

impl<'de: 'a, 'a> SSHDecode<'de> for NameList<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(NameList::Remote(SSHDecode::dec(s)?))
    }
}

impl SSHEncode for NameList<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            NameList::Remote(r) => r.enc(s),
            NameList::Local(l) => l.enc(s),
        }
    }
}

impl<'a> From<&'a LocalNames> for NameList<'a> {
    fn from(l: &'a LocalNames) -> Self {
        NameList::Local(l)
    }
}

impl<'a> NameList<'a> {
    /// Returns the list as received from the peer.
    ///
    /// Fails if called on a `Local` list.
    pub fn remote(&self) -> Result<&RemoteNames<'a>> {
        match self {
            NameList::Remote(r) => Ok(r),
            NameList::Local(_) => Err(Error::bug()),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            NameList::Remote(r) => r.0.to_string(),
            NameList::Local(l) => l.0.join(","),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for RemoteNames<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(Self(SSHDecode::dec(s)?))
    }
}

impl SSHEncode for RemoteNames<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.0.enc(s)
    }
}

/// Serialize the list of names with comma separators
impl SSHEncode for LocalNames {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let names = self.0.as_slice();
        let strlen = names.iter().map(|n| n.len()).sum::<usize>()
            + names.len().saturating_sub(1);
        (strlen as u32).enc(s)?;
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                b','.enc(s)?;
            }
            n.as_bytes().enc(s)?;
        }
        Ok(())
    }
}

impl<'a> TryFrom<&'a str> for RemoteNames<'a> {
    type Error = Error;
    fn try_from(s: &'a str) -> Result<Self> {
        Ok(Self(AsciiStr::from_ascii(s).map_err(|_| Error::BadName)?))
    }
}

impl TryFrom<&[&'static str]> for LocalNames {
    type Error = Error;
    fn try_from(s: &[&'static str]) -> Result<Self> {
        Ok(Self(Vec::from_slice(s).map_err(|_| Error::NoRoom)?))
    }
}

impl<'a> RemoteNames<'a> {
    /// Returns the negotiated name, or `None` if nothing is shared.
    ///
    /// The client's list decides priority. `self` is the peer's list,
    /// `ours` is our own list in preference order.
    pub fn first_match(&self, is_client: bool, ours: &LocalNames) -> Option<&'static str> {
        if is_client {
            ours.0.iter().find(|o| self.has_algo(o)).copied()
        } else {
            self.0
                .split(Comma)
                .find_map(|n| ours.0.iter().find(|o| n.as_str() == **o).copied())
        }
    }

    /// Returns whether `algo` is contained in this list
    pub fn has_algo(&self, algo: &str) -> bool {
        self.0.split(Comma).any(|a| a.as_str() == algo)
    }

    /// Returns the first name in the list, or `""` if the list is empty.
    pub fn first(&self) -> &'a str {
        self.0.split(Comma).next().map(|a| a.as_str()).unwrap_or("")
    }
}

impl LocalNames {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn first(&self) -> &'static str {
        self.0.first().copied().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use crate::namelist::*;
    use crate::sshwire::write_ssh_vec;

    #[test]
    fn client_priority() {
        let r1 = RemoteNames::try_from("rho,cog").unwrap();
        let r2 = RemoteNames::try_from("woe").unwrap();
        let l1 = LocalNames::try_from(["rho", "cog"].as_slice()).unwrap();
        let l2 = LocalNames::try_from(["cog", "rho"].as_slice()).unwrap();
        let l3 = LocalNames::try_from(["now", "woe"].as_slice()).unwrap();
        assert_eq!(r1.first_match(true, &l1), Some("rho"));
        assert_eq!(r1.first_match(false, &l1), Some("rho"));
        assert_eq!(r1.first_match(true, &l2), Some("cog"));
        assert_eq!(r1.first_match(false, &l2), Some("rho"));
        assert_eq!(r2.first_match(false, &l1), None);
        assert_eq!(r2.first_match(true, &l3), Some("woe"));
        assert_eq!(r2.first_match(false, &l3), Some("woe"));
    }

    #[test]
    fn localnames_serialize() {
        let tests: [&[&'static str]; 4] =
            [&["aes256-ctr", "x", "boo"], &[], &["one"], &["", "2"]];
        for t in tests {
            let n = LocalNames::try_from(t).unwrap();
            let buf = write_ssh_vec(&n).unwrap();
            assert_eq!(buf[..4], ((buf.len() - 4) as u32).to_be_bytes());
            assert_eq!(core::str::from_utf8(&buf[4..]).unwrap(), t.join(","));
        }
    }

    #[test]
    fn has_algo() {
        fn n(list: &str, has: &str) -> bool {
            RemoteNames::try_from(list).unwrap().has_algo(has)
        }
        assert!(n("", ""));
        assert!(!n("", "one"));
        assert!(!n("zzz", "zz"));
        assert!(!n("zz,more", "zzz"));
        assert!(n("zzz,boo", "boo"));
    }

    #[test]
    fn first() {
        assert_eq!(RemoteNames::try_from("a,b").unwrap().first(), "a");
        assert_eq!(RemoteNames::try_from("").unwrap().first(), "");
        assert_eq!(LocalNames::new().first(), "");
    }

    #[test]
    fn max_size() {
        let s = vec!["one"; MAX_LOCAL_NAMES + 1];
        let e = LocalNames::try_from(s.as_slice()).unwrap_err();
        assert!(matches!(e, Error::NoRoom));
        LocalNames::try_from(&s[..MAX_LOCAL_NAMES]).unwrap();
    }
}
