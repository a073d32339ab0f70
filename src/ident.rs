//! SSH version line exchange, RFC4253 section 4.2.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use heapless::Vec;

/// Sent by the client, without CR LF
pub const OUR_VERSION: &[u8] = b"SSH-2.0-ssh_probe_0.1";

const SSH_PREFIX: &[u8] = b"SSH-2.0-";

// RFC4253 4.2 says max length 255 incl CR LF.
const MAX_REMOTE_VERSION_LEN: usize = 253;
// Lines a server may send before its version
const MAX_LINES: usize = 50;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;

/// Writes our version line
pub fn our_version_line() -> std::vec::Vec<u8> {
    [OUR_VERSION, &[CR, LF]].concat()
}

/// Parses and stores the remote SSH version string
#[derive(Debug)]
pub struct RemoteVersion {
    storage: Vec<u8, MAX_REMOTE_VERSION_LEN>,
    st: VersPars,
    num_lines: usize,
}

/// Version parsing state.
///
/// We need to match `SSH-2.0-softwareversion SP comments CR LF`
/// at the start of a line. The server may first send other lines
/// which are discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
enum VersPars {
    /// Reading start of a line, before receiving a full SSH-2.0- prefix
    Start,
    /// Have a line that didn't start with SSH-2.0-, discarding until LF
    Discarding,
    /// Currently reading a SSH-2.0- string, waiting for ending CR
    FillSSH,
    /// Have ending CR after a version, waiting for ending LF
    HaveCR,
    Done,
}

impl Default for RemoteVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteVersion {
    pub fn new() -> Self {
        RemoteVersion { storage: Vec::new(), st: VersPars::Start, num_lines: 0 }
    }

    /// Returns the parsed version, without CR LF, once complete.
    pub fn version(&self) -> Option<&[u8]> {
        (self.st == VersPars::Done).then_some(self.storage.as_slice())
    }

    pub fn is_done(&self) -> bool {
        self.st == VersPars::Done
    }

    /// Reads the initial SSH stream to find the version string and returns
    /// the number of bytes consumed. Bytes after the version line are
    /// not consumed, they belong to the first binary packet.
    pub fn consume(&mut self, buf: &[u8]) -> Result<usize> {
        let mut taken = 0;
        for &b in buf {
            if self.st == VersPars::Done {
                break;
            }
            taken += 1;

            match self.st {
                VersPars::Start => {
                    self.storage.push(b).map_err(|_| Error::NoRoom)?;
                    let s = self.storage.as_slice();
                    if s == SSH_PREFIX {
                        self.st = VersPars::FillSSH
                    } else if !SSH_PREFIX.starts_with(s) {
                        self.st = VersPars::Discarding;
                        // might be the end of a short line
                        if b == LF {
                            self.next_line()?;
                        }
                    }
                }

                VersPars::Discarding => {
                    if b == LF {
                        self.next_line()?;
                    }
                }

                VersPars::FillSSH => match b {
                    CR => {
                        if !self.storage.is_ascii() {
                            return Err(Error::NotSSH);
                        }
                        self.st = VersPars::HaveCR;
                    }
                    LF => return Err(Error::NotSSH),
                    _ => {
                        self.storage.push(b).map_err(|_| Error::NotSSH)?;
                    }
                },

                VersPars::HaveCR => match b {
                    LF => {
                        self.st = VersPars::Done;
                        debug!("Remote version {:?}", String::from_utf8_lossy(&self.storage));
                    }
                    _ => return Err(Error::NotSSH),
                },

                VersPars::Done => (),
            }
        }
        Ok(taken)
    }

    fn next_line(&mut self) -> Result<()> {
        trace!("Discarding pre-version line");
        self.storage.clear();
        self.st = VersPars::Start;
        self.num_lines += 1;
        if self.num_lines > MAX_LINES {
            return Err(Error::NotSSH);
        }
        Ok(())
    }
}
