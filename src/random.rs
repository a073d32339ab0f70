#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

/// Fills `buf` from the operating system RNG.
///
/// Used for packet padding and the KEXINIT cookie.
pub fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    getrandom::getrandom(buf)
    .map_err(|e| {
        error!("RNG failed: {e}");
        Error::msg("RNG failed")
    })
}
