#[cfg(test)]
use simplelog::{self, LevelFilter, TestLogger};

pub use ::log::{debug, error, info, log, trace, warn};

/// Installs a `TestLogger` so that `cargo test` output includes crate logging.
///
/// May be called from every test, only the first call takes effect.
#[cfg(test)]
pub fn init_test_log() {
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("tokio")
        .add_filter_ignore_str("mio")
        .build();
    let _ = TestLogger::init(LevelFilter::Trace, conf);
}
