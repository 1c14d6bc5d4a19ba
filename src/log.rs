use once_cell::sync::OnceCell;
use slog::{Drain, Logger};
use slog_stdlog::StdLog;

static GLOBAL_LOGGER: OnceCell<Logger> = OnceCell::new();

fn with_version(root: &Logger) -> Logger { root.new(o!("firn_version" => crate::VERSION)) }

/// Process-wide root logger. Every engine and driver in this crate derives
/// its module logger from here.
pub struct GlobalLogger;

impl GlobalLogger {
    /// Get the global logger. The first call installs a `log` crate backed
    /// drain unless [`GlobalLogger::setup`] ran before.
    pub fn get() -> &'static Logger {
        GLOBAL_LOGGER.get_or_init(|| with_version(&Logger::root(StdLog.fuse(), o!())))
    }

    /// Install a custom root logger. Can only be called once and only before
    /// the first call to [`GlobalLogger::get`]. Returns `Err` with the
    /// rejected logger if a global logger is already set.
    pub fn setup(root: &Logger) -> Result<(), Logger> { GLOBAL_LOGGER.set(with_version(root)) }
}
