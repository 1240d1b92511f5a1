mod headless;
mod record;

use anyhow::Result;
use marksync_engine::log_buffer::LogBuffer;
use std::sync::Arc;

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

/// Install the global subscriber. Records at INFO and above also go to `logs`.
pub(crate) fn set_up(options: &Options, logs: Arc<LogBuffer>) -> Result<()> {
    headless::set_up(options, logs)
}
