use super::record::RecordLayer;
use anyhow::Result;
use marksync_engine::log_buffer::LogBuffer;
use std::sync::Arc;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{format::FmtSpan, Layer as FmtLayer},
    layer::SubscriberExt as _,
    Layer as _, Registry,
};

pub(super) fn set_up(options: &super::Options, logs: Arc<LogBuffer>) -> Result<()> {
    let filter = if options.verbose {
        eprintln!("setting up verbose logging");
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let span_events = if options.verbose {
        // include enter/exit events for detailed tracing
        FmtSpan::FULL
    } else {
        // announce what we do and when we're done
        FmtSpan::NEW | FmtSpan::CLOSE
    };

    let fmt_layer = FmtLayer::new()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_ansi(options.color)
        .with_filter(filter);
    let record_layer = RecordLayer::new(logs).with_filter(LevelFilter::INFO);
    let subscriber = Registry::default().with(fmt_layer).with(record_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("failed to set up tracing: {}", e))?;

    Ok(())
}
