//! Artemis capture pipeline demo against the virtual board.

use std::sync::Arc;
use std::time::Duration;

use artemis::virt::{EpochPump, VirtHw, VirtProfile};
use artemis::{CaptureStream, StreamConfig};
use color_eyre::Result;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("artemis=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Artemis launching...");

    // Optional TOML overrides on top of the built-in defaults.
    let config = match config::Config::builder()
        .add_source(config::File::with_name("artemis").required(false))
        .build()
        .and_then(|c| c.try_deserialize::<StreamConfig>())
    {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(%err, "no usable artemis.toml, using defaults");
            StreamConfig::default()
        }
    };

    let hw = VirtHw::new(VirtProfile::default());
    let stream = Arc::new(CaptureStream::new(config, &hw.descriptor(), hw.pipeline_hw())?);

    stream.open()?;

    // Identity lookup table for the front-end sampling path.
    let mut lut = vec![0u8; artemis::pipeline::stages::LUT_LEN];
    for (i, chunk) in lut.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as u32).to_le_bytes());
    }
    stream.load_lut(&lut)?;

    let count = stream.request_buffers(4)?;
    for index in 0..count {
        stream.enqueue_buffer(index)?;
    }

    if let Err(err) = stream.start_streaming() {
        warn!(%err, "bring-up was degraded");
    }

    let pump = EpochPump::spawn(hw.clone(), stream.clone(), Duration::from_millis(33))?;
    let completions = stream.completions();

    let mut captured = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            frame = completions.recv_async() => {
                let Ok(frame) = frame else { break };
                info!(
                    index = frame.index,
                    sequence = frame.sequence,
                    state = ?frame.state,
                    "frame"
                );
                stream.enqueue_buffer(frame.index)?;
                captured += 1;
                if captured == 100 {
                    let alive = stream.transport_alive()?;
                    let snapshot = stream.snapshot_last_frame()?;
                    info!(alive, snapshot, "transport checkpoint");
                }
                if captured >= 300 {
                    break;
                }
            }
        }
    }

    pump.stop();
    if let Err(err) = stream.stop_streaming() {
        warn!(%err, "teardown was degraded");
    }
    let stats = stream.stats();
    info!(?stats, "final queue stats");
    stream.close();

    info!("Artemis shutting down");
    Ok(())
}
