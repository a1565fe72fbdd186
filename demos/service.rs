//! A long-running pipeline that shuts down gracefully on SIGINT/SIGTERM.
//!
//! Run with: RUST_LOG=flowweld=debug,info cargo run --example service
//! then press ctrl-c.

use std::time::Duration;

use flowweld::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut pipeline = Pipeline::with_config(
        PipelineConfig::default()
            .name("service")
            .rate_per_second(20)
            .queue_capacity(100),
    )?;

    pipeline
        .register_source(
            |cancel: CancellationToken, output: Sender<u64>, limiter: RateLimiter| async move {
                let mut reading = 0u64;
                while limiter.admit(&cancel).await {
                    reading += 1;
                    if output.send(reading).await.is_err() {
                        return;
                    }
                }
            },
            4,
        )?
        .register_processor(
            |_cancel: CancellationToken, input: Receiver<u64>, output: Sender<u64>| async move {
                while let Some(reading) = input.recv().await {
                    // Simulated slow work; shutdown waits for it to drain.
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    if output.send(reading * 10).await.is_err() {
                        return;
                    }
                }
            },
            8,
            100,
        )?;

    let sink = pipeline.sink();
    let printer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(value) = sink.recv().await {
            count += 1;
            tracing::debug!(value, "sink");
        }
        count
    });

    pipeline.run()?;
    let monitor = pipeline.spawn_monitor(Duration::from_secs(1));

    let signal = pipeline.listen().await?;
    let delivered = printer.await.unwrap_or_default();
    monitor.abort();

    tracing::info!(?signal, delivered, "service exited");
    Ok(())
}
