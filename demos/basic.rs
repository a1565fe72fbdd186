//! Basic usage examples for flowweld
//!
//! Run with: cargo run --example basic

use async_trait::async_trait;
use flowweld::prelude::*;

/// A processor that tags each word with its length
struct WordLength;

#[async_trait]
impl Processor<String> for WordLength {
    async fn run(&self, _cancel: CancellationToken, input: Receiver<String>, output: Sender<String>) {
        while let Some(word) = input.recv().await {
            let tagged = format!("{} ({})", word, word.len());
            if output.send(tagged).await.is_err() {
                return;
            }
        }
    }
}

/// Example 1: One source, one processor, ordered output
async fn simple_example() -> Result<()> {
    println!("=== Simple Number Processing ===");

    let mut pipeline = Pipeline::new(1000, 16)?;
    pipeline
        .register_source(IterSource::new(|| 1..11u64), 1)?
        .register_processor(MapProcessor::new(|x: u64| x * x), 1, 16)?;

    let sink = pipeline.sink();
    pipeline.run()?;

    while let Some(square) = sink.recv().await {
        println!("Square: {}", square);
    }
    pipeline.wait().await;

    println!();
    Ok(())
}

/// Example 2: Several sources fanning into worker pools
async fn fan_in_example() -> Result<()> {
    println!("=== Fan-in With Worker Pools ===");

    let config = PipelineConfig::default()
        .name("words")
        .rate_per_second(200)
        .queue_capacity(32);
    let mut pipeline = Pipeline::with_config(config)?;
    pipeline
        .register_source_named(
            "fruit",
            SharedIterSource::new(["apple", "banana", "cherry"].map(String::from)),
            2,
        )?
        .register_source_named(
            "trees",
            SharedIterSource::new(["oak", "birch", "maple", "willow"].map(String::from)),
            2,
        )?
        .register_processor_named("length", WordLength, 3, 32)?
        .register_processor_named("upper", MapProcessor::new(|w: String| w.to_uppercase()), 1, 32)?;

    let sink = pipeline.sink();
    pipeline.run()?;

    for word in sink.collect().await {
        println!("Word: {}", word);
    }
    pipeline.wait().await;

    println!("{:#?}", pipeline.stats());
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    simple_example().await?;
    fan_in_example().await?;
    Ok(())
}
