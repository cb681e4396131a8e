use anyhow::Context;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tokio::runtime::Builder as TokioBuilder;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Synthetic telemetry workflow driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    streams: usize,
    #[arg(long, default_value_t = 200)]
    samples: usize,
    /// Nominal sample rate in Hz
    #[arg(long, default_value_t = 10.0)]
    rate: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Write the full run result as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.streams, args.samples, args.rate, args.seed)
    };

    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating runtime for the workflow")?;
    let runner = Runner::new(workflow_config);
    let result = runtime.block_on(runner.execute())?;

    for stream in &result.streams {
        println!(
            "{} -> generated {}, processed {}, failed {}, interpolated {}, aligned {}",
            stream.stream_id,
            stream.generated,
            stream.processed,
            stream.failed,
            stream.interpolated,
            stream.aligned
        );
    }
    if !result.rejected_streams.is_empty() {
        println!("rejected streams: {}", result.rejected_streams.join(", "));
    }
    println!(
        "live: {} samples, {} errors, {:.1} samples/s | fusion: {} samples, {} errors",
        result.live_metrics.total_processed,
        result.live_metrics.total_errors,
        result.live_metrics.throughput,
        result.fusion_metrics.total_processed,
        result.fusion_metrics.total_errors
    );
    for bottleneck in result
        .live_metrics
        .bottlenecks
        .iter()
        .chain(&result.fusion_metrics.bottlenecks)
    {
        println!("bottleneck: {}", bottleneck);
    }

    if let Some(report_path) = args.report {
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let report = serde_json::to_string_pretty(&result).context("serializing run report")?;
        fs::write(&report_path, report)
            .with_context(|| format!("writing report {}", report_path.display()))?;
    }

    Ok(())
}
