//! Submit a small shell job to a local farm.
//!
//! ```text
//! framefarm node --name render01 &
//! cargo run --example submit_job -- --frames 1-20 --command 'echo frame {frame}'
//! ```

use std::path::PathBuf;

use clap::Parser;
use serde_json::{Map, Value};

use framefarm::ingest::{DescriptorId, JobDescriptor};
use framefarm::scheduler::FrameRange;

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Drop a shell job into a framefarm drop directory")]
struct Args {
    /// Drop directory the coordinator scans
    #[arg(long, default_value = "dropbox")]
    drop_dir: PathBuf,

    /// Job name
    #[arg(long, default_value = "demo")]
    name: String,

    /// Frame range
    #[arg(long, default_value = "1-10")]
    frames: String,

    /// Command run once per frame; `{frame}` is replaced with the frame number
    #[arg(long, default_value = "sleep 1 && echo rendered {frame}")]
    command: String,

    /// Frames per allocation
    #[arg(long, default_value = "2")]
    allocation: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let range = FrameRange::parse(&args.frames)?;

    let mut parameters = Map::new();
    parameters.insert("command".into(), Value::String(args.command));

    let descriptor = JobDescriptor {
        name: args.name,
        purpose: "render".into(),
        kind: "shell".into(),
        metadata: Map::new(),
        range: args.frames,
        id: DescriptorId::Submitter("submit-job-demo".into()),
        environment: Map::new(),
        dependencies: Vec::new(),
        parameters,
        allocation: Some(args.allocation),
    };
    let path = descriptor.write_to(&args.drop_dir).await?;

    println!("Submitted {} frames in {}", range.frames().len(), path.display());
    Ok(())
}
