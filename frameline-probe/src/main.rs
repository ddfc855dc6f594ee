//! Frameline probe
//!
//! Opens a container, reports metadata and index statistics, and optionally
//! decodes individual frames. A diagnostic harness for the engine, not a
//! player.
//!
//! Usage:
//!   frameline-probe <file.mkv> [--fps N] [--frame I]... [--json]

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use frameline_core::{StreamConfig, VideoStream};
use tracing_subscriber::EnvFilter;

struct Args {
    path: String,
    target_fps: f64,
    frames: Vec<usize>,
    json: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    let mut target_fps = 30.0;
    let mut frames = Vec::new();
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fps" => {
                let value = args.next().context("--fps needs a value")?;
                target_fps = value.parse().context("--fps must be a number")?;
            }
            "--frame" => {
                let value = args.next().context("--frame needs an index")?;
                frames.push(value.parse().context("--frame must be an integer")?);
            }
            "--json" => json = true,
            other if path.is_none() => path = Some(other.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
    }

    let Some(path) = path else {
        bail!("usage: frameline-probe <file.mkv> [--fps N] [--frame I]... [--json]");
    };
    Ok(Args {
        path,
        target_fps,
        frames,
        json,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;
    let data = std::fs::read(&args.path)
        .with_context(|| format!("failed to read {}", args.path))?;
    tracing::info!(path = %args.path, bytes = data.len(), "opening container");

    let config = StreamConfig {
        target_fps: args.target_fps,
        ..StreamConfig::default()
    };
    let mut last_reported = -10.0f32;
    let stream = VideoStream::open_with_progress(Bytes::from(data), config, |percent| {
        if percent - last_reported >= 10.0 || percent >= 100.0 {
            tracing::info!(percent, "indexing");
            last_reported = percent;
        }
    })
    .await?;

    let metadata = stream.metadata().clone();
    let mut decoded = Vec::new();
    let mut failure = None;
    for &index in &args.frames {
        match stream.get_frame_at_index(index, false).await {
            Ok(Some(handle)) => {
                tracing::info!(
                    index,
                    pts = handle.pts(),
                    width = handle.width(),
                    height = handle.height(),
                    "frame decoded"
                );
                decoded.push((index, Some(handle.pts())));
            }
            Ok(None) => {
                tracing::warn!(index, "frame miss");
                decoded.push((index, None));
            }
            Err(e) => {
                failure = Some((index, e));
                break;
            }
        }
    }
    let stats = stream.stats();
    if let Some((index, e)) = failure {
        stream.cleanup();
        bail!("frame {index} failed: {e}");
    }

    if args.json {
        let report = serde_json::json!({
            "file": args.path,
            "metadata": metadata,
            "target_fps": args.target_fps,
            "frames": decoded
                .iter()
                .map(|(index, pts)| serde_json::json!({ "index": index, "pts": pts }))
                .collect::<Vec<_>>(),
            "cached": stats.cached,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", args.path);
        println!(
            "  {}x{}, {:.3} s, {} frames @ {} fps",
            metadata.width,
            metadata.height,
            metadata.duration_ms as f64 / 1000.0,
            metadata.frame_count,
            args.target_fps
        );
        for (index, pts) in &decoded {
            match pts {
                Some(pts) => println!("  frame {index}: pts {pts:.4}"),
                None => println!("  frame {index}: miss"),
            }
        }
    }

    stream.cleanup();
    Ok(())
}
