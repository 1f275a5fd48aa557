use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use npc_trace_post::{ProfileConfig, parse_log_directory, report};

#[derive(Parser, Debug)]
#[command(about = "Summarize NPC simulator traces into JSON and a markdown report")]
struct Args {
    /// Directory holding the benchmark logs
    #[arg(short, long)]
    log_dir: PathBuf,

    /// Markdown template; the built-in one is used when omitted
    #[arg(short, long)]
    template: Option<PathBuf>,

    /// Relative paths resolve against the log directory
    #[arg(long, default_value = "summary.json")]
    out_json: PathBuf,

    #[arg(long, default_value = "report.md")]
    out_md: PathBuf,

    /// Cycles after a flush that a decode-blocked sample is attributed to it
    #[arg(long)]
    post_flush_window: Option<u64>,

    /// Pending replay sources at which rename counts as full
    #[arg(long)]
    replay_full_lanes: Option<u64>,

    /// PC / instruction hotspots kept per benchmark
    #[arg(long)]
    hotspots: Option<usize>,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> ProfileConfig {
        let mut config = ProfileConfig::default();
        if let Some(window) = self.post_flush_window {
            config.post_flush_window_cycles = window;
        }
        if let Some(lanes) = self.replay_full_lanes {
            config.pending_replay_full_lanes = lanes;
        }
        if let Some(limit) = self.hotspots {
            config.hotspot_limit = limit;
        }
        config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.log_dir.join(path)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = args.config();
    let summaries = parse_log_directory(&args.log_dir, &config)
        .with_context(|| format!("failed to scan {}", args.log_dir.display()))?;

    let out_json = args.resolve(&args.out_json);
    let mut writer = BufWriter::new(
        File::create(&out_json).with_context(|| format!("cannot create {}", out_json.display()))?,
    );
    serde_json::to_writer_pretty(&mut writer, &summaries)
        .with_context(|| format!("failed to write {}", out_json.display()))?;
    writeln!(writer)?;
    writer.flush()?;

    let template = report::load_template(args.template.as_deref())?;
    let generated_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let out_md = args.resolve(&args.out_md);
    fs::write(
        &out_md,
        report::render_report(&template, &summaries, &generated_at),
    )
    .with_context(|| format!("failed to write {}", out_md.display()))?;

    println!("[profiler] summary json: {}", out_json.display());
    println!("[profiler] report md: {}", out_md.display());
    Ok(())
}
