mod app;
mod autotune;
mod cache;
mod config;
mod error;
mod fs_scan;
mod logging;
mod markup;
mod process;
mod render;
mod scheduler;
mod summary;
mod task_unit;
mod trim;
mod types;

use clap::{Args, Parser, Subcommand};
use config::CliOverrides;
use std::path::PathBuf;
use types::KindFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Batch renderer for formula, text and table fragments")]
struct Cli {
    /// Log file shared by the scheduler and its workers
    #[arg(short = 'l', long, global = true)]
    log_file: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render every document named in a file list
    Run(RunArgs),
    /// Render a single document in this process
    Render(RenderArgs),
    /// Rebuild and print summary.json from the cache
    Summary {
        #[arg(short = 'c', long, default_value = "rendered_images_cache")]
        cache_dir: PathBuf,
    },
    /// Delete cache records
    Clear {
        #[arg(short = 'c', long, default_value = "rendered_images_cache")]
        cache_dir: PathBuf,
        /// Only the record for this input
        #[arg(long)]
        file: Option<PathBuf>,
    },
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        task: String,
    },
}

#[derive(Args, Debug)]
struct RenderOpts {
    #[arg(short = 'o', long = "output")]
    output_dir: Option<PathBuf>,

    /// Defaults to `<output>_cache`
    #[arg(short = 'c', long)]
    cache_dir: Option<PathBuf>,

    #[arg(short = 'r', long = "render-type", value_enum)]
    kinds: Option<KindFilter>,

    #[arg(long)]
    dpi: Option<u32>,

    /// Renderer command line, e.g. "python3 render_fragment.py"
    #[arg(long)]
    renderer: Option<String>,

    /// Per-fragment ceiling in seconds
    #[arg(long)]
    render_timeout: Option<u64>,

    /// YAML file with defaults for any of these options
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Text file with one input path (or directory) per line
    file_list: PathBuf,

    #[command(flatten)]
    render: RenderOpts,

    /// Skip inputs that already have a cache record
    #[arg(long)]
    resume: bool,

    /// With --resume, re-render inputs whose record failed
    #[arg(long, requires = "resume")]
    retry_failed: bool,

    #[arg(short = 'j', long = "max-workers")]
    workers: Option<usize>,

    /// Per-file ceiling in seconds
    #[arg(short = 't', long = "task-timeout")]
    task_timeout: Option<u64>,

    #[arg(short = 'n', long)]
    max_files: Option<usize>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    json_file: PathBuf,

    #[command(flatten)]
    render: RenderOpts,
}

impl RenderOpts {
    fn overrides(&self, log_file: Option<PathBuf>) -> CliOverrides {
        CliOverrides {
            output_dir: self.output_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            dpi: self.dpi,
            render_timeout_secs: self.render_timeout,
            kinds: self.kinds,
            renderer: self.renderer.clone(),
            log_file,
            ..CliOverrides::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run(args) => {
            let log_file = cli.log_file.unwrap_or_else(logging::default_log_file);
            logging::init(cli.verbose, Some(&log_file))?;

            let cfg = config::load(
                args.render.config.as_deref(),
                CliOverrides {
                    workers: args.workers,
                    task_timeout_secs: args.task_timeout,
                    ..args.render.overrides(Some(log_file))
                },
            )?;

            let report = app::run_batch(&app::BatchOptions {
                file_list: args.file_list,
                config: cfg,
                resume: args.resume,
                retry_failed: args.retry_failed,
                max_files: args.max_files,
                verbose: cli.verbose,
            })?;
            tracing::debug!(?report, "batch report");
        }
        Commands::Render(args) => {
            logging::init(cli.verbose, cli.log_file.as_deref())?;
            let cfg = config::load(
                args.render.config.as_deref(),
                args.render.overrides(cli.log_file.clone()),
            )?;
            app::render_file(&cfg.run, &args.json_file)?;
        }
        Commands::Summary { cache_dir } => {
            logging::init(cli.verbose, cli.log_file.as_deref())?;
            app::summary_cmd(&cache_dir)?;
        }
        Commands::Clear { cache_dir, file } => {
            logging::init(cli.verbose, cli.log_file.as_deref())?;
            app::clear_cmd(&cache_dir, file.as_deref())?;
        }
        Commands::Worker { task } => {
            logging::init(cli.verbose, cli.log_file.as_deref())?;
            let outcome = app::worker(&task)?;
            // the only line a worker ever writes to stdout
            println!("{}", serde_json::to_string(&outcome)?);
        }
    }

    Ok(())
}
