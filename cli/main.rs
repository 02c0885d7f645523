#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use std::error::Error;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;

use genoflow::callers::{ChunkedCaller, GenoSnp, Illuminus, ZCallInputs, ZCallRun};
use genoflow::config::WorkflowConfig;
use genoflow::dispatch::{FileMemo, LocalDispatcher};
use genoflow::grouping::{GroupedPathAllocator, partition_index, partition_name};
use genoflow::merge::{MergeAxis, MergeLayout, MergeReassembler};
use genoflow::partition::RangeChunks;
use genoflow::planner::ChunkJobPlanner;
use genoflow::sim::SimHeader;
use genoflow::types::{ExpectedOutputSet, IndexRange, MergedArtifact, Outcome};
use genoflow::workflow::{
    GenoSnpRun, IlluminusRun, WorkflowContext, ZCallWorkflowRun, genotype_genosnp,
    genotype_illuminus, genotype_zcall,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "genoflow",
    about = "Chunked genotype calling: plan job arrays, dispatch them and merge the results",
    long_about = "Splits genotype-calling work into index-range chunks, runs each chunk as a \
                 memoized job, and reassembles the chunk outputs into one dataset."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ConfigArgs {
    /// Workflow configuration (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Working directory; overrides the one in the configuration file
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<WorkflowConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => WorkflowConfig::read(path)?,
            None => {
                let dir = self.work_dir.clone().unwrap_or(std::env::current_dir()?);
                WorkflowConfig::for_work_dir(dir)
            }
        };
        if let Some(dir) = &self.work_dir {
            config.planner.work_dir = std::path::absolute(dir)?;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CallerKind {
    Genosnp,
    Illuminus,
    Zcall,
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(value_enum)]
    caller: CallerKind,

    /// SIM intensity file (GenoSNP, Illuminus)
    #[arg(long)]
    sim: Option<PathBuf>,

    /// Chip manifest
    #[arg(long)]
    manifest: PathBuf,

    /// SNP annotation JSON (GenoSNP)
    #[arg(long)]
    snp_json: Option<PathBuf>,

    /// Sample JSON (Illuminus, zCall)
    #[arg(long)]
    sample_json: Option<PathBuf>,

    /// EGT cluster file (zCall)
    #[arg(long)]
    egt: Option<PathBuf>,

    /// zCall threshold file
    #[arg(long)]
    thresholds: Option<PathBuf>,

    /// First index of the span
    #[arg(long, default_value = "0")]
    start: u64,

    /// End of the span (exclusive)
    #[arg(long)]
    end: u64,

    /// Output base, relative to the working directory
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    workflow: RunWorkflow,
}

#[derive(Subcommand)]
enum RunWorkflow {
    /// Call genotypes with GenoSNP in sample chunks
    Genosnp {
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        sim: PathBuf,
        #[arg(long)]
        snp_json: PathBuf,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, default_value = "0")]
        start: u64,
        /// Defaults to the number of samples in the SIM file
        #[arg(long)]
        end: Option<u64>,
    },
    /// Call genotypes with Illuminus in SNP chunks, chromosome by chromosome
    Illuminus {
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        sim: PathBuf,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        sample_json: PathBuf,
        /// JSON array of {"chromosome", "start", "end"} SNP bounds
        #[arg(long)]
        chromosome_json: PathBuf,
    },
    /// Evaluate zCall thresholds, then call genotypes in sample chunks
    Zcall {
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        sample_json: PathBuf,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        egt: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutKind {
    /// PLINK chunks that each hold a slice of the SNPs
    PlinkVariants,
    /// PLINK chunks that each hold a slice of the samples
    PlinkSamples,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chunk ranges of a span
    #[command(about = "Split [from, to) into chunks of at most N indices")]
    Partition {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
        #[arg(long, value_name = "N")]
        chunk_size: u64,
        /// Also print the grouped output path of each chunk for this base
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(long, default_value = "100")]
        group_size: usize,
    },

    /// Plan a chunked caller and print the job array as TSV, without running it
    #[command(about = "Plan a job array (outputs: TSV on stdout)")]
    Plan(PlanArgs),

    /// Run a complete workflow
    #[command(about = "Plan, dispatch and merge a genotyping workflow")]
    Run(RunArgs),

    /// Merge chunk outputs given in any order
    #[command(about = "Merge chunk outputs into one dataset")]
    Merge {
        #[arg(long, value_enum)]
        layout: LayoutKind,
        /// Header lines to skip in every text chunk but the first
        #[arg(long, default_value = "0")]
        header_lines: usize,
        #[arg(long)]
        output: PathBuf,
        /// Chunk files named `<stem>.part.<i>.<ext>` (for PLINK, the .bed files)
        #[arg(required = true)]
        chunks: Vec<PathBuf>,
    },

    /// Print the header of a SIM intensity file
    #[command(about = "Describe a SIM intensity file")]
    SimInfo {
        #[arg(value_name = "SIM_PATH")]
        path: PathBuf,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Partition {
            from,
            to,
            chunk_size,
            output,
            group_size,
        }) => run_partition(from, to, chunk_size, output, group_size),
        Some(Commands::Plan(args)) => run_plan(args),
        Some(Commands::Run(args)) => run_workflow(args),
        Some(Commands::Merge {
            layout,
            header_lines,
            output,
            chunks,
        }) => run_merge(layout, header_lines, &output, chunks),
        Some(Commands::SimInfo { path }) => run_sim_info(&path),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn invalid_input(message: impl Into<String>) -> Box<dyn Error> {
    Box::new(io::Error::new(io::ErrorKind::InvalidInput, message.into()))
}

fn required(value: Option<PathBuf>, flag: &str, caller: &str) -> Result<PathBuf, Box<dyn Error>> {
    value.ok_or_else(|| invalid_input(format!("--{flag} is required for {caller}")))
}

fn run_partition(
    from: u64,
    to: u64,
    chunk_size: u64,
    output: Option<PathBuf>,
    group_size: usize,
) -> CliResult {
    let allocator = GroupedPathAllocator::new(group_size)?;
    for (i, range) in RangeChunks::new(from, to, chunk_size)?.enumerate() {
        match &output {
            Some(base) => {
                let path = allocator.group_path(&partition_name(base, i)?, i)?;
                println!("{i}\t{}\t{}\t{}", range.start(), range.end(), path.display());
            }
            None => println!("{i}\t{}\t{}", range.start(), range.end()),
        }
    }
    Ok(())
}

fn build_caller(args: PlanArgs, config: &WorkflowConfig) -> Result<Box<dyn ChunkedCaller>, Box<dyn Error>> {
    let span = IndexRange::new(args.start, args.end)?;
    let caller: Box<dyn ChunkedCaller> = match args.caller {
        CallerKind::Genosnp => Box::new(GenoSnp {
            sim: required(args.sim, "sim", "genosnp")?,
            snp_json: required(args.snp_json, "snp-json", "genosnp")?,
            manifest: args.manifest,
            output: args.output,
            samples: span,
            options: config.genosnp.clone(),
        }),
        CallerKind::Illuminus => Box::new(Illuminus {
            sim: required(args.sim, "sim", "illuminus")?,
            manifest: args.manifest,
            sample_json: required(args.sample_json, "sample-json", "illuminus")?,
            output: args.output,
            snps: span,
            chromosome: None,
            options: config.illuminus.clone(),
        }),
        CallerKind::Zcall => Box::new(ZCallRun {
            thresholds: required(args.thresholds, "thresholds", "zcall")?,
            inputs: ZCallInputs {
                sample_json: required(args.sample_json, "sample-json", "zcall")?,
                manifest: args.manifest,
                egt: required(args.egt, "egt", "zcall")?,
            },
            output: args.output,
            samples: span,
            options: config.zcall.clone(),
        }),
    };
    Ok(caller)
}

fn run_plan(args: PlanArgs) -> CliResult {
    let config = args.config.load()?;
    let caller = build_caller(args, &config)?;
    let plan = ChunkJobPlanner::new(&config.planner).prepare(caller.as_ref())?;
    eprintln!(
        "> {}: {} chunk(s), array key {}",
        plan.label,
        plan.len(),
        plan.array_key
    );

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(io::stdout());
    writer.write_record(["index", "start", "end", "output", "task_key", "log", "command"])?;
    for (spec, command) in plan.specs.iter().zip(&plan.commands) {
        writer.write_record([
            spec.index.to_string(),
            spec.range.start().to_string(),
            spec.range.end().to_string(),
            spec.output_path.display().to_string(),
            spec.task_key.to_hex(),
            plan.log_path(spec.index).display().to_string(),
            command.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn report(outcome: Outcome<MergedArtifact>) -> CliResult {
    match outcome {
        Outcome::Success(artifact) => {
            eprintln!("> Merged {} chunk(s) into:", artifact.chunks_merged);
            for file in &artifact.files {
                println!("{}", file.display());
            }
            Ok(())
        }
        Outcome::Incomplete(failures) => {
            eprintln!("> {} chunk(s) must be run again:", failures.len());
            for failure in &failures {
                eprintln!("  {failure}");
            }
            Err(invalid_input(format!(
                "workflow incomplete; failed chunks: {}",
                failures.iter().map(|f| f.index).join(", ")
            )))
        }
        Outcome::Cancelled => Err(invalid_input("workflow was cancelled")),
        Outcome::Failure(reason) => Err(invalid_input(reason)),
    }
}

fn run_workflow(args: RunArgs) -> CliResult {
    let config = args.config.load()?;
    let dispatcher = LocalDispatcher::from_settings(&config.dispatch);
    let memo = FileMemo::in_work_dir(&config.planner.work_dir);
    let ctx = WorkflowContext::new(&config, &dispatcher, &memo)
        .with_progress(io::stderr().is_terminal());
    eprintln!("> Working in {}", config.planner.work_dir.display());

    let outcome = match args.workflow {
        RunWorkflow::Genosnp {
            run_name,
            sim,
            snp_json,
            manifest,
            start,
            end,
        } => genotype_genosnp(
            &ctx,
            &GenoSnpRun {
                run_name,
                sim,
                snp_json,
                manifest,
                start,
                end,
            },
        )?,
        RunWorkflow::Illuminus {
            run_name,
            sim,
            manifest,
            sample_json,
            chromosome_json,
        } => genotype_illuminus(
            &ctx,
            &IlluminusRun {
                run_name,
                sim,
                manifest,
                sample_json,
                chromosome_json,
            },
        )?,
        RunWorkflow::Zcall {
            run_name,
            sample_json,
            manifest,
            egt,
        } => genotype_zcall(
            &ctx,
            &ZCallWorkflowRun {
                run_name,
                sample_json,
                manifest,
                egt,
            },
        )?,
    };
    report(outcome)
}

fn run_merge(layout: LayoutKind, header_lines: usize, output: &Path, chunks: Vec<PathBuf>) -> CliResult {
    let layout = match layout {
        LayoutKind::PlinkVariants => MergeLayout::PlinkTrio(MergeAxis::Variants),
        LayoutKind::PlinkSamples => MergeLayout::PlinkTrio(MergeAxis::Samples),
        LayoutKind::Text => MergeLayout::Text { header_lines },
    };
    let sets = chunks
        .into_iter()
        .map(|path| {
            let index = partition_index(&path).ok_or_else(|| {
                invalid_input(format!(
                    "'{}' is not named like a chunk output (<stem>.part.<i>.<ext>)",
                    path.display()
                ))
            })?;
            Ok(match layout {
                MergeLayout::PlinkTrio(_) => ExpectedOutputSet::plink_trio(index, &path),
                MergeLayout::Text { .. } => ExpectedOutputSet::single(index, path),
            })
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?
        .into_iter()
        .sorted_by_key(|set| set.index)
        .collect::<Vec<_>>();

    let artifact = MergeReassembler::new(layout).reassemble(&sets, output)?;
    report(Outcome::Success(artifact))
}

fn run_sim_info(path: &Path) -> CliResult {
    let header = SimHeader::read(path)?;
    println!("{header}");
    println!("{} bytes per sample record", header.record_len());
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("GENOFLOW_RELEASE_TAG");
    let build_timestamp: u64 = env!("GENOFLOW_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("genoflow {version}");
    match release_tag {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
