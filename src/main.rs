use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{debug, info};
use phylopipe::annotation::{annotate, AnnotationRules};
use phylopipe::fingerprint;
use phylopipe::newick;
use phylopipe::pipeline::{
    Driver, GapPolicy, InferenceSettings, PipelineConfig, PipelineState, TrimSettings, WorkFiles,
};
use phylopipe::render::{render, RenderConfig, StoredStyles, Unit};
use phylopipe::tools::{Executables, PathProbe, SystemRunner};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UnitArg {
    Mm,
    In,
    Px,
}

impl From<UnitArg> for Unit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::Mm => Unit::Mm,
            UnitArg::In => Unit::In,
            UnitArg::Px => Unit::Px,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GapArg {
    None,
    Half,
    All,
}

impl From<GapArg> for GapPolicy {
    fn from(gaps: GapArg) -> Self {
        match gaps {
            GapArg::None => GapPolicy::None,
            GapArg::Half => GapPolicy::Half,
            GapArg::All => GapPolicy::All,
        }
    }
}

#[derive(Parser)]
#[command(name = "phylopipe")]
#[command(about = "Align protein sequences, infer a maximum-likelihood tree and draw it as SVG.", long_about = None)]
struct Args {
    // MANDATORY OPTIONS
    /// Read the protein sequences in FASTA format from this FILE.
    #[arg(short = 'i', long = "input", value_name = "FILE", required_unless_present = "tree")]
    input: Option<PathBuf>,

    /// Write the tree drawing to this FILE (SVG).
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: PathBuf,

    // Pipeline Options
    /// Directory for the intermediate files.
    #[arg(short = 'w', long = "work-dir", value_name = "DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Skip all external tools and reuse the decoded tree from a previous run.
    #[arg(short = 'n', long = "no-recompute")]
    no_recompute: bool,

    /// Reuse this decoded Newick FILE instead of running the pipeline.
    #[arg(short = 't', long = "tree", value_name = "FILE")]
    tree: Option<PathBuf>,

    /// phyml bootstrap replicates (-1 = aLRT statistics).
    #[arg(short = 'b', long = "bootstrap", value_name = "N", default_value_t = -1, allow_hyphen_values = true)]
    bootstrap: i32,

    /// Always use serial phyml, even when mpirun and phyml-mpi are installed.
    #[arg(long = "serial")]
    serial: bool,

    /// Remove poorly aligned blocks with Gblocks after alignment.
    #[arg(long = "trim")]
    trim: bool,

    /// Gap positions Gblocks may keep.
    #[arg(long = "trim-gaps", value_name = "POLICY", requires = "trim")]
    trim_gaps: Option<GapArg>,

    /// Minimum block length kept by Gblocks.
    #[arg(long = "trim-min-block", value_name = "N", requires = "trim", default_value_t = 10)]
    trim_min_block: u32,

    // Annotation Options
    /// Read clade, swap, prefix and root rules from this tab-separated FILE.
    #[arg(short = 'r', long = "rules", value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Root the tree on this leaf (overrides a root rule).
    #[arg(short = 'g', long = "outgroup", value_name = "LEAF")]
    outgroup: Option<String>,

    // Render Options
    /// Pixels per unit of branch length.
    #[arg(short = 's', long = "scale", value_name = "FLOAT", default_value_t = 270.0)]
    scale: f64,

    /// Draw an extra name label next to each tip.
    #[arg(long = "show-leaf-names")]
    show_leaf_names: bool,

    /// Hide support values above branches.
    #[arg(long = "hide-branch-support")]
    hide_branch_support: bool,

    /// Show branch lengths below branches.
    #[arg(long = "show-branch-length")]
    show_branch_length: bool,

    /// Don't align labels or draw dotted guide lines.
    #[arg(long = "no-guide-lines")]
    no_guide_lines: bool,

    /// Output width (derived from the height when omitted).
    #[arg(short = 'x', long = "width", value_name = "FLOAT")]
    width: Option<f64>,

    /// Output height (340 when neither width nor height is given).
    #[arg(short = 'y', long = "height", value_name = "FLOAT")]
    height: Option<f64>,

    /// Unit of width and height.
    #[arg(short = 'u', long = "unit", value_name = "UNIT", default_value = "mm")]
    unit: UnitArg,

    // Logging
    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            executables: Executables::from_env(),
            inference: InferenceSettings {
                bootstrap: self.bootstrap,
                force_serial: self.serial,
                ..InferenceSettings::default()
            },
            trim: self.trim.then(|| TrimSettings {
                min_block: self.trim_min_block,
                gaps: self.trim_gaps.map(GapPolicy::from),
            }),
        }
    }

    fn render_config(&self) -> RenderConfig {
        let defaults = RenderConfig::default();
        let height = match (self.width, self.height) {
            (None, None) => defaults.height,
            (_, height) => height,
        };
        RenderConfig {
            scale: self.scale,
            show_leaf_name: self.show_leaf_names,
            show_branch_length: self.show_branch_length,
            show_branch_support: !self.hide_branch_support,
            draw_guiding_lines: !self.no_guide_lines,
            width: self.width,
            height,
            unit: self.unit.into(),
        }
    }
}

/// Runs the pipeline (or reuses its result) and returns the decoded tree file.
fn decoded_tree(args: &Args) -> anyhow::Result<PathBuf> {
    if let Some(tree) = &args.tree {
        return Ok(PipelineState::reuse_decoded(tree)?.path);
    }
    let input = args
        .input
        .as_deref()
        .context("An input FASTA file is required unless --tree is given")?;
    let files = WorkFiles::new(input, &args.work_dir);

    if args.no_recompute {
        let state = PipelineState::reuse_decoded(&files.decoded)
            .context("Cannot skip recomputation without a previous decoded tree")?;
        return Ok(state.path);
    }

    std::fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("Failed to create work directory {:?}", args.work_dir))?;
    let config = args.pipeline_config();
    let probe = PathProbe::new(&config.executables);
    let driver = Driver::new(&SystemRunner, &probe, config, files)?;
    let path = driver.run()?;
    Ok(path)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let tree_path = decoded_tree(args)?;

    let mut tree = newick::read_file(&tree_path)?;
    info!("Loaded tree with {} leaves from {:?}", tree.num_leaves(), tree_path);

    let mut rules = match &args.rules {
        Some(path) => AnnotationRules::load(path)?,
        None => AnnotationRules::default(),
    };
    if let Some(outgroup) = &args.outgroup {
        rules.outgroup = Some(outgroup.clone());
    }
    annotate(&mut tree, &rules).context("Tree annotation failed")?;
    debug!("Annotated tree: {}", newick::to_newick(&tree));

    info!("Rendering SVG...");
    render(&tree, &args.render_config(), &StoredStyles, &args.out)?;

    let svg = std::fs::read(&args.out)
        .with_context(|| format!("Failed to read back {:?}", args.out))?;
    info!("Saved {:?} (sha256 {})", args.out, fingerprint(&svg));
    Ok(())
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    info!("Done.");
}
