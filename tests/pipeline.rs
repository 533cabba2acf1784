use phylopipe::annotation::{annotate, AnnotationRules};
use phylopipe::codec::TOKEN_PREFIX;
use phylopipe::fasta::read_fasta;
use phylopipe::newick;
use phylopipe::pipeline::{
    Driver, PipelineConfig, PipelineError, PipelineState, Stage, TrimSettings, WorkFiles,
};
use phylopipe::render::{render_svg, RenderConfig, StoredStyles};
use phylopipe::tools::{Capabilities, ToolCommand, ToolError, ToolRunner};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

const INPUT: &str = "\
>VEGFA Homo sapiens|NP_001020539.2
MNFLLSWVHWSLALLLYLHHAKWSQA
>VEGFB.Ovis aries XP_027815351.1
MSPLLRRLLLAALLQLAPAQAPVSQP
>TGF-beta1
MPPSGLRLLLLLLPLLWLLVLTPGRP
";

/// Stands in for t_coffee, Gblocks and phyml by writing the files they would.
#[derive(Default)]
struct FakeTools {
    calls: RefCell<Vec<ToolCommand>>,
    /// phyml writes `<phylip>_phyml_tree` without the `.txt` suffix.
    undecorated_output: bool,
    fail_program: Option<String>,
    skip_output: bool,
    /// Step (`align`, `trim`, `reformat` or `infer`) that exits 0 without writing.
    silent_step: Option<&'static str>,
    /// Step that exits 0 after writing an empty file.
    empty_step: Option<&'static str>,
}

fn step(command: &ToolCommand) -> &'static str {
    match command.program.as_str() {
        "t_coffee" if command.args.iter().any(|a| a == "-other_pg") => "reformat",
        "t_coffee" => "align",
        "Gblocks" => "trim",
        _ => "infer",
    }
}

impl FakeTools {
    fn programs(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.program.clone()).collect()
    }
}

fn arg_after<'a>(command: &'a ToolCommand, flag: &str) -> &'a str {
    let pos = command.args.iter().position(|a| a == flag).unwrap();
    &command.args[pos + 1]
}

impl ToolRunner for FakeTools {
    fn run(&self, command: &ToolCommand) -> Result<(), ToolError> {
        self.calls.borrow_mut().push(command.clone());
        if self.fail_program.as_deref() == Some(command.program.as_str()) {
            return Err(ToolError::Failed {
                command: command.to_string(),
                status: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }
        if self.skip_output || self.silent_step == Some(step(command)) {
            return Ok(());
        }
        if self.empty_step == Some(step(command)) {
            let target = command.stdout.clone().unwrap_or_else(|| {
                PathBuf::from(format!("{}_phyml_tree.txt", arg_after(command, "-i")))
            });
            std::fs::write(target, "").unwrap();
            return Ok(());
        }

        match command.program.as_str() {
            "t_coffee" if command.args.contains(&"-other_pg".to_string()) => {
                // seq_reformat: phylip on stdout, names as tokens
                let records = read_fasta(Path::new(arg_after(command, "-in"))).unwrap();
                let mut out = format!("{} {}\n", records.len(), records[0].residues.len());
                for record in &records {
                    out.push_str(&format!("{:<10} {}\n", record.id, record.residues));
                }
                std::fs::write(command.stdout.as_ref().unwrap(), out).unwrap();
            }
            "t_coffee" => {
                std::fs::copy(&command.args[0], arg_after(command, "-outfile")).unwrap();
            }
            "Gblocks" => {
                let trimmed = format!("{}-gb", command.args[0]);
                std::fs::copy(&command.args[0], trimmed).unwrap();
            }
            "phyml" | "mpirun" => {
                let phylip = arg_after(command, "-i");
                let content = std::fs::read_to_string(phylip).unwrap();
                let names: Vec<&str> = content
                    .lines()
                    .skip(1)
                    .filter_map(|l| l.split_whitespace().next())
                    .collect();
                let tree = format!(
                    "(({}:0.1,{}:0.2)0.93:0.05,{}:0.3);\n",
                    names[0], names[1], names[2]
                );
                let suffix = if self.undecorated_output {
                    "_phyml_tree"
                } else {
                    "_phyml_tree.txt"
                };
                std::fs::write(format!("{}{}", phylip, suffix), tree).unwrap();
            }
            other => panic!("unexpected program {other}"),
        }
        Ok(())
    }
}

fn setup() -> (tempfile::TempDir, WorkFiles) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("vegf.fasta");
    std::fs::write(&input, INPUT).unwrap();
    let files = WorkFiles::new(&input, &dir.path().join("work"));
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    (dir, files)
}

fn run_pipeline(tools: &FakeTools, caps: Capabilities, config: PipelineConfig, files: WorkFiles) -> Result<PathBuf, PipelineError> {
    Driver::new(tools, &caps, config, files)?.run()
}

#[test]
fn full_run_restores_identifiers() {
    let (_dir, files) = setup();
    let tools = FakeTools::default();
    let decoded = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap();

    assert_eq!(decoded, files.decoded);
    assert_eq!(tools.programs(), vec!["t_coffee", "t_coffee", "phyml"]);

    // tools never see the real identifiers
    let phylip = std::fs::read_to_string(&files.phylip).unwrap();
    assert!(phylip.contains(TOKEN_PREFIX));
    assert!(!phylip.contains("Homo"));

    let tree = newick::read_file(&decoded).unwrap();
    assert_eq!(
        tree.leaf_names(),
        vec![
            "VEGFA Homo sapiens|NP_001020539.2",
            "VEGFB.Ovis aries XP_027815351.1",
            "TGF-beta1"
        ]
    );
    let clade = tree
        .common_ancestor("VEGFA Homo sapiens|NP_001020539.2", "VEGFB.Ovis aries XP_027815351.1")
        .unwrap();
    assert_eq!(tree[clade].support(), Some(0.93));
}

#[test]
fn stages_visit_every_state_in_order() {
    let (_dir, files) = setup();
    let tools = FakeTools::default();
    let caps = Capabilities::default();
    let mut driver = Driver::new(&tools, &caps, PipelineConfig::default(), files.clone()).unwrap();

    let mut stages = vec![driver.state().stage];
    while driver.state().stage != Stage::Decoded {
        let state = driver.advance().unwrap();
        assert!(state.path.is_file());
        stages.push(state.stage);
    }
    assert_eq!(
        stages,
        vec![
            Stage::Raw,
            Stage::Aligned,
            Stage::Encoded,
            Stage::PhylipConverted,
            Stage::TreeInferred,
            Stage::Decoded
        ]
    );
    assert!(files.code_table.is_file());
    assert_eq!(
        driver.advance().unwrap().stage,
        Stage::Decoded,
        "advancing past the last stage is a no-op"
    );
}

#[test]
fn parallel_backend_used_when_available() {
    let (_dir, files) = setup();
    let tools = FakeTools::default();
    let caps = Capabilities {
        has_parallel_runner: true,
        has_parallel_inferrer: true,
    };
    run_pipeline(&tools, caps, PipelineConfig::default(), files).unwrap();

    let calls = tools.calls.borrow();
    let inference = calls.last().unwrap();
    assert_eq!(inference.program, "mpirun");
    assert_eq!(&inference.args[..3], ["-n", "4", "phyml-mpi"]);
}

#[test]
fn undecorated_inference_output_is_normalized() {
    let (_dir, files) = setup();
    let tools = FakeTools {
        undecorated_output: true,
        ..FakeTools::default()
    };
    run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap();
    assert!(files.inference_output().is_file());
}

#[test]
fn trimming_runs_gblocks_after_alignment() {
    let (_dir, files) = setup();
    let tools = FakeTools::default();
    let config = PipelineConfig {
        trim: Some(TrimSettings::default()),
        ..PipelineConfig::default()
    };
    run_pipeline(&tools, Capabilities::default(), config, files).unwrap();

    assert_eq!(tools.programs(), vec!["t_coffee", "Gblocks", "t_coffee", "phyml"]);
    let calls = tools.calls.borrow();
    assert_eq!(&calls[1].args[1..], ["-t=p", "-b4=10"]);
}

#[test]
fn tool_failure_aborts_with_stage_and_command() {
    let (_dir, files) = setup();
    let tools = FakeTools {
        fail_program: Some("phyml".to_string()),
        ..FakeTools::default()
    };
    let err = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap_err();

    match err {
        PipelineError::Tool { stage, source } => {
            assert_eq!(stage, Stage::TreeInferred);
            assert!(source.to_string().contains("phyml -i"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!files.decoded.exists());
}

#[test]
fn missing_tool_output_is_fatal() {
    let (_dir, files) = setup();
    let tools = FakeTools {
        skip_output: true,
        ..FakeTools::default()
    };
    let err = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MissingOutput { stage: Stage::Aligned, ref path, .. } if *path == files.aligned
    ));
}

#[test]
fn missing_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let files = WorkFiles::new(&dir.path().join("absent.fasta"), dir.path());
    let tools = FakeTools::default();
    let caps = Capabilities::default();
    assert!(matches!(
        Driver::new(&tools, &caps, PipelineConfig::default(), files),
        Err(PipelineError::MissingInput { .. })
    ));
}

#[test]
fn reuse_renders_same_image_as_recompute() {
    let (_dir, files) = setup();
    let tools = FakeTools::default();
    let rules = AnnotationRules::parse(
        "root\tTGF-beta1\nprefix\tVEGFA\t#9db0cf\nclade\tVEGFA Homo sapiens|NP_001020539.2\tVEGFB.Ovis aries XP_027815351.1\t#ffff99\n",
    )
    .unwrap();
    let draw = |path: &Path| {
        let mut tree = newick::read_file(path).unwrap();
        annotate(&mut tree, &rules).unwrap();
        render_svg(&tree, &RenderConfig::default(), &StoredStyles)
    };

    let computed = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap();
    let recomputed_svg = draw(&computed);
    let calls_after_first_run = tools.calls.borrow().len();

    let reused = PipelineState::reuse_decoded(&files.decoded).unwrap();
    assert_eq!(reused.stage, Stage::Decoded);
    let reused_svg = draw(&reused.path);

    assert_eq!(tools.calls.borrow().len(), calls_after_first_run);
    assert_eq!(recomputed_svg, reused_svg);
    assert!(reused_svg.contains("VEGFA Homo sapiens|NP_001020539.2"));
    assert!(reused_svg.contains("#9db0cf"));
}

#[test]
fn rerun_does_not_accept_previous_tree() {
    let (_dir, files) = setup();
    run_pipeline(&FakeTools::default(), Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap();
    assert!(files.inference_output().is_file());

    let tools = FakeTools {
        silent_step: Some("infer"),
        ..FakeTools::default()
    };
    let err = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MissingOutput { stage: Stage::TreeInferred, .. }
    ));
}

#[test]
fn rerun_does_not_accept_previous_alignment_or_trim() {
    let (_dir, files) = setup();
    let trimming = PipelineConfig {
        trim: Some(TrimSettings::default()),
        ..PipelineConfig::default()
    };
    run_pipeline(&FakeTools::default(), Capabilities::default(), trimming.clone(), files.clone()).unwrap();

    for (silent, stage) in [("align", Stage::Aligned), ("trim", Stage::Aligned)] {
        // a leftover -gb file must not stand in for a fresh one either
        let leftover = format!("{}-gb", files.aligned.display());
        std::fs::write(&leftover, ">SEQ\nMKV\n").unwrap();

        let tools = FakeTools {
            silent_step: Some(silent),
            ..FakeTools::default()
        };
        let err = run_pipeline(&tools, Capabilities::default(), trimming.clone(), files.clone()).unwrap_err();
        match err {
            PipelineError::MissingOutput { stage: got, path, .. } => {
                assert_eq!(got, stage);
                let expected = if silent == "trim" {
                    PathBuf::from(&leftover)
                } else {
                    files.aligned.clone()
                };
                assert_eq!(path, expected);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn empty_phylip_is_missing_output() {
    let (_dir, files) = setup();
    let tools = FakeTools {
        empty_step: Some("reformat"),
        ..FakeTools::default()
    };
    let err = run_pipeline(&tools, Capabilities::default(), PipelineConfig::default(), files.clone()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MissingOutput { stage: Stage::PhylipConverted, ref path, .. } if *path == files.phylip
    ));
    assert_eq!(tools.programs(), vec!["t_coffee", "t_coffee"]);
}
