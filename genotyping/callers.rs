// ========================================================================================
//
//                                Caller Tasks
//
// ========================================================================================
//
// Each genotype caller knows how to turn one chunk (an index range plus a grouped
// output path) into a shell command and the files that command must leave behind.
// Everything else about chunking is shared and lives in the planner.

use std::path::{Path, PathBuf};

use crate::command::{CommandLine, Pipeline};
use crate::config::{GenoSnpOptions, IlluminusOptions, ZCallOptions};
use crate::merge::{MergeAxis, MergeLayout};
use crate::shared::files::append_extension;
use crate::types::{ExpectedOutputSet, IndexRange, JobLabel};

pub const SIMTOOLS: &str = "simtools";
pub const GENOSNP_WRAPPER: &str = "genosnp.pl";
pub const GENOTYPE_CALL: &str = "genotype-call";
pub const ILLUMINUS_WRAPPER: &str = "illuminus.pl";
pub const ZCALL_PREPARE: &str = "prepareThresholds.py";
pub const ZCALL_EVALUATE: &str = "evaluateThresholds.py";
pub const ZCALL_MERGE: &str = "mergeEvaluation.py";
pub const ZCALL_RUN: &str = "runZCall.py";

/// A caller whose work is split over an index range and dispatched as a job array.
pub trait ChunkedCaller {
    /// Stable name used in task identity and in failure labels.
    fn name(&self) -> &str;

    /// Files that must be readable before any chunk is planned.
    fn required_inputs(&self) -> Vec<&Path>;

    /// Output base before partition naming and grouping; relative paths are
    /// resolved against the working directory.
    fn output_base(&self) -> &Path;

    fn span(&self) -> IndexRange;

    fn chunk_size(&self) -> u64;

    /// Partitions per grouping directory; `None` takes the planner's.
    fn group_size(&self) -> Option<usize>;

    fn label(&self) -> JobLabel {
        JobLabel::new(self.name())
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline;

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet;

    /// How chunk outputs are combined; `None` when merging is delegated to a
    /// separate job.
    fn merge_layout(&self) -> Option<MergeLayout>;
}

/// A caller step that runs exactly once.
pub trait SingleJob {
    fn name(&self) -> &str;

    fn required_inputs(&self) -> Vec<&Path>;

    fn command(&self) -> Pipeline;

    fn outputs(&self) -> ExpectedOutputSet;
}

fn plink_or_text(index: usize, output: &Path, plink: bool) -> ExpectedOutputSet {
    if plink {
        ExpectedOutputSet::plink_trio(index, &append_extension(output, "bed"))
    } else {
        ExpectedOutputSet::single(index, output)
    }
}

// ========================================================================================
//                                       GenoSNP
// ========================================================================================

/// GenoSNP calls genotypes per sample, so chunks split the sample axis.
#[derive(Debug, Clone)]
pub struct GenoSnp {
    pub sim: PathBuf,
    pub snp_json: PathBuf,
    pub manifest: PathBuf,
    pub output: PathBuf,
    pub samples: IndexRange,
    pub options: GenoSnpOptions,
}

impl ChunkedCaller for GenoSnp {
    fn name(&self) -> &str {
        "genosnp"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![&self.sim, &self.snp_json, &self.manifest]
    }

    fn output_base(&self) -> &Path {
        &self.output
    }

    fn span(&self) -> IndexRange {
        self.samples
    }

    fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    fn group_size(&self) -> Option<usize> {
        self.options.group_size
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
        let raw = append_extension(output, "raw.txt");
        Pipeline::new(
            CommandLine::new(SIMTOOLS)
                .word("genosnp")
                .path_opt("infile", &self.sim)
                .opt("outfile", "-")
                .path_opt("man_dir", &self.manifest)
                .opt("start", range.start())
                .opt("end", range.end()),
        )
        .pipe_if(self.options.debug, || {
            CommandLine::new("tee").word(raw.display().to_string())
        })
        .pipe(
            CommandLine::new(GENOSNP_WRAPPER)
                .opt("input", "/dev/stdin")
                .path_opt("snps", &self.snp_json)
                .opt("cutoff", self.options.cutoff)
                .path_opt("output", output)
                .flag("plink", self.options.plink),
        )
    }

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
        plink_or_text(index, output, self.options.plink)
    }

    fn merge_layout(&self) -> Option<MergeLayout> {
        Some(if self.options.plink {
            MergeLayout::PlinkTrio(MergeAxis::Samples)
        } else {
            MergeLayout::Text { header_lines: 0 }
        })
    }
}

// ========================================================================================
//                                      Illuminus
// ========================================================================================

/// Illuminus clusters each SNP across all samples, so chunks split the SNP axis.
/// One array is planned per chromosome.
#[derive(Debug, Clone)]
pub struct Illuminus {
    pub sim: PathBuf,
    pub manifest: PathBuf,
    /// Sample JSON naming the intensity columns.
    pub sample_json: PathBuf,
    pub output: PathBuf,
    pub snps: IndexRange,
    pub chromosome: Option<String>,
    pub options: IlluminusOptions,
}

impl ChunkedCaller for Illuminus {
    fn name(&self) -> &str {
        "illuminus"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![&self.sim, &self.manifest, &self.sample_json]
    }

    fn output_base(&self) -> &Path {
        &self.output
    }

    fn span(&self) -> IndexRange {
        self.snps
    }

    fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    fn group_size(&self) -> Option<usize> {
        self.options.group_size
    }

    fn label(&self) -> JobLabel {
        match &self.chromosome {
            Some(chromosome) => JobLabel::scoped(self.name(), format!("chromosome {chromosome}")),
            None => JobLabel::new(self.name()),
        }
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
        Pipeline::new(
            CommandLine::new(GENOTYPE_CALL)
                .word("sim-to-illuminus")
                .path_opt("input", &self.sim)
                .opt("output", "stdout")
                .path_opt("manifest", &self.manifest)
                .opt("start", range.start())
                .opt("end", range.end()),
        )
        .pipe(
            CommandLine::new(ILLUMINUS_WRAPPER)
                .path_opt("columns", &self.sample_json)
                .path_opt("output", output)
                .flag("plink", self.options.plink),
        )
    }

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
        plink_or_text(index, output, self.options.plink)
    }

    fn merge_layout(&self) -> Option<MergeLayout> {
        Some(if self.options.plink {
            MergeLayout::PlinkTrio(MergeAxis::Variants)
        } else {
            MergeLayout::Text { header_lines: 1 }
        })
    }
}

// ========================================================================================
//                                        zCall
// ========================================================================================

/// Inputs shared by every zCall step.
#[derive(Debug, Clone)]
pub struct ZCallInputs {
    pub sample_json: PathBuf,
    pub manifest: PathBuf,
    pub egt: PathBuf,
}

/// Writes one threshold file per candidate z score plus a JSON index of them.
#[derive(Debug, Clone)]
pub struct ZCallPrepare {
    pub egt: PathBuf,
    pub work_dir: PathBuf,
    pub zstart: u32,
    pub ztotal: u32,
}

impl ZCallPrepare {
    pub fn threshold_index(&self) -> PathBuf {
        self.work_dir.join("threshold_index.json")
    }

    /// `thresholds_<egt stem>_z<zz>.txt`, one per z score in `zstart..zstart + ztotal`.
    pub fn threshold_files(&self) -> Vec<PathBuf> {
        let stem = self
            .egt
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        (self.zstart..self.zstart.saturating_add(self.ztotal))
            .map(|z| self.work_dir.join(format!("thresholds_{stem}_z{z:02}.txt")))
            .collect()
    }
}

impl SingleJob for ZCallPrepare {
    fn name(&self) -> &str {
        "zcall-prepare"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![&self.egt]
    }

    fn command(&self) -> Pipeline {
        CommandLine::new(ZCALL_PREPARE)
            .path_opt("egt", &self.egt)
            .path_opt("out", &self.work_dir)
            .opt("zstart", self.zstart)
            .opt("ztotal", self.ztotal)
            .into()
    }

    fn outputs(&self) -> ExpectedOutputSet {
        let mut files = vec![self.threshold_index()];
        files.extend(self.threshold_files());
        ExpectedOutputSet { index: 0, files }
    }
}

/// Scores every candidate threshold set on a slice of samples.
#[derive(Debug, Clone)]
pub struct ZCallEvaluate {
    pub thresholds_json: PathBuf,
    pub inputs: ZCallInputs,
    pub output: PathBuf,
    pub samples: IndexRange,
    pub options: ZCallOptions,
}

impl ChunkedCaller for ZCallEvaluate {
    fn name(&self) -> &str {
        "zcall-evaluate"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![
            &self.thresholds_json,
            &self.inputs.sample_json,
            &self.inputs.manifest,
            &self.inputs.egt,
        ]
    }

    fn output_base(&self) -> &Path {
        &self.output
    }

    fn span(&self) -> IndexRange {
        self.samples
    }

    fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    fn group_size(&self) -> Option<usize> {
        self.options.group_size
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
        CommandLine::new(ZCALL_EVALUATE)
            .path_opt("thresholds", &self.thresholds_json)
            .path_opt("samples", &self.inputs.sample_json)
            .path_opt("manifest", &self.inputs.manifest)
            .path_opt("egt", &self.inputs.egt)
            .opt("start", range.start())
            .opt("end", range.end())
            .path_opt("out", output)
            .into()
    }

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
        ExpectedOutputSet::single(index, output)
    }

    fn merge_layout(&self) -> Option<MergeLayout> {
        None
    }
}

/// Combines the per-chunk evaluations and picks the best threshold set.
#[derive(Debug, Clone)]
pub struct ZCallMergeEvaluation {
    /// JSON list of chunk evaluation files in partition order.
    pub metrics_list: PathBuf,
    pub thresholds_json: PathBuf,
    pub output: PathBuf,
    pub summary: PathBuf,
}

impl SingleJob for ZCallMergeEvaluation {
    fn name(&self) -> &str {
        "zcall-merge-evaluation"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![&self.metrics_list, &self.thresholds_json]
    }

    fn command(&self) -> Pipeline {
        CommandLine::new(ZCALL_MERGE)
            .path_opt("metrics", &self.metrics_list)
            .path_opt("thresholds", &self.thresholds_json)
            .path_opt("out", &self.output)
            .path_opt("text", &self.summary)
            .into()
    }

    fn outputs(&self) -> ExpectedOutputSet {
        ExpectedOutputSet {
            index: 0,
            files: vec![self.output.clone(), self.summary.clone()],
        }
    }
}

/// Re-calls GenCall no-calls with the chosen thresholds on a slice of samples.
#[derive(Debug, Clone)]
pub struct ZCallRun {
    pub thresholds: PathBuf,
    pub inputs: ZCallInputs,
    pub output: PathBuf,
    pub samples: IndexRange,
    pub options: ZCallOptions,
}

impl ChunkedCaller for ZCallRun {
    fn name(&self) -> &str {
        "zcall"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        vec![
            &self.thresholds,
            &self.inputs.sample_json,
            &self.inputs.manifest,
            &self.inputs.egt,
        ]
    }

    fn output_base(&self) -> &Path {
        &self.output
    }

    fn span(&self) -> IndexRange {
        self.samples
    }

    fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    fn group_size(&self) -> Option<usize> {
        self.options.group_size
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
        CommandLine::new(ZCALL_RUN)
            .path_opt("thresholds", &self.thresholds)
            .path_opt("bpm", &self.inputs.manifest)
            .path_opt("egt", &self.inputs.egt)
            .path_opt("samples", &self.inputs.sample_json)
            .opt("start", range.start())
            .opt("end", range.end())
            .path_opt("out", output)
            .flag("plink", true)
            .into()
    }

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
        plink_or_text(index, output, true)
    }

    fn merge_layout(&self) -> Option<MergeLayout> {
        Some(MergeLayout::PlinkTrio(MergeAxis::Samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> IndexRange {
        IndexRange::new(start, end).unwrap()
    }

    #[test]
    fn genosnp_pipes_simtools_into_the_wrapper() {
        let caller = GenoSnp {
            sim: "/d/run1.sim".into(),
            snp_json: "/d/run1.snp.json".into(),
            manifest: "/m/chip.bpm.csv".into(),
            output: "run1.genosnp".into(),
            samples: range(0, 100),
            options: GenoSnpOptions::default(),
        };
        let out = Path::new("/w/0/run1.part.0.genosnp");
        assert_eq!(
            caller.chunk_command(range(0, 20), out).render(),
            "simtools genosnp --infile /d/run1.sim --outfile - --man_dir /m/chip.bpm.csv \
             --start 0 --end 20 | genosnp.pl --input /dev/stdin --snps /d/run1.snp.json \
             --cutoff 0.7 --output /w/0/run1.part.0.genosnp --plink"
        );
        let outputs = caller.chunk_outputs(0, out);
        assert_eq!(
            outputs.primary(),
            Some(Path::new("/w/0/run1.part.0.genosnp.bed"))
        );
        assert_eq!(outputs.files.len(), 3);
    }

    #[test]
    fn genosnp_debug_tees_raw_intensities() {
        let caller = GenoSnp {
            sim: "/d/run1.sim".into(),
            snp_json: "/d/run1.snp.json".into(),
            manifest: "/m/chip.bpm.csv".into(),
            output: "run1.genosnp".into(),
            samples: range(0, 10),
            options: GenoSnpOptions {
                debug: true,
                plink: false,
                ..GenoSnpOptions::default()
            },
        };
        let pipeline = caller.chunk_command(range(0, 10), Path::new("/w/0/out"));
        assert_eq!(pipeline.stages().len(), 3);
        assert!(pipeline.render().contains("| tee /w/0/out.raw.txt |"));
        assert!(!pipeline.render().contains("--plink"));
        assert_eq!(
            caller.chunk_outputs(4, Path::new("/w/0/out")).files,
            vec![PathBuf::from("/w/0/out")]
        );
    }

    #[test]
    fn illuminus_labels_name_the_chromosome() {
        let caller = Illuminus {
            sim: "/d/run1.sim".into(),
            manifest: "/m/chip.bpm.csv".into(),
            sample_json: "/d/run1.sample.json".into(),
            output: "run1.12".into(),
            snps: range(1000, 3000),
            chromosome: Some("12".into()),
            options: IlluminusOptions::default(),
        };
        assert_eq!(
            caller.label().chunk(7, 20),
            "illuminus chunk 7 of 20 for chromosome 12"
        );
        let rendered = caller
            .chunk_command(range(1000, 2000), Path::new("/w/0/run1.part.0.12"))
            .render();
        assert!(rendered.starts_with(
            "genotype-call sim-to-illuminus --input /d/run1.sim --output stdout"
        ));
        assert!(rendered.contains("--start 1000 --end 2000 | illuminus.pl --columns"));
        assert_eq!(
            caller.merge_layout(),
            Some(MergeLayout::PlinkTrio(MergeAxis::Variants))
        );
    }

    #[test]
    fn zcall_prepare_lists_one_threshold_file_per_z_score() {
        let prepare = ZCallPrepare {
            egt: "/c/HumanExome-12v1.egt".into(),
            work_dir: "/w".into(),
            zstart: 6,
            ztotal: 3,
        };
        assert_eq!(
            prepare.threshold_files(),
            vec![
                PathBuf::from("/w/thresholds_HumanExome-12v1_z06.txt"),
                PathBuf::from("/w/thresholds_HumanExome-12v1_z07.txt"),
                PathBuf::from("/w/thresholds_HumanExome-12v1_z08.txt"),
            ]
        );
        assert_eq!(prepare.outputs().files.len(), 4);
        assert_eq!(
            prepare.command().render(),
            "prepareThresholds.py --egt /c/HumanExome-12v1.egt --out /w --zstart 6 --ztotal 3"
        );
    }

    #[test]
    fn zcall_run_always_writes_plink() {
        let caller = ZCallRun {
            thresholds: "/w/t.txt".into(),
            inputs: ZCallInputs {
                sample_json: "/d/s.json".into(),
                manifest: "/m/chip.bpm.csv".into(),
                egt: "/c/chip.egt".into(),
            },
            output: "run1.zcall".into(),
            samples: range(0, 25),
            options: ZCallOptions::default(),
        };
        let out = Path::new("/w/0/run1.part.2.zcall");
        assert!(caller.chunk_command(range(20, 25), out).render().ends_with(
            "--start 20 --end 25 --out /w/0/run1.part.2.zcall --plink"
        ));
        assert_eq!(caller.chunk_outputs(2, out).files.len(), 3);
        assert_eq!(
            caller.merge_layout(),
            Some(MergeLayout::PlinkTrio(MergeAxis::Samples))
        );
    }
}
