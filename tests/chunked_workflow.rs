#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use genoflow::callers::ChunkedCaller;
use genoflow::command::{CommandLine, Pipeline};
use genoflow::config::WorkflowConfig;
use genoflow::dispatch::{FileMemo, LocalDispatcher};
use genoflow::merge::{MergeAxis, MergeLayout};
use genoflow::shared::files::append_extension;
use genoflow::types::{ExpectedOutputSet, IndexRange, JobLabel, Outcome};
use genoflow::workflow::WorkflowContext;

use tempfile::tempdir;

// Writes one PLINK variant per SNP index for two samples. Chunk outputs are
// refused for the chunk starting at `$3` until a file named `ready` exists in
// the working directory, and every run appends its start index to `runs.txt`.
const WRITE_TRIO: &str = r#"echo "$1" >> runs.txt
if [ "$1" = "$3" ] && [ ! -f ready ]; then exit 7; fi
printf '\154\033\001' > "$0.bed"
: > "$0.bim"
i=$1
while [ "$i" -lt "$2" ]; do
  printf '\003' >> "$0.bed"
  echo "1 snp$i 0 $i A B" >> "$0.bim"
  i=$((i + 1))
done
printf 's1 s1 0 0 0 -9\ns2 s2 0 0 0 -9\n' > "$0.fam""#;

struct FakeCaller {
    output: PathBuf,
    snps: IndexRange,
    flaky_start: u64,
}

impl ChunkedCaller for FakeCaller {
    fn name(&self) -> &str {
        "fake"
    }

    fn required_inputs(&self) -> Vec<&Path> {
        Vec::new()
    }

    fn output_base(&self) -> &Path {
        &self.output
    }

    fn span(&self) -> IndexRange {
        self.snps
    }

    fn chunk_size(&self) -> u64 {
        2
    }

    fn group_size(&self) -> Option<usize> {
        None
    }

    fn label(&self) -> JobLabel {
        JobLabel::scoped("fake", "chromosome 1")
    }

    fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
        CommandLine::new("sh")
            .word("-c")
            .word(WRITE_TRIO)
            .word(output.display().to_string())
            .word(range.start().to_string())
            .word(range.end().to_string())
            .word(self.flaky_start.to_string())
            .into()
    }

    fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
        ExpectedOutputSet::plink_trio(index, &append_extension(output, "bed"))
    }

    fn merge_layout(&self) -> Option<MergeLayout> {
        Some(MergeLayout::PlinkTrio(MergeAxis::Variants))
    }
}

fn runs(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("runs.txt"))
        .expect("read runs.txt")
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn failed_chunk_is_reported_then_retried_alone() {
    let tmp = tempdir().expect("temporary directory");
    let mut config = WorkflowConfig::for_work_dir(tmp.path());
    config.planner.group_size = 2;
    let dispatcher = LocalDispatcher::new(2);
    let memo = FileMemo::in_work_dir(tmp.path());
    let ctx = WorkflowContext::new(&config, &dispatcher, &memo);

    let caller = FakeCaller {
        output: "calls".into(),
        snps: IndexRange::new(0, 5).expect("range"),
        flaky_start: 2,
    };
    let destination = Path::new("merged.bed");

    // First attempt: the chunk covering [2, 4) fails and nothing is merged.
    match ctx.run_chunked(&caller, destination).expect("run") {
        Outcome::Incomplete(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].index, 1);
            assert_eq!(failures[0].label, "fake chunk 1 of 3 for chromosome 1");
        }
        other => panic!("expected an incomplete outcome, got {other:?}"),
    }
    assert!(!tmp.path().join("merged.bed").exists());

    // The configured group size puts chunks 0 and 1 in group 0 and chunk 2 in group 1.
    assert!(tmp.path().join("0/calls.part.0.bed").exists());
    assert!(tmp.path().join("1/calls.part.2.bim").exists());

    // Second attempt: only the failed chunk runs again.
    fs::write(tmp.path().join("ready"), "").expect("write marker");
    let artifact = ctx
        .run_chunked(&caller, destination)
        .expect("rerun")
        .success()
        .expect("merged after retry");
    assert_eq!(artifact.chunks_merged, 3);

    let mut attempts = runs(tmp.path());
    attempts.sort();
    assert_eq!(attempts, vec!["0", "2", "2", "4"]);

    let bed = fs::read(tmp.path().join("merged.bed")).expect("read bed");
    assert_eq!(bed, vec![0x6c, 0x1b, 0x01, 3, 3, 3, 3, 3]);
    let bim = fs::read_to_string(tmp.path().join("merged.bim")).expect("read bim");
    let snps: Vec<&str> = bim
        .lines()
        .map(|l| l.split_whitespace().nth(1).expect("snp id"))
        .collect();
    assert_eq!(snps, vec!["snp0", "snp1", "snp2", "snp3", "snp4"]);
    assert_eq!(
        fs::read_to_string(tmp.path().join("merged.fam")).expect("read fam"),
        "s1 s1 0 0 0 -9\ns2 s2 0 0 0 -9\n"
    );

    // Third attempt: the whole array is memoized and nothing runs.
    assert!(ctx.run_chunked(&caller, destination).expect("memoized").is_success());
    assert_eq!(runs(tmp.path()).len(), 4);
}

#[test]
fn empty_span_runs_one_empty_chunk() {
    let tmp = tempdir().expect("temporary directory");
    let config = WorkflowConfig::for_work_dir(tmp.path());
    let dispatcher = LocalDispatcher::new(1);
    let memo = FileMemo::in_work_dir(tmp.path());
    let ctx = WorkflowContext::new(&config, &dispatcher, &memo);

    let caller = FakeCaller {
        output: "calls".into(),
        snps: IndexRange::new(3, 3).expect("range"),
        flaky_start: 99,
    };

    // The chunk leaves an empty .bim behind, which the merge treats as missing.
    match ctx.run_chunked(&caller, Path::new("empty.bed")).expect("run") {
        Outcome::Incomplete(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].index, 0);
        }
        other => panic!("expected an incomplete outcome, got {other:?}"),
    }
    assert_eq!(runs(tmp.path()), vec!["3"]);
}
