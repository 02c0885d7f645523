use std::fs;
use std::process::{Command, Output};

use tempfile::tempdir;

fn genoflow(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_genoflow"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run genoflow cli")
}

#[test]
fn partition_prints_half_open_ranges_and_grouped_paths() {
    let tmp = tempdir().expect("temporary directory");
    let out = genoflow(
        tmp.path(),
        &[
            "partition",
            "--from",
            "0",
            "--to",
            "5",
            "--chunk-size",
            "2",
            "--output",
            "/work/run1.genosnp",
            "--group-size",
            "2",
        ],
    );
    assert!(out.status.success(), "CLI exited with status {:?}", out.status);
    let stdout = String::from_utf8(out.stdout).expect("utf8 stdout");
    assert_eq!(
        stdout,
        "0\t0\t2\t/work/0/run1.part.0.genosnp\n\
         1\t2\t4\t/work/0/run1.part.1.genosnp\n\
         2\t4\t5\t/work/1/run1.part.2.genosnp\n"
    );
}

#[test]
fn partition_rejects_a_zero_chunk_size() {
    let tmp = tempdir().expect("temporary directory");
    let out = genoflow(
        tmp.path(),
        &["partition", "--from", "0", "--to", "5", "--chunk-size", "0"],
    );
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Error:"), "stderr was: {stderr}");
}

#[test]
fn merge_orders_chunks_by_partition_index() {
    let tmp = tempdir().expect("temporary directory");
    for (i, body) in [(0, "id\tcall\na\tAA\n"), (1, "id\tcall\nb\tAB\n"), (2, "id\tcall\nc\tBB\n")] {
        fs::write(tmp.path().join(format!("calls.part.{i}.txt")), body).expect("write chunk");
    }
    let out = genoflow(
        tmp.path(),
        &[
            "merge",
            "--layout",
            "text",
            "--header-lines",
            "1",
            "--output",
            "calls.txt",
            "calls.part.2.txt",
            "calls.part.0.txt",
            "calls.part.1.txt",
        ],
    );
    assert!(out.status.success(), "CLI exited with status {:?}", out.status);
    assert_eq!(
        fs::read_to_string(tmp.path().join("calls.txt")).expect("merged file"),
        "id\tcall\na\tAA\nb\tAB\nc\tBB\n"
    );
}

#[test]
fn merge_refuses_a_gap_in_the_chunks() {
    let tmp = tempdir().expect("temporary directory");
    for i in [0, 2] {
        fs::write(tmp.path().join(format!("calls.part.{i}.txt")), "x\n").expect("write chunk");
    }
    let out = genoflow(
        tmp.path(),
        &[
            "merge",
            "--layout",
            "text",
            "--output",
            "calls.txt",
            "calls.part.0.txt",
            "calls.part.2.txt",
        ],
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(!tmp.path().join("calls.txt").exists());
}

#[test]
fn plan_lists_every_chunk_as_tsv() {
    let tmp = tempdir().expect("temporary directory");
    for input in ["run1.sim", "run1.snp.json", "chip.bpm.csv"] {
        fs::write(tmp.path().join(input), "x").expect("write input");
    }
    let work_dir = tmp.path().to_str().expect("path str");
    let out = genoflow(
        tmp.path(),
        &[
            "plan",
            "genosnp",
            "--work-dir",
            work_dir,
            "--sim",
            "run1.sim",
            "--snp-json",
            "run1.snp.json",
            "--manifest",
            "chip.bpm.csv",
            "--end",
            "45",
            "--output",
            "run1.genosnp",
        ],
    );
    assert!(out.status.success(), "CLI exited with status {:?}", out.status);
    let stdout = String::from_utf8(out.stdout).expect("utf8 stdout");
    let rows: Vec<Vec<&str>> = stdout.lines().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows.len(), 4, "header plus three chunks of at most 20 samples");
    assert_eq!(rows[0][..3], ["index", "start", "end"]);
    assert_eq!(rows[3][..3], ["2", "40", "45"]);
    assert!(rows[3][6].contains("--start 40 --end 45"));
    // Planning alone does not create grouping directories.
    assert!(!tmp.path().join("0").exists());
}

#[test]
fn work_dir_flag_replaces_the_configured_one_before_validation() {
    let tmp = tempdir().expect("temporary directory");
    for input in ["run1.sim", "run1.snp.json", "chip.bpm.csv"] {
        fs::write(tmp.path().join(input), "x").expect("write input");
    }
    fs::write(
        tmp.path().join("genoflow.toml"),
        "[planner]\nwork_dir = \"/definitely/not/here/genoflow\"\ngroup_size = 1\n",
    )
    .expect("write config");
    let plan_args = [
        "plan",
        "genosnp",
        "--config",
        "genoflow.toml",
        "--sim",
        "run1.sim",
        "--snp-json",
        "run1.snp.json",
        "--manifest",
        "chip.bpm.csv",
        "--end",
        "45",
        "--output",
        "run1.genosnp",
    ];

    let out = genoflow(tmp.path(), &plan_args);
    assert_eq!(out.status.code(), Some(1));

    let work_dir = tmp.path().to_str().expect("path str");
    let mut args = plan_args.to_vec();
    args.extend(["--work-dir", work_dir]);
    let out = genoflow(tmp.path(), &args);
    assert!(out.status.success(), "CLI exited with status {:?}", out.status);
    let stdout = String::from_utf8(out.stdout).expect("utf8 stdout");
    let last: Vec<&str> = stdout.lines().last().expect("a chunk row").split('\t').collect();
    // One partition per group, so the third chunk lands in directory 2.
    assert!(last[3].ends_with("/2/run1.part.2.genosnp"), "row was {last:?}");
}

#[test]
fn sim_info_reports_counts_and_record_size() {
    let tmp = tempdir().expect("temporary directory");
    let mut header = b"sim".to_vec();
    header.push(1);
    header.extend(60u16.to_le_bytes());
    header.extend(96u32.to_le_bytes());
    header.extend(1_000u32.to_le_bytes());
    header.extend([2u8, 1u8]);
    fs::write(tmp.path().join("run1.sim"), header).expect("write sim");

    let out = genoflow(tmp.path(), &["sim-info", "run1.sim"]);
    assert!(out.status.success(), "CLI exited with status {:?}", out.status);
    let stdout = String::from_utf8(out.stdout).expect("utf8 stdout");
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].contains("1000 probes, 96 samples, 2 channels"), "stdout was: {stdout}");
    assert_eq!(lines[1], "4060 bytes per sample record");
}

#[test]
fn version_prints_the_package_version() {
    let tmp = tempdir().expect("temporary directory");
    let out = genoflow(tmp.path(), &["version"]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).expect("utf8 stdout");
    assert!(stdout.starts_with(&format!("genoflow {}", env!("CARGO_PKG_VERSION"))));
}
