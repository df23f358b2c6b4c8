use std::path::PathBuf;
use std::process::Command;

fn vf() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vf"));
    // keep ~/.verifile lookups inside a throwaway home
    let home = std::env::temp_dir().join(format!("verifile_cli_home_{}", std::process::id()));
    let _ = std::fs::create_dir_all(&home);
    cmd.env("HOME", &home).env("USERPROFILE", &home).env_remove("RUST_LOG");
    cmd
}

fn source_tree() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("src");
    let target = root.path().join("dst");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("one.txt"), b"one").unwrap();
    std::fs::write(source.join("two.txt"), b"two").unwrap();
    (root, source, target)
}

#[test]
fn replicate_success_exits_zero_with_json_summary() {
    let (_root, source, target) = source_tree();
    let out = vf().arg("replicate").arg(&source).arg(&target).arg("--json").output().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let json_line = stdout.lines().last().unwrap();
    let v: serde_json::Value = serde_json::from_str(json_line).unwrap();
    assert_eq!(v["files"], 2);
    assert_eq!(v["verified"], 2);
    assert_eq!(v["errors"], 0);
    assert!(stdout.contains("All files were replicated successfully!"));
    assert_eq!(std::fs::read(target.join("two.txt")).unwrap(), b"two");
}

#[test]
fn replicate_failure_exits_one_and_writes_report() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("f"), b"f").unwrap();
    // a regular file where the target's parent should be
    let target = root.path().join("dst");
    std::fs::write(&target, b"not a directory").unwrap();
    let report = root.path().join("failures.jsonl");
    let out = vf()
        .arg("replicate")
        .arg(&source)
        .arg(target.join("inner"))
        .arg("--failures-out")
        .arg(&report)
        .arg("--quiet")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let body = std::fs::read_to_string(&report).unwrap();
    let v: serde_json::Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
    assert_eq!(v["kind"], "CREATE");
}

#[test]
fn hash_prints_known_digest() {
    let root = tempfile::tempdir().unwrap();
    let p = root.path().join("hello.txt");
    std::fs::write(&p, b"hello world").unwrap();
    let out = vf().arg("hash").arg(&p).output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9  "));
}

#[test]
fn copy_reports_elapsed_time() {
    let (_root, source, target) = source_tree();
    std::fs::create_dir_all(&target).unwrap();
    let out = vf()
        .arg("copy")
        .arg(source.join("one.txt"))
        .arg(target.join("one.txt"))
        .args(["--strategy", "mmap", "--progress"])
        .output()
        .unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Progress: 100.0%"));
    assert!(stdout.contains("Elapsed time:"));
    assert_eq!(std::fs::read(target.join("one.txt")).unwrap(), b"one");
}
