use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn hashpatch_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hashpatch"))
}

fn run(args: &[&str]) -> Output {
    Command::new(hashpatch_exe())
        .args(args)
        .env_remove("HASHPATCH_CONFIG")
        .env_remove("HASHPATCH_ORIGIN")
        .output()
        .expect("Failed to run hashpatch")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "hashpatch {} failed:\nstdout: {}\nstderr: {}",
        what,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");

        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            entries.push((rel, fs::read(&path).unwrap()));
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

#[test]
fn test_end_to_end_publish_and_patch_in_place() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let target_dir = temp.path().join("target");
    let site_dir = temp.path().join("site");

    let mut records = vec![0xAA; 300_000];
    records[150_000..150_100].fill(0x00);
    let mut modified_records = vec![0xAA; 200_000];
    modified_records.extend_from_slice(&vec![0xBB; 120_000]);

    create_dir_tree(
        &old_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &records),
            ("data/stable.txt", b"Never changes"),
        ],
    );
    create_dir_tree(
        &new_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            ("config/settings.json", b"{\"version\": 2, \"debug\": true, \"newField\": 42}"),
            ("data/records.bin", &modified_records),
            ("data/stable.txt", b"Never changes"),
        ],
    );
    copy_dir_recursive(&old_dir, &target_dir);

    let output = run(&[
        "create",
        "--old",
        old_dir.to_str().unwrap(),
        "--new",
        new_dir.to_str().unwrap(),
        "--output",
        site_dir.to_str().unwrap(),
        "--chunk-size",
        "65536",
    ]);
    assert_success(&output, "create");

    let patches: Vec<_> = fs::read_dir(site_dir.join("patches")).unwrap().collect();
    assert_eq!(patches.len(), 3, "one patch per changed file");

    let changed = ["readme.txt", "config/settings.json", "data/records.bin"];
    let mut args = vec![
        "apply".to_string(),
        "--origin".to_string(),
        site_dir.to_str().unwrap().to_string(),
        "--in-place".to_string(),
        "--no-prompt".to_string(),
    ];
    args.extend(changed.iter().map(|rel| target_dir.join(rel).to_str().unwrap().to_string()));
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run(&args);
    assert_success(&output, "apply");

    assert_eq!(collect_dir_tree(&new_dir), collect_dir_tree(&target_dir));
}

#[test]
fn test_identify_prints_fingerprint() {
    let temp = tempfile::tempdir().unwrap();
    let file = temp.path().join("a.bin");
    fs::write(&file, b"some content").unwrap();

    let output = run(&["identify", file.to_str().unwrap()]);
    assert_success(&output, "identify");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let id = stdout.split_whitespace().next().unwrap();
    assert_eq!(id.len(), 8);
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
}

#[test]
fn test_apply_without_patch_fails_and_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let site_dir = temp.path().join("site");
    let out_dir = temp.path().join("out");
    fs::create_dir_all(site_dir.join("patches")).unwrap();
    fs::create_dir_all(&out_dir).unwrap();
    let file = temp.path().join("unknown.bin");
    fs::write(&file, b"nobody published a patch for this").unwrap();

    let output = run(&[
        "apply",
        "--origin",
        site_dir.to_str().unwrap(),
        "--output-dir",
        out_dir.to_str().unwrap(),
        "--no-prompt",
        file.to_str().unwrap(),
    ]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No patch is available"), "stdout: {stdout}");
    assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
    assert_eq!(fs::read(&file).unwrap(), b"nobody published a patch for this");
}

#[test]
fn test_config_overrides_messages() {
    let temp = tempfile::tempdir().unwrap();
    let site_dir = temp.path().join("site");
    fs::create_dir_all(site_dir.join("patches")).unwrap();
    let file = temp.path().join("unknown.bin");
    fs::write(&file, b"x").unwrap();
    let config = temp.path().join("hashpatch.toml");
    fs::write(
        &config,
        format!(
            "origin = {:?}\noutput_dir = {:?}\nprompt = false\n\n[messages]\nnoPatch = \"Nothing to patch here\"\n",
            site_dir.to_str().unwrap(),
            temp.path().to_str().unwrap()
        ),
    )
    .unwrap();

    let output = run(&["--config", config.to_str().unwrap(), "apply", file.to_str().unwrap()]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Nothing to patch here"), "stdout: {stdout}");
}
