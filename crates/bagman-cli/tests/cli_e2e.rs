use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn write_bag_tar(path: &Path, payload: &[u8], payload_md5_hex: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    let file = fs::File::create(path).expect("create tar");
    let mut builder = tar::Builder::new(file);

    let mut append = |name: &str, content: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).expect("append");
    };

    append("bagit.txt", b"BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n");
    append("aptrust-info.txt", b"Title: Test Bag\nAccess: consortia\nDescription: a cli e2e test bag\n");
    let manifest = format!("{payload_md5_hex}  data/metadata.xml\n");
    append("manifest-md5.txt", manifest.as_bytes());
    append("data/metadata.xml", payload);

    builder.finish().expect("finish tar");
}

fn bagman_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("bagman"))
}

/// "hello world" per RFC 1321 test vectors.
const PAYLOAD: &[u8] = b"hello world";
const PAYLOAD_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

#[test]
fn once_mode_ingests_a_discovered_bag_end_to_end() {
    let td = tempdir().expect("tempdir");
    let blob_root = td.path().join("blobstore");
    let working_dir = td.path().join("work");
    let log_dir = td.path().join("logs");

    write_bag_tar(&blob_root.join("aptrust.receiving.test.edu").join("bag1.tar"), PAYLOAD, PAYLOAD_MD5);

    let config_path = td.path().join("bagman.toml");
    fs::write(
        &config_path,
        format!(
            r#"
log_dir = "{log_dir}"

[buckets]
institutions = ["test.edu"]

[volume]
working_dir = "{working_dir}"
initial_free_bytes = 10000000000
"#,
            working_dir = working_dir.display().to_string().replace('\\', "/"),
            log_dir = log_dir.display().to_string().replace('\\', "/"),
        ),
    )
    .expect("write config");

    let mut cmd = bagman_cmd();
    cmd.arg("--config")
        .arg(&config_path)
        .arg("--blob-root")
        .arg(&blob_root)
        .arg("--once")
        .assert()
        .success()
        .stderr(contains("published 1 bag(s)"));

    // Source tar is removed by the cleanup worker once fully recorded.
    assert!(!blob_root.join("aptrust.receiving.test.edu").join("bag1.tar").exists());

    // Payload is now stored under a UUID key in the preservation bucket.
    let preservation_dir = blob_root.join("aptrust.preservation.storage");
    let stored: Vec<_> = fs::read_dir(&preservation_dir)
        .expect("read preservation bucket")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) != Some("json"))
        .collect();
    assert_eq!(stored.len(), 1, "expected exactly one stored payload file, found {stored:?}");
    assert_eq!(fs::read(&stored[0]).unwrap(), PAYLOAD);

    // Replication copied the same payload to the secondary-region bucket.
    let replication_dir = blob_root.join("aptrust.preservation.replication");
    let replicated: Vec<_> = fs::read_dir(&replication_dir)
        .expect("read replication bucket")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) != Some("json"))
        .collect();
    assert_eq!(replicated.len(), 1, "expected exactly one replicated payload file, found {replicated:?}");

    assert!(log_dir.join("status.jsonl").is_file());
}

#[test]
fn second_once_run_does_not_rediscover_the_already_ingested_bag() {
    let td = tempdir().expect("tempdir");
    let blob_root = td.path().join("blobstore");
    let working_dir = td.path().join("work");
    let log_dir = td.path().join("logs");

    write_bag_tar(&blob_root.join("aptrust.receiving.test.edu").join("bag1.tar"), PAYLOAD, PAYLOAD_MD5);

    let config_path = td.path().join("bagman.toml");
    fs::write(
        &config_path,
        format!(
            r#"
log_dir = "{log_dir}"

[buckets]
institutions = ["test.edu"]

[volume]
working_dir = "{working_dir}"
initial_free_bytes = 10000000000
"#,
            working_dir = working_dir.display().to_string().replace('\\', "/"),
            log_dir = log_dir.display().to_string().replace('\\', "/"),
        ),
    )
    .expect("write config");

    // Each `--once` invocation starts a fresh in-process registry and
    // broker, so this only exercises that a second run with nothing left
    // in the intake bucket publishes no further work — not cross-run
    // registry memory.
    bagman_cmd().arg("--config").arg(&config_path).arg("--blob-root").arg(&blob_root).arg("--once").assert().success();

    bagman_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("--blob-root")
        .arg(&blob_root)
        .arg("--once")
        .assert()
        .success()
        .stderr(contains("published 0 bag(s)"));
}

#[test]
fn invalid_poll_interval_fails_fast() {
    let td = tempdir().expect("tempdir");

    bagman_cmd()
        .arg("--config")
        .arg(td.path().join("missing-bagman.toml"))
        .arg("--blob-root")
        .arg(td.path().join("blobstore"))
        .arg("--poll-interval")
        .arg("not-a-duration")
        .arg("--once")
        .assert()
        .failure()
        .stderr(contains("invalid --poll-interval"));
}
