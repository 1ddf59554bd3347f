#![cfg(feature = "cli")]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a magus command
fn magus_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("magus"))
}

const MAGIC_SOURCE: &str = "\
0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data
!:mime\timage/png
0\tstring\tGIF8\tGIF image data
!:mime\timage/gif
";

#[test]
fn test_help() {
    magus_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("File type identification"));
}

#[test]
fn test_version() {
    magus_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("magus"));
}

#[test]
fn test_identify_from_source() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    let input = dir.path().join("image.bin");
    std::fs::write(&magic, MAGIC_SOURCE).unwrap();
    std::fs::write(&input, [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]).unwrap();

    magus_cmd()
        .arg("identify")
        .arg("-m")
        .arg(&magic)
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("PNG image data"));
}

#[test]
fn test_identify_mime_and_json() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    let input = dir.path().join("anim.bin");
    std::fs::write(&magic, MAGIC_SOURCE).unwrap();
    std::fs::write(&input, b"GIF87a").unwrap();

    magus_cmd()
        .arg("identify")
        .arg("-m")
        .arg(&magic)
        .arg("--mime")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("image/gif"));

    magus_cmd()
        .arg("identify")
        .arg("-m")
        .arg(&magic)
        .arg("--json")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verdict\":\"match\""));
}

#[test]
fn test_compile_then_identify() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    let mgc = dir.path().join("magic.mgc");
    let input = dir.path().join("image.bin");
    std::fs::write(&magic, MAGIC_SOURCE).unwrap();
    std::fs::write(&input, [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]).unwrap();

    magus_cmd()
        .arg("compile")
        .arg("-m")
        .arg(&magic)
        .arg("-o")
        .arg(&mgc)
        .assert()
        .success()
        .stdout(predicate::str::contains("compiled"));

    magus_cmd()
        .arg("identify")
        .arg("-m")
        .arg(&mgc)
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("PNG image data"));
}

#[test]
fn test_list_output() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    std::fs::write(&magic, MAGIC_SOURCE).unwrap();

    magus_cmd()
        .arg("list")
        .arg("-m")
        .arg(&magic)
        .assert()
        .success()
        .stdout(predicate::str::contains("Set 0:"))
        .stdout(predicate::str::contains("Binary patterns:"))
        .stdout(predicate::str::contains("PNG image data [image/png]"));
}

#[test]
fn test_check_reports_bad_rules() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    std::fs::write(&magic, "0 nonsense 1 broken\n").unwrap();

    magus_cmd()
        .arg("check")
        .arg("-m")
        .arg(&magic)
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown type"));
}

#[test]
fn test_unknown_input_prints_data() {
    let dir = TempDir::new().unwrap();
    let magic = dir.path().join("magic");
    let input = dir.path().join("mystery.bin");
    std::fs::write(&magic, MAGIC_SOURCE).unwrap();
    std::fs::write(&input, b"nothing recognizable").unwrap();

    magus_cmd()
        .arg("identify")
        .arg("-m")
        .arg(&magic)
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("mystery.bin: data"));
}
