//! Compiling a database and reloading it must not change any verdict.

use magus::{Magic, Options, Verdict};
use tempfile::TempDir;

const DATABASE: &str = "\
# assorted rule shapes
0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data
!:mime\timage/png
!:ext\tpng
0\tbeshort\t0xffd8\tJPEG image data
>6\tstring\tJFIF\t\\b, JFIF standard
0\tlelong\t0x464c457f\tELF
>(0x18.l)\tbyte\tx\tentry %d
0\tsearch/128\tBEGIN\ttext header
0\tpstring/h\tabc\tpascal record
0\tregex/4\t^#!/bin/sh\tshell script
0\tname\tchunk\t
>0\tstring\tFORM\tIFF form
0\tuse\tchunk\t
0\tbelong&0xffffff00\t0x47494600\tGIF picture
0\tbyte\t1\tone
0\tbyte\t2\ttwo
0\tdefault\tx\tother
";

fn inputs() -> Vec<Vec<u8>> {
    let mut elf = vec![0u8; 32];
    elf[0..4].copy_from_slice(&0x464c457fu32.to_le_bytes());
    elf[0x18..0x1c].copy_from_slice(&0x1cu32.to_le_bytes());
    elf[0x1c] = 9;

    let mut begin = vec![b'-'; 60];
    begin.extend_from_slice(b"BEGIN body");

    vec![
        vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a],
        vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00],
        elf,
        begin,
        vec![0x03, 0x00, b'a', b'b', b'c'],
        b"#!/bin/sh\n".to_vec(),
        b"FORM1234".to_vec(),
        b"GIF87a".to_vec(),
        vec![0x01],
        vec![0x02],
        vec![0x42],
        vec![],
        vec![0u8; 64],
        b"completely unrelated text".to_vec(),
    ]
}

#[test]
fn verdicts_survive_compile_and_reload() {
    let dir = TempDir::new().unwrap();
    let mgc_path = dir.path().join("test.mgc");

    let source = Magic::from_source_str(DATABASE, "roundtrip").unwrap();
    let warnings = source.compile(&mgc_path).unwrap();
    assert!(warnings.is_empty(), "{:?}", warnings);

    let reloaded = Magic::load_compiled(&mgc_path).unwrap();
    assert_eq!(source.rule_count(), reloaded.rule_count());

    for opts in [
        Options::default(),
        Options {
            keep_going: true,
            ..Default::default()
        },
    ] {
        for input in inputs() {
            let a = source.identify(&input, &opts);
            let b = reloaded.identify(&input, &opts);
            assert_eq!(a, b, "verdicts diverged on {:?}", input);
        }
    }
}

#[test]
fn auto_detection_loads_both_forms() {
    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("magic");
    let mgc_path = dir.path().join("magic.mgc");

    std::fs::write(&src_path, DATABASE).unwrap();
    let from_source = Magic::load(&src_path).unwrap();
    from_source.compile(&mgc_path).unwrap();

    // `load` must sniff the compiled form without being told
    let from_compiled = Magic::load(&mgc_path).unwrap();
    let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    match (
        from_source.identify(&png, &Options::default()),
        from_compiled.identify(&png, &Options::default()),
    ) {
        (Verdict::Match(a), Verdict::Match(b)) => {
            assert_eq!(a.description, "PNG image data");
            assert_eq!(a, b);
        }
        other => panic!("expected matches, got {:?}", other),
    }
}

#[test]
fn double_roundtrip_is_stable() {
    let source = Magic::from_source_str(DATABASE, "roundtrip").unwrap();
    let (bytes1, _) = source.to_compiled_bytes();
    let reloaded = Magic::from_compiled_bytes(&bytes1, "(mem)").unwrap();
    let (bytes2, _) = reloaded.to_compiled_bytes();
    assert_eq!(bytes1, bytes2);
}
