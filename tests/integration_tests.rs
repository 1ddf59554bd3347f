//! End-to-end identification scenarios driving the public API only.

use magus::{Magic, Options, Verdict};

fn identify(source: &str, data: &[u8]) -> Option<String> {
    let magic = Magic::from_source_str(source, "test-magic").unwrap();
    match magic.identify(data, &Options::default()) {
        Verdict::Match(m) => Some(m.description),
        Verdict::None => None,
    }
}

#[test]
fn png_signature() {
    let source = "0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data\n";
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    data.extend_from_slice(&[0x00; 16]);
    assert_eq!(identify(source, &data).as_deref(), Some("PNG image data"));
}

#[test]
fn jpeg_with_continuation() {
    let source = "0\tbeshort\t0xffd8\tJPEG image data\n\
                  >6\tstring\tJFIF\t\\b, JFIF standard\n";
    let data = [
        0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00,
    ];
    assert_eq!(
        identify(source, &data).as_deref(),
        Some("JPEG image data, JFIF standard")
    );
}

#[test]
fn elf_indirect_entry_point() {
    let source = "0\tlelong\t0x464c457f\tELF\n\
                  >(0x18.l)\tbyte\tx\tentry %d\n";
    let mut data = vec![0u8; 32];
    data[0..4].copy_from_slice(&0x464c457fu32.to_le_bytes());
    data[0x18..0x1c].copy_from_slice(&0x1cu32.to_le_bytes());
    data[0x1c] = 7;
    assert_eq!(identify(source, &data).as_deref(), Some("ELF entry 7"));
}

#[test]
fn default_fires_only_without_match() {
    let source = "0\tbyte\t1\tone\n\
                  0\tbyte\t2\ttwo\n\
                  0\tdefault\tx\tother\n";
    assert_eq!(identify(source, &[0x01]).as_deref(), Some("one"));
    assert_eq!(identify(source, &[0x02]).as_deref(), Some("two"));
    assert_eq!(identify(source, &[0x09]).as_deref(), Some("other"));
}

#[test]
fn search_window_honored() {
    let source = "0\tsearch/128\tBEGIN\ttext header\n";

    let mut near = vec![b'#'; 80];
    near.extend_from_slice(b"BEGIN content");
    assert_eq!(identify(source, &near).as_deref(), Some("text header"));

    let mut far = vec![b'#'; 130];
    far.extend_from_slice(b"BEGIN content");
    assert_eq!(identify(source, &far), None);
}

#[test]
fn pstring_two_byte_little_endian_length() {
    let source = "0\tpstring/h\tabc\tpascal record\n";
    let hit = [0x03, 0x00, b'a', b'b', b'c'];
    assert_eq!(identify(source, &hit).as_deref(), Some("pascal record"));

    // A two-byte payload cannot equal the three-byte value
    let miss = [0x02, 0x00, b'a', b'b', b'c'];
    assert_eq!(identify(source, &miss), None);
}

#[test]
fn use_reference_with_inherited_offset() {
    let source = "0\tname\tchunk\t\n\
                  >0\tstring\tFORM\tIFF form\n\
                  >>4\tbyte\tx\t\\b, size byte %d\n\
                  0\tuse\tchunk\t\n\
                  12\tuse\tchunk\t\n";
    assert_eq!(
        identify(source, b"FORM\x05rest....").as_deref(),
        Some("IFF form, size byte 5")
    );
    let mut shifted = vec![b'.'; 12];
    shifted.extend_from_slice(b"FORM\x09tail");
    assert_eq!(
        identify(source, &shifted).as_deref(),
        Some("IFF form, size byte 9")
    );
}

#[test]
fn clear_reenables_default() {
    let source = "0\tbyte\tx\tkind:\n\
                  >1\tbyte\t7\tseven\n\
                  >1\tclear\tx\t\n\
                  >1\tdefault\tx\tunsure\n";
    assert_eq!(identify(source, &[0, 7]).as_deref(), Some("kind: seven unsure"));
    assert_eq!(identify(source, &[0, 8]).as_deref(), Some("kind: unsure"));
}

#[test]
fn mime_and_extensions_flow_to_verdict() {
    let source = "0\tstring\tGIF8\tGIF image data\n\
                  !:mime\timage/gif\n\
                  !:ext\tgif\n\
                  >4\tstring\t7a\t\\b, version 87a\n";
    let magic = Magic::from_source_str(source, "gif").unwrap();
    match magic.identify(b"GIF87a", &Options::default()) {
        Verdict::Match(m) => {
            assert_eq!(m.description, "GIF image data, version 87a");
            assert_eq!(m.mime.as_deref(), Some("image/gif"));
            assert_eq!(m.extensions, vec!["gif"]);
        }
        Verdict::None => panic!("expected a match"),
    }
}

#[test]
fn keep_going_joins_with_dash_separator() {
    let source = "0\tstring\tABCD\tfour\n\
                  0\tstring\tAB\ttwo\n";
    let magic = Magic::from_source_str(source, "multi").unwrap();
    let opts = Options {
        keep_going: true,
        ..Default::default()
    };
    match magic.identify(b"ABCDx", &opts) {
        Verdict::Match(m) => assert_eq!(m.description, "four\n- two"),
        Verdict::None => panic!("expected a match"),
    }
}

#[test]
fn binary_phase_runs_before_text_phase() {
    let source = "0\tstring/t\tPK-TEXT-RULE\ttext wins\n\
                  0\tstring\tPK\tbinary wins\n";
    assert_eq!(
        identify(source, b"PK-TEXT-RULE").as_deref(),
        Some("binary wins")
    );
}

#[test]
fn unsigned_comparison_policy() {
    let signed = "0\tbyte\t>100\tbig\n";
    let unsigned = "0\tubyte\t>100\tbig\n";
    assert_eq!(identify(signed, &[0xf0]), None);
    assert_eq!(identify(unsigned, &[0xf0]).as_deref(), Some("big"));
}

#[test]
fn relative_and_negative_offsets() {
    let source = "0\tstring\tHDR\theader\n\
                  >&1\tstring\tXY\t\\b+XY\n";
    assert_eq!(identify(source, b"HDR.XY").as_deref(), Some("header+XY"));

    let source = "-6\tstring\tFOOTER\twith footer\n";
    assert_eq!(identify(source, b"data..FOOTER").as_deref(), Some("with footer"));
}

#[test]
fn regex_with_line_limit_and_anchor() {
    let source = "0\tregex/1\t^%PDF-\tPDF document\n";
    assert_eq!(identify(source, b"%PDF-1.7\n").as_deref(), Some("PDF document"));
    assert_eq!(identify(source, b"junk\n%PDF-1.7\n"), None);
}

#[test]
fn guid_and_der_probes() {
    let source = "0\tguid\t3F2504E0-4F89-11D3-9A0C-0305E82C3301\tknown container\n";
    let guid = magus::value::parse_guid("3F2504E0-4F89-11D3-9A0C-0305E82C3301").unwrap();
    assert_eq!(identify(source, &guid).as_deref(), Some("known container"));

    let source = "0\tder\tseq\tASN.1 sequence\n";
    assert_eq!(
        identify(source, &[0x30, 0x03, 0x02, 0x01, 0x01]).as_deref(),
        Some("ASN.1 sequence")
    );
    assert_eq!(identify(source, &[0x02, 0x01, 0x01]), None);
}

#[test]
fn unrecognized_input_yields_none() {
    let source = "0\tstring\tZZZZ\tnever seen\n";
    let magic = Magic::from_source_str(source, "mini").unwrap();
    assert_eq!(magic.identify(b"AAAA", &Options::default()), Verdict::None);
    assert_eq!(magic.identify(&[], &Options::default()), Verdict::None);
}

#[test]
fn broken_rules_do_not_poison_the_database() {
    let source = "0\tnonsense\t1\tdropped\n\
                  >4\tbyte\t1\torphaned by the drop\n\
                  0\tstring\tOK\tstill works\n";
    let magic = Magic::from_source_str(source, "mixed").unwrap();
    assert!(!magic.check().is_empty());
    assert!(magic.identify(b"OK", &Options::default()).is_match());
}

#[test]
fn identification_is_deterministic_across_threads() {
    let source = "0\tstring\tRIFF\tRIFF data\n\
                  >8\tstring\tWAVE\t\\b, WAVE audio\n";
    let magic = std::sync::Arc::new(Magic::from_source_str(source, "riff").unwrap());
    let data: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt ";

    let expected = magic.identify(data, &Options::default());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let magic = magic.clone();
            let data = data.to_vec();
            std::thread::spawn(move || magic.identify(&data, &Options::default()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}
