use csopack::codec::{Family, Method, MethodSet};
use csopack::format::open_index;
use csopack::job::{CodecFlags, ConfigError, Job};
use csopack::pipeline::{Event, JobError, JobStatus, Outcome, Pipeline, PipelineOptions};
use csopack::FormatVariant;
use proptest::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tempfile::TempDir;

/// Sector-like test image: zero runs, text, noise and counters.
fn image(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let text = b"PLAYSTATION PORTABLE UMD GAME DISC SECTOR DATA ";
    (0..len)
        .map(|i| match (i / 2048 + seed as usize) % 4 {
            0 => 0,
            1 => text[i % text.len()],
            2 => {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (state >> 16) as u8
            }
            _ => (i / 7) as u8,
        })
        .collect()
}

fn write_image(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineOptions { threads: 2 }).unwrap()
}

fn run(job: &Job) -> Result<Outcome, JobError> {
    let (tx, _rx) = mpsc::channel();
    pipeline().run(0, job, &tx)
}

fn roundtrip(dir: &TempDir, input: &Path, job: Job) -> Vec<u8> {
    let container = job.output.clone().unwrap();
    run(&job).unwrap();
    let restored = dir.path().join("restored.iso");
    run(&Job::decompress(&container, &restored)).unwrap();
    fs::read(restored).unwrap_or_else(|_| panic!("no output for {}", input.display()))
}

#[test]
fn test_roundtrip_every_format() {
    let dir = TempDir::new().unwrap();
    let data = image(3 * 8192 + 1000, 1);
    let input = write_image(&dir, "game.iso", &data);

    for variant in FormatVariant::ALL {
        let out = dir.path().join(format!("game{}", variant.extension()));
        let job = Job::compress(&input, &out).with_format(variant);
        assert_eq!(roundtrip(&dir, &input, job), data, "{variant} roundtrip");

        let mut file = File::open(&out).unwrap();
        let index = open_index(&mut file).unwrap();
        assert_eq!(index.variant, variant);
        assert_eq!(index.geometry.raw_size, data.len() as u64);
    }
}

#[test]
fn test_sixty_four_kib_with_zlib_only() {
    let dir = TempDir::new().unwrap();
    let data = image(64 * 1024, 2);
    let input = write_image(&dir, "small.iso", &data);
    let out = dir.path().join("small.cso");

    let codecs = CodecFlags { only: MethodSet::single(Method::Zlib), ..Default::default() };
    let job = Job::compress(&input, &out).with_block_size(2048).with_codecs(codecs);
    assert_eq!(roundtrip(&dir, &input, job), data);

    let index = open_index(&mut File::open(&out).unwrap()).unwrap();
    assert_eq!(index.entries.len(), 32);
    assert!(index.entries.iter().all(|e| e.family != Family::Lz4));
    assert!(index.entries.iter().any(|e| e.family == Family::Deflate));
}

#[test]
fn test_short_last_block() {
    let dir = TempDir::new().unwrap();
    let data = image(2048 * 5 + 17, 3);
    let input = write_image(&dir, "odd.iso", &data);
    let out = dir.path().join("odd.cso");
    let job = Job::compress(&input, &out).with_format(FormatVariant::Cso2).with_block_size(2048);
    assert_eq!(roundtrip(&dir, &input, job), data);
    let index = open_index(&mut File::open(&out).unwrap()).unwrap();
    assert_eq!(index.entries.len(), 6);
}

#[test]
fn test_empty_method_set_fails_before_reading() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does-not-exist.iso");
    let out = dir.path().join("never.cso");
    let codecs = CodecFlags {
        only:    MethodSet::single(Method::Zlib),
        disable: MethodSet::single(Method::Zlib),
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel();
    let err = pipeline()
        .run(4, &Job::compress(&missing, &out).with_codecs(codecs), &tx)
        .unwrap_err();
    assert!(matches!(err, JobError::Config(ConfigError::NoMethods { .. })));
    assert!(!out.exists());

    drop(tx);
    let events: Vec<Event> = rx.iter().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Finished { job: 4, status: JobStatus::Failure, .. }));
}

#[test]
fn test_lz4_only_is_rejected_for_cso1() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "a.iso", &image(4096, 4));
    let codecs = CodecFlags { only: MethodSet::LZ4, ..Default::default() };
    let job = Job::compress(&input, dir.path().join("a.cso")).with_codecs(codecs);
    assert!(matches!(run(&job), Err(JobError::Config(_))));
}

#[test]
fn test_truncated_container_is_a_format_error() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "t.iso", &image(64 * 1024, 5));
    let container = dir.path().join("t.cso");
    run(&Job::compress(&input, &container).with_block_size(2048)).unwrap();

    let bytes = fs::read(&container).unwrap();
    fs::write(&container, &bytes[..40]).unwrap();
    let restored = dir.path().join("t-out.iso");
    let err = run(&Job::decompress(&container, &restored)).unwrap_err();
    assert!(matches!(err, JobError::Format(_)), "{err}");
    assert!(!restored.exists());
}

#[test]
fn test_missing_payload_bytes_are_a_format_error() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "m.iso", &image(32 * 1024, 6));
    let container = dir.path().join("m.zso");
    run(&Job::compress(&input, &container).with_format(FormatVariant::Zso)).unwrap();

    let bytes = fs::read(&container).unwrap();
    fs::write(&container, &bytes[..bytes.len() - 100]).unwrap();
    let err = run(&Job::checksum(&container)).unwrap_err();
    assert!(matches!(err, JobError::Format(_)), "{err}");
}

#[test]
fn test_trailing_garbage_is_a_format_error() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "g.iso", &image(16 * 1024, 12));
    for variant in [FormatVariant::Cso1, FormatVariant::Dax] {
        let container = dir.path().join(format!("g{}", variant.extension()));
        run(&Job::compress(&input, &container).with_format(variant)).unwrap();

        let mut bytes = fs::read(&container).unwrap();
        bytes.extend_from_slice(&[0xAA; 4096]);
        fs::write(&container, &bytes).unwrap();
        let err = run(&Job::checksum(&container)).unwrap_err();
        assert!(matches!(err, JobError::Format(_)), "{variant}: {err}");
    }
}

#[test]
fn test_checksum_matches_raw_image_and_container() {
    let dir = TempDir::new().unwrap();
    let data = image(40_000, 7);
    let input = write_image(&dir, "c.iso", &data);
    let expected = crc32fast::hash(&data);

    let raw = run(&Job::checksum(&input)).unwrap();
    assert_eq!(raw, Outcome::Checksum { raw_size: data.len() as u64, crc32: expected });

    for variant in [FormatVariant::Cso1, FormatVariant::Dax] {
        let container = dir.path().join(format!("c{}", variant.extension()));
        run(&Job::compress(&input, &container).with_format(variant)).unwrap();
        let packed = run(&Job::checksum(&container)).unwrap();
        assert_eq!(packed, raw, "{variant}");
    }
}

#[test]
fn test_recompress_container_to_another_format() {
    let dir = TempDir::new().unwrap();
    let data = image(50_000, 8);
    let input = write_image(&dir, "r.iso", &data);
    let cso = dir.path().join("r.cso");
    run(&Job::compress(&input, &cso)).unwrap();

    let zso = dir.path().join("r.zso");
    let job = Job::compress(&cso, &zso).with_format(FormatVariant::Zso);
    assert_eq!(roundtrip(&dir, &cso, job), data);
}

#[test]
fn test_output_is_deterministic_across_thread_counts() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "d.iso", &image(100_000, 9));
    let mut outputs = Vec::new();
    for threads in [1, 4] {
        let out = dir.path().join(format!("d{threads}.cso"));
        let p = Pipeline::new(PipelineOptions { threads }).unwrap();
        let (tx, _rx) = mpsc::channel();
        let job = Job::compress(&input, &out).with_format(FormatVariant::Cso2);
        p.run(0, &job, &tx).unwrap();
        outputs.push(fs::read(out).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_incompressible_image_is_stored_raw() {
    let dir = TempDir::new().unwrap();
    let mut state = 99u32;
    let noise: Vec<u8> = (0..16_384)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect();
    let input = write_image(&dir, "n.iso", &noise);
    let out = dir.path().join("n.cso");
    assert_eq!(roundtrip(&dir, &input, Job::compress(&input, &out).with_block_size(2048)), noise);
    let index = open_index(&mut File::open(&out).unwrap()).unwrap();
    assert!(index.entries.iter().all(|e| e.family == Family::Raw));
}

#[test]
fn test_empty_image() {
    let dir = TempDir::new().unwrap();
    let input = write_image(&dir, "empty.iso", &[]);
    let out = dir.path().join("empty.cso");
    assert!(roundtrip(&dir, &input, Job::compress(&input, &out)).is_empty());
}

#[test]
fn test_events_report_progress_then_finish() {
    let dir = TempDir::new().unwrap();
    let data = image(200_000, 10);
    let a = write_image(&dir, "a.iso", &data);
    let b = dir.path().join("missing.iso");
    let jobs = vec![
        Job::compress(&a, dir.path().join("a.cso")),
        Job::compress(&b, dir.path().join("b.cso")),
    ];

    let (tx, rx) = mpsc::channel();
    let results = pipeline().run_all(&jobs, &tx);
    drop(tx);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(JobError::Io(_))));

    let events: Vec<Event> = rx.iter().collect();
    let finished: Vec<(usize, JobStatus)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Finished { job, status, .. } => Some((*job, *status)),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![(0, JobStatus::Success), (1, JobStatus::Failure)]);

    let mut last = 0;
    for e in &events {
        if let Event::Progress { job: 0, position, total, .. } = e {
            assert!(*position >= last);
            assert_eq!(*total, data.len() as u64);
            last = *position;
        }
    }
    assert_eq!(last, data.len() as u64);
}

#[test]
fn test_output_may_not_overwrite_input() {
    let dir = TempDir::new().unwrap();
    let data = image(4096, 11);
    let input = write_image(&dir, "same.iso", &data);
    let err = run(&Job::compress(&input, &input)).unwrap_err();
    assert!(matches!(err, JobError::Config(ConfigError::OutputIsInput(_))));
    assert_eq!(fs::read(&input).unwrap(), data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_roundtrip(len in 0usize..20_000, seed in 0u32..64, which in 0usize..4) {
        let dir = TempDir::new().unwrap();
        let data = image(len, seed);
        let input = write_image(&dir, "p.iso", &data);
        let variant = FormatVariant::ALL[which];
        let out = dir.path().join(format!("p{}", variant.extension()));
        let mut job = Job::compress(&input, &out).with_format(variant).with_costs(2.0, 5.0);
        if variant != FormatVariant::Dax {
            job = job.with_block_size(1024);
        }
        prop_assert_eq!(roundtrip(&dir, &input, job), data);
    }
}
