//! End-to-end tests for evaluation and the benchmark sweep.

use alopex_chunkeval::bench::{BenchConfig, Phase, RunSpec, Runner, DEFAULT_EXPR};
use alopex_chunkeval::codec::Codec;
use alopex_chunkeval::{
    populate, ChunkPlan, ChunkRange, ChunkedEvaluator, ChunkedOptions, ChunkedStorage,
    Compression, DType, Evaluator, EvaluatorKind, Expr, FlatFileStorage, MemoryStorage, Storage,
    StorageKind, SyncMode, WholeArrayEvaluator,
};
use tempfile::TempDir;

fn small_config(dir: &TempDir) -> BenchConfig {
    BenchConfig::default()
        .with_n(1000)
        .with_step(100)
        .with_work_dir(dir.path())
        .with_sync_mode(SyncMode::None)
}

/// Populates `x` in `input`, evaluates into `r` in `output` and returns `r`.
fn evaluate_with(
    evaluator: &dyn Evaluator,
    input: &mut dyn Storage,
    output: &mut dyn Storage,
    n: usize,
    step: usize,
) -> Vec<f64> {
    let expr = Expr::parse(DEFAULT_EXPR).unwrap();

    let mut x = input.create("x", n, DType::Float64).unwrap();
    populate(x.as_mut(), &ChunkPlan::new(n, step).unwrap()).unwrap();
    let mut r = output.create("r", n, DType::Float64).unwrap();
    evaluator.evaluate(&expr, x.as_mut(), r.as_mut()).unwrap();
    x.close().unwrap();

    let values = r.read_range(ChunkRange::new(0, n)).unwrap();
    r.close().unwrap();
    values
}

#[test]
fn test_whole_and_chunked_bit_identical() {
    let n = 1_000_007;
    let step = 100_000;
    let dir = TempDir::new().unwrap();

    let whole = evaluate_with(
        &WholeArrayEvaluator,
        &mut MemoryStorage::new(),
        &mut MemoryStorage::new(),
        n,
        step,
    );

    let mut flat = FlatFileStorage::new(dir.path())
        .unwrap()
        .with_sync_mode(SyncMode::None);
    let mut sink = MemoryStorage::new();
    let chunked = evaluate_with(
        &ChunkedEvaluator::new(step).unwrap(),
        &mut flat,
        &mut sink,
        n,
        step,
    );

    assert_eq!(whole.len(), chunked.len());
    for (i, (a, b)) in whole.iter().zip(&chunked).enumerate() {
        assert_eq!(a.to_bits(), b.to_bits(), "mismatch at index {i}");
    }
    assert_eq!(whole[0], 0.0);
    assert_eq!(whole[n - 1], -2.5);
}

#[test]
fn test_chunked_container_matches_memory() {
    let n = 25_003;
    let step = 1000;
    let dir = TempDir::new().unwrap();

    let reference = evaluate_with(
        &WholeArrayEvaluator,
        &mut MemoryStorage::new(),
        &mut MemoryStorage::new(),
        n,
        step,
    );

    let options = ChunkedOptions::new(Compression::new(Codec::Gorilla, 1).unwrap())
        .with_chunk_len(Some(777))
        .with_sync_mode(SyncMode::None);
    let mut container = ChunkedStorage::new(dir.path().join("c.achk"), options);
    let mut sink = MemoryStorage::new();
    let streamed = evaluate_with(
        &ChunkedEvaluator::new(step).unwrap(),
        &mut container,
        &mut sink,
        n,
        step,
    );

    assert!(reference
        .iter()
        .zip(&streamed)
        .all(|(a, b)| a.to_bits() == b.to_bits()));
}

#[test]
fn test_end_to_end_endpoints_across_backends() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(small_config(&dir).with_codecs(["gorilla", "zlib"])).unwrap();
    let sweep = runner.run().unwrap();

    let kinds: Vec<StorageKind> = sweep.runs.iter().map(|r| r.spec.storage).collect();
    assert!(kinds.contains(&StorageKind::Memory));
    assert!(kinds.contains(&StorageKind::FlatFile));
    assert!(kinds.contains(&StorageKind::Chunked));

    for run in &sweep.runs {
        let (first, last) = run.endpoints.unwrap();
        assert!(first.abs() < 1e-12, "{}: r[0] = {first}", run.spec);
        assert!((last + 2.5).abs() < 1e-12, "{}: r[999] = {last}", run.spec);
        assert!(run.timing(Phase::Populate).is_some());
        assert!(run.timing(Phase::Compute).is_some());
    }
}

#[test]
fn test_unavailable_codec_is_skipped() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(
        small_config(&dir)
            .with_codecs(["blosc", "lzo", "bzip2", "gorilla"])
            .with_levels([0, 1]),
    )
    .unwrap();
    let sweep = runner.run().unwrap();

    let codecs: Vec<Codec> = sweep
        .runs
        .iter()
        .filter_map(|r| r.spec.compression)
        .map(|c| c.codec())
        .collect();
    assert_eq!(codecs, vec![Codec::Gorilla, Codec::Gorilla]);
    assert!(!sweep.to_string().contains("blosc"));
}

#[test]
fn test_only_unavailable_codecs_runs_baselines() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(small_config(&dir).with_codecs(["blosc"])).unwrap();
    let sweep = runner.run().unwrap();
    assert_eq!(sweep.runs.len(), 3);
    assert!(sweep.runs.iter().all(|r| r.spec.compression.is_none()));
}

#[cfg(feature = "zlib")]
#[test]
fn test_compression_monotonicity() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(
        small_config(&dir)
            .with_n(50_000)
            .with_step(5_000)
            .with_codecs(["zlib"])
            .with_levels([0, 1, 9])
            .with_flat_file(false),
    )
    .unwrap();
    let sweep = runner.run().unwrap();

    let size = |level| {
        sweep
            .find(Compression::new(Codec::Zlib, level).unwrap())
            .unwrap()
            .size_bytes
    };
    let raw = size(0);
    let fast = size(1);
    let best = size(9);
    assert!(fast < raw);
    assert!(best as f64 <= fast as f64 * 1.01, "lvl9 {best} > lvl1 {fast}");
}

#[test]
fn test_report_text() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(small_config(&dir).with_codecs(["gorilla"]).with_levels([1])).unwrap();
    let text = runner.run().unwrap().to_string();

    assert!(text.starts_with("Total size for datasets: 0.0 MB\n"));
    assert!(text.contains("Populating x using in-memory whole-array with 1000 points..."));
    assert!(text.contains(&format!("Computing: '{DEFAULT_EXPR}' using flat-file streaming")));
    assert!(text.contains("\t\tTotal file sizes: 16000 -- (0.0 MB)\n"));
    assert!(text.contains("(using gorilla lvl1)"));
}

#[test]
fn test_sweep_reuses_paths() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(small_config(&dir).with_codecs(["gorilla"]).with_levels([1])).unwrap();
    runner.run().unwrap();
    runner.run().unwrap();

    let spec = RunSpec::chunked(Compression::new(Codec::Gorilla, 1).unwrap());
    let report = runner.run_spec(&spec).unwrap();
    assert_eq!(report.spec.evaluator, EvaluatorKind::Chunked);
    assert!(runner.container_path().exists());
}

#[test]
fn test_constant_expression() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(small_config(&dir).with_expr("2**3 - 1").with_codecs(["gorilla"]))
        .unwrap();
    assert!(runner.expr().is_constant());
    let report = runner
        .run_spec(&RunSpec::memory(EvaluatorKind::WholeArray))
        .unwrap();
    assert_eq!(report.endpoints, Some((7.0, 7.0)));
}
