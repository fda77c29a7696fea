use rand::prelude::*;
use rand::rngs::StdRng;

use super::*;

#[test]
fn test_empty_digest() {
    let mut digest = TDigest::new();
    assert_eq!(digest.count(), 0);
    assert_eq!(digest.percentile(50.0), None);
    assert_eq!(digest.min(), None);
    assert_eq!(digest.max(), None);
}

#[test]
fn test_small_sample_exact_ends() {
    let mut digest = TDigest::new();
    for v in [5.0, 1.0, 3.0, 2.0, 4.0] {
        digest.add(v);
    }

    assert_eq!(digest.percentile(0.0), Some(1.0));
    assert_eq!(digest.percentile(100.0), Some(5.0));
    let p50 = digest.percentile(50.0).unwrap();
    assert!((p50 - 3.0).abs() < 1.0, "p50 was {p50}");
}

#[test]
fn test_uniform_stream_percentiles() {
    let mut rng = StdRng::seed_from_u64(0x6D65_6469_616C_696E);
    let mut digest = TDigest::new();
    for _ in 0..10_000 {
        digest.add(rng.gen_range(0.0..100_000.0));
    }

    let p50 = digest.percentile(50.0).unwrap();
    let p99 = digest.percentile(99.0).unwrap();
    assert!(
        (p50 - 50_000.0).abs() < 2_500.0,
        "p50 {p50} strayed from the uniform median"
    );
    assert!(
        (p99 - 99_000.0).abs() < 1_000.0,
        "p99 {p99} strayed from the uniform tail"
    );
    assert!(digest.cluster_count() <= MAX_MERGED_CLUSTERS);
}

#[test]
fn test_percentiles_monotonic() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut digest = TDigest::new();
    for _ in 0..5_000 {
        // Heavily skewed stream to stress the tail clusters.
        let v: f64 = rng.gen_range(0.0f64..1.0).powi(4) * 1_000_000.0;
        digest.add(v);
    }

    let mut prev = digest.percentile(0.0).unwrap();
    for p in 1..=100 {
        let cur = digest.percentile(f64::from(p)).unwrap();
        assert!(
            cur >= prev,
            "percentile({p}) = {cur} fell below percentile({}) = {prev}",
            p - 1
        );
        prev = cur;
    }
}

#[test]
fn test_ends_track_min_max() {
    let mut digest = TDigest::new();
    for i in 0..50_000 {
        digest.add(f64::from(i));
    }

    assert_eq!(digest.percentile(0.0), Some(0.0));
    assert_eq!(digest.percentile(100.0), Some(49_999.0));
    assert_eq!(digest.min(), Some(0.0));
    assert_eq!(digest.max(), Some(49_999.0));
}

#[test]
fn test_reset() {
    let mut digest = TDigest::new();
    for i in 0..1_000 {
        digest.add(f64::from(i));
    }
    digest.reset();

    assert_eq!(digest.count(), 0);
    assert_eq!(digest.percentile(50.0), None);

    digest.add(7.0);
    assert_eq!(digest.percentile(50.0), Some(7.0));
}

#[test]
fn test_identical_samples() {
    let mut digest = TDigest::new();
    for _ in 0..10_000 {
        digest.add(123.0);
    }

    for p in [0.0, 25.0, 50.0, 99.0, 100.0] {
        assert_eq!(digest.percentile(p), Some(123.0), "p{p}");
    }
}
