#[allow(dead_code)]
mod common;

use std::sync::Arc;
use std::thread;

use drp_core::consts::LATEST_SAVE_KEY;
use drp_core::data::{fingerprint, Batch, FingerprintMode, Image};
use drp_core::io::fits;
use drp_core::processor::cache::{CacheSettings, PremadeCache, ProductCache, ProductSource};
use drp_core::processor::ProcessorError;
use tempfile::TempDir;

use common::CountingProducer;

fn inputs() -> Batch {
    Batch::images([
        common::image("a.fits", "flat", 1.0, 1.0),
        common::image("b.fits", "flat", 1.0, 2.0),
    ])
}

// ---------------------------------------------------------------------------
// get_or_make
// ---------------------------------------------------------------------------

#[test]
fn test_second_call_loads_cached_product() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let cache = ProductCache::default();
    let producer = CountingProducer::default();

    let first = cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    let second = cache.get_or_make(&producer, &inputs(), &ctx).unwrap();

    assert_eq!(producer.calls(), 1);
    assert_eq!(first.base_name(), second.base_name());
    assert!(second.data().unwrap().iter().all(|v| *v == 3.0));

    let fp = fingerprint(&inputs(), FingerprintMode::Identity).unwrap();
    let path = cache.cache_path("stack", &fp, &ctx);
    assert!(path.exists());
    assert_eq!(first.base_name(), path.file_name().unwrap().to_string_lossy());
    assert!(first.header().get(LATEST_SAVE_KEY).is_some());
}

#[test]
fn test_concurrent_callers_compute_once() {
    let dir = TempDir::new().unwrap();
    let ctx = Arc::new(common::context(dir.path()));
    let cache = Arc::new(ProductCache::default());
    let producer = Arc::new(CountingProducer::default());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (ctx, cache, producer) = (ctx.clone(), cache.clone(), producer.clone());
            thread::spawn(move || {
                cache
                    .get_or_make(producer.as_ref(), &inputs(), &ctx)
                    .map(|img| img.base_name().to_string())
            })
        })
        .collect();
    let names: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(producer.calls(), 1);
    assert!(names.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_different_inputs_use_different_products() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let cache = ProductCache::default();
    let producer = CountingProducer::default();

    let one = cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    let other = Batch::images([common::image("c.fits", "flat", 1.0, 1.0)]);
    let two = cache.get_or_make(&producer, &other, &ctx).unwrap();

    assert_eq!(producer.calls(), 2);
    assert_ne!(one.base_name(), two.base_name());
}

#[test]
fn test_without_try_load_always_computes() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let cache = ProductCache::new(CacheSettings {
        try_load_cache: false,
        ..CacheSettings::default()
    });
    let producer = CountingProducer::default();

    cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    assert_eq!(producer.calls(), 2);
}

#[test]
fn test_without_write_nothing_is_stored() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let cache = ProductCache::new(CacheSettings {
        write_to_cache: false,
        ..CacheSettings::default()
    });
    let producer = CountingProducer::default();

    cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    cache.get_or_make(&producer, &inputs(), &ctx).unwrap();

    assert_eq!(producer.calls(), 2);
    assert!(!ctx.output_dir(&cache.settings().sub_dir).exists());
}

#[test]
fn test_empty_selection_is_missing_calibration() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let producer = CountingProducer::default();
    let result = ProductCache::default().get_or_make(&producer, &Batch::new(), &ctx);
    assert!(matches!(result, Err(ProcessorError::MissingCalibration(_))));
    assert_eq!(producer.calls(), 0);
}

// ---------------------------------------------------------------------------
// Fingerprint modes
// ---------------------------------------------------------------------------

#[test]
fn test_identity_fingerprint_ignores_pixels() {
    let a = Batch::images([common::image("x.fits", "flat", 1.0, 1.0)]);
    let b = Batch::images([common::image("x.fits", "flat", 1.0, 9.0)]);
    assert_eq!(
        fingerprint(&a, FingerprintMode::Identity).unwrap(),
        fingerprint(&b, FingerprintMode::Identity).unwrap()
    );
    assert_ne!(
        fingerprint(&a, FingerprintMode::IdentityAndPayload).unwrap(),
        fingerprint(&b, FingerprintMode::IdentityAndPayload).unwrap()
    );
}

#[test]
fn test_payload_mode_recomputes_changed_pixels() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let cache = ProductCache::new(CacheSettings {
        fingerprint_mode: FingerprintMode::IdentityAndPayload,
        ..CacheSettings::default()
    });
    let producer = CountingProducer::default();

    cache.get_or_make(&producer, &inputs(), &ctx).unwrap();
    let changed = Batch::images([
        common::image("a.fits", "flat", 1.0, 5.0),
        common::image("b.fits", "flat", 1.0, 2.0),
    ]);
    let product = cache.get_or_make(&producer, &changed, &ctx).unwrap();

    assert_eq!(producer.calls(), 2);
    assert!(product.data().unwrap().iter().all(|v| *v == 7.0));
}

// ---------------------------------------------------------------------------
// Premade products
// ---------------------------------------------------------------------------

#[test]
fn test_premade_product_is_loaded_not_computed() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let path = dir.path().join("master_flat.fits");
    fits::write_image(&common::image("master_flat.fits", "masterflat", 1.0, 0.5), &path).unwrap();

    let producer = CountingProducer::default();
    let source = ProductSource::Premade(PremadeCache::new(&path));
    let product = source.resolve(&producer, &inputs(), &ctx).unwrap();

    assert_eq!(producer.calls(), 0);
    assert_eq!(product.base_name(), "master_flat.fits");
    assert!(product.data().unwrap().iter().all(|v| *v == 0.5));
}

#[test]
fn test_missing_premade_product_is_missing_calibration() {
    let dir = TempDir::new().unwrap();
    let ctx = common::context(dir.path());
    let source = ProductSource::Premade(PremadeCache::new(dir.path().join("absent.fits")));
    let result = source.resolve(&CountingProducer::default(), &inputs(), &ctx);
    assert!(matches!(result, Err(ProcessorError::MissingCalibration(_))));
}

#[test]
fn test_payload_fingerprint_includes_shape() {
    let wide = common::image("x.fits", "flat", 1.0, 1.0);
    let mut tall = wide.clone();
    tall.set_data(ndarray::Array2::from_elem((common::WIDTH, common::HEIGHT), 1.0));

    let fp = |img: Image| {
        fingerprint(&Batch::images([img]), FingerprintMode::IdentityAndPayload).unwrap()
    };
    assert_ne!(fp(wide), fp(tall));
}
