use std::{
    sync::{Arc, Mutex},
    thread,
};

use blobcache::{
    CacheConfig, CountingMetrics, Executors, Listener, ManualExecutor, NodeRoleSet, RegionChannel,
    Result, SharedBlobCacheService, SizeSetting, SystemClock, TestClock,
};
use tempfile::TempDir;

/// Writer that fills a gap with a fixed byte and records its length via
/// `Gap::on_progress`, matching the monotonic-progress contract.
fn fill_writer(byte: u8) -> blobcache::Writer {
    Arc::new(move |channel: &RegionChannel, gap: &blobcache::Gap| {
        let data = vec![byte; gap.len() as usize];
        channel.write_at(gap.start(), &data);
        gap.on_progress(gap.len());
        Ok(())
    })
}

/// Writer that always fails, for population-failure tests.
fn failing_writer() -> blobcache::Writer {
    Arc::new(|_channel: &RegionChannel, _gap: &blobcache::Gap| {
        Err(blobcache::Error::InvariantViolation("simulated write failure".into()))
    })
}

/// Reader returning the bytes at `range` as an owned `Vec<u8>`.
fn byte_reader(range: (u64, u64)) -> blobcache::Reader<Vec<u8>> {
    Arc::new(move |channel: &RegionChannel| channel.read_at(range.0, range.1 - range.0).to_vec())
}

fn setup_manual(
    region_size: u64,
    shared_size: u64,
    min_time_delta_millis: u64,
) -> Result<(SharedBlobCacheService<String>, TempDir, Arc<TestClock>, Arc<ManualExecutor>)> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("cache.bin");
    let config = CacheConfig {
        size: SizeSetting::Absolute(shared_size),
        max_headroom: None,
        region_size,
        range_size: region_size,
        recovery_range_size: region_size,
        min_time_delta: std::time::Duration::from_millis(min_time_delta_millis),
    };
    let clock = Arc::new(TestClock::new(0));
    let (executors, manual) = Executors::manual_shared();
    let service = SharedBlobCacheService::open_for_test(
        &path,
        &config,
        shared_size,
        NodeRoleSet::frozen(),
        clock.clone(),
        executors,
    )?;
    Ok((service, temp_dir, clock, manual))
}

fn get_sync(
    service: &SharedBlobCacheService<String>,
    key: &str,
    blob_len: u64,
    region_idx: u64,
    range: (u64, u64),
    writer: blobcache::Writer,
    manual: &ManualExecutor,
) -> Result<Vec<u8>> {
    let result: Arc<Mutex<Option<Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));
    let result_slot = result.clone();
    service.get(
        key.to_string(),
        blob_len,
        region_idx,
        range,
        range,
        writer,
        byte_reader(range),
        Box::new(move |r| {
            *result_slot.lock().unwrap() = Some(r);
        }),
    )?;
    manual.run_all();
    result.lock().unwrap().take().expect("listener never fired")
}

#[test]
fn basic_eviction() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 500, 0)?;

    for idx in 0..3 {
        let range = if idx == 2 { (0, 50) } else { (0, 100) };
        get_sync(&service, "k", 250, idx, range, fill_writer(0xAB), &manual)?;
    }
    assert_eq!(service.free_region_count(), 2);
    assert_eq!(service.region_count(), 3);

    assert!(service.force_evict("k".to_string(), 1));
    assert_eq!(service.free_region_count(), 3);

    assert!(!service.force_evict("k".to_string(), 1));
    assert_eq!(service.free_region_count(), 3);

    Ok(())
}

#[test]
fn automatic_eviction_on_miss() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 200, 0)?;

    get_sync(&service, "a", 100, 0, (0, 100), fill_writer(1), &manual)?;
    get_sync(&service, "b", 100, 0, (0, 100), fill_writer(2), &manual)?;
    assert_eq!(service.free_region_count(), 0);

    // Both regions are unreferenced (each `get` call released its ref),
    // so a third distinct key must evict one of them to make room.
    let data = get_sync(&service, "c", 100, 0, (0, 100), fill_writer(3), &manual)?;
    assert_eq!(data, vec![3u8; 100]);
    assert_eq!(service.free_region_count(), 0);
    assert_eq!(service.region_count(), 2);

    Ok(())
}

#[test]
fn force_evict_by_predicate() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 500, 0)?;

    get_sync(&service, "blob-1", 100, 0, (0, 100), fill_writer(1), &manual)?;
    get_sync(&service, "blob-2", 100, 0, (0, 100), fill_writer(2), &manual)?;
    get_sync(&service, "other", 100, 0, (0, 100), fill_writer(3), &manual)?;
    assert_eq!(service.region_count(), 3);

    let evicted = service.remove_from_cache(|k: &String| k.starts_with("blob-"));
    assert_eq!(evicted, 2);
    assert_eq!(service.region_count(), 1);
    assert_eq!(service.free_region_count(), 4);

    Ok(())
}

#[test]
fn frequency_and_decay() -> Result<()> {
    let (service, _temp, clock, manual) = setup_manual(100, 200, 1_000)?;

    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;
    // Freshly created: freq == 1.

    clock.advance(2_000);
    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;
    // Touch past the gate: freq == 2.

    clock.advance(2_000);
    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;
    // freq == 3 == FREQ_MAX, further touches don't overflow it.

    service.compute_decay();
    // Too soon since last access (< 2 * min_time_delta): no decay yet.
    assert!(!service.maybe_evict_least_used());

    clock.advance(3_000);
    service.compute_decay();
    service.compute_decay();
    service.compute_decay();
    // Three decay ticks bring freq from 3 down to 0.
    assert!(service.maybe_evict_least_used());
    assert_eq!(service.free_region_count(), 2);

    Ok(())
}

#[test]
fn coalesced_populate() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(1000, 2000, 0)?;

    let metrics_a: Arc<Mutex<Option<Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));
    let metrics_b: Arc<Mutex<Option<Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));
    let a = metrics_a.clone();
    let b = metrics_b.clone();

    let writer = fill_writer(7);
    service.get(
        "k".to_string(),
        1000,
        0,
        (0, 1000),
        (0, 1000),
        writer.clone(),
        byte_reader((0, 1000)),
        Box::new(move |r| *a.lock().unwrap() = Some(r)),
    )?;
    service.get(
        "k".to_string(),
        1000,
        0,
        (200, 800),
        (200, 800),
        writer,
        byte_reader((200, 800)),
        Box::new(move |r| *b.lock().unwrap() = Some(r)),
    )?;

    // Exactly one fill should have been scheduled: the second call's
    // range is a strict subset of the first's in-flight gap.
    assert_eq!(manual.pending(), 1);
    manual.run_all();

    let result_a = metrics_a.lock().unwrap().take().unwrap()?;
    let result_b = metrics_b.lock().unwrap().take().unwrap()?;
    assert_eq!(result_a, vec![7u8; 1000]);
    assert_eq!(result_b, vec![7u8; 600]);

    Ok(())
}

#[test]
fn populate_failure_is_retryable() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 200, 0)?;

    let outcome: Arc<Mutex<Option<Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    service.get(
        "k".to_string(),
        100,
        0,
        (0, 100),
        (0, 100),
        failing_writer(),
        byte_reader((0, 100)),
        Box::new(move |r| *slot.lock().unwrap() = Some(r)),
    )?;
    manual.run_all();
    assert!(outcome.lock().unwrap().take().unwrap().is_err());

    // Retrying with a real writer must still fill the (still-unpopulated) range.
    let data = get_sync(&service, "k", 100, 0, (0, 100), fill_writer(9), &manual)?;
    assert_eq!(data, vec![9u8; 100]);

    Ok(())
}

/// Runs a `maybe_fetch_*` call to completion against `manual` and returns
/// the listener's outcome alongside the call's own synchronous bool.
fn fetch_sync(manual: &ManualExecutor, schedule: impl FnOnce(Listener<()>) -> bool) -> (bool, Result<()>) {
    let outcome: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let scheduled = schedule(Box::new(move |r| *slot.lock().unwrap() = Some(r)));
    manual.run_all();
    (scheduled, outcome.lock().unwrap().take().expect("listener never fired"))
}

#[test]
fn maybe_fetch_full_entry_under_pressure() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 300, 0)?;

    // Fill all three regions with unrelated, still-referenced-free data
    // so none are force-evictable, then immediately release the refs.
    get_sync(&service, "a", 100, 0, (0, 100), fill_writer(1), &manual)?;
    get_sync(&service, "b", 100, 0, (0, 100), fill_writer(2), &manual)?;
    get_sync(&service, "c", 100, 0, (0, 100), fill_writer(3), &manual)?;
    assert_eq!(service.free_region_count(), 0);

    // blob_len spans two regions, both missing: needs 2 slots of
    // capacity, which the 3 unreferenced resident regions can supply.
    let (scheduled, result) = fetch_sync(&manual, |listener| {
        service.maybe_fetch_full_entry("d".to_string(), 200, fill_writer(4), listener)
    });
    assert!(scheduled);
    result?;

    // Both regions of "d" are now fully populated by the entry fetch
    // above: a region-level fetch must report no new work, not a
    // disguised success for an already-present region.
    let (fetched, result) = fetch_sync(&manual, |listener| {
        service.maybe_fetch_region("d".to_string(), 200, 0, fill_writer(4), listener)
    });
    assert!(!fetched);
    result?;

    let (fetched, result) = fetch_sync(&manual, |listener| {
        service.maybe_fetch_region("d".to_string(), 200, 1, fill_writer(4), listener)
    });
    assert!(!fetched);
    result?;

    Ok(())
}

#[test]
fn maybe_fetch_region_completes_partially_populated_region() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 200, 0)?;

    // Populate only the first half of the region through a normal `get`,
    // leaving it resident in the cache but not fully covered.
    get_sync(&service, "k", 100, 0, (0, 50), fill_writer(1), &manual)?;

    // A region-level fetch must still complete the remaining gap rather
    // than treating residency as "already done" and doing nothing.
    let (fetched, result) = fetch_sync(&manual, |listener| {
        service.maybe_fetch_region("k".to_string(), 100, 0, fill_writer(2), listener)
    });
    assert!(fetched);
    result?;

    let data = get_sync(&service, "k", 100, 0, (0, 100), fill_writer(9), &manual)?;
    assert_eq!(&data[..50], &vec![1u8; 50][..]);
    assert_eq!(&data[50..], &vec![2u8; 50][..]);

    Ok(())
}

#[test]
fn maybe_evict_least_used_respects_decay_gate() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 200, 1_000)?;

    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;
    // freq == 1, never decayed: maybeEvictLeastUsed must not touch it.
    assert!(!service.maybe_evict_least_used());
    assert_eq!(service.region_count(), 1);

    Ok(())
}

#[test]
fn invariant_free_plus_live_equals_total() -> Result<()> {
    let (service, _temp, _clock, manual) = setup_manual(100, 500, 0)?;

    for (idx, key) in ["a", "b", "c"].iter().enumerate() {
        get_sync(&service, key, 100, 0, (0, 100), fill_writer(idx as u8), &manual)?;
    }
    assert_eq!(service.free_region_count() + service.region_count(), 5);

    service.force_evict("b".to_string(), 0);
    assert_eq!(service.free_region_count() + service.region_count(), 5);

    Ok(())
}

#[test]
fn disabled_cache_rejects_zero_size() -> Result<()> {
    let (service, _temp, _clock, _manual) = setup_manual(100, 0, 0)?;
    assert!(service.is_disabled());
    assert_eq!(service.region_count(), 0);
    Ok(())
}

#[test]
fn config_rejects_size_without_matching_role() {
    let config = CacheConfig {
        size: SizeSetting::Absolute(1000),
        ..CacheConfig::default()
    };
    let err = config.resolve(10_000, NodeRoleSet::NONE).unwrap_err();
    assert!(matches!(err, blobcache::Error::SizeOnWrongRole { .. }));
}

#[test]
fn config_rejects_headroom_with_absolute_size() {
    let config = CacheConfig {
        size: SizeSetting::Absolute(1000),
        max_headroom: Some(100),
        ..CacheConfig::default()
    };
    let err = config.resolve(10_000, NodeRoleSet::frozen()).unwrap_err();
    assert!(matches!(err, blobcache::Error::HeadroomWithAbsoluteSize));
}

#[test]
fn config_rejects_multiple_data_paths_on_frozen_node() {
    let config = CacheConfig {
        size: SizeSetting::Absolute(1000),
        ..CacheConfig::default()
    };
    let roles = NodeRoleSet {
        frozen: true,
        data_paths: 2,
        ..NodeRoleSet::NONE
    };
    let err = config.resolve(10_000, roles).unwrap_err();
    assert!(matches!(err, blobcache::Error::MultipleDataPathsOnFrozenNode { count: 2 }));
}

#[test]
fn config_rounds_down_to_whole_regions() -> Result<()> {
    let config = CacheConfig {
        size: SizeSetting::Absolute(250),
        region_size: 100,
        ..CacheConfig::default()
    };
    let resolved = config.resolve(10_000, NodeRoleSet::frozen())?;
    assert_eq!(resolved.num_regions, 2);
    assert_eq!(resolved.shared_cache_size, 200);
    Ok(())
}

#[test]
fn counting_metrics_observe_hits_and_misses() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("cache.bin");
    let config = CacheConfig {
        size: SizeSetting::Absolute(200),
        region_size: 100,
        range_size: 100,
        recovery_range_size: 100,
        ..CacheConfig::default()
    };
    let metrics = Arc::new(CountingMetrics::default());
    let (executors, manual) = Executors::manual_shared();
    let service = SharedBlobCacheService::open(
        &path,
        &config,
        200,
        NodeRoleSet::frozen(),
        Arc::new(SystemClock),
        executors,
        metrics.clone(),
    )?;

    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;
    get_sync(&service, "k", 100, 0, (0, 100), fill_writer(1), &manual)?;

    use std::sync::atomic::Ordering;
    assert_eq!(metrics.misses.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.hits.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.bytes_filled.load(Ordering::Relaxed), 100);

    Ok(())
}

#[test]
fn concurrent_get_on_same_region_is_safe() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("cache.bin");
    let config = CacheConfig {
        size: SizeSetting::Absolute(1_000_000),
        region_size: 1_000_000,
        range_size: 1_000_000,
        recovery_range_size: 1_000_000,
        ..CacheConfig::default()
    };
    let executors = Executors::rayon_shared();
    let service = Arc::new(SharedBlobCacheService::open_for_test(
        &path,
        &config,
        1_000_000,
        NodeRoleSet::frozen(),
        Arc::new(SystemClock),
        executors,
    )?);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            let result: Arc<Mutex<Option<Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));
            let slot = result.clone();
            service.get(
                "shared".to_string(),
                1_000_000,
                0,
                (0, 1_000_000),
                (0, 100),
                fill_writer(0x42),
                byte_reader((0, 100)),
                Box::new(move |r| *slot.lock().unwrap() = Some(r)),
            )?;
            loop {
                if let Some(r) = result.lock().unwrap().take() {
                    r?;
                    break;
                }
                thread::yield_now();
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    assert_eq!(service.region_count(), 1);
    assert_eq!(service.free_region_count(), 0);

    Ok(())
}
