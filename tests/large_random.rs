//! Large seeded end-to-end test: a million-record database with
//! duplicate-heavy keys, checked key by key, plus a compression sweep.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rangerdb::{Lookup, NullObserver, RangerDb, Record, RecordMap, BATCH_SIZE};

fn generate_records(rng: &mut ChaCha8Rng, total: usize) -> (Vec<Record>, RecordMap) {
    let mut records = Vec::with_capacity(total);
    let mut expected = RecordMap::new();
    let mut key = 0u64;
    while records.len() < total {
        key += 1 + rng.gen_range(0..1u64 << 24);
        // 10% of keys carry 2..=64 duplicate values.
        let count = if rng.gen_bool(0.1) {
            rng.gen_range(2..=64usize)
        } else {
            1
        };
        for _ in 0..count.min(total - records.len()) {
            let m = Record::new(key, rng.gen());
            records.push(m);
            expected.add_record(m);
        }
    }
    (records, expected)
}

fn check_all_keys(db: &RangerDb, expected: &RecordMap) {
    let keys: Vec<u64> = expected.keys().collect();
    for chunk in keys.chunks(BATCH_SIZE) {
        let mut batch = [chunk[0]; BATCH_SIZE];
        batch[..chunk.len()].copy_from_slice(chunk);
        let out = db.query(&batch);
        for (i, &key) in batch.iter().enumerate() {
            let mut want = expected.values(key).unwrap().to_vec();
            want.sort_unstable();
            match out[i] {
                Lookup::Values64(got) => {
                    assert_eq!(got, want.as_slice(), "wrong values for key {key}")
                }
                other => panic!("key {key} returned {other:?}"),
            }
        }
    }
}

#[test]
fn million_record_database_answers_every_key() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    let compression = [1u32, 2, 4, 8][rng.gen_range(0..4)];
    let (records, expected) = generate_records(&mut rng, 1 << 20);

    let count = records.len();
    let mut source = records.into_iter();
    let db = RangerDb::build_with_observer(
        count,
        true,
        compression,
        &mut source,
        &mut NullObserver,
    )
    .expect("build failed");

    assert_eq!(db.reader().total_key_num() as usize, count);
    assert_eq!(
        db.reader().distinct_key_num() as usize,
        expected.distinct_keys()
    );

    check_all_keys(&db, &expected);

    // Random batches over the inserted key set, as the harness runs them.
    let keys: Vec<u64> = expected.keys().collect();
    for _ in 0..100_000 {
        let mut batch = [0u64; BATCH_SIZE];
        for lane in batch.iter_mut() {
            *lane = keys[rng.gen_range(0..keys.len())];
        }
        let out = db.query(&batch);
        for (i, &key) in batch.iter().enumerate() {
            assert_eq!(
                out[i].len(),
                expected.values(key).unwrap().len(),
                "value count mismatch for key {key}"
            );
        }
    }
}

#[test]
fn every_compression_factor_round_trips() {
    for compression in [1u32, 2, 4, 8] {
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(compression));
        let (records, expected) = generate_records(&mut rng, 1 << 16);

        let count = records.len();
        let mut source = records.into_iter();
        let db = RangerDb::build_with_observer(
            count,
            true,
            compression,
            &mut source,
            &mut NullObserver,
        )
        .expect("build failed");

        check_all_keys(&db, &expected);
    }
}

#[test]
fn narrow_mode_survives_a_compression_sweep() {
    for compression in [1u32, 4] {
        let mut rng = ChaCha8Rng::seed_from_u64(77 + u64::from(compression));
        let mut records = Vec::new();
        let mut expected = RecordMap::new();
        let mut key = 0u64;
        while records.len() < 1 << 15 {
            key += 1 + rng.gen_range(0..1u64 << 20);
            let count = if rng.gen_bool(0.2) {
                rng.gen_range(2..=16usize)
            } else {
                1
            };
            for _ in 0..count {
                let m = Record::new(key, u64::from(rng.gen::<u32>()));
                records.push(m);
                expected.add_record(m);
            }
        }

        let count = records.len();
        let mut source = records.into_iter();
        let db = RangerDb::build_with_observer(
            count,
            false,
            compression,
            &mut source,
            &mut NullObserver,
        )
        .expect("build failed");

        let keys: Vec<u64> = expected.keys().collect();
        for chunk in keys.chunks(BATCH_SIZE) {
            let mut batch = [chunk[0]; BATCH_SIZE];
            batch[..chunk.len()].copy_from_slice(chunk);
            let out = db.query(&batch);
            for (i, &key) in batch.iter().enumerate() {
                let mut want: Vec<u32> = expected
                    .values(key)
                    .unwrap()
                    .iter()
                    .map(|&v| v as u32)
                    .collect();
                want.sort_unstable();
                match out[i] {
                    Lookup::Values32(got) => {
                        assert_eq!(got, want.as_slice(), "wrong values for key {key}")
                    }
                    other => panic!("key {key} returned {other:?}"),
                }
            }
        }
    }
}
