//! Bucket-level invariants: capacity, tag uniqueness, pack round trips,
//! and the collision-forced flush behavior of the database builder.

use std::collections::HashSet;

use proptest::prelude::*;
use rangerdb::appendix::Appendix;
use rangerdb::bucket::{self, bucket_size_bytes, BUCKET_CAPACITY};
use rangerdb::bucket_builder::{BucketBuilder, PushOutcome};
use rangerdb::hash::{tag15, tag_identity, APPENDIX_FLAG};
use rangerdb::{Lookup, NullObserver, RangerDb, Record};

fn build_db(records: Vec<Record>, use64: bool, compression: u32) -> RangerDb {
    let count = records.len();
    let mut source = records.into_iter();
    RangerDb::build_with_observer(count, use64, compression, &mut source, &mut NullObserver)
        .expect("build failed")
}

/// Finds a key above `base` whose tag collides with `base`'s own tag.
fn colliding_key(base: u64) -> u64 {
    let target = tag15(base, base);
    (base + 1..)
        .find(|&k| tag15(k, base) == target)
        .expect("15-bit tag space must collide")
}

#[test]
fn collision_starts_a_new_bucket_before_capacity() {
    let base = 1_000_000u64;
    let other = colliding_key(base);
    let db = build_db(
        vec![Record::new(base, 1), Record::new(other, 2)],
        true,
        1,
    );

    // Two keys, but the tag collision forces a second bucket.
    assert_eq!(db.reader().bucket_num(), 2);
    let out = db.query(&[base, other, base, other]);
    assert_eq!(out[0], Lookup::Values64(&[1]));
    assert_eq!(out[1], Lookup::Values64(&[2]));
}

#[test]
fn packed_buckets_have_unique_nonzero_tags() {
    let mut scratch = BucketBuilder::new(true);
    let mut key = 500u64;
    while scratch.distinct_key_num() < BUCKET_CAPACITY {
        scratch.push(Record::new(key, key * 3));
        key += 7;
    }

    let mut apdx = Appendix::new();
    scratch.populate_appendix(&mut apdx);
    let mut page = vec![0u8; bucket_size_bytes(true)];
    scratch.pack(&mut page);

    assert_eq!(bucket::population(&page), BUCKET_CAPACITY);
    let mut seen = HashSet::new();
    for slot in 0..BUCKET_CAPACITY {
        let tag = tag_identity(bucket::raw_tag(&page, slot));
        assert_ne!(tag, 0, "slot {slot} holds the empty sentinel");
        assert!(seen.insert(tag), "slot {slot} repeats tag {tag:#06x}");
    }
}

#[test]
fn range_boundaries_stay_monotone_on_random_data() {
    let mut rng_state = 0x1234_5678_9ABC_DEFu64;
    let mut next = move || {
        // xorshift is plenty for monotone key gaps.
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    let mut key = 0u64;
    let mut records = Vec::new();
    for _ in 0..20_000 {
        key += 1 + next() % 1_000;
        records.push(Record::new(key, next()));
    }
    let db = build_db(records, true, 8);

    let ranges = db.extract_ranges();
    assert!(ranges.windows(2).all(|w| w[0] <= w[1]));
}

proptest! {
    /// Property 3: packing a bucket and reading it back yields the same
    /// key → values multimap, with each list in sorted order.
    #[test]
    fn pack_roundtrip_preserves_the_multimap(
        raw in prop::collection::vec((0u64..1 << 40, any::<u64>()), 1..120)
    ) {
        let mut records: Vec<Record> =
            raw.into_iter().map(|(k, v)| Record::new(k, v)).collect();
        records.sort_by_key(|m| m.key);

        let mut scratch = BucketBuilder::new(true);
        let mut inserted: Vec<u64> = Vec::new();
        for m in records {
            match scratch.push(m) {
                PushOutcome::Inserted => {
                    if !inserted.contains(&m.key) {
                        inserted.push(m.key);
                    }
                }
                PushOutcome::Rejected => break,
            }
        }

        let mut apdx = Appendix::new();
        scratch.populate_appendix(&mut apdx);
        let mut page = vec![0u8; bucket_size_bytes(true)];
        scratch.pack(&mut page);

        prop_assert_eq!(bucket::population(&page), inserted.len());
        for key in inserted {
            let mut expected = scratch.key_values(key).unwrap().to_vec();
            expected.sort_unstable();

            let tag = tag15(key, scratch.smallest_key());
            let hit = bucket::probe(&page, tag).expect("inserted key must probe");
            let got: Vec<u64> = if hit.raw_tag & APPENDIX_FLAG == 0 {
                vec![bucket::slot_u64(&page, hit.slot)]
            } else {
                let handle = bucket::slot_u64(&page, hit.slot);
                let count = (handle & 0xFFFF_FFFF) as usize;
                let offset = (handle >> 32) as usize;
                (0..count)
                    .map(|i| {
                        let at = offset + i * 8;
                        u64::from_le_bytes(apdx.data()[at..at + 8].try_into().unwrap())
                    })
                    .collect()
            };
            prop_assert_eq!(got, expected);
        }
    }

    /// End-to-end: any sorted record list round-trips through a built
    /// database, every inserted key returning its sorted value list.
    #[test]
    fn built_database_answers_every_inserted_key(
        raw in prop::collection::vec((0u64..1 << 32, 0u64..1 << 20), 1..200),
        compression in 1u32..5,
    ) {
        let mut records: Vec<Record> =
            raw.into_iter().map(|(k, v)| Record::new(k, v)).collect();
        records.sort_by_key(|m| m.key);

        let mut expected = rangerdb::RecordMap::new();
        for &m in &records {
            expected.add_record(m);
        }

        let db = build_db(records, true, compression);
        let keys: Vec<u64> = expected.keys().collect();
        for chunk in keys.chunks(4) {
            let mut batch = [chunk[0]; 4];
            batch[..chunk.len()].copy_from_slice(chunk);
            let out = db.query(&batch);
            for (i, &key) in batch.iter().enumerate() {
                let mut want = expected.values(key).unwrap().to_vec();
                want.sort_unstable();
                match out[i] {
                    Lookup::Values64(got) => prop_assert_eq!(got, want.as_slice()),
                    other => prop_assert!(false, "key {} returned {:?}", key, other),
                }
            }
        }
    }
}
