//! Media store behaviour shared by the memory and SQLite backends.

use media_pipeline::core::fingerprint::Fingerprint;
use media_pipeline::core::media::{
    DuplicatePair, ExifData, ExifRecord, FingerprintRecord, MediaCategory, MediaId, NewMedia,
    Resolution, Stage, StageStatus, StatusUpdate, ThumbnailRecord, UpsertBatch,
};
use media_pipeline::core::storage::{MediaStore, MemoryStore, SqliteStore};
use std::path::PathBuf;
use tempfile::TempDir;

fn stores() -> Vec<(&'static str, Box<dyn MediaStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        ("sqlite", Box::new(SqliteStore::in_memory().unwrap())),
    ]
}

fn media(n: u128, path: &str) -> NewMedia {
    let path = PathBuf::from(path);
    NewMedia {
        id: MediaId::from_u128(n),
        category: MediaCategory::from_path(&path),
        path,
        size_bytes: 1000 + n as u64,
    }
}

fn seed(store: &dyn MediaStore, entries: &[(u128, &str)]) {
    let batch = UpsertBatch {
        media: entries.iter().map(|(n, p)| media(*n, p)).collect(),
        ..UpsertBatch::default()
    };
    store.batch_upsert(&batch).unwrap();
}

fn id(n: u128) -> MediaId {
    MediaId::from_u128(n)
}

#[test]
fn eligibility_follows_the_stage_chain() {
    for (name, store) in stores() {
        seed(
            store.as_ref(),
            &[(1, "/p/a.jpg"), (2, "/p/b.nef"), (3, "/p/c.txt"), (4, "/p/d.mov")],
        );

        let exif: Vec<_> = store
            .find_eligible(Stage::Exif, 10)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(exif, vec![id(1), id(2)], "{}", name);
        assert!(store.find_eligible(Stage::Thumbnail, 10).unwrap().is_empty(), "{}", name);

        store
            .batch_update_status(Stage::Exif, &[StatusUpdate::done(id(1)), StatusUpdate::done(id(2))])
            .unwrap();

        let thumbnail: Vec<_> = store
            .find_eligible(Stage::Thumbnail, 10)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(thumbnail, vec![id(1)], "raw files stop after exif ({})", name);
        assert!(store.find_eligible(Stage::Exif, 10).unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn failed_items_are_not_selected_again() {
    for (name, store) in stores() {
        seed(store.as_ref(), &[(1, "/p/a.jpg"), (2, "/p/b.jpg")]);
        store
            .batch_update_status(Stage::Exif, &[StatusUpdate::failed(id(1), "corrupt")])
            .unwrap();

        let eligible = store.find_eligible(Stage::Exif, 10).unwrap();
        assert_eq!(eligible.len(), 1, "{}", name);
        assert_eq!(eligible[0].id, id(2), "{}", name);
        let failed = store.find_by_ids(&[id(1)]).unwrap();
        assert_eq!(failed[0].status(Stage::Exif), StageStatus::Failed, "{}", name);
    }
}

#[test]
fn limit_bounds_selection() {
    for (name, store) in stores() {
        seed(
            store.as_ref(),
            &[(1, "/p/1.jpg"), (2, "/p/2.jpg"), (3, "/p/3.jpg")],
        );
        assert_eq!(store.find_eligible(Stage::Exif, 2).unwrap().len(), 2, "{}", name);
    }
}

#[test]
fn rescanning_a_path_keeps_the_existing_row() {
    for (name, store) in stores() {
        seed(store.as_ref(), &[(1, "/p/a.jpg")]);
        seed(store.as_ref(), &[(2, "/p/a.jpg")]);

        assert_eq!(store.count().unwrap(), 1, "{}", name);
        assert_eq!(store.find_by_ids(&[id(1)]).unwrap().len(), 1, "{}", name);
        assert!(store.find_by_ids(&[id(2)]).unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn stage_records_are_visible_on_items() {
    for (name, store) in stores() {
        seed(store.as_ref(), &[(1, "/p/a.jpg")]);
        let fingerprint = Fingerprint::parse(&"a".repeat(60)).unwrap();
        let batch = UpsertBatch {
            exif: vec![ExifRecord {
                media_id: id(1),
                data: ExifData {
                    width: Some(4000),
                    height: Some(3000),
                    camera_make: Some("Sony".to_string()),
                    ..ExifData::default()
                },
            }],
            thumbnails: vec![ThumbnailRecord {
                media_id: id(1),
                thumbnail_path: PathBuf::from("/thumbs/1.jpg"),
                file_hash: "00ff".to_string(),
            }],
            fingerprints: vec![FingerprintRecord {
                media_id: id(1),
                fingerprint: fingerprint.clone(),
            }],
            ..UpsertBatch::default()
        };
        assert_eq!(store.batch_upsert(&batch).unwrap(), 3, "{}", name);

        let item = store.find_by_ids(&[id(1)]).unwrap().remove(0);
        assert_eq!(item.dimensions(), Some((4000, 3000)), "{}", name);
        assert_eq!(item.file_hash.as_deref(), Some("00ff"), "{}", name);
        assert_eq!(item.fingerprint, Some(fingerprint), "{}", name);
    }
}

#[test]
fn fingerprinted_lists_live_items_of_one_category() {
    for (name, store) in stores() {
        seed(
            store.as_ref(),
            &[(1, "/p/a.jpg"), (2, "/p/b.jpg"), (3, "/p/c.nef"), (4, "/p/d.jpg")],
        );
        let fp = |c: &str| Fingerprint::parse(&c.repeat(60)).unwrap();
        let batch = UpsertBatch {
            fingerprints: vec![
                FingerprintRecord { media_id: id(1), fingerprint: fp("1") },
                FingerprintRecord { media_id: id(2), fingerprint: fp("2") },
                FingerprintRecord { media_id: id(3), fingerprint: fp("3") },
            ],
            ..UpsertBatch::default()
        };
        store.batch_upsert(&batch).unwrap();
        store
            .resolve_duplicates(&[Resolution { keep: id(1), discard: id(2) }])
            .unwrap();

        let images: Vec<_> = store
            .fingerprinted(MediaCategory::Image)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(images, vec![id(1)], "{}", name);
    }
}

#[test]
fn pairs_upsert_by_canonical_key() {
    for (name, store) in stores() {
        seed(store.as_ref(), &[(1, "/p/a.jpg"), (2, "/p/b.jpg")]);
        let first = UpsertBatch {
            duplicates: vec![DuplicatePair::new(id(2), id(1), 4, 240)],
            ..UpsertBatch::default()
        };
        let again = UpsertBatch {
            duplicates: vec![DuplicatePair::new(id(1), id(2), 3, 240)],
            ..UpsertBatch::default()
        };
        store.batch_upsert(&first).unwrap();
        store.batch_upsert(&again).unwrap();

        let pairs = store.duplicate_pairs().unwrap();
        assert_eq!(pairs.len(), 1, "{}", name);
        assert_eq!(pairs[0].key(), (id(1), id(2)), "{}", name);
        assert_eq!(pairs[0].hamming_distance(), 3, "{}", name);
    }
}

#[test]
fn resolving_soft_deletes_and_drops_pairs() {
    for (name, store) in stores() {
        seed(
            store.as_ref(),
            &[(1, "/p/a.jpg"), (2, "/p/b.jpg"), (3, "/p/c.jpg")],
        );
        let batch = UpsertBatch {
            duplicates: vec![
                DuplicatePair::new(id(1), id(2), 0, 240),
                DuplicatePair::new(id(2), id(3), 0, 240),
                DuplicatePair::new(id(1), id(3), 2, 240),
            ],
            ..UpsertBatch::default()
        };
        store.batch_upsert(&batch).unwrap();

        let discarded = store
            .resolve_duplicates(&[Resolution { keep: id(1), discard: id(2) }])
            .unwrap();
        assert_eq!(discarded, 1, "{}", name);

        let pairs = store.duplicate_pairs().unwrap();
        assert_eq!(pairs.len(), 1, "{}", name);
        assert_eq!(pairs[0].key(), (id(1), id(3)), "{}", name);

        let item = store.find_by_ids(&[id(2)]).unwrap().remove(0);
        assert!(item.is_deleted, "{}", name);
        assert!(
            store
                .find_eligible(Stage::Exif, 10)
                .unwrap()
                .iter()
                .all(|i| i.id != id(2)),
            "{}",
            name
        );
    }
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("media.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        seed(&store, &[(1, "/p/a.jpg")]);
        store
            .batch_update_status(Stage::Exif, &[StatusUpdate::done(id(1))])
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let item = store.find_by_ids(&[id(1)]).unwrap().remove(0);
    assert_eq!(item.status(Stage::Exif), StageStatus::Done);
    assert_eq!(item.size_bytes, 1001);
}

#[test]
fn persist_batch_writes_rows_and_statuses_together() {
    for (name, store) in stores() {
        seed(store.as_ref(), &[(1, "/p/a.jpg"), (2, "/p/b.jpg")]);
        let batch = UpsertBatch {
            exif: vec![ExifRecord {
                media_id: id(1),
                data: ExifData {
                    width: Some(10),
                    height: Some(20),
                    ..ExifData::default()
                },
            }],
            ..UpsertBatch::default()
        };
        let persisted = store
            .persist_batch(
                Stage::Exif,
                &batch,
                &[StatusUpdate::done(id(1)), StatusUpdate::failed(id(2), "corrupt")],
            )
            .unwrap();
        assert_eq!((persisted.rows, persisted.statuses), (1, 2), "{}", name);

        let items = store.find_by_ids(&[id(1), id(2)]).unwrap();
        assert_eq!(items[0].dimensions(), Some((10, 20)), "{}", name);
        assert_eq!(items[0].status(Stage::Exif), StageStatus::Done, "{}", name);
        assert_eq!(items[1].status(Stage::Exif), StageStatus::Failed, "{}", name);
    }
}

#[test]
fn failed_persist_batch_leaves_rows_and_statuses_untouched() {
    let store = MemoryStore::new();
    seed(&store, &[(1, "/p/a.jpg")]);
    store.fail_writes("disk full");
    let batch = UpsertBatch {
        fingerprints: vec![FingerprintRecord {
            media_id: id(1),
            fingerprint: Fingerprint::parse(&"0".repeat(60)).unwrap(),
        }],
        ..UpsertBatch::default()
    };

    assert!(store
        .persist_batch(Stage::Hash, &batch, &[StatusUpdate::done(id(1))])
        .is_err());

    let item = store.find_by_ids(&[id(1)]).unwrap().remove(0);
    assert!(item.fingerprint.is_none());
    assert_eq!(item.status(Stage::Hash), StageStatus::Pending);
}
