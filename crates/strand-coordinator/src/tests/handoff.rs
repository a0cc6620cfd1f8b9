//! Hinted-handoff substitution on the write path.

use strand_store::SegmentStore;
use strand_types::SegmentIdent;

use crate::tests::helpers::{archive_request, cluster, test_data, TestCluster};
use crate::{Archiver, Destroyer};

fn segment_ident(key: &str, segment_number: u8) -> SegmentIdent {
    SegmentIdent {
        avatar_id: 1,
        key: key.to_string(),
        version_number: 1,
        segment_number,
    }
}

/// Count the nodes holding a local copy of the given segment.
async fn copies_of(c: &TestCluster, ident: &SegmentIdent) -> usize {
    let mut copies = 0;
    for node in &c.nodes {
        if node.store.contains(ident).await.unwrap() {
            copies += 1;
        }
    }
    copies
}

#[tokio::test]
async fn test_write_to_down_primary_lands_on_standins_with_hints() {
    let c = cluster(5, 3);
    let archiver = Archiver::new(c.bus.clone(), c.table.clone(), c.config.clone());

    c.bus.set_unreachable("storage-2").await;
    archiver
        .archive(archive_request(1, "k", 1, 100, vec![test_data(40); 5]))
        .await
        .unwrap();

    // Segment 2 never reached its primary. It exists on exactly the
    // sampled stand-ins, and each stand-in carries exactly one hint
    // naming the down primary. One copy, one hint, nothing lost and
    // nothing duplicated.
    let ident = segment_ident("k", 2);
    assert!(!c.node("storage-2").store.contains(&ident).await.unwrap());
    assert_eq!(copies_of(&c, &ident).await, 2);
    for node in &c.nodes {
        let holds_copy = node.store.contains(&ident).await.unwrap();
        let hints = node.hints.count("storage-2").unwrap();
        assert_eq!(hints, usize::from(holds_copy));
    }

    // The other segments went to their primaries, one copy each.
    for segment in [1u8, 3, 4, 5] {
        let ident = segment_ident("k", segment);
        assert_eq!(copies_of(&c, &ident).await, 1);
        assert!(c
            .node(&format!("storage-{segment}"))
            .store
            .contains(&ident)
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn test_rewriting_same_version_does_not_duplicate_hints() {
    // 3 nodes with one down leaves exactly 2 stand-ins, so both writes
    // pick the same pair.
    let c = cluster(3, 2);
    let archiver = Archiver::new(c.bus.clone(), c.table.clone(), c.config.clone());

    c.bus.set_unreachable("storage-1").await;
    archiver
        .archive(archive_request(1, "k", 1, 100, vec![test_data(16); 3]))
        .await
        .unwrap();
    archiver
        .archive(archive_request(1, "k", 1, 200, vec![test_data(16); 3]))
        .await
        .unwrap();

    for name in ["storage-2", "storage-3"] {
        assert_eq!(c.node(name).hints.count("storage-1").unwrap(), 1);
    }
}

#[tokio::test]
async fn test_destroy_with_down_primary_records_hints() {
    let c = cluster(3, 2);
    let archiver = Archiver::new(c.bus.clone(), c.table.clone(), c.config.clone());
    let destroyer = Destroyer::new(c.bus.clone(), c.table.clone(), c.config.clone());

    archiver
        .archive(archive_request(1, "k", 1, 100, vec![test_data(16); 3]))
        .await
        .unwrap();

    c.bus.set_unreachable("storage-1").await;
    let freed = destroyer.destroy(1, "k", 1, 150).await.unwrap();
    // The stand-ins never held segment 1, so the minimum over all
    // replies reports nothing freed.
    assert_eq!(freed, 0);

    // The tombstone for segment 1 is owed to the down primary.
    let hints: usize = ["storage-2", "storage-3"]
        .iter()
        .map(|n| c.node(n).hints.count("storage-1").unwrap())
        .sum();
    assert_eq!(hints, 2);

    // The live nodes no longer serve the key.
    let ident = segment_ident("k", 2);
    assert!(!c.node("storage-2").store.contains(&ident).await.unwrap());
}

#[tokio::test]
async fn test_no_hints_when_everyone_is_up() {
    let c = cluster(3, 2);
    let archiver = Archiver::new(c.bus.clone(), c.table.clone(), c.config.clone());

    archiver
        .archive(archive_request(1, "k", 1, 100, vec![test_data(16); 3]))
        .await
        .unwrap();

    for node in &c.nodes {
        for dest in ["storage-1", "storage-2", "storage-3"] {
            assert_eq!(node.hints.count(dest).unwrap(), 0);
        }
    }
}
