mod fixtures;

use anyhow::Result;
use pretty_assertions::assert_eq;
use tabletraft::ConsensusErrorCode;
use tabletraft::OpId;
use tabletraft::OpIdType;

/// Log-matching enforcement, driven directly against a single follower.
///
/// The follower accepts a term-1 prefix with a pending `(1,5)`, then a term-2
/// leader overwrites index 5: the follower must abort `(1,5)`, truncate, and
/// accept `(2,5)` (the delete-conflicting-suffix rule).
///
/// RUST_LOG=tabletraft=trace cargo test -p tabletraft --test log_matching
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_suffix_is_replaced() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    // Term-1 leader "b" replicates five writes, committing the first four.
    let ops: Vec<_> = (1..=5).map(|i| fixtures::write_msg(1, i, format!("w{}", i).as_bytes())).collect();
    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 4, ops))
        .await?;
    assert!(resp.success, "unexpected rejection: {:?}", resp.error);
    assert_eq!(resp.last_received, OpId::new(1, 5));
    assert_eq!(resp.last_committed_index, 4);

    // Term-2 leader "c" has a different entry at index 5.
    let resp = node
        .consensus
        .update(fixtures::append_req(
            "c",
            2,
            OpId::new(1, 4),
            4,
            vec![fixtures::write_msg(2, 5, b"w5-prime")],
        ))
        .await?;
    assert!(resp.success, "unexpected rejection: {:?}", resp.error);
    assert_eq!(resp.term, 2);
    assert_eq!(resp.last_received, OpId::new(2, 5));

    // The log replaced the conflicting tail.
    assert_eq!(
        node.log.opids(),
        vec![
            OpId::new(1, 1),
            OpId::new(1, 2),
            OpId::new(1, 3),
            OpId::new(1, 4),
            OpId::new(2, 5),
        ],
    );

    // Committing index 5 applies the replacement, never the aborted write.
    let resp = node
        .consensus
        .update(fixtures::append_req("c", 2, OpId::new(2, 5), 5, vec![]))
        .await?;
    assert!(resp.success);
    assert_eq!(node.consensus.get_last_opid(OpIdType::Committed), OpId::new(2, 5));

    let applied = node.factory.applied();
    assert_eq!(applied.len(), 5);
    assert_eq!(applied[4], (OpId::new(2, 5), b"w5-prime".to_vec()));
    assert!(!applied.iter().any(|(_, data)| data == b"w5"));
    Ok(())
}

/// A request whose effective preceding entry is not in the follower's log is
/// rejected with `PrecedingEntryDidntMatch` and the follower's last-received
/// OpId, so the leader can back off.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_preceding_entry_is_rejected() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 0, vec![fixtures::write_msg(1, 1, b"w1")]))
        .await?;
    assert!(resp.success);

    // The leader optimistically assumes we are at index 7.
    let resp = node
        .consensus
        .update(fixtures::append_req(
            "b",
            1,
            OpId::new(1, 7),
            1,
            vec![fixtures::write_msg(1, 8, b"w8")],
        ))
        .await?;
    assert!(!resp.success);
    assert_eq!(resp.error, Some(ConsensusErrorCode::PrecedingEntryDidntMatch));
    assert_eq!(resp.last_received, OpId::new(1, 1));
    Ok(())
}

/// A stale leader's request is answered with the newer term and no success.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_term_is_rejected() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    let resp = node
        .consensus
        .update(fixtures::append_req("c", 2, OpId::MIN, 0, vec![fixtures::write_msg(2, 1, b"w1")]))
        .await?;
    assert!(resp.success);

    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 0, vec![fixtures::write_msg(1, 1, b"stale")]))
        .await?;
    assert!(!resp.success);
    assert_eq!(resp.term, 2);
    assert_eq!(resp.error, Some(ConsensusErrorCode::InvalidTerm));
    Ok(())
}

/// Replaying an already-acknowledged AppendEntries is a no-op: the response
/// equals the previous success, and the log is unchanged.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_request_is_idempotent() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    let req = fixtures::append_req(
        "b",
        1,
        OpId::MIN,
        1,
        vec![fixtures::write_msg(1, 1, b"w1"), fixtures::write_msg(1, 2, b"w2")],
    );
    let first = node.consensus.update(req.clone()).await?;
    assert!(first.success);

    let replay = node.consensus.update(req).await?;
    assert_eq!(first, replay);
    assert_eq!(node.log.opids(), vec![OpId::new(1, 1), OpId::new(1, 2)]);

    // The write was applied exactly once.
    let applied = node.factory.applied();
    assert_eq!(applied.iter().filter(|(id, _)| *id == OpId::new(1, 1)).count(), 1);
    Ok(())
}

/// Two leaders cannot coexist in one term: a second uuid claiming leadership
/// for the already-observed term is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_leader_in_same_term_conflicts() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 0, vec![]))
        .await?;
    assert!(resp.success);

    let resp = node
        .consensus
        .update(fixtures::append_req("c", 1, OpId::MIN, 0, vec![]))
        .await?;
    assert!(!resp.success);
    assert_eq!(resp.error, Some(ConsensusErrorCode::LeaderConflict));
    Ok(())
}
