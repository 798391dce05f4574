mod fixtures;

use anyhow::Result;
use pretty_assertions::assert_eq;
use tabletraft::ConsensusErrorCode;
use tabletraft::OpId;
use tabletraft::VoteRequest;

fn vote_req(candidate: &str, term: i64, last_logged: OpId) -> VoteRequest {
    VoteRequest {
        tablet_id: "tablet-1".to_string(),
        candidate_uuid: candidate.to_string(),
        term,
        last_logged_opid: last_logged,
        is_pre_election: false,
        ignore_live_leader: false,
    }
}

/// The voter decision table, driven directly against a single node.
///
/// RUST_LOG=tabletraft=trace cargo test -p tabletraft --test request_vote
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_is_unique_and_idempotent_per_term() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    let resp = node.consensus.request_vote(vote_req("b", 1, OpId::MIN)).await?;
    assert!(resp.vote_granted);
    assert_eq!(resp.term, 1);

    // The vote is durable before it is acknowledged.
    let stored = node.meta.stored().expect("metadata must have been flushed");
    assert_eq!(stored.current_term, 1);
    assert_eq!(stored.voted_for.as_deref(), Some("b"));

    // The same candidate asking again in the same term is granted again.
    let resp = node.consensus.request_vote(vote_req("b", 1, OpId::MIN)).await?;
    assert!(resp.vote_granted);

    // A different candidate in the same term is refused.
    let resp = node.consensus.request_vote(vote_req("c", 1, OpId::MIN)).await?;
    assert!(!resp.vote_granted);
    assert_eq!(resp.error, Some(ConsensusErrorCode::AlreadyVoted));

    // A candidate from a stale term is refused with our term.
    let resp = node.consensus.request_vote(vote_req("c", 0, OpId::MIN)).await?;
    assert!(!resp.vote_granted);
    assert_eq!(resp.error, Some(ConsensusErrorCode::InvalidTerm));
    assert_eq!(resp.term, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_denied_while_leader_is_alive() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    // Leader "b" makes contact; votes are withheld for an election period.
    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 0, vec![]))
        .await?;
    assert!(resp.success);

    let resp = node.consensus.request_vote(vote_req("c", 2, OpId::MIN)).await?;
    assert!(!resp.vote_granted);
    assert_eq!(resp.error, Some(ConsensusErrorCode::LeaderIsAlive));

    // A forced hand-off ignores leader liveness and is evaluated on the
    // merits.
    let mut req = vote_req("c", 3, OpId::MIN);
    req.ignore_live_leader = true;
    let resp = node.consensus.request_vote(req).await?;
    assert!(resp.vote_granted);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_denied_to_stale_log() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;

    // Five entries from leader "b" in term 1.
    let ops: Vec<_> = (1..=5).map(|i| fixtures::write_msg(1, i, b"w")).collect();
    let resp = node
        .consensus
        .update(fixtures::append_req("b", 1, OpId::MIN, 0, ops))
        .await?;
    assert!(resp.success);

    // Candidate "c" never saw entries past (1,3): denied.
    let mut req = vote_req("c", 2, OpId::new(1, 3));
    req.ignore_live_leader = true;
    let resp = node.consensus.request_vote(req).await?;
    assert!(!resp.vote_granted);
    assert_eq!(resp.error, Some(ConsensusErrorCode::LastOpIdTooOld));
    // The higher term stuck even though the vote was denied.
    assert_eq!(resp.term, 2);

    // A candidate with a matching log is granted.
    let mut req = vote_req("c", 3, OpId::new(1, 5));
    req.ignore_live_leader = true;
    let resp = node.consensus.request_vote(req).await?;
    assert!(resp.vote_granted);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_election_persists_nothing() -> Result<()> {
    fixtures::init_tracing();

    let node = fixtures::standalone_node("a", fixtures::config_of(&["a", "b", "c"]), fixtures::quiet_options()).await?;
    let flushes_before = node.meta.flush_count();

    let mut req = vote_req("b", 1, OpId::MIN);
    req.is_pre_election = true;
    let resp = node.consensus.request_vote(req).await?;
    assert!(resp.vote_granted);

    // Nothing was flushed, the term did not move, and no vote is bound.
    assert_eq!(node.meta.flush_count(), flushes_before);
    assert_eq!(node.consensus.current_term(), 0);

    // The real vote for another candidate in that term is still available.
    let resp = node.consensus.request_vote(vote_req("c", 1, OpId::MIN)).await?;
    assert!(resp.vote_granted);
    Ok(())
}
