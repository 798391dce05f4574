mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use tabletraft::ConsensusError;
use tabletraft::RaftRole;

/// Graceful leadership transfer.
///
/// What does this test do?
///
/// - elects a leader over {a, b, c};
/// - asks it to step down in favour of a chosen successor;
/// - asserts the successor campaigns immediately (even though the old leader
///   was alive moments ago), wins in a later term, and the old leader ends
///   up a follower;
/// - asserts writes flow through the new leader afterwards.
///
/// RUST_LOG=tabletraft=trace cargo test -p tabletraft --test stepdown
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_handoff() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::fast_options());
    let config = fixtures::config_of(&["a", "b", "c"]);
    for uuid in ["a", "b", "c"] {
        router.add_node(uuid, config.clone()).await?;
    }
    for uuid in ["a", "b", "c"] {
        router.start_node(uuid).await?;
    }

    let old_leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let old_term = router.consensus(&old_leader).await?.current_term();
    let successor = ["a", "b", "c"]
        .into_iter()
        .find(|u| *u != old_leader)
        .expect("two followers exist")
        .to_string();

    let r1 = router.client_write(&old_leader, b"r1").await?;
    router
        .wait_for_commit(&["a", "b", "c"], r1.index, Duration::from_secs(10))
        .await?;

    tracing::info!(%old_leader, %successor, "--- transferring leadership");
    router
        .consensus(&old_leader)
        .await?
        .step_down(Some(successor.as_str()))
        .await
        .map_err(anyhow::Error::new)?;
    assert_eq!(router.consensus(&old_leader).await?.role(), RaftRole::Follower);

    router
        .wait_for_state(&successor, Duration::from_secs(20), "successor leads", |s| {
            s.role == RaftRole::Leader && s.current_term > old_term
        })
        .await?;

    let r2 = router.client_write(&successor, b"r2").await?;
    router
        .wait_for_commit(&["a", "b", "c"], r2.index, Duration::from_secs(10))
        .await?;
    router.assert_logs_equal(&["a", "b", "c"]).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_down_requires_leadership() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::fast_options());
    let config = fixtures::config_of(&["a", "b", "c"]);
    for uuid in ["a", "b", "c"] {
        router.add_node(uuid, config.clone()).await?;
    }
    for uuid in ["a", "b", "c"] {
        router.start_node(uuid).await?;
    }
    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let follower = ["a", "b", "c"]
        .into_iter()
        .find(|u| *u != leader)
        .expect("two followers exist");

    let result = router.consensus(follower).await?.step_down(None).await;
    assert!(matches!(result, Err(ConsensusError::IllegalState(_))), "{:?}", result);

    // Transferring to an unknown peer is refused without stepping down.
    let result = router.consensus(&leader).await?.step_down(Some("nobody")).await;
    assert!(matches!(result, Err(ConsensusError::NotFound(_))), "{:?}", result);
    assert_eq!(router.consensus(&leader).await?.role(), RaftRole::Leader);
    Ok(())
}
