use std::collections::HashSet;

use atmosphere::approval::ApprovalConfig;
use atmosphere::config::NodeConfig;
use atmosphere::identity::verify_token;
use atmosphere::transport::{admit_over_stream, join_over_stream, SessionState};
use atmosphere::AtmosphereNode;
use atmosphere_core::JoinEndpoints;
use tempfile::tempdir;
use tokio::io::duplex;

#[tokio::test]
async fn a_founder_issued_token_admits_a_joining_node_end_to_end() {
    let founder_dir = tempdir().unwrap();
    let founder = AtmosphereNode::new(founder_dir.path(), NodeConfig::default(), ApprovalConfig::default()).unwrap();
    let founder_verifying_key = founder.identity.verifying_key();

    let token = founder
        .issue_join_token(
            "mesh-1",
            "home mesh",
            vec!["llm/*".to_string()],
            Some(3600.0),
            JoinEndpoints { local: Some("127.0.0.1:0".into()), public: None, relay: None },
        )
        .unwrap();

    let (joiner_io, founder_io) = duplex(4096);

    let revocation_set = HashSet::new();
    let admitter = tokio::spawn(async move {
        admit_over_stream(founder_io, "mesh-1", "home mesh", |presented, _proposed_caps| {
            verify_token(presented, &founder_verifying_key, &revocation_set)
                .map(|()| "session-1".to_string())
                .map_err(|e| e.to_string())
        })
        .await
    });

    let session = join_over_stream(joiner_io, token, vec!["llm/chat".into()], "joining-node")
        .await
        .unwrap();

    assert_eq!(session.state, SessionState::Established);
    let admitted = admitter.await.unwrap().unwrap();
    assert_eq!(admitted.peer_node_id, "joining-node");
}

#[tokio::test]
async fn a_revoked_token_is_rejected_by_the_admitting_node() {
    let founder_dir = tempdir().unwrap();
    let founder = AtmosphereNode::new(founder_dir.path(), NodeConfig::default(), ApprovalConfig::default()).unwrap();
    let founder_verifying_key = founder.identity.verifying_key();

    let token = founder
        .issue_join_token(
            "mesh-1",
            "home mesh",
            vec!["llm/*".to_string()],
            None,
            JoinEndpoints::default(),
        )
        .unwrap();
    founder.revoke_token(&token.token_id).unwrap();

    let mut revocation_set = HashSet::new();
    revocation_set.insert(token.token_id.clone());

    let (joiner_io, founder_io) = duplex(4096);
    let admitter = tokio::spawn(async move {
        admit_over_stream(founder_io, "mesh-1", "home mesh", |presented, _proposed_caps| {
            verify_token(presented, &founder_verifying_key, &revocation_set)
                .map(|()| "session-1".to_string())
                .map_err(|e| e.to_string())
        })
        .await
    });

    let result = join_over_stream(joiner_io, token, vec!["llm/chat".into()], "joining-node").await;
    assert!(result.is_err(), "a joiner presenting a revoked token must not be admitted");
    assert!(admitter.await.unwrap().is_err());
}
