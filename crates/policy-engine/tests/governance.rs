//! Input and output governance through the engine facade
//!
//! Scenarios:
//! 1. ExecuteCount(3): fourth release is refused and leaves state untouched
//! 2. ExecuteOnce behaves as ExecuteCount(1)
//! 3. Ownership: ids are attributed to the first node that holds them
//! 4. ExactMatch: disallowed keys dropped, mismatched ids refused
//! 5. Persisted state: concurrent releases against one policy id serialize

mod helpers;

use helpers::*;
use policy_engine::store::{ObjectStore, StoredObject};
use policy_engine::{
    ExactMatch, GovernanceError, InputPolicy, InputValue, OutputPolicy, OutputPolicyExecuteCount,
    OutputPolicyExecuteOnce, OwnershipError, PolicyError, PolicyState,
};
use policy_lang::Value;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn kwargs(pairs: &[(&str, Uuid)]) -> BTreeMap<String, InputValue> {
    pairs.iter().map(|(k, id)| (k.to_string(), InputValue::Id(*id))).collect()
}

// =============================================================================
// Output governance
// =============================================================================

#[test]
fn test_execute_count_exhausts_after_limit() {
    let h = harness();
    let n = node("a");
    let mut policy = OutputPolicyExecuteCount::new(3, vec!["model".into()]);

    for _ in 0..3 {
        h.engine.apply_output(&mut policy, &ctx(&n, "alice"), Uuid::new_v4()).unwrap();
    }
    let before = policy.clone();
    let err = h.engine.apply_output(&mut policy, &ctx(&n, "alice"), Uuid::new_v4()).unwrap_err();

    assert_eq!(err, GovernanceError::Exhausted { count: 3, limit: 3 });
    assert_eq!(policy, before);
    assert_eq!(policy.output_history().len(), 3);
    assert_eq!(
        policy.public_state().unwrap(),
        Value::Map(BTreeMap::from([
            ("count".to_string(), Value::Int(3)),
            ("limit".to_string(), Value::Int(3)),
        ]))
    );
}

#[test]
fn test_execute_once_matches_count_of_one() {
    let n = node("a");
    let mut once = OutputPolicyExecuteOnce::new(vec![]);
    let mut count = OutputPolicyExecuteCount::new(1, vec![]);

    let first = (
        once.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).is_ok(),
        count.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).is_ok(),
    );
    assert_eq!(first, (true, true));

    let once_err = once.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).unwrap_err();
    let count_err = count.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).unwrap_err();
    assert_eq!(once_err, count_err);
    assert_eq!(once.public_state().unwrap(), count.public_state().unwrap());
}

#[test]
fn test_history_records_executing_user() {
    let n = node("a");
    let mut policy = OutputPolicyExecuteCount::new(2, vec![]);
    let output = Uuid::new_v4();
    let record = policy.apply_output(&ctx(&n, "bob"), output.into()).unwrap();

    assert_eq!(record.executing_user_verify_key, key("bob"));
    assert_eq!(record.outputs.ids(), vec![output]);
    assert_eq!(policy.output_history(), [record]);
}

#[test]
fn test_codec_preserves_count_limit_and_history() {
    let h = harness();
    let n = node("a");
    let mut policy = OutputPolicyExecuteCount::new(5, vec![]);
    policy.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).unwrap();
    policy.apply_output(&ctx(&n, "alice"), Uuid::new_v4().into()).unwrap();

    let bytes = h.engine.update_policy_state(&PolicyState::from(policy.clone())).unwrap();
    let decoded: PolicyState = policy_engine::codec::deserialize(&bytes).unwrap();
    match decoded {
        PolicyState::OutputPolicyExecuteCount(restored) => {
            assert_eq!(restored.count(), 2);
            assert_eq!(restored.limit(), 5);
            assert_eq!(restored.output_history().len(), 2);
            assert_eq!(restored, policy);
        }
        other => panic!("decoded as {}", other.kind()),
    }
}

// =============================================================================
// Ownership resolution
// =============================================================================

#[tokio::test]
async fn test_ownership_attributes_to_holding_node() {
    let h = harness();
    let (a, b) = (node("a"), node("b"));
    let id = Uuid::new_v4();
    connect(&h, &a, &[]).await;
    connect(&h, &b, &[id]).await;

    let resolved = h.engine.resolve_ownership(&kwargs(&[("x", id)])).await.unwrap();
    assert_eq!(
        resolved,
        BTreeMap::from([(b.clone(), BTreeMap::from([("x".to_string(), id)]))])
    );
}

#[tokio::test]
async fn test_ownership_first_match_wins() {
    let h = harness();
    let (a, b) = (node("a"), node("b"));
    let id = Uuid::new_v4();
    connect(&h, &a, &[id]).await;
    connect(&h, &b, &[id]).await;

    let resolved = h.engine.resolve_ownership(&kwargs(&[("x", id)])).await.unwrap();
    assert_eq!(resolved.keys().collect::<Vec<_>>(), vec![&a]);
}

#[tokio::test]
async fn test_unclaimed_id_is_an_ownership_error() {
    let h = harness();
    let a = node("a");
    connect(&h, &a, &[Uuid::new_v4()]).await;

    let stray = Uuid::new_v4();
    let err = h.engine.resolve_ownership(&kwargs(&[("x", stray)])).await.unwrap_err();
    assert_eq!(
        err,
        OwnershipError::Unclaimed {
            argument: "x".into(),
            id: stray
        }
    );
}

#[tokio::test]
async fn test_value_without_identifier() {
    let h = harness();
    let mut args = BTreeMap::new();
    args.insert("x".to_string(), InputValue::ActionObject { id: None });
    let err = h.engine.resolve_ownership(&args).await.unwrap_err();
    assert!(matches!(err, OwnershipError::MissingUid { .. }));
}

// =============================================================================
// ExactMatch filtering
// =============================================================================

#[tokio::test]
async fn test_exact_match_filters_to_allow_list() {
    let h = harness();
    let n = node("a");
    let (data, labels) = (Uuid::new_v4(), Uuid::new_v4());
    connect(&h, &n, &[data, labels]).await;
    h.objects
        .put(StoredObject {
            id: data,
            payload: serde_json::json!({"rows": 10}),
        })
        .await
        .unwrap();

    let allowed = h.engine.resolve_ownership(&kwargs(&[("data", data)])).await.unwrap();
    let policy = ExactMatch::new(allowed);

    let filtered = h
        .engine
        .filter_inputs(&policy, &kwargs(&[("data", data), ("labels", labels)]), &ctx(&n, "alice"), Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["data"]);
    assert_eq!(filtered["data"].payload["rows"], 10);
}

#[tokio::test]
async fn test_exact_match_refuses_swapped_identifier() {
    let h = harness();
    let n = node("a");
    let data = Uuid::new_v4();
    let policy = ExactMatch::new(BTreeMap::from([(n.clone(), BTreeMap::from([("data".to_string(), data)]))]));

    let err = h
        .engine
        .filter_inputs(&policy, &kwargs(&[("data", Uuid::new_v4())]), &ctx(&n, "alice"), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PolicyError::Governance(GovernanceError::Violation { ref argument, .. }) if argument == "data"
    ));

    let stranger = node("z");
    let err = policy.allowed_ids_only(&kwargs(&[("data", data)]), &ctx(&stranger, "alice")).unwrap_err();
    assert!(matches!(err, GovernanceError::NotOwner { .. }));
}

#[tokio::test]
async fn test_custom_input_policy_predicate() {
    let h = harness();
    let n = node("a");
    let (data, labels) = (Uuid::new_v4(), Uuid::new_v4());
    connect(&h, &n, &[data, labels]).await;
    for id in [data, labels] {
        h.objects
            .put(StoredObject {
                id,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
    }

    let submitted = h
        .engine
        .submit(
            policy_engine::SubmitUserPolicy::new(ONLY_DATA, "OnlyData", vec!["data".into(), "labels".into()]),
            &key("alice"),
        )
        .unwrap();
    let args = kwargs(&[("data", data), ("labels", labels)]);
    let policy = h
        .engine
        .instantiate_input(&submitted, Default::default(), &args)
        .await
        .unwrap()
        .into_input()
        .unwrap();

    let filtered = h
        .engine
        .filter_inputs(&policy, &args, &ctx(&n, "alice"), submitted.id)
        .await
        .unwrap();
    assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["data"]);
}

// =============================================================================
// Persisted state
// =============================================================================

#[tokio::test]
async fn test_concurrent_persisted_releases_respect_limit() {
    let h = Arc::new(harness());
    let n = node("a");
    let policy = OutputPolicyExecuteCount::new(3, vec![]);
    let id = policy.id;
    h.engine.save_policy_state(&policy.into()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        let context = ctx(&n, "alice");
        tasks.push(tokio::spawn(async move {
            h.engine.apply_output_persisted(id, &context, Uuid::new_v4()).await
        }));
    }

    let mut released = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => released += 1,
            Err(e) if e.is_exhausted() => exhausted += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((released, exhausted), (3, 5));

    match h.engine.load_policy_state(id).await.unwrap() {
        PolicyState::OutputPolicyExecuteCount(p) => assert_eq!(p.output_history().len(), 3),
        other => panic!("unexpected state {}", other.kind()),
    }
}

#[tokio::test]
async fn test_persisted_custom_release() {
    let h = harness();
    let n = node("a");
    let submitted = h
        .engine
        .submit(policy_engine::SubmitUserPolicy::new(RATE_LIMITED, "RateLimited", vec![]), &key("alice"))
        .unwrap();
    let instance = h
        .engine
        .instantiate(&submitted, policy_engine::InitArgs::new().arg(1i64))
        .unwrap()
        .into_output()
        .unwrap();
    let id = instance.id();
    h.engine.save_policy_state(&PolicyState::from(&instance)).await.unwrap();

    h.engine.apply_output_persisted(id, &ctx(&n, "alice"), Uuid::new_v4()).await.unwrap();
    let err = h
        .engine
        .apply_output_persisted(id, &ctx(&n, "alice"), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::Governance(GovernanceError::Rejected { .. })));
}

#[tokio::test]
async fn test_persisted_custom_release_at_configured_version() {
    let h = harness_with(policy_engine::EngineConfig {
        fallback_version: 2,
        ..Default::default()
    });
    let n = node("a");
    let submitted = h
        .engine
        .submit(policy_engine::SubmitUserPolicy::new(RATE_LIMITED, "RateLimited", vec![]), &key("alice"))
        .unwrap();
    let instance = h
        .engine
        .instantiate(&submitted, policy_engine::InitArgs::new().arg(2i64))
        .unwrap()
        .into_output()
        .unwrap();
    let id = instance.id();
    h.engine.save_policy_state(&PolicyState::from(&instance)).await.unwrap();

    for _ in 0..2 {
        h.engine.apply_output_persisted(id, &ctx(&n, "alice"), Uuid::new_v4()).await.unwrap();
    }
    let err = h
        .engine
        .apply_output_persisted(id, &ctx(&n, "alice"), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::Governance(GovernanceError::Rejected { .. })));
}
