//! Locator failover behavior through the actor handle.

use watchpost::actors::locator::LocatorHandle;
use watchpost::locator::{
    AssignOutcome, Locator, LocatorError, LocatorMode, QueryResult, ServiceType, Stickiness,
};

fn spawn_directory() -> LocatorHandle {
    LocatorHandle::spawn(Locator::new(LocatorMode::Distributed), None)
}

#[tokio::test]
async fn stickiness_survives_unrelated_registrations() {
    let handle = spawn_directory();
    handle
        .register("hub-1", ServiceType::History, 2, Stickiness::Sticky)
        .await;

    let first = handle.resolve("db1", ServiceType::History).await.unwrap();
    assert_eq!(first.server(), "hub-1");

    // a heavier newcomer and a burst of other hosts must not move db1
    handle
        .register("hub-2", ServiceType::History, 9, Stickiness::Sticky)
        .await;
    for i in 0..10 {
        handle
            .resolve(&format!("other{i}"), ServiceType::History)
            .await
            .unwrap();
    }

    assert_eq!(
        handle.resolve("db1", ServiceType::History).await.unwrap(),
        AssignOutcome::Pinned("hub-1".to_string())
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn roaming_hosts_float_to_a_live_server() {
    let handle = spawn_directory();
    handle
        .register("hub-1", ServiceType::Graph, 2, Stickiness::Roaming)
        .await;
    handle
        .register("hub-2", ServiceType::Graph, 2, Stickiness::Roaming)
        .await;

    let original = handle
        .resolve("db1", ServiceType::Graph)
        .await
        .unwrap()
        .server()
        .to_string();

    handle.server_down(&original, ServiceType::Graph).await.unwrap();

    let moved = handle.resolve("db1", ServiceType::Graph).await.unwrap();
    assert_ne!(moved.server(), original);

    handle.shutdown().await;
}

#[tokio::test]
async fn sticky_hosts_wait_out_the_outage() {
    let handle = spawn_directory();
    handle
        .register("hub-1", ServiceType::Client, 2, Stickiness::Sticky)
        .await;
    handle
        .register("hub-2", ServiceType::Client, 2, Stickiness::Sticky)
        .await;

    let original = handle
        .resolve("db1", ServiceType::Client)
        .await
        .unwrap()
        .server()
        .to_string();

    handle.server_down(&original, ServiceType::Client).await.unwrap();

    // pinned but unavailable, never silently moved
    assert_eq!(
        handle.query("db1", ServiceType::Client).await,
        QueryResult::Unavailable
    );
    assert_eq!(
        handle.resolve("db1", ServiceType::Client).await,
        Err(LocatorError::Unavailable)
    );

    handle.server_up(&original, ServiceType::Client).await.unwrap();
    assert_eq!(
        handle.resolve("db1", ServiceType::Client).await.unwrap(),
        AssignOutcome::Pinned(original)
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn rename_preserves_identity_continuity() {
    let handle = spawn_directory();
    handle
        .register("hub-1", ServiceType::Client, 2, Stickiness::Sticky)
        .await;

    let server = handle
        .resolve("db1", ServiceType::Client)
        .await
        .unwrap()
        .server()
        .to_string();

    handle
        .rename_host(ServiceType::Client, "db1", "db1-new")
        .await
        .unwrap();

    assert_eq!(
        handle.query("db1-new", ServiceType::Client).await,
        QueryResult::Assigned(server)
    );
    assert_eq!(
        handle.query("db1", ServiceType::Client).await,
        QueryResult::Unassigned
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn assignments_are_per_service_type() {
    let handle = spawn_directory();
    handle
        .register("hub-1", ServiceType::Client, 2, Stickiness::Sticky)
        .await;
    handle
        .register("hub-2", ServiceType::Graph, 2, Stickiness::Sticky)
        .await;

    assert_eq!(
        handle.resolve("db1", ServiceType::Client).await.unwrap().server(),
        "hub-1"
    );
    assert_eq!(
        handle.resolve("db1", ServiceType::Graph).await.unwrap().server(),
        "hub-2"
    );

    handle.shutdown().await;
}
