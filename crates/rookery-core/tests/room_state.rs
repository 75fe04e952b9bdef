mod common;

use common::{link, member_displays, server, settle, timeline, user, Loopback};
use rookery_core::error::CoreError;
use rookery_core::membership;
use rookery_models::gateway;
use rookery_models::room::RoomKind;

const S1: &str = "s1.example";
const S2: &str = "s2.example";

fn handles(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test]
async fn removal_is_published_on_the_event_bus() -> anyhow::Result<()> {
    let net = Loopback::new();
    let s1 = server(&net, S1, 1).await?;
    let alice = user(&s1, "alice").await?;
    let carol = user(&s1, "carol").await?;
    let (view, _) = membership::create_room(
        &s1,
        alice.id,
        "general",
        RoomKind::Public,
        false,
        &handles(&["carol"]),
    )
    .await?;
    let room_id = view.room.room_id.as_str();

    let mut bus = s1.event_bus.subscribe();
    membership::remove(&s1, room_id, alice.id, "carol").await?;

    let mut published = Vec::new();
    while let Ok(event) = bus.try_recv() {
        published.push(event);
    }
    let types: Vec<&str> = published.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![gateway::EVENT_SYSTEM_MESSAGE_CREATE, gateway::EVENT_ROOM_MEMBER_REMOVE]
    );
    assert!(published.iter().all(|e| e.room_id.as_deref() == Some(room_id)));
    assert_eq!(published[0].payload["text"], "removed carol");
    assert_eq!(published[1].payload["identity"]["id"], carol.id);
    Ok(())
}

#[tokio::test]
async fn concurrent_invite_and_remove_leave_a_consistent_room() -> anyhow::Result<()> {
    let net = Loopback::new();
    let s1 = server(&net, S1, 1).await?;
    let s2 = server(&net, S2, 2).await?;
    link(&[&s1, &s2]).await?;
    let alice = user(&s1, "alice").await?;
    user(&s1, "carol").await?;
    let bob = user(&s2, "bob").await?;
    let (view, _) = membership::create_room(
        &s1,
        alice.id,
        "general",
        RoomKind::Public,
        true,
        &handles(&["carol"]),
    )
    .await?;
    let room_id = view.room.room_id.as_str();

    let bob_handles = handles(&["bob:s2.example"]);
    let (invited, removed) = tokio::join!(
        membership::invite(&s1, room_id, alice.id, &bob_handles),
        membership::remove(&s1, room_id, alice.id, "carol"),
    );
    assert_eq!(invited?.added.len(), 1);
    assert!(removed?.event_id.is_some());

    let room = membership::room_view(&s1, room_id, alice.id).await?.room;
    assert_eq!(room.sequence, 3);
    assert_eq!(member_displays(&s1, room_id, &alice).await?, vec!["alice", "bob:s2.example"]);
    assert_eq!(timeline(&s1, room_id, &alice).await?.len(), 3);

    settle(&[&s1, &s2]).await?;
    let replica = membership::room_view(&s2, room_id, bob.id).await?.room;
    assert_eq!(replica.sequence, 3);
    assert_eq!(member_displays(&s2, room_id, &bob).await?, vec!["alice:s1.example", "bob"]);
    Ok(())
}

#[tokio::test]
async fn an_invite_racing_a_delete_never_lands_in_the_deleted_room() -> anyhow::Result<()> {
    let net = Loopback::new();
    let s1 = server(&net, S1, 1).await?;
    let s2 = server(&net, S2, 2).await?;
    link(&[&s1, &s2]).await?;
    let alice = user(&s1, "alice").await?;
    let bob = user(&s2, "bob").await?;
    let (view, _) =
        membership::create_room(&s1, alice.id, "general", RoomKind::Public, true, &[]).await?;
    let room_id = view.room.room_id.as_str();

    let bob_handles = handles(&["bob:s2.example"]);
    let (invited, deleted) = tokio::join!(
        membership::invite(&s1, room_id, alice.id, &bob_handles),
        membership::delete(&s1, room_id, alice.id),
    );
    assert!(deleted?.event_id.is_some());
    match invited {
        Ok(applied) => assert_eq!(applied.added.len(), 1),
        Err(CoreError::UnknownRoom(_)) => {}
        Err(other) => panic!("unexpected invite failure: {other}"),
    }

    settle(&[&s1, &s2]).await?;
    assert!(matches!(
        membership::room_view(&s1, room_id, alice.id).await,
        Err(CoreError::UnknownRoom(_))
    ));
    assert!(membership::rooms_for(&s2, bob.id).await?.is_empty());
    assert!(common::queued_envelopes(&s1).await?.is_empty());
    Ok(())
}
