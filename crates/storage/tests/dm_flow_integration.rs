use shared::domain::UserId;
use storage::Storage;

#[tokio::test]
async fn direct_message_lifecycle_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path().join("chat.db").to_string_lossy().replace('\\', "/")
    );

    let (alice, bob, conversation_id) = {
        let storage = Storage::new(&database_url).await.expect("db");
        let alice = storage.create_user("alice").await.expect("alice");
        let bob = storage.create_user("bob").await.expect("bob");
        let (conversation, created) = storage
            .create_or_get_conversation(alice, bob)
            .await
            .expect("conversation");
        assert!(created);
        storage
            .insert_message(conversation.conversation_id, alice, "hello bob")
            .await
            .expect("first");
        storage
            .insert_message(conversation.conversation_id, bob, "hi alice")
            .await
            .expect("reply");
        (alice, bob, conversation.conversation_id)
    };

    let storage = Storage::new(&database_url).await.expect("reopen");
    let (existing, created) = storage
        .create_or_get_conversation(bob, alice)
        .await
        .expect("existing");
    assert!(!created);
    assert_eq!(existing.conversation_id, conversation_id);

    let history = storage.list_messages(conversation_id).await.expect("history");
    let senders: Vec<UserId> = history.iter().map(|m| m.sender_id).collect();
    assert_eq!(senders, vec![alice, bob]);

    let bob_view = storage.list_conversation_previews(bob).await.expect("previews");
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].peer.user_id, alice);
    assert_eq!(bob_view[0].last_message.as_deref(), Some("hi alice"));

    let former = storage
        .delete_conversation(conversation_id)
        .await
        .expect("delete");
    assert_eq!(former.len(), 2);
    assert!(storage
        .list_conversation_previews(alice)
        .await
        .expect("previews")
        .is_empty());
}
