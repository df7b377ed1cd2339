//! Socket-level tests for the role capabilities.

use daq_fleet::error::FleetError;
use daq_fleet::transport::{Inbox, LinkSettings, Publisher, Receiver, Sender, Subscriber};
use daq_fleet::wire::{ErrorReport, KindSet, Message, MessageKind, Payload};
use std::time::{Duration, Instant};

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn collect(inbox: &mut Inbox, want: usize) -> Vec<Message> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got = Vec::new();
    while got.len() < want && Instant::now() < deadline {
        got.extend(inbox.poll(Duration::from_millis(50)).await);
    }
    // anything extra that is already on its way
    got.extend(inbox.poll(Duration::from_millis(100)).await);
    got
}

#[tokio::test]
async fn test_publisher_fans_out_with_kind_filters() {
    let settings = LinkSettings::default();
    let publisher = Publisher::bind("cam", "127.0.0.1:0", &settings).await.unwrap();
    let address = publisher.local_addr().to_string();

    let mut triggers = Inbox::new(64);
    let mut everything = Inbox::new(64);
    let mut sub_a = Subscriber::new("a", triggers.sender(), settings.clone());
    sub_a.add_subscription("cam", address.clone(), KindSet::of(&[MessageKind::Trigger]));
    let mut sub_b = Subscriber::new("b", everything.sender(), settings.clone());
    sub_b.add_subscription("cam", address, KindSet::all());

    wait_until("subscriptions", || sub_a.all_connected() && sub_b.all_connected()).await;
    assert_eq!(publisher.subscriber_count(), 2);

    let reached = publisher
        .publish(&Message::new("cam", Payload::String("hello".into())))
        .unwrap();
    assert_eq!(reached, 1);
    let reached = publisher.publish(&Message::new("cam", Payload::Trigger)).unwrap();
    assert_eq!(reached, 2);

    let only_triggers = collect(&mut triggers, 1).await;
    assert_eq!(only_triggers.len(), 1);
    assert_eq!(only_triggers[0].kind(), MessageKind::Trigger);
    assert_eq!(only_triggers[0].source(), "cam");

    let all = collect(&mut everything, 2).await;
    let kinds: Vec<MessageKind> = all.iter().map(Message::kind).collect();
    assert_eq!(kinds, [MessageKind::String, MessageKind::Trigger]);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_fire_and_forget() {
    let publisher = Publisher::bind("lonely", "127.0.0.1:0", &LinkSettings::default())
        .await
        .unwrap();
    let reached = publisher.publish(&Message::new("lonely", Payload::Trigger)).unwrap();
    assert_eq!(reached, 0);
}

#[tokio::test]
async fn test_error_published_before_subscriber_is_replayed() {
    let settings = LinkSettings::default();
    let publisher = Publisher::bind("cam", "127.0.0.1:0", &settings).await.unwrap();
    let address = publisher.local_addr().to_string();

    let failure = Payload::Error {
        report: ErrorReport {
            kind: "Error".into(),
            message: "camera not found".into(),
            critical: false,
        },
        trace: "cam setup".into(),
    };
    assert_eq!(publisher.publish(&Message::new("cam", failure)).unwrap(), 0);
    assert_eq!(publisher.publish(&Message::new("cam", Payload::Trigger)).unwrap(), 0);
    assert_eq!(publisher.backlog_len(), 1);

    let mut inbox = Inbox::new(64);
    let mut subscriber = Subscriber::new("orchestrator", inbox.sender(), settings.clone());
    subscriber.add_subscription(
        "cam",
        address,
        KindSet::of(&[MessageKind::Error, MessageKind::Connection, MessageKind::Trigger]),
    );
    wait_until("subscription", || subscriber.all_connected()).await;

    let got = collect(&mut inbox, 1).await;
    assert_eq!(got.len(), 1);
    let Payload::Error { report, .. } = got[0].payload() else {
        panic!("expected the backlogged error, got {:?}", got[0]);
    };
    assert_eq!(report.message, "camera not found");
    assert_eq!(publisher.backlog_len(), 0);
}

#[tokio::test]
async fn test_sender_receiver_round_trip() {
    let settings = LinkSettings::default();
    let mut saver_inbox = Inbox::new(64);
    let sender = Sender::bind("saver", "127.0.0.1:0", saver_inbox.sender(), &settings)
        .await
        .unwrap();

    // queued until the peer connects
    sender
        .send(&Message::new("saver", Payload::Connection(true)))
        .unwrap();

    let mut orchestrator_inbox = Inbox::new(64);
    let mut receiver = Receiver::new("orchestrator", orchestrator_inbox.sender(), settings);
    receiver.add_peer("saver", sender.local_addr().to_string());

    let replies = collect(&mut orchestrator_inbox, 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload(), &Payload::Connection(true));
    assert!(receiver.is_connected("saver"));
    assert!(sender.is_connected());

    receiver
        .send_to(
            "saver",
            &Message::new("orchestrator", Payload::Request("status".into())),
        )
        .unwrap();
    let requests = collect(&mut saver_inbox, 1).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload(), &Payload::Request("status".into()));

    let err = receiver
        .send_to("nobody", &Message::new("orchestrator", Payload::Trigger))
        .unwrap_err();
    assert!(matches!(err, FleetError::UnknownPeer(_)));
}
