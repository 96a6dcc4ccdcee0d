use crate::{AckAction, Delivery, FailedMsg, Settle};
use std::sync::Arc;
use tokio::sync::mpsc;

fn delivery(queue: &str, body: &str) -> (Delivery, mpsc::Receiver<Settle>) {
    let (tx, rx) = mpsc::channel(8);
    let msg = Delivery::new(
        Arc::new(body.as_bytes().to_vec()),
        "1718986464123-0".to_string(),
        queue.to_string(),
        tx,
    );
    (msg, rx)
}

#[tokio::test]
async fn test_ack_settles_once() {
    let (msg, mut rx) = delivery("ingress", "{}");

    msg.ack().await.unwrap();
    // Second settle attempts are no-ops, from whichever side.
    msg.ack().await.unwrap();
    msg.nack("boom", "should not be recorded").await.unwrap();

    let settle = rx.recv().await.unwrap();
    assert_eq!(settle.queue, "ingress");
    assert_eq!(settle.id, "1718986464123-0");
    assert!(matches!(settle.action, AckAction::Ack));
    assert!(rx.try_recv().is_err());
    assert!(msg.is_settled());
}

#[tokio::test]
async fn test_nack_carries_failure_record() {
    let (msg, mut rx) = delivery("ingress", r#"{"filename":"x"}"#);

    msg.nack("busy", "Feeding sample to analyzer failed")
        .await
        .unwrap();

    let settle = rx.recv().await.unwrap();
    let AckAction::Nack(failed) = settle.action else {
        panic!("expected a nack");
    };
    assert_eq!(failed.queue, "ingress");
    assert_eq!(failed.error, "busy");
    assert_eq!(failed.desc, "Feeding sample to analyzer failed");
    assert_eq!(failed.msg, r#"{"filename":"x"}"#);
}

#[tokio::test]
async fn test_clones_share_the_settle_guard() {
    let (msg, mut rx) = delivery("ingress", "{}");
    let other = msg.clone();

    msg.ack().await.unwrap();
    other.nack("late", "fanned-out loser").await.unwrap();

    assert!(matches!(rx.recv().await.unwrap().action, AckAction::Ack));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_failed_msg_wire_keys() {
    let failed = FailedMsg {
        queue: "totem_dynamic_input".to_string(),
        error: "busy".to_string(),
        desc: "Feeding sample to analyzer failed".to_string(),
        msg: "{}".to_string(),
    };

    let json = serde_json::to_value(&failed).unwrap();
    assert_eq!(json["Queue"], "totem_dynamic_input");
    assert_eq!(json["Error"], "busy");
    assert_eq!(json["Desc"], "Feeding sample to analyzer failed");
    assert_eq!(json["Msg"], "{}");
}
