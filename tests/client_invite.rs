//! INVITE client transaction scenarios (RFC 3261 §17.1.1), driven on the
//! paused tokio clock.

mod common;

use std::time::Duration;

use common::*;
use sip_transaction::prelude::*;

async fn start() -> (TransactionManager, Incoming, TransportProbe) {
    let (transport, probe) = mock_transport(false);
    let (manager, incoming) = TransactionManager::new(transport, CLIENT_ADDR, None)
        .await
        .expect("manager starts");
    (manager, incoming, probe)
}

#[tokio::test(start_paused = true)]
async fn invite_with_100_and_200_terminates_on_success() {
    let (manager, _incoming, mut probe) = start().await;
    let origin = invite("z9hG4bK-1");
    let mut tx = manager.send(origin.clone(), SERVER_ADDR);
    settle().await;

    // The INVITE goes out immediately, addressed to the destination.
    let sent = probe.drain_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, SERVER_ADDR);
    assert_eq!(method_of(&sent[0].1), Some(Method::Invite));

    // 100 Trying: Calling -> Proceeding, response passed up, nothing sent.
    probe.inject(response_to(&origin, 100, "Trying", None)).await;
    assert_eq!(tx.state(), TransactionState::Proceeding);
    assert_eq!(tx.responses().try_recv().unwrap().status, 100);
    assert!(probe.drain_sent().is_empty());

    elapse(Duration::from_secs(1)).await;
    // Timer A is a no-op once an INVITE client is in Proceeding.
    assert!(probe.drain_sent().is_empty());

    // 200 OK: passed up, transaction terminates and leaves the store.
    probe.inject(response_to(&origin, 200, "OK", Some("to-2"))).await;
    assert_eq!(tx.responses().try_recv().unwrap().status, 200);
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(!manager.has_client_transaction(tx.key()));

    // The ACK for a 2xx is the TU's job, sent as its own transaction.
    let mut ack = ack_for_final(&origin);
    ack.headers.retain(|h| h.name() != "Via");
    ack.add_header(Header::Via(Via(vec![ViaHop::new(
        "UDP",
        "client.example.com",
        Some(5060),
    )
    .with_branch(&generate_branch())])));
    let _ack_tx = manager.send(ack, SERVER_ADDR);
    settle().await;
    let sent = probe.drain_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(method_of(&sent[0].1), Some(Method::Ack));
}

#[tokio::test(start_paused = true)]
async fn non_2xx_final_is_acked_automatically() {
    let (manager, _incoming, mut probe) = start().await;
    let origin = invite("z9hG4bK-404");
    let mut tx = manager.send(origin.clone(), SERVER_ADDR);
    settle().await;
    probe.drain_sent();

    probe.inject(response_to(&origin, 100, "Trying", None)).await;
    tx.responses().try_recv().unwrap();

    probe
        .inject(response_to(&origin, 404, "Not Found", Some("to-404")))
        .await;
    assert_eq!(tx.responses().try_recv().unwrap().status, 404);
    assert_eq!(tx.state(), TransactionState::Completed);

    // An ACK with the INVITE's branch went out; its To carries the 404's tag.
    let sent = probe.drain_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].1 {
        Message::Request(ack) => {
            assert_eq!(ack.method, Method::Ack);
            assert_eq!(ack.branch(), Some("z9hG4bK-404"));
            assert_eq!(ack.to_tag(), Some("to-404"));
            assert_eq!(ack.cseq().unwrap().method, Method::Ack);
            assert_eq!(ack.cseq().unwrap().seq, origin.cseq().unwrap().seq);
        }
        other => panic!("expected ACK request, got {}", other.short()),
    }

    // Timer D (32 s on UDP) expires: Completed -> Terminated, store empty.
    elapse(Duration::from_secs(32)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(!manager.has_client_transaction(tx.key()));
}

#[tokio::test(start_paused = true)]
async fn retransmitted_final_response_is_reacked() {
    let (manager, _incoming, mut probe) = start().await;
    let origin = invite("z9hG4bK-486");
    let _tx = manager.send(origin.clone(), SERVER_ADDR);
    settle().await;
    probe.drain_sent();

    let busy = response_to(&origin, 486, "Busy Here", Some("to-486"));
    probe.inject(busy.clone()).await;
    assert_eq!(probe.drain_sent().len(), 1); // first ACK

    // The server retransmits its final because the first ACK got lost on the
    // wire; the transaction absorbs it and ACKs again without passing it up.
    probe.inject(busy.clone()).await;
    probe.inject(busy).await;
    let sent = probe.drain_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|(_, m)| method_of(m) == Some(Method::Ack)));
}

#[tokio::test(start_paused = true)]
async fn invite_retransmits_with_uncapped_backoff_until_timer_b() {
    let (manager, _incoming, mut probe) = start().await;
    let origin = invite("z9hG4bK-retr");
    let mut tx = manager.send(origin, SERVER_ADDR);
    settle().await;
    assert_eq!(probe.drain_sent().len(), 1); // initial send at t=0

    // Timer A doubles without cap for INVITE: fires at 0.5, 1.5, 3.5, 7.5,
    // 15.5 and 31.5 seconds.
    for gap_ms in [500u64, 1000, 2000, 4000, 8000, 16000] {
        elapse(Duration::from_millis(gap_ms)).await;
        let sent = probe.drain_sent();
        assert_eq!(sent.len(), 1, "expected one retransmission after {}ms", gap_ms);
        assert_eq!(method_of(&sent[0].1), Some(Method::Invite));
    }

    // Timer B fires at 32 s: timeout reported, transaction gone.
    elapse(Duration::from_millis(500)).await;
    assert!(matches!(
        tx.errors().try_recv().unwrap(),
        Error::Timeout(_)
    ));
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(!manager.has_client_transaction(tx.key()));
    assert!(probe.drain_sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reliable_transport_never_arms_timer_a_and_skips_timer_d() {
    let (transport, mut probe) = mock_transport(true);
    let (manager, _incoming) = TransactionManager::new(transport, CLIENT_ADDR, None)
        .await
        .unwrap();

    let origin = invite("z9hG4bK-tcp");
    let mut tx = manager.send(origin.clone(), SERVER_ADDR);
    settle().await;
    assert_eq!(probe.drain_sent().len(), 1);

    // No retransmissions, ever.
    elapse(Duration::from_secs(31)).await;
    assert!(probe.drain_sent().is_empty());

    // A final response lands; timer D is zero on reliable transports, so the
    // transaction terminates as soon as the ACK is out.
    probe
        .inject(response_to(&origin, 404, "Not Found", Some("to-tcp")))
        .await;
    assert_eq!(tx.responses().try_recv().unwrap().status, 404);
    assert_eq!(probe.drain_sent().len(), 1); // the ACK
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(!manager.has_client_transaction(tx.key()));
}

#[tokio::test(start_paused = true)]
async fn transport_failure_terminates_and_reports() {
    let (manager, _incoming, probe) = start().await;
    let origin = invite("z9hG4bK-err");
    probe.break_sends();
    let mut tx = manager.send(origin, SERVER_ADDR);
    settle().await;

    assert!(matches!(
        tx.errors().try_recv().unwrap(),
        Error::Transport(_)
    ));
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(!manager.has_client_transaction(tx.key()));
}

#[tokio::test(start_paused = true)]
async fn cancel_is_reserved() {
    let (manager, _incoming, _probe) = start().await;
    let tx = manager.send(invite("z9hG4bK-cancel"), SERVER_ADDR);
    assert!(matches!(tx.cancel(), Err(Error::NotSupported(_))));
}
