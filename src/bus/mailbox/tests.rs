use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::bus::HandlerError;
use crate::message::Message;

type HandlerResult = std::result::Result<(), HandlerError>;

fn make_mailbox(capacity: usize, cancel: &CancellationToken) -> Mailbox {
    Mailbox::new(
        Topic::new("hello"),
        capacity,
        OverflowPolicy::Error,
        BusHandle::noop(),
        cancel.clone(),
        None,
    )
}

fn forwarding_handler(tx: mpsc::UnboundedSender<Message>) -> Arc<dyn MessageHandler> {
    Arc::new(
        move |msg: Message, _bus: BusHandle| -> BoxFuture<'static, HandlerResult> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
                Ok(())
            })
        },
    )
}

fn failing_handler(err: HandlerError) -> Arc<dyn MessageHandler> {
    Arc::new(
        move |_msg: Message, _bus: BusHandle| -> BoxFuture<'static, HandlerResult> {
            let err = err.clone();
            Box::pin(async move { Err(err) })
        },
    )
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

#[tokio::test]
async fn test_start_and_stop() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);

    mailbox.start();
    mailbox.start(); // idempotent
    mailbox.stop();
    mailbox.stop(); // idempotent
    mailbox.wait().await;
}

#[tokio::test]
async fn test_start_and_stop_with_cancel() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);

    mailbox.start();

    let canceler = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceler.cancel();
    });

    mailbox.wait().await;
}

#[tokio::test]
async fn test_message_delivery() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);
    mailbox.start();

    let message = Message::new("hello", "yay", "alex");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = mailbox.add(forwarding_handler(tx));
    assert!(channel.err().is_none());

    mailbox.deliver(message.clone()).await.unwrap();

    assert_eq!(recv(&mut rx).await, message);

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_three_subscribers_fan_out() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);
    mailbox.start();

    let message = Message::new("hello", "yay", "alex");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channels: Vec<Channel> = (0..3).map(|_| mailbox.add(forwarding_handler(tx.clone()))).collect();
    for channel in &channels {
        assert!(channel.err().is_none());
    }

    mailbox.deliver(message.clone()).await.unwrap();

    for _ in 0..3 {
        assert_eq!(recv(&mut rx).await, message);
    }
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    mailbox.wait().await;
}

// Closing any position (first, middle, last) leaves exactly the remaining
// subscribers receiving.
#[tokio::test]
async fn test_unsubscribe_each_position() {
    for closed in 0..3usize {
        let cancel = CancellationToken::new();
        let mailbox = make_mailbox(1, &cancel);
        mailbox.start();

        let message = Message::new("hello", "yay", "alex");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let channels: Vec<Channel> = (0..3)
            .map(|_| mailbox.add(forwarding_handler(tx.clone())))
            .collect();

        mailbox.deliver(message.clone()).await.unwrap();
        for _ in 0..3 {
            recv(&mut rx).await;
        }

        channels[closed].close();
        channels[closed].close(); // idempotent
        assert!(!channels[closed].is_live());

        mailbox.deliver(message.clone()).await.unwrap();
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Drain window: the closed handler must not fire.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "closed position {closed} still delivered");

        cancel.cancel();
        mailbox.wait().await;
    }
}

#[tokio::test]
async fn test_delivery_order_per_handler() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(8, &cancel);
    mailbox.start();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Arc<dyn MessageHandler> = Arc::new(
        move |msg: Message, _bus: BusHandle| -> BoxFuture<'static, HandlerResult> {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(msg.from_addr);
                Ok(())
            })
        },
    );
    mailbox.add(handler);

    for i in 0..5 {
        mailbox
            .deliver(Message::new("hello", format!("sender-{i}"), "x"))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(1), async {
        while seen.lock().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("not all messages dispatched");

    let order = seen.lock().clone();
    let expected: Vec<String> = (0..5).map(|i| format!("sender-{i}")).collect();
    assert_eq!(order, expected);

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_messages() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(4, &cancel);
    mailbox.start();

    let (early_tx, mut early_rx) = mpsc::unbounded_channel();
    mailbox.add(forwarding_handler(early_tx));

    mailbox
        .deliver(Message::new("hello", "first", "x"))
        .await
        .unwrap();
    recv(&mut early_rx).await;

    let (late_tx, mut late_rx) = mpsc::unbounded_channel();
    mailbox.add(forwarding_handler(late_tx));

    mailbox
        .deliver(Message::new("hello", "second", "x"))
        .await
        .unwrap();

    assert_eq!(recv(&mut early_rx).await.from_addr, "second");
    assert_eq!(recv(&mut late_rx).await.from_addr, "second");
    assert!(late_rx.try_recv().is_err());

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_overflow_returns_error() {
    eprintln!("DIAG: start");
    let cancel = CancellationToken::new();
    // Not started: the queue buffers up to capacity and never drains.
    let mailbox = make_mailbox(1, &cancel);
    eprintln!("DIAG: mailbox created");

    mailbox
        .deliver(Message::new("hello", "yay", "one"))
        .await
        .unwrap();
    eprintln!("DIAG: first deliver ok");

    let overflow = mailbox.deliver(Message::new("hello", "yay", "two")).await;
    eprintln!("DIAG: second deliver done");
    assert!(matches!(overflow, Err(BusError::MailboxFull { .. })));

    mailbox.stop();
    eprintln!("DIAG: stopped");
    mailbox.wait().await;
    eprintln!("DIAG: waited");
}

#[tokio::test]
async fn test_block_with_timeout_overflow() {
    let cancel = CancellationToken::new();
    let mailbox = Mailbox::new(
        Topic::new("hello"),
        1,
        OverflowPolicy::BlockWithTimeout(Duration::from_millis(20)),
        BusHandle::noop(),
        cancel.clone(),
        None,
    );

    mailbox
        .deliver(Message::new("hello", "yay", "one"))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let overflow = mailbox.deliver(Message::new("hello", "yay", "two")).await;
    assert!(matches!(overflow, Err(BusError::MailboxFull { .. })));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_deliver_after_stop_is_closed() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);
    mailbox.start();
    mailbox.stop();
    mailbox.wait().await;

    let result = mailbox.deliver(Message::new("hello", "yay", "alex")).await;
    assert!(matches!(result, Err(BusError::Closed)));

    let channel = mailbox.add(forwarding_handler(mpsc::unbounded_channel().0));
    assert!(matches!(channel.err(), Some(BusError::Closed)));
}

#[tokio::test]
async fn test_tracked_outcome_reflects_handler_failures() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(2, &cancel);
    mailbox.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    mailbox.add(forwarding_handler(tx));
    mailbox.add(failing_handler(HandlerError::retryable("busy")));

    let receipt = mailbox
        .deliver_tracked(Message::new("hello", "yay", "alex"))
        .await
        .unwrap();
    let outcome = receipt.await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::HandlerFailed { retryable: true }
    );
    assert!(!outcome.should_ack());
    recv(&mut rx).await;

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_tracked_outcome_fatal_acks() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(2, &cancel);
    mailbox.start();

    mailbox.add(failing_handler(HandlerError::fatal("poison")));

    let receipt = mailbox
        .deliver_tracked(Message::new("hello", "yay", "alex"))
        .await
        .unwrap();
    let outcome = receipt.await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::HandlerFailed { retryable: false }
    );
    assert!(outcome.should_ack());

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_tracked_outcome_no_subscribers() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);
    mailbox.start();

    let receipt = mailbox
        .deliver_tracked(Message::new("hello", "yay", "alex"))
        .await
        .unwrap();
    assert_eq!(receipt.await.unwrap(), DispatchOutcome::NoSubscribers);

    cancel.cancel();
    mailbox.wait().await;
}

#[tokio::test]
async fn test_terminal_failure_surfaces_on_channel() {
    let cancel = CancellationToken::new();
    let mailbox = make_mailbox(1, &cancel);
    mailbox.start();

    let channel = mailbox.add(forwarding_handler(mpsc::unbounded_channel().0));
    assert!(channel.err().is_none());

    mailbox.fail(BusError::Connection("broker gone".to_string()));
    assert!(matches!(channel.err(), Some(BusError::Connection(_))));

    cancel.cancel();
    mailbox.wait().await;
}
