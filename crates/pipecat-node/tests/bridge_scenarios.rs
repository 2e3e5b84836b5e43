use std::io::{self, BufReader, Cursor, Read};
use std::sync::mpsc;

use pipecat_broker::adapter::{InMemoryBroker, InMemoryHandle, Settlement};
use pipecat_core::CONTENT_TYPE_TEXT_PLAIN;
use pipecat_node::config::{AckSourceKind, BridgeConfig};
use pipecat_node::mode::Mode;
use pipecat_node::pending::{KeyStrategy, PendingKey};
use pipecat_node::service::{run_bridge, BridgeError, BridgeIo, BridgeReport};

struct Captured {
    report: Result<BridgeReport<InMemoryHandle>, BridgeError>,
    output: String,
    diagnostics: String,
}

fn run(
    broker: &mut InMemoryBroker,
    mode: Mode,
    config: &BridgeConfig,
    input: Box<dyn io::BufRead + Send>,
) -> Captured {
    let mut output = Vec::new();
    let mut diagnostics = Vec::new();
    let report = run_bridge(
        broker,
        "q1",
        mode,
        config,
        BridgeIo {
            input,
            output: &mut output,
            diagnostics: &mut diagnostics,
        },
    );
    Captured {
        report,
        output: String::from_utf8(output).expect("utf8 output"),
        diagnostics: String::from_utf8(diagnostics).expect("utf8 diagnostics"),
    }
}

fn publish_lines(broker: &mut InMemoryBroker, input: &str) -> Captured {
    run(
        broker,
        Mode::Publish,
        &BridgeConfig::default(),
        Box::new(Cursor::new(input.to_string())),
    )
}

fn consume(broker: &mut InMemoryBroker, config: &BridgeConfig) -> Captured {
    run(
        broker,
        Mode::Consume,
        config,
        Box::new(BufReader::new(io::empty())),
    )
}

/// Blocking reader fed over a channel; EOF once the sender is dropped.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Cursor<Vec<u8>>,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.buf.read(out)?;
            if n > 0 {
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(chunk) => self.buf = Cursor::new(chunk),
                Err(_) => return Ok(0),
            }
        }
    }
}

#[test]
fn publisher_preserves_order_and_echoes_each_line() {
    let mut broker = InMemoryBroker::default();
    let captured = publish_lines(&mut broker, "alpha\nbeta\n");

    match captured.report.expect("publish should succeed") {
        BridgeReport::Published(stats) => assert_eq!(stats.lines_published, 2),
        other => panic!("unexpected report: {other:?}"),
    }
    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].payload, b"alpha");
    assert_eq!(published[1].payload, b"beta");
    for message in published {
        assert_eq!(message.routing_key, "q1");
        assert_eq!(message.exchange, "");
        assert_eq!(message.content_type, CONTENT_TYPE_TEXT_PLAIN);
    }
    assert_eq!(captured.output, "alpha\nbeta\n");
    assert_eq!(broker.declared()[0].name, "q1");
    assert!(broker.declared()[0].durable);
}

#[test]
fn publisher_order_holds_for_many_lines() {
    let lines: Vec<String> = (0..200).map(|i| format!("line-{i}")).collect();
    let mut broker = InMemoryBroker::default();
    let captured = publish_lines(&mut broker, &(lines.join("\n") + "\n"));
    assert!(captured.report.is_ok());

    let bodies: Vec<String> = broker
        .published()
        .iter()
        .map(|m| String::from_utf8(m.payload.clone()).unwrap())
        .collect();
    assert_eq!(bodies, lines);
    assert_eq!(captured.output.lines().collect::<Vec<_>>(), lines);
}

#[test]
fn consumer_forwards_single_message_and_reports_backlog() {
    let mut broker = InMemoryBroker::default();
    broker.enqueue_inbound("q1", "hello");
    let captured = consume(&mut broker, &BridgeConfig::default());

    assert!(captured.report.is_ok());
    assert_eq!(captured.output, "hello\n");
    assert_eq!(captured.diagnostics, "1\n");
    let (queue, options) = &broker.subscriptions()[0];
    assert_eq!(queue, "q1");
    assert!(!options.auto_ack);
    assert!(!options.exclusive);
}

#[test]
fn consumer_duplicate_content_collides() {
    let mut broker = InMemoryBroker::default();
    broker.enqueue_inbound("q1", "x");
    broker.enqueue_inbound("q1", "x");
    let captured = consume(&mut broker, &BridgeConfig::default());

    assert_eq!(captured.output, "x\nx\n");
    assert_eq!(captured.diagnostics, "1\n1\n");
    match captured.report.expect("consume should succeed") {
        BridgeReport::Consumed { stats, pending, .. } => {
            assert_eq!(stats.collisions, 1);
            let set = pending.lock().unwrap();
            assert_eq!(set.len(), 1);
            assert_eq!(
                set.get(&PendingKey::Content("x".into()))
                    .unwrap()
                    .delivery_tag,
                2
            );
        }
        other => panic!("unexpected report: {other:?}"),
    }
}

#[test]
fn consumer_backlog_grows_by_one_per_distinct_message() {
    let mut broker = InMemoryBroker::default();
    for i in 0..25 {
        broker.enqueue_inbound("q1", format!("m{i}"));
    }
    let captured = consume(&mut broker, &BridgeConfig::default());
    let reported: Vec<usize> = captured
        .diagnostics
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(reported, (1..=25).collect::<Vec<_>>());
}

#[test]
fn delivery_tag_keys_track_duplicates_separately() {
    let mut broker = InMemoryBroker::default();
    broker.enqueue_inbound("q1", "x");
    broker.enqueue_inbound("q1", "x");
    let config = BridgeConfig {
        key_strategy: KeyStrategy::DeliveryTag,
        ..BridgeConfig::default()
    };
    let captured = consume(&mut broker, &config);
    assert_eq!(captured.diagnostics, "1\n2\n");
}

#[test]
fn publish_then_consume_round_trips_through_queue() {
    let mut broker = InMemoryBroker::default();
    assert!(publish_lines(&mut broker, "first\nsecond\n").report.is_ok());
    let captured = consume(&mut broker, &BridgeConfig::default());
    assert_eq!(captured.output, "first\nsecond\n");
    assert_eq!(captured.diagnostics, "1\n2\n");
}

#[test]
fn declare_failure_stops_before_any_loop() {
    for mode in [Mode::Publish, Mode::Consume] {
        let mut broker = InMemoryBroker::default();
        broker.enqueue_inbound("q1", "waiting");
        broker.fail_declare("access refused");
        let captured = run(
            &mut broker,
            mode,
            &BridgeConfig::default(),
            Box::new(Cursor::new("never\n")),
        );

        let err = captured.report.expect_err("declare failure must be fatal");
        assert!(matches!(err, BridgeError::Declare(_)));
        assert!(err.to_string().contains("access refused"));
        assert!(broker.published().is_empty());
        assert!(broker.subscriptions().is_empty());
        assert!(captured.output.is_empty());
        assert!(captured.diagnostics.is_empty());
    }
}

#[test]
fn subscribe_failure_is_fatal() {
    let mut broker = InMemoryBroker::default();
    broker.fail_subscribe("consumer tag in use");
    let captured = consume(&mut broker, &BridgeConfig::default());
    let err = captured.report.expect_err("subscribe failure must be fatal");
    assert_eq!(
        err.to_string(),
        "failed to register a consumer: subscribe error: consumer tag in use"
    );
}

#[test]
fn publish_failure_is_fatal() {
    let mut broker = InMemoryBroker::default();
    broker.fail_publish_after(0);
    let captured = publish_lines(&mut broker, "a\nb\n");
    let err = captured.report.expect_err("publish failure must be fatal");
    assert!(err
        .to_string()
        .starts_with("failed to publish a message: publish error"));
    assert!(captured.output.is_empty());
}

#[test]
fn stdin_ack_source_settles_pending_deliveries() {
    let mut broker = InMemoryBroker::default();
    broker.enqueue_inbound("q1", "keep");
    broker.enqueue_inbound("q1", "done");
    broker.enqueue_inbound("q1", "retry");
    let config = BridgeConfig {
        ack_source: AckSourceKind::Stdin,
        ..BridgeConfig::default()
    };
    let (tx, rx) = mpsc::channel();
    let input = BufReader::new(ChannelReader {
        rx,
        buf: Cursor::new(Vec::new()),
    });

    let captured = run(&mut broker, Mode::Consume, &config, Box::new(input));
    assert_eq!(captured.diagnostics, "1\n2\n3\n");

    let (pending, worker) = match captured.report.expect("consume should succeed") {
        BridgeReport::Consumed {
            pending,
            ack_worker,
            ..
        } => (pending, ack_worker.expect("stdin source should run")),
        other => panic!("unexpected report: {other:?}"),
    };

    tx.send(b"ack done\nnack retry\nack missing\n".to_vec())
        .unwrap();
    drop(tx);
    let stats = worker.join().expect("ack worker should finish");

    assert_eq!(stats.applied, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(
        pending.lock().unwrap().keys(),
        vec![PendingKey::Content("keep".into())]
    );
    assert_eq!(
        *broker.settlements().lock().unwrap(),
        vec![
            Settlement::Ack(2),
            Settlement::Reject {
                tag: 3,
                requeue: true
            }
        ]
    );
}

#[test]
fn queue_ack_source_declares_and_subscribes_control_queue() {
    let mut broker = InMemoryBroker::default();
    broker.enqueue_inbound("q1", "payload");
    let config = BridgeConfig {
        ack_source: AckSourceKind::Queue("q1-acks".into()),
        consumer_tag: "tail".into(),
        ..BridgeConfig::default()
    };
    let captured = consume(&mut broker, &config);

    match captured.report.expect("consume should succeed") {
        BridgeReport::Consumed { ack_worker, .. } => {
            let stats = ack_worker
                .expect("queue source should run")
                .join()
                .expect("worker should finish");
            assert_eq!(stats.applied, 0);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    let declared: Vec<&str> = broker.declared().iter().map(|q| q.name.as_str()).collect();
    assert_eq!(declared, vec!["q1", "q1-acks"]);
    let tags: Vec<(&str, &str)> = broker
        .subscriptions()
        .iter()
        .map(|(q, o)| (q.as_str(), o.consumer_tag.as_str()))
        .collect();
    assert_eq!(tags, vec![("q1", "tail"), ("q1-acks", "tail-acks")]);
}
