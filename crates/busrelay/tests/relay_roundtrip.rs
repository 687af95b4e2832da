// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end relay tests: broker on a background thread over the in-memory
//! bus, nodes driven from the test thread.

use busrelay::{
    Broker, BrokerConfig, EndpointAddr, HandleState, MemoryBus, MessageDescriptor, Node,
    NodeConfig, NodeError, PublisherId, SchemaPolicy,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Harness {
    bus: MemoryBus,
    control: EndpointAddr,
    notify: EndpointAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Broker>>,
}

impl Harness {
    fn start(config: BrokerConfig) -> Self {
        let bus = MemoryBus::recording();
        let mut broker = Broker::bind(config, Arc::new(bus.clone())).unwrap();
        let control = broker.control_addr().clone();
        let notify = broker.notify_addr().clone();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            broker.run(&flag);
            broker
        });

        Self {
            bus,
            control,
            notify,
            running,
            handle: Some(handle),
        }
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig::for_broker(&self.control, &self.notify)
    }

    fn node(&self) -> Node {
        Node::connect(self.node_config()).unwrap()
    }

    fn stop(mut self) -> Broker {
        self.running.store(false, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn poll_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn temp(hash: &str) -> MessageDescriptor {
    MessageDescriptor::new("temp", hash, "sensor/Temp", "float64 value")
}

type Received = Arc<Mutex<Vec<Vec<u8>>>>;

fn collector() -> (Received, impl FnMut(&[u8]) + Send + 'static) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |bytes: &[u8]| sink.lock().push(bytes.to_vec()))
}

fn control_round_trip(stream: &mut TcpStream, request: &[u8]) -> serde_json::Value {
    stream.write_all(request).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        if byte[0] == 0 {
            break;
        }
        reply.push(byte[0]);
    }
    serde_json::from_slice(&reply).unwrap()
}

#[test]
fn temp_scenario_delivers_exactly_once() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut producer = harness.node();
    let mut consumer = harness.node();

    let publisher = producer.advertise(&temp("h1")).unwrap();
    let (received, callback) = collector();
    let subscriber = consumer.subscribe(&temp("h1"), callback).unwrap();

    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        producer.publisher_peer_count(publisher) == 1 && consumer.is_subscriber_connected(subscriber)
    }));

    producer.publish(publisher, &[0x01, 0x02]).unwrap();
    assert!(poll_until(|| {
        consumer.poll_once();
        !received.lock().is_empty()
    }));

    // Let any duplicate surface before counting.
    let settle = Instant::now() + Duration::from_millis(100);
    while Instant::now() < settle {
        consumer.poll_once();
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(*received.lock(), vec![vec![0x01, 0x02]]);
    assert_eq!(harness.bus.published("temp"), vec![vec![0x01, 0x02]]);

    let broker = harness.stop();
    let stats = broker.stats();
    assert_eq!(stats.messages_in, 1);
    assert_eq!(stats.bytes_in, 2);
    assert_eq!(stats.messages_out, 1);
}

/// Producer and consumer nodes with their endpoints connected through the broker.
fn connected_pair(harness: &Harness) -> (Node, PublisherId, Node, Received) {
    let mut producer = harness.node();
    let mut consumer = harness.node();

    let publisher = producer.advertise(&temp("h1")).unwrap();
    let (received, callback) = collector();
    let subscriber = consumer.subscribe(&temp("h1"), callback).unwrap();
    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        producer.publisher_peer_count(publisher) == 1 && consumer.is_subscriber_connected(subscriber)
    }));
    (producer, publisher, consumer, received)
}

#[test]
fn multi_megabyte_payload_crosses_the_broker() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let (mut producer, publisher, mut consumer, received) = connected_pair(&harness);

    let payload: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(producer.publish(publisher, &payload).unwrap(), 1);
    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        !received.lock().is_empty()
    }));

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert!(received[0] == payload);
    drop(received);

    let broker = harness.stop();
    let stats = broker.stats();
    assert_eq!(stats.messages_out, 1);
    assert_eq!(stats.bytes_out, payload.len() as u64);
}

#[test]
fn back_to_back_messages_arrive_in_order() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let (mut producer, publisher, mut consumer, received) = connected_pair(&harness);

    let sent: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_be_bytes().to_vec()).collect();
    for message in &sent {
        producer.publish(publisher, message).unwrap();
    }
    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        received.lock().len() >= sent.len()
    }));

    assert_eq!(*received.lock(), sent);
    assert_eq!(harness.bus.published("temp"), sent);
}

#[test]
fn idle_collection_keeps_live_registrations() {
    let harness = Harness::start(BrokerConfig {
        relay_idle_timeout_secs: Some(1),
        ..BrokerConfig::ephemeral()
    });
    let (mut producer, publisher, mut consumer, received) = connected_pair(&harness);

    // Outlast the idle timeout with no traffic at all.
    let quiet = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < quiet {
        producer.poll_once();
        consumer.poll_once();
        thread::sleep(Duration::from_millis(10));
    }

    producer.publish(publisher, b"after-quiet").unwrap();
    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        !received.lock().is_empty()
    }));
    assert_eq!(*received.lock(), vec![b"after-quiet".to_vec()]);

    let broker = harness.stop();
    assert_eq!(broker.publish_relay_count(), 1);
    assert_eq!(broker.subscribe_relay_count(), 1);
    assert_eq!(broker.known_addrs("temp").len(), 1);
}

#[test]
fn fan_in_from_two_publishers() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut first = harness.node();
    let mut second = harness.node();

    let a = first.advertise(&temp("h1")).unwrap();
    let b = second.advertise(&temp("h1")).unwrap();
    assert!(poll_until(|| {
        first.poll_once();
        second.poll_once();
        first.publisher_peer_count(a) == 1 && second.publisher_peer_count(b) == 1
    }));

    first.publish(a, b"from-a").unwrap();
    second.publish(b, b"from-b").unwrap();
    assert!(poll_until(|| harness.bus.published("temp").len() == 2));

    let mut published = harness.bus.published("temp");
    published.sort();
    assert_eq!(published, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

    let broker = harness.stop();
    assert_eq!(broker.known_addrs("temp").len(), 2);
    assert_eq!(broker.publish_relay_count(), 1);
}

#[test]
fn subscribe_address_is_shared_per_topic() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut one = harness.node();
    let mut two = harness.node();

    one.subscribe(&temp("h1"), |_: &[u8]| {}).unwrap();
    two.subscribe(&temp("h1"), |_: &[u8]| {}).unwrap();
    two.subscribe(&temp("h1").for_topic("pressure"), |_: &[u8]| {})
        .unwrap();

    let one_addr = one.endpoints()[0].addr.clone();
    let two_endpoints = two.endpoints();
    assert_eq!(two_endpoints[0].addr, one_addr);
    assert_ne!(two_endpoints[1].addr, one_addr);

    let broker = harness.stop();
    assert_eq!(broker.subscribe_relay_count(), 2);
}

#[test]
fn advertise_same_address_twice_connects_once() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut stream = TcpStream::connect(harness.control.connect_addr().unwrap()).unwrap();

    let request = b"{\"cmd\":\"publish\",\"data\":{\"topic\":\"temp\",\"addr\":\"tcp://127.0.0.1:9\",\
                    \"md5\":\"h1\",\"type\":\"sensor/Temp\",\"def\":\"\"}}\0";
    let first = control_round_trip(&mut stream, request);
    let second = control_round_trip(&mut stream, request);
    assert_eq!(first, second);
    assert_eq!(first["cmd"], "publish");
    assert_eq!(first["data"]["addr"], "tcp://127.0.0.1:9");

    let broker = harness.stop();
    assert_eq!(
        broker.known_addrs("temp"),
        vec![EndpointAddr::new("127.0.0.1", 9)]
    );
}

#[test]
fn no_cross_topic_leakage() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut node = harness.node();

    let (received, callback) = collector();
    let id = node
        .subscribe(&temp("h1").for_topic("b"), callback)
        .unwrap();
    assert!(poll_until(|| {
        node.poll_once();
        node.is_subscriber_connected(id)
    }));
    // The relay Sink accepts on its own tick; give it one.
    thread::sleep(Duration::from_millis(50));

    harness.bus.inject("a", b"for-a");
    harness.bus.inject("b", b"for-b");
    assert!(poll_until(|| {
        node.poll_once();
        !received.lock().is_empty()
    }));
    thread::sleep(Duration::from_millis(50));
    node.poll_once();

    assert_eq!(*received.lock(), vec![b"for-b".to_vec()]);
}

#[test]
fn zero_length_messages_are_dropped() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut producer = harness.node();
    let mut consumer = harness.node();

    let publisher = producer.advertise(&temp("h1")).unwrap();
    let (received, callback) = collector();
    let subscriber = consumer.subscribe(&temp("h1"), callback).unwrap();
    assert!(poll_until(|| {
        producer.poll_once();
        consumer.poll_once();
        producer.publisher_peer_count(publisher) == 1 && consumer.is_subscriber_connected(subscriber)
    }));

    producer.publish(publisher, &[]).unwrap();
    producer.publish(publisher, &[7]).unwrap();
    assert!(poll_until(|| {
        consumer.poll_once();
        !received.lock().is_empty()
    }));

    assert_eq!(*received.lock(), vec![vec![7]]);
    assert_eq!(harness.bus.published("temp"), vec![vec![7]]);

    let broker = harness.stop();
    assert_eq!(broker.stats().dropped_empty, 1);
}

#[test]
fn get_param_lookups() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    harness.bus.set_param("rate", "10");
    harness.bus.set_param("name", "not-a-number");
    let mut node = harness.node();

    assert_eq!(node.param_raw("missing").unwrap(), "");
    assert_eq!(node.param_opt::<i32>("missing").unwrap(), None);
    assert_eq!(node.param_or("missing", 5u32).unwrap(), 5);
    assert_eq!(node.param::<u32>("rate").unwrap(), 10);
    assert_eq!(node.param::<String>("name").unwrap(), "not-a-number");
    assert!(matches!(
        node.param::<u32>("name"),
        Err(NodeError::InvalidParam { .. })
    ));

    let mut stream = TcpStream::connect(harness.control.connect_addr().unwrap()).unwrap();
    let reply = control_round_trip(&mut stream, b"{\"cmd\":\"getParam\",\"name\":\"missing\"}\0");
    assert_eq!(reply, serde_json::json!({"name": "missing", "value": ""}));
}

#[test]
fn bad_requests_get_error_responses() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut stream = TcpStream::connect(harness.control.connect_addr().unwrap()).unwrap();

    let reply = control_round_trip(&mut stream, b"this is not json\0");
    assert_eq!(reply["error"]["code"], 1);

    let reply = control_round_trip(&mut stream, b"{\"cmd\":\"unpublish\"}\0");
    assert_eq!(reply["error"]["code"], 2);

    let reply = control_round_trip(&mut stream, b"{\"cmd\":\"subscribe\",\"data\":{\"topic\":\"t\"}}\0");
    assert_eq!(reply["error"]["code"], 1);

    // The connection stays usable after errors.
    let reply = control_round_trip(&mut stream, b"{\"cmd\":\"getParam\",\"name\":\"x\"}\0");
    assert_eq!(reply["value"], "");

    let broker = harness.stop();
    assert_eq!(broker.subscribe_relay_count(), 0);
}

#[test]
fn schema_mismatch_rejected_by_policy() {
    let harness = Harness::start(BrokerConfig {
        schema_policy: SchemaPolicy::Reject,
        ..BrokerConfig::ephemeral()
    });
    let mut first = harness.node();
    let mut second = harness.node();

    first.advertise(&temp("h1")).unwrap();
    let err = second.advertise(&temp("h2")).unwrap_err();
    assert!(matches!(err, NodeError::Rejected { code: 3, .. }));
    assert!(second.endpoints().is_empty());

    let broker = harness.stop();
    assert_eq!(broker.known_addrs("temp").len(), 1);
}

#[test]
fn unreachable_broker_is_a_connect_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = NodeConfig {
        control_port: port,
        connect_retries: 2,
        retry_backoff_ms: 5,
        rpc_timeout_ms: 200,
        ..Default::default()
    };

    let start = Instant::now();
    let err = Node::connect(config).err().unwrap();
    assert!(matches!(err, NodeError::Connect { .. }));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn silent_broker_times_out() {
    // Accepts connections (backlog) but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = NodeConfig {
        control_port: port,
        notify_port: port,
        data_bind_host: "127.0.0.1".into(),
        rpc_timeout_ms: 200,
        ..Default::default()
    };

    let mut node = Node::connect(config).unwrap();
    let start = Instant::now();
    let err = node.advertise(&temp("h1")).unwrap_err();
    assert!(matches!(err, NodeError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(node.endpoints().is_empty());
}

#[test]
fn handle_lifecycle() {
    let harness = Harness::start(BrokerConfig::ephemeral());
    let mut node = harness.node();

    let publisher = node.advertise(&temp("h1")).unwrap();
    let subscriber = node.subscribe(&temp("h1"), |_: &[u8]| {}).unwrap();
    assert_eq!(node.state(publisher), HandleState::Active);
    assert_eq!(node.state(subscriber), HandleState::Active);
    assert_eq!(node.endpoints().len(), 2);

    node.close_publisher(publisher).unwrap();
    node.close_subscriber(subscriber).unwrap();
    assert_eq!(node.state(publisher), HandleState::Closed);
    assert_eq!(node.state(subscriber), HandleState::Closed);
    assert!(node.endpoints().is_empty());

    assert!(matches!(
        node.publish(publisher, b"late"),
        Err(NodeError::UnknownHandle(_))
    ));
    assert!(node.close_subscriber(subscriber).is_err());
}
