//! End-to-end scenarios: two (or more) transports exchanging messages over
//!  the in-memory fabric, including loss, duplication and partition cases.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use homa::test_util::{FabricConfig, FabricDriver, InMemoryFabric};
use homa::transport::next_transport_id;
use homa::{HomaConfig, OutStatus, SendFlags, Transport};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn fast_config() -> HomaConfig {
    let mut config = HomaConfig::default_10g();
    config.resend_timeout = Duration::from_millis(2);
    config.ping_timeout = Duration::from_millis(2);
    config
}

fn endpoint(fabric: &InMemoryFabric, port: u16, config: HomaConfig) -> (Transport, Arc<FabricDriver>) {
    let driver = fabric.add_endpoint(addr(port), 2048);
    let transport = Transport::new(driver.clone(), next_transport_id(), config).unwrap();
    (transport, driver)
}

/// poll both transports until `done` or the tick budget runs out
fn pump(transports: &[&Transport], max_ticks: usize, mut done: impl FnMut() -> bool) -> bool {
    for tick in 0..max_ticks {
        for transport in transports {
            transport.poll();
        }
        if done() {
            return true;
        }
        // give the millisecond-scale timeouts a chance to fire
        if tick % 16 == 15 {
            std::thread::sleep(Duration::from_micros(500));
        }
    }
    done()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn single_short_message() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let payload = patterned(200);
    let mut out = client.alloc();
    out.append(&payload).unwrap();
    assert_eq!(out.status(), OutStatus::InProgress);
    out.send(addr(2), SendFlags::default()).unwrap();

    // 200 bytes fit into the unscheduled window: one poll emits everything
    client.poll();
    assert_eq!(out.status(), OutStatus::Sent);

    assert!(pump(&[&client, &server], 100, || server.receive().map(|mut received| {
        assert_eq!(received.address(), addr(1));
        assert_eq!(received.len(), 200);
        let mut bytes = vec![0; 200];
        assert_eq!(received.get(0, &mut bytes), 200);
        assert_eq!(bytes, payload);
        received.acknowledge();
    }).is_some()));

    assert!(pump(&[&client, &server], 100, || out.status() == OutStatus::Completed));
}

#[test]
fn single_long_message() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let payload = patterned(1 << 20);
    let mut out = client.alloc();
    out.append(&payload).unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    let mut received_payload = None;
    assert!(pump(&[&client, &server], 20_000, || {
        if let Some(mut received) = server.receive() {
            let mut bytes = vec![0; received.len()];
            assert_eq!(received.get(0, &mut bytes), payload.len());
            received.acknowledge();
            received_payload = Some(bytes);
        }
        received_payload.is_some() && out.status() == OutStatus::Completed
    }), "1 MiB transfer did not finish");

    assert_eq!(received_payload.unwrap(), payload);
}

#[test]
fn duplicated_packets_do_not_corrupt() {
    let mut fabric_config = FabricConfig::reliable();
    fabric_config.duplicate_probability = 1.0;
    fabric_config.seed = 3;
    let fabric = InMemoryFabric::new(fabric_config);
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let payload = patterned(50_000);
    let mut out = client.alloc();
    out.append(&payload).unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    let mut matched = false;
    assert!(pump(&[&client, &server], 5_000, || {
        if let Some(mut received) = server.receive() {
            let mut bytes = vec![0; received.len()];
            received.get(0, &mut bytes);
            matched = bytes == payload;
            received.acknowledge();
        }
        matched && out.status() == OutStatus::Completed
    }));

    assert!(server.stats().duplicate_packets > 0, "duplicates must be detected, not absorbed");
}

#[test]
fn heavy_loss_recovers_through_resends() {
    let mut fabric_config = FabricConfig::lossy(11, 0.3);
    fabric_config.reorder_probability = 0.1;
    let fabric = InMemoryFabric::new(fabric_config);

    let mut config = fast_config();
    config.ping_limit = 20;
    config.resend_limit = 20;
    let (client, _) = endpoint(&fabric, 1, config.clone());
    let (server, _) = endpoint(&fabric, 2, config);

    let payload = patterned(100_000);
    let mut out = client.alloc();
    out.append(&payload).unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    let mut matched = false;
    assert!(pump(&[&client, &server], 50_000, || {
        if let Some(mut received) = server.receive() {
            let mut bytes = vec![0; received.len()];
            received.get(0, &mut bytes);
            matched = bytes == payload;
            received.acknowledge();
        }
        matched && out.status() == OutStatus::Completed
    }), "transfer under 30% loss did not complete");
}

#[test]
fn fifty_percent_loss_reaches_terminal_state() {
    let fabric = InMemoryFabric::new(FabricConfig::lossy(17, 0.5));

    let mut config = fast_config();
    config.ping_limit = 8;
    config.resend_limit = 8;
    let (client, _) = endpoint(&fabric, 1, config.clone());
    let (server, _) = endpoint(&fabric, 2, config);

    let mut handles = Vec::new();
    for i in 0..4 {
        let mut out = client.alloc();
        out.append(&patterned(5_000 + i * 1000)).unwrap();
        out.send(addr(2), SendFlags::default()).unwrap();
        handles.push(out);
    }

    assert!(pump(&[&client, &server], 100_000, || {
        while let Some(mut received) = server.receive() {
            received.acknowledge();
        }
        handles.iter().all(|out| out.status().is_terminal())
    }), "every message must reach COMPLETED or FAILED in finite time");
}

#[test]
fn peer_crash_fails_both_sides() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());

    let mut config = fast_config();
    config.ping_limit = 3;
    config.resend_limit = 3;
    let (client, _) = endpoint(&fabric, 1, config.clone());
    let (server, _) = endpoint(&fabric, 2, config);

    let payload = patterned(100_000);
    let mut out = client.alloc();
    out.append(&payload).unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    // let the exchange get going, then cut the wire
    pump(&[&client, &server], 50, || false);
    fabric.set_partitioned(true);

    assert!(pump(&[&client, &server], 50_000, || out.status() == OutStatus::Failed),
            "sender must give up after ping_limit probes");
    assert!(server.receive().is_none(), "the partial message must not surface");
}

#[test]
fn srpt_short_message_overtakes_long() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let mut long = client.alloc();
    long.append(&patterned(1 << 20)).unwrap();
    long.send(addr(2), SendFlags::default()).unwrap();

    let mut short = client.alloc();
    short.append(b"short and urgent").unwrap();
    short.send(addr(2), SendFlags::default()).unwrap();

    let short_id = short.id().unwrap();
    let mut first_completed = None;
    assert!(pump(&[&client, &server], 20_000, || {
        if let Some(mut received) = server.receive() {
            first_completed.get_or_insert(received.id());
            received.acknowledge();
        }
        first_completed.is_some()
    }));

    assert_eq!(first_completed.unwrap(), short_id,
               "the short message must finish before the long one");
    assert_eq!(long.status(), OutStatus::InProgress);
}

#[test]
fn request_response_round_trip() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let mut request = client.alloc();
    request.append(b"ping #42").unwrap();
    request.send(addr(2), SendFlags { expect_response: true, ..SendFlags::default() }).unwrap();

    // server side: echo the request back to its source; client side: pull
    //  the response
    let mut response_handle = None;
    let mut reply = None;
    assert!(pump(&[&client, &server], 2_000, || {
        if let Some(mut received) = server.receive() {
            let mut bytes = vec![0; received.len()];
            received.get(0, &mut bytes);
            received.acknowledge();

            let mut response = server.alloc();
            response.append(b"pong for ").unwrap();
            response.append(&bytes).unwrap();
            response.send(received.address(), SendFlags::default()).unwrap();
            response_handle = Some(response);
        }
        if let Some(mut received) = client.receive() {
            received.acknowledge();
            reply = Some(received);
        }
        reply.is_some()
    }));

    let reply = reply.unwrap();
    let mut bytes = vec![0; reply.len()];
    reply.get(0, &mut bytes);
    assert_eq!(bytes, b"pong for ping #42");

    // the client's acknowledgment completes the response on the server
    assert!(pump(&[&client, &server], 1_000,
                 || response_handle.as_ref().is_some_and(|r| r.status() == OutStatus::Completed)));
}

#[test]
fn detached_send_survives_handle_drop() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let payload = patterned(50_000);
    {
        let mut out = client.alloc();
        out.append(&payload).unwrap();
        out.send(addr(2), SendFlags { detached: true, ..SendFlags::default() }).unwrap();
        // the handle goes away immediately; the transport keeps sending
    }

    let mut matched = false;
    assert!(pump(&[&client, &server], 10_000, || {
        if let Some(mut received) = server.receive() {
            let mut bytes = vec![0; received.len()];
            received.get(0, &mut bytes);
            matched = bytes == payload;
            received.acknowledge();
        }
        matched
    }), "detached message must be delivered without its handle");
}

#[test]
fn dropping_in_message_acknowledges_implicitly() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let mut out = client.alloc();
    out.append(b"auto-acked").unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    assert!(pump(&[&client, &server], 1_000, || {
        server.receive().is_some() // dropped right here, without acknowledge()
    }));

    assert!(pump(&[&client, &server], 1_000, || out.status() == OutStatus::Completed),
            "dropping the handle must emit DONE");
}

#[test]
fn canceled_message_stays_canceled() {
    let fabric = InMemoryFabric::new(FabricConfig::reliable());
    let (client, _) = endpoint(&fabric, 1, fast_config());
    let (server, _) = endpoint(&fabric, 2, fast_config());

    let mut out = client.alloc();
    out.append(&patterned(1 << 20)).unwrap();
    out.send(addr(2), SendFlags::default()).unwrap();

    pump(&[&client, &server], 20, || false);
    out.cancel();
    assert_eq!(out.status(), OutStatus::Canceled);

    // the peer's half-received message eventually times out and is dropped
    assert!(pump(&[&client, &server], 50_000, || server.stats().ingress_packets > 0
            && server.receive().is_none()));
    assert_eq!(out.status(), OutStatus::Canceled);
}
