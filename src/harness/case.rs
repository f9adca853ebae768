//! Execution and verification of a single matrix case.
//!
//! A case owns one connection and the sessions opened on it. Every
//! destination gets its consumers attached before any producer, then
//! producers and consumers run as concurrent tasks. Each payload is a JSON
//! stamp naming the destination, producer and sequence it was sent with;
//! verification works from those stamps alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::config::{CaseSpec, DistributionConfig};
use super::report::{CaseError, CaseStats, DestinationTally};
use crate::{
    // ---
    log_debug,
    log_warn,
    Connection,
    ConnectionProvider,
    Consumer,
    Destination,
    DestinationKind,
    Producer,
    Session,
};

/// Longest single receive call; consumers re-check their quota in between.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Payload of every message the harness sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Stamp {
    pub destination: String,
    pub producer: usize,
    pub sequence: usize,
}

impl Stamp {
    fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Messages one destination should see and what its consumers got.
pub(crate) struct Delivery {
    pub name: String,
    pub kind: DestinationKind,
    pub producers: usize,
    pub messages: usize,
    /// Raw payloads, one list per consumer in attach order.
    pub received: Vec<Vec<Bytes>>,
}

/// Receive target shared by the consumers that split one stream.
///
/// Queue consumers of a destination share one quota; every topic consumer
/// has its own.
struct Quota {
    counter: AtomicUsize,
    expected: usize,
}

impl Quota {
    fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicUsize::new(0),
            expected,
        })
    }
}

/// Run one case end to end. Resources are released on every path.
pub(crate) async fn run_case(
    provider: Arc<dyn ConnectionProvider>,
    config: Arc<DistributionConfig>,
    spec: CaseSpec,
) -> Result<CaseStats, CaseError> {
    // ---
    let started = Instant::now();
    let connection = provider.provide_connection().await?;

    // The body runs in its own task; this one keeps the connection and
    // closes it even when the body panics.
    let body = tokio::spawn(drive(provider, connection.clone(), config, spec));
    let result = flatten(body.await);

    if let Err(err) = connection.close().await {
        log_warn!("{err}");
    }

    let destinations = verify(result?)?;
    log_debug!(
        "case {}: {} destination(s) verified in {:?}",
        spec.index,
        destinations.len(),
        started.elapsed()
    );

    Ok(CaseStats {
        destinations,
        elapsed: started.elapsed(),
    })
}

async fn drive(
    provider: Arc<dyn ConnectionProvider>,
    connection: Connection,
    config: Arc<DistributionConfig>,
    spec: CaseSpec,
) -> Result<Vec<Delivery>, CaseError> {
    // ---
    let mut sessions = Vec::with_capacity(config.session_group);

    let result = open_sessions(&connection, &mut sessions, config.session_group).await;
    let result = match result {
        Ok(()) => exercise(provider.as_ref(), &sessions, &config, spec).await,
        Err(err) => Err(err),
    };

    close_sessions(&connection, &sessions).await;
    result
}

/// Sessions opened before a failure stay in `sessions` so they get closed.
async fn open_sessions(
    connection: &Connection,
    sessions: &mut Vec<Session>,
    count: usize,
) -> Result<(), CaseError> {
    // ---
    for _ in 0..count {
        sessions.push(connection.create_session().await?);
    }
    Ok(())
}

async fn close_sessions(connection: &Connection, sessions: &[Session]) {
    // ---
    for session in sessions {
        if let Err(err) = session.close().await {
            log_warn!("{}: {err}", connection.id());
        }
    }
}

/// Attach, send and collect on every destination of the case.
async fn exercise(
    provider: &dyn ConnectionProvider,
    sessions: &[Session],
    config: &DistributionConfig,
    spec: CaseSpec,
) -> Result<Vec<Delivery>, CaseError> {
    // ---
    let run = uuid::Uuid::new_v4().simple().to_string();
    let mut plans = Vec::new();

    for (s, session) in sessions.iter().enumerate() {
        for d in 0..config.destination_group {
            let name = format!("heavy.{}.c{}.s{s}.d{d}", &run[..8], spec.index);
            let destination = match spec.kind {
                DestinationKind::Queue => provider.get_queue(session, &name)?,
                DestinationKind::Topic => provider.get_topic(session, &name)?,
            };
            plans.push(attach(session, destination, config).await?);
        }
    }

    let mut consumers = JoinSet::new();
    let mut producers = JoinSet::new();
    let mut deliveries = Vec::with_capacity(plans.len());

    for (slot, plan) in plans.into_iter().enumerate() {
        let name = plan.destination.name().to_string();
        let sent = spec.message_count * plan.producers.len();
        let shared = Quota::new(sent);

        for (c, consumer) in plan.consumers.into_iter().enumerate() {
            let quota = match spec.kind {
                DestinationKind::Queue => Arc::clone(&shared),
                DestinationKind::Topic => Quota::new(sent),
            };
            let timing = (config.receive_timeout, config.settle_window);
            consumers.spawn(async move {
                let received = consume(consumer, quota, timing).await?;
                Ok::<_, CaseError>((slot, c, received))
            });
        }

        for (p, producer) in plan.producers.into_iter().enumerate() {
            let name = name.clone();
            let count = spec.message_count;
            producers.spawn(produce(producer, name, p, count));
        }

        deliveries.push(Delivery {
            name,
            kind: spec.kind,
            producers: config.producer_group,
            messages: spec.message_count,
            received: vec![Vec::new(); config.consumer_group],
        });
    }

    // Drain both sets fully before reporting, so no task outlives the case.
    let mut first_error = None;

    while let Some(joined) = producers.join_next().await {
        if let Err(err) = flatten(joined) {
            first_error.get_or_insert(err);
        }
    }

    while let Some(joined) = consumers.join_next().await {
        match flatten(joined) {
            Ok((slot, c, received)) => deliveries[slot].received[c] = received,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(deliveries),
    }
}

struct Plan {
    destination: Destination,
    consumers: Vec<Consumer>,
    producers: Vec<Producer>,
}

/// Consumers first, so nothing a producer sends can predate a subscriber.
async fn attach(
    session: &Session,
    destination: Destination,
    config: &DistributionConfig,
) -> Result<Plan, CaseError> {
    // ---
    let mut consumers = Vec::with_capacity(config.consumer_group);
    for _ in 0..config.consumer_group {
        consumers.push(session.create_consumer(&destination).await?);
    }

    let mut producers = Vec::with_capacity(config.producer_group);
    for _ in 0..config.producer_group {
        producers.push(session.create_producer(&destination).await?);
    }

    Ok(Plan {
        destination,
        consumers,
        producers,
    })
}

pub(crate) fn flatten<T>(
    joined: Result<Result<T, CaseError>, tokio::task::JoinError>,
) -> Result<T, CaseError> {
    // ---
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(CaseError::Panicked(panic_message(err.into_panic()))),
        Err(_) => Err(CaseError::Cancelled),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    // ---
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn produce(
    producer: Producer,
    destination: String,
    index: usize,
    count: usize,
) -> Result<(), CaseError> {
    // ---
    for sequence in 0..count {
        let stamp = Stamp {
            destination: destination.clone(),
            producer: index,
            sequence,
        };
        let payload = stamp.encode().map_err(|err| CaseError::Malformed {
            destination: destination.clone(),
            reason: format!("could not encode stamp: {err}"),
        })?;
        producer.send(payload).await?;
    }
    Ok(())
}

/// Receive until the quota is met or the destination goes quiet for
/// `idle_timeout`, then listen for `settle` more to catch extras.
async fn consume(
    consumer: Consumer,
    quota: Arc<Quota>,
    (idle_timeout, settle): (Duration, Duration),
) -> Result<Vec<Bytes>, CaseError> {
    // ---
    let slice = POLL_SLICE.min(idle_timeout);
    let mut received = Vec::new();
    let mut seen = 0;
    let mut last_progress = Instant::now();

    loop {
        let count = quota.counter.load(Ordering::SeqCst);
        if count >= quota.expected {
            break;
        }
        if count != seen {
            seen = count;
            last_progress = Instant::now();
        }
        if last_progress.elapsed() >= idle_timeout {
            log_debug!(
                "{}: idle after {count} of {} stamp(s)",
                consumer.destination(),
                quota.expected
            );
            break;
        }

        if let Some(message) = consumer.receive(slice).await? {
            quota.counter.fetch_add(1, Ordering::SeqCst);
            received.push(message.payload);
        }
    }

    if !settle.is_zero() {
        while let Some(message) = consumer.receive(settle).await? {
            quota.counter.fetch_add(1, Ordering::SeqCst);
            received.push(message.payload);
        }
    }

    Ok(received)
}

/// Check exactly-once delivery for every destination of a case.
///
/// Queues: each stamp is seen exactly once across all consumers. Topics:
/// each consumer sees each stamp exactly once. No destination may see a
/// stamp addressed to another.
pub(crate) fn verify(deliveries: Vec<Delivery>) -> Result<Vec<DestinationTally>, CaseError> {
    // ---
    let mut tallies = Vec::with_capacity(deliveries.len());

    for delivery in deliveries {
        let label = format!("{}://{}", delivery.kind, delivery.name);
        let expected = delivery.producers * delivery.messages;

        let mut stamps = Vec::with_capacity(delivery.received.len());
        for payloads in &delivery.received {
            let mut decoded = Vec::with_capacity(payloads.len());
            for payload in payloads {
                decoded.push(decode(&delivery, &label, payload)?);
            }
            stamps.push(decoded);
        }

        match delivery.kind {
            DestinationKind::Queue => {
                let all: Vec<&Stamp> = stamps.iter().flatten().collect();
                check_exactly_once(&label, &all, expected)?;
            }
            DestinationKind::Topic => {
                for consumer in &stamps {
                    let own: Vec<&Stamp> = consumer.iter().collect();
                    check_exactly_once(&label, &own, expected)?;
                }
            }
        }

        let per_consumer: Vec<usize> = stamps.iter().map(Vec::len).collect();
        tallies.push(DestinationTally {
            destination: label,
            kind: delivery.kind,
            expected,
            received: per_consumer.iter().sum(),
            per_consumer,
        });
    }

    Ok(tallies)
}

fn decode(delivery: &Delivery, label: &str, payload: &[u8]) -> Result<Stamp, CaseError> {
    // ---
    let stamp: Stamp = serde_json::from_slice(payload).map_err(|err| CaseError::Malformed {
        destination: label.to_string(),
        reason: err.to_string(),
    })?;

    if stamp.destination != delivery.name {
        return Err(CaseError::CrossTalk {
            destination: label.to_string(),
            origin: stamp.destination,
        });
    }

    if stamp.producer >= delivery.producers || stamp.sequence >= delivery.messages {
        return Err(CaseError::Malformed {
            destination: label.to_string(),
            reason: format!(
                "stamp {}/{} outside the sent range",
                stamp.producer, stamp.sequence
            ),
        });
    }

    Ok(stamp)
}

fn check_exactly_once(label: &str, stamps: &[&Stamp], expected: usize) -> Result<(), CaseError> {
    // ---
    let mut counts: HashMap<(usize, usize), usize> = HashMap::with_capacity(stamps.len());
    for stamp in stamps {
        *counts.entry((stamp.producer, stamp.sequence)).or_default() += 1;
    }

    let mut duplicated: Vec<_> = counts.iter().filter(|(_, n)| **n > 1).collect();
    duplicated.sort();
    if let Some(&(&(producer, sequence), &count)) = duplicated.first() {
        return Err(CaseError::Duplicated {
            destination: label.to_string(),
            producer,
            sequence,
            count,
        });
    }

    if counts.len() < expected {
        return Err(CaseError::Lost {
            destination: label.to_string(),
            expected,
            received: counts.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn stamp(destination: &str, producer: usize, sequence: usize) -> Bytes {
        Stamp {
            destination: destination.to_string(),
            producer,
            sequence,
        }
        .encode()
        .expect("encode")
    }

    fn all_stamps(destination: &str, producers: usize, messages: usize) -> Vec<Bytes> {
        // ---
        (0..producers)
            .flat_map(|p| (0..messages).map(move |s| (p, s)))
            .map(|(p, s)| stamp(destination, p, s))
            .collect()
    }

    fn delivery(kind: DestinationKind, received: Vec<Vec<Bytes>>) -> Delivery {
        Delivery {
            name: "d".to_string(),
            kind,
            producers: 2,
            messages: 4,
            received,
        }
    }

    #[test]
    fn queue_split_across_consumers_passes() {
        // ---
        let mut stamps = all_stamps("d", 2, 4);
        let second = stamps.split_off(3);

        let tallies = verify(vec![delivery(DestinationKind::Queue, vec![stamps, second])])
            .expect("clean delivery");

        assert_eq!(tallies[0].expected, 8);
        assert_eq!(tallies[0].received, 8);
        assert_eq!(tallies[0].per_consumer, vec![3, 5]);
        assert_eq!(tallies[0].destination, "queue://d");
    }

    #[test]
    fn topic_requires_every_consumer_to_see_everything() {
        // ---
        let full = all_stamps("d", 2, 4);
        let mut partial = full.clone();
        partial.pop();

        let ok = verify(vec![delivery(
            DestinationKind::Topic,
            vec![full.clone(), full.clone()],
        )]);
        assert_eq!(ok.expect("clean delivery")[0].received, 16);

        let err = verify(vec![delivery(DestinationKind::Topic, vec![full, partial])])
            .expect_err("one subscriber missed a stamp");
        assert!(matches!(
            err,
            CaseError::Lost {
                expected: 8,
                received: 7,
                ..
            }
        ));
    }

    #[test]
    fn missing_stamp_is_lost() {
        // ---
        let mut stamps = all_stamps("d", 2, 4);
        stamps.remove(5);

        let err = verify(vec![delivery(DestinationKind::Queue, vec![stamps, vec![]])])
            .expect_err("loss must be detected");
        assert!(matches!(err, CaseError::Lost { received: 7, .. }));
    }

    #[test]
    fn repeated_stamp_is_duplicated() {
        // ---
        let stamps = all_stamps("d", 2, 4);
        let repeat = vec![stamp("d", 1, 2)];

        let err = verify(vec![delivery(DestinationKind::Queue, vec![stamps, repeat])])
            .expect_err("duplicate must be detected");
        assert!(matches!(
            err,
            CaseError::Duplicated {
                producer: 1,
                sequence: 2,
                count: 2,
                ..
            }
        ));
    }

    #[test]
    fn foreign_stamp_is_cross_talk() {
        // ---
        let mut stamps = all_stamps("d", 2, 4);
        stamps.push(stamp("other", 0, 0));

        let err = verify(vec![delivery(DestinationKind::Queue, vec![stamps])])
            .expect_err("cross-talk must be detected");
        assert!(matches!(err, CaseError::CrossTalk { ref origin, .. } if origin == "other"));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        // ---
        let garbage = vec![Bytes::from_static(b"not json")];
        let err = verify(vec![delivery(DestinationKind::Queue, vec![garbage])])
            .expect_err("garbage must be rejected");
        assert!(matches!(err, CaseError::Malformed { .. }));

        let out_of_range = vec![stamp("d", 5, 0)];
        let err = verify(vec![delivery(DestinationKind::Queue, vec![out_of_range])])
            .expect_err("unknown producer must be rejected");
        assert!(matches!(err, CaseError::Malformed { .. }));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        // ---
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }
}
