use super::*;

use bytes::Bytes;
use serde_json::json;

use crate::packet::message::ContentType;

const T0: i32 = 1_700_000_000;

fn at(secs_after_t0: i32) -> SystemTime {
    Timestamp::from_secs(T0 + secs_after_t0).to_system_time()
}

fn pair() -> (Messenger, Messenger) {
    pair_with_config(Config::default())
}

fn pair_with_config(config: Config) -> (Messenger, Messenger) {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    (
        Messenger::new(a, b, config.clone()),
        Messenger::new(b, a, config),
    )
}

/// Outbox density: entry `i` must hold message id `i + 1`.
fn assert_outbox_density(m: &Messenger) {
    let outbox = m.outbox();
    for (i, item) in outbox.iter().enumerate() {
        assert_eq!(item.message.header.message_id, i as u32 + 1);
    }
}

#[test]
fn test_append_assigns_dense_ids_and_types() -> Result<()> {
    let (a, _) = pair();

    a.append_outbox_data("hello")?;
    a.append_outbox_data(vec![0u8, 1, 2])?;
    a.append_outbox_data(json!({"k": 1}))?;

    assert_eq!(a.clock_self(), 3);
    assert_outbox_density(&a);
    let types: Vec<ContentType> = (0..3)
        .map(|i| a.outbox_item(i).unwrap().message.header.content_type)
        .collect();
    assert_eq!(
        types,
        vec![
            ContentType::String,
            ContentType::Binary,
            ContentType::JsonObject
        ]
    );
    Ok(())
}

#[test]
fn test_multipart_split() -> Result<()> {
    let config = Config::default().with_multipart_limit_size_bytes(20);
    let (a, _) = pair_with_config(config);

    let data: Vec<u8> = (0..50u8).collect();
    a.append_outbox_data(data)?;

    assert_eq!(a.clock_self(), 3);
    assert_outbox_density(&a);

    let fragments: Vec<_> = (0..3).map(|i| a.outbox_item(i).unwrap().message).collect();
    assert_eq!(fragments[0].header.message_prev, 0);
    assert_eq!(fragments[1].header.message_prev, 1);
    assert_eq!(fragments[2].header.message_prev, 2);
    assert_eq!(fragments[0].header.content_type, ContentType::MultipartFragment);
    assert_eq!(fragments[1].header.content_type, ContentType::MultipartFragment);
    // only the terminal fragment carries the real content type
    assert_eq!(fragments[2].header.content_type, ContentType::Binary);
    assert_eq!(fragments[0].binary_data.len(), 20);
    assert_eq!(fragments[1].binary_data.len(), 20);
    assert_eq!(fragments[2].binary_data.len(), 10);
    Ok(())
}

#[test]
fn test_multipart_exact_multiple() -> Result<()> {
    let config = Config::default().with_multipart_limit_size_bytes(20);
    let (a, _) = pair_with_config(config);

    a.append_outbox_data(vec![7u8; 40])?;
    assert_eq!(a.clock_self(), 2);
    assert_eq!(a.outbox_item(1).unwrap().message.binary_data.len(), 20);
    Ok(())
}

#[test]
fn test_multipart_reconstruction() -> Result<()> {
    let config = Config::default().with_multipart_limit_size_bytes(20);
    let (mut a, mut b) = pair_with_config(config);

    let data: Vec<u8> = (0..251u8).chain(0..251u8).collect();
    a.append_outbox_data(data.clone())?;

    let packet = a.create_packet(at(0), None)?;
    a.packet_send(&packet)?;
    b.packet_receive(&packet)?;

    let terminal_id = a.clock_self();
    assert_eq!(
        b.inbox().content(terminal_id)?,
        Some(Content::Binary(Bytes::from(data)))
    );
    // non-terminal fragments do not decode on their own
    assert_eq!(b.inbox().content(1)?, None);
    assert_eq!(b.inbox().unlinked_len(), 0);
    Ok(())
}

#[test]
fn test_multipart_partial_chain_is_unreadable() -> Result<()> {
    let config = Config::default().with_multipart_limit_size_bytes(10);
    let (mut a, mut b) = pair_with_config(config);

    a.append_outbox_data(vec![1u8; 25])?; // fragments 1, 2, 3
    let p1 = a.create_packet(at(0), None)?;
    a.packet_send(&p1)?;

    // deliver a packet that lost its middle fragment
    let mut lossy = p1.clone();
    lossy.messages.remove(1);
    lossy.header.num_messages = 2;
    b.packet_receive(&lossy)?;

    assert_eq!(b.inbox().content(3)?, None);
    assert_eq!(b.inbox().unlinked_len(), 1, "fragment 3 waits for fragment 2");

    // the full packet arrives later
    b.packet_receive(&p1)?;
    assert_eq!(
        b.inbox().content(3)?,
        Some(Content::Binary(Bytes::from(vec![1u8; 25])))
    );
    assert_eq!(b.inbox().unlinked_len(), 0);
    Ok(())
}

#[test]
fn test_create_packet_carries_clocks_and_sorted_nacks() -> Result<()> {
    let (mut a, _) = pair();
    a.append_outbox_data("one")?;
    a.add_nack(9);
    a.add_nack(3);
    a.add_nack(9);

    let packet = a.create_packet(at(0), None)?;
    let control = packet.control.as_ref().unwrap();
    assert_eq!(control.sender_clock_sender, 1);
    assert_eq!(control.sender_clock_recipient, 0);
    assert_eq!(control.nack_ids, vec![3, 9], "set semantics, sorted");
    assert_eq!(packet.header.packet_id, 1);
    assert_eq!(packet.header.num_messages, 1);
    Ok(())
}

#[test]
fn test_retransmission_timeout_lower_bound() -> Result<()> {
    let (mut a, mut b) = pair();
    a.append_outbox_data("m")?;

    let p1 = a.create_packet(at(0), None)?;
    assert_eq!(p1.messages.len(), 1);
    a.packet_send(&p1)?;

    // unacked but sent recently: excluded until the timeout elapses
    let p2 = a.create_packet(at(1), None)?;
    assert_eq!(p2.messages.len(), 0);

    // an explicit zero timeout forces an immediate resend
    let p3 = a.create_packet(at(1), Some(Duration::ZERO))?;
    assert_eq!(p3.messages.len(), 1);

    // the default five second timeout elapsed
    let p4 = a.create_packet(at(5), None)?;
    assert_eq!(p4.messages.len(), 1);

    // a NACK resets the send metadata, retransmit without waiting
    a.packet_send(&p4)?;
    b.add_nack(p4.header.packet_id);
    let pb = b.create_packet(at(6), None)?;
    b.packet_send(&pb)?;
    a.packet_receive(&pb)?;
    assert_eq!(a.outbox_item(0).unwrap().packet_id, None);
    let p5 = a.create_packet(at(6), None)?;
    assert_eq!(p5.messages.len(), 1);
    Ok(())
}

#[test]
fn test_packet_send_records_send_metadata() -> Result<()> {
    let (mut a, _) = pair();
    a.append_outbox_data("m")?;

    let packet = a.create_packet(at(0), None)?;
    assert_eq!(a.outbox_item(0).unwrap().packet_id, None);

    a.packet_send(&packet)?;
    let item = a.outbox_item(0).unwrap();
    assert_eq!(item.packet_id, Some(packet.header.packet_id));
    assert_eq!(item.packet_timestamp, Some(packet.header.packet_timestamp));
    Ok(())
}

#[test]
fn test_ack_round_trip() -> Result<()> {
    let (mut a, mut b) = pair();
    a.append_outbox_data("hello")?;

    // A -> B: the message
    let pa = a.create_packet(at(0), None)?;
    a.packet_send(&pa)?;
    b.packet_receive(&pa)?;
    assert_eq!(
        b.inbox().content(1)?,
        Some(Content::String("hello".to_owned()))
    );
    assert_eq!(b.clock_other(), 1);

    // B -> A: the ack
    let pb = b.create_packet(at(1), None)?;
    b.packet_send(&pb)?;
    a.packet_receive(&pb)?;
    let item = a.outbox_item(0).unwrap();
    assert_eq!(item.acked, Some(pb.header.packet_timestamp));
    assert_eq!(a.other_clock_self(), 1);
    assert!(a.is_synchronized());

    // A -> B: the ack of the ack
    let pa2 = a.create_packet(at(2), None)?;
    assert_eq!(pa2.control.as_ref().unwrap().recipient_clock_sender, 1);
    a.packet_send(&pa2)?;
    b.packet_receive(&pa2)?;
    assert_eq!(
        b.inbox().get(0).unwrap().ack_acked,
        Some(pa2.header.packet_timestamp)
    );
    assert!(b.is_synchronized());
    Ok(())
}

#[test]
fn test_out_of_order_receipt() -> Result<()> {
    let (mut a, mut b) = pair();

    a.append_outbox_data("m1")?;
    let p1 = a.create_packet(at(0), None)?;
    a.packet_send(&p1)?;

    a.append_outbox_data("m2")?;
    let p2 = a.create_packet(at(0), None)?;
    assert_eq!(p2.messages.len(), 1, "m1 was sent moments ago");
    a.packet_send(&p2)?;

    // the packet carrying m2 arrives first
    b.packet_receive(&p2)?;
    assert!(b.inbox().get(1).unwrap().message.is_some());
    assert!(b.inbox().get(0).unwrap().message.is_none());
    assert_eq!(b.clock_other(), 0);
    assert_eq!(b.clock_out_of_order(), vec![2]);

    b.packet_receive(&p1)?;
    assert_eq!(b.clock_other(), 2);
    assert!(b.clock_out_of_order().is_empty());
    Ok(())
}

#[test]
fn test_selective_ack_of_out_of_order_messages() -> Result<()> {
    let (mut a, mut b) = pair();

    a.append_outbox_data("m1")?;
    let p1 = a.create_packet(at(0), None)?;
    a.packet_send(&p1)?;
    a.append_outbox_data("m2")?;
    let p2 = a.create_packet(at(0), None)?;
    a.packet_send(&p2)?;

    // only m2 made it through
    b.packet_receive(&p2)?;
    let pb = b.create_packet(at(1), None)?;
    assert_eq!(pb.control.as_ref().unwrap().sender_clock_recipient, 0);
    assert_eq!(pb.control.as_ref().unwrap().sender_clock_out_of_order, vec![2]);
    b.packet_send(&pb)?;

    // the SACK acks m2 but not m1
    a.packet_receive(&pb)?;
    assert_eq!(a.outbox_item(0).unwrap().acked, None);
    assert!(a.outbox_item(1).unwrap().acked.is_some());
    assert_eq!(a.other_clock_self(), 0);
    assert_eq!(a.other_clock_out_of_order(), vec![2]);
    Ok(())
}

#[test]
fn test_duplicate_delivery_is_idempotent() -> Result<()> {
    let (mut a, mut b) = pair();
    a.append_outbox_data("hello")?;

    let pa = a.create_packet(at(0), None)?;
    a.packet_send(&pa)?;
    b.packet_receive(&pa)?;
    let first_ts = b.inbox().get(0).unwrap().packet_timestamp;

    // the same packet file is delivered again
    b.packet_receive(&pa)?;
    assert_eq!(b.inbox().get(0).unwrap().packet_timestamp, first_ts);
    assert_eq!(b.other_clock_other(), 1, "inbox did not grow");

    // acks stay first-writer-wins too
    let pb1 = b.create_packet(at(1), None)?;
    b.packet_send(&pb1)?;
    a.packet_receive(&pb1)?;
    let acked = a.outbox_item(0).unwrap().acked;
    let pb2 = b.create_packet(at(9), None)?;
    b.packet_send(&pb2)?;
    a.packet_receive(&pb2)?;
    assert_eq!(a.outbox_item(0).unwrap().acked, acked);
    Ok(())
}

#[test]
fn test_nack_decay() -> Result<()> {
    let (mut a, _) = pair();
    a.add_nack(42);

    let mut transmissions = 0;
    for i in 0..10 {
        let packet = a.create_packet(at(i), None)?;
        if packet
            .control
            .as_ref()
            .unwrap()
            .nack_ids
            .contains(&42)
        {
            transmissions += 1;
        }
    }
    assert_eq!(transmissions, 5, "a NACK fades after the configured count");

    // re-insertion starts a fresh budget
    a.add_nack(42);
    let packet = a.create_packet(at(11), None)?;
    assert!(packet.control.as_ref().unwrap().nack_ids.contains(&42));
    Ok(())
}

#[test]
fn test_uuid_mismatch_changes_no_state() -> Result<()> {
    let (mut a, mut b) = pair();
    a.append_outbox_data("m")?;
    let pa = a.create_packet(at(0), None)?;

    // a messenger must reject its own outgoing packet as incoming
    assert_eq!(
        a.packet_receive(&pa).unwrap_err(),
        Error::ErrMismatchedSenderUuid
    );
    assert_eq!(a.other_clock_other(), 0);

    // and a stranger's packet entirely
    let mut stranger = Messenger::new(Uuid::new_v4(), Uuid::new_v4(), Config::default());
    stranger.append_outbox_data("x")?;
    let ps = stranger.create_packet(at(0), None)?;
    assert_eq!(
        b.packet_receive(&ps).unwrap_err(),
        Error::ErrMismatchedSenderUuid
    );
    assert_eq!(
        b.packet_send(&ps).unwrap_err(),
        Error::ErrMismatchedSenderUuid
    );
    assert_eq!(b.other_clock_other(), 0);
    Ok(())
}

#[test]
fn test_control_less_packet_is_inert() -> Result<()> {
    let (mut a, mut b) = pair();
    a.append_outbox_data("m")?;
    let mut pa = a.create_packet(at(0), None)?;
    pa.control = None;
    pa.messages.clear();

    b.packet_receive(&pa)?;
    assert_eq!(b.other_clock_other(), 0);
    assert_eq!(b.clock_other(), 0);
    Ok(())
}

#[test]
fn test_cached_cursors_are_monotonic() -> Result<()> {
    let (mut a, mut b) = pair();
    let mut prev_a = (0, 0);
    let mut prev_b = (0, 0);
    let mut check = |a: &Messenger, b: &Messenger| {
        let cur_a = (a.cached_clock_other(), a.cached_other_clock_self());
        let cur_b = (b.cached_clock_other(), b.cached_other_clock_self());
        assert!(cur_a.0 >= prev_a.0 && cur_a.1 >= prev_a.1);
        assert!(cur_b.0 >= prev_b.0 && cur_b.1 >= prev_b.1);
        prev_a = cur_a;
        prev_b = cur_b;
    };

    for round in 0..6 {
        a.append_outbox_data(format!("a{round}"))?;
        b.append_outbox_data(format!("b{round}"))?;
        let pa = a.create_packet(at(round), Some(Duration::ZERO))?;
        a.packet_send(&pa)?;
        check(&a, &b);
        b.packet_receive(&pa)?;
        check(&a, &b);
        let pb = b.create_packet(at(round), Some(Duration::ZERO))?;
        b.packet_send(&pb)?;
        check(&a, &b);
        a.packet_receive(&pb)?;
        check(&a, &b);
        // replaying an old packet must not move anything backwards
        b.packet_receive(&pa)?;
        check(&a, &b);
    }
    Ok(())
}

#[test]
fn test_clock_inequalities() -> Result<()> {
    let (mut a, mut b) = pair();
    for round in 0..4 {
        a.append_outbox_data(format!("{round}"))?;
        let pa = a.create_packet(at(round), Some(Duration::ZERO))?;
        a.packet_send(&pa)?;
        if round % 2 == 0 {
            b.packet_receive(&pa)?;
        }
        let pb = b.create_packet(at(round), None)?;
        b.packet_send(&pb)?;
        a.packet_receive(&pb)?;

        assert!(a.clock_self() >= a.other_clock_self());
        assert!(a.other_clock_other() >= a.clock_other());
        assert!(b.clock_self() >= b.other_clock_self());
        assert!(b.other_clock_other() >= b.clock_other());
    }
    Ok(())
}

/// Both sides converge given enough round trips, even when the transport
/// drops packets.
#[test]
fn test_convergence_over_lossy_transport() -> Result<()> {
    let (mut a, mut b) = pair();

    a.append_outbox_data("from a")?;
    a.append_outbox_data(json!({"seq": 1}))?;
    b.append_outbox_data("from b")?;
    b.append_outbox_data(vec![9u8; 100])?;

    let mut synchronized_at = None;
    for round in 0..20 {
        let pa = a.create_packet(at(round), Some(Duration::ZERO))?;
        a.packet_send(&pa)?;
        // every third a->b packet is lost on the floor
        if round % 3 != 0 {
            b.packet_receive(&pa)?;
        }

        let pb = b.create_packet(at(round), Some(Duration::ZERO))?;
        b.packet_send(&pb)?;
        if round % 4 != 0 {
            a.packet_receive(&pb)?;
        }

        if a.is_synchronized() && b.is_synchronized() {
            synchronized_at = Some(round);
            break;
        }
    }
    assert!(
        synchronized_at.is_some(),
        "peers failed to converge: a={} b={}",
        a.debug_clocks(),
        b.debug_clocks()
    );

    assert_eq!(b.inbox().content(1)?, Some(Content::String("from a".to_owned())));
    assert_eq!(b.inbox().content(2)?, Some(Content::Json(json!({"seq": 1}))));
    assert_eq!(a.inbox().content(1)?, Some(Content::String("from b".to_owned())));
    assert_eq!(
        a.inbox().content(2)?,
        Some(Content::Binary(Bytes::from(vec![9u8; 100])))
    );
    Ok(())
}

#[test]
fn test_new_pair_is_vacuously_synchronized() {
    let (mut a, mut b) = pair();
    assert!(a.is_synchronized());
    assert!(b.is_synchronized());
    assert_eq!(
        a.debug_clocks(),
        DebugClocks {
            clock_self: 0,
            clock_other: 0,
            clock_out_of_order: vec![],
            other_clock_self: 0,
            other_clock_other: 0,
            other_clock_out_of_order: vec![],
        }
    );
    let _ = b.debug_clocks();
}
