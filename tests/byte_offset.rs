//! Byte-offset reassembly through the public table API.
//!
//! Covers arrival orders, retransmissions, overlaps, conflicting final
//! fragments and the out-of-band length operations.

use std::num::NonZeroUsize;

use reassembly::{
    AnomalyKind,
    FlowKey,
    FragmentDescriptor,
    FrameNumber,
    KeyInput,
    MessageId,
    ReassemblyConfig,
    ReassemblyError,
    ReassemblyTable,
    ReconstructionState,
};
use reassembly_testing::{OwnedFragment, add_all, completions, flow, split_bytes, table};
use rstest::rstest;

fn at(frame: u32, position: u32, data: &[u8]) -> FragmentDescriptor<'_> {
    FragmentDescriptor::new(FrameNumber::new(frame), position, data)
}

#[rstest]
#[case::in_order(&[0, 1, 2, 3])]
#[case::reversed(&[3, 2, 1, 0])]
#[case::interleaved(&[2, 0, 3, 1])]
fn any_arrival_order_rebuilds_the_payload(
    #[case] order: &[usize],
    mut table: ReassemblyTable,
    flow: FlowKey,
) {
    let key = KeyInput::new(&flow, MessageId::new(0x1c46));
    let pieces = split_bytes(b"the quick brown fox", 5);
    let shuffled: Vec<OwnedFragment> = order.iter().map(|&i| pieces[i].clone()).collect();

    let done = completions(add_all(&mut table, &key, &shuffled));
    let [message] = &done[..] else {
        panic!("expected exactly one completion, got {}", done.len());
    };
    assert_eq!(message.payload(), b"the quick brown fox");
    assert!(message.anomalies().is_empty());
    assert_eq!(message.reassembled_in(), shuffled[3].frame);
    assert_eq!(message.fragments().len(), 4);
}

#[rstest]
fn retransmission_from_completing_packet_returns_result(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(1));
    assert_eq!(table.add(&key, at(1, 0, b"HELLO")), Ok(None));
    let done = table
        .add(&key, at(2, 5, b"WORLD").last())
        .expect("accepted")
        .expect("complete");

    assert_eq!(table.add(&key, at(1, 0, b"HELLO")), Ok(None));
    let again = table
        .add(&key, at(2, 5, b"WORLD").last())
        .expect("accepted")
        .expect("replayed completion");
    assert!(std::sync::Arc::ptr_eq(&done, &again));
    assert_eq!(table.reconstruction(&key).map(|r| r.fragments().len()), Some(2));
}

#[rstest]
fn conflicting_overlap_keeps_first_arrival(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(2));
    table.add(&key, at(1, 0, b"AAAAAAAAAA")).expect("accepted");
    let done = table
        .add(&key, at(2, 5, b"BBBBBBBBBB").last())
        .expect("accepted")
        .expect("complete");

    assert_eq!(done.payload(), b"AAAAAAAAAABBBBB");
    assert!(done.anomalies().contains(AnomalyKind::Overlap));
    assert!(done.anomalies().contains(AnomalyKind::OverlapConflict));
    assert!(done.fragments()[1].anomalies.contains(AnomalyKind::OverlapConflict));
    assert!(!done.fragments()[0].anomalies.contains(AnomalyKind::Overlap));
}

#[rstest]
fn tolerated_second_tail_is_flagged(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(3));
    table.add(&key, at(1, 4, b"tail").last()).expect("first tail");
    table.add(&key, at(2, 4, b"tail!!").last()).expect("second tail tolerated");
    let done = table
        .add(&key, at(3, 0, b"head"))
        .expect("accepted")
        .expect("complete at the first total");

    assert_eq!(done.payload(), b"headtail");
    assert!(done.anomalies().contains(AnomalyKind::MultipleTails));
    assert!(done.anomalies().contains(AnomalyKind::TooLong));
}

#[rstest]
fn strict_tails_fail_the_reassembly(flow: FlowKey) {
    let mut table = ReassemblyTable::new("strict", ReassemblyConfig::default().tolerate_multiple_tails(false));
    let key = KeyInput::new(&flow, MessageId::new(4));
    table.add(&key, at(1, 4, b"tail").last()).expect("first tail");

    assert_eq!(
        table.add(&key, at(2, 0, b"early").last()),
        Err(ReassemblyError::UnreconcilableLength { existing: 8, claimed: 5 })
    );
    let state = table.reconstruction(&key).map(reassembly::Reconstruction::state);
    assert_eq!(state, Some(ReconstructionState::Failed));
    assert!(matches!(
        table.add(&key, at(3, 0, b"head")),
        Err(ReassemblyError::Failed { .. })
    ));
}

#[rstest]
fn zero_length_final_fragment_closes_the_message(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(5));
    table.add(&key, at(1, 0, b"body")).expect("accepted");
    let done = table
        .add(&key, at(2, 4, b"").last())
        .expect("accepted")
        .expect("complete");
    assert_eq!(done.payload(), b"body");
    assert_eq!(done.total_len(), 4);
}

#[rstest]
fn late_conflicting_fragment_only_flags(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(6));
    table.add(&key, at(1, 0, b"abc")).expect("accepted");
    table.add(&key, at(2, 3, b"def").last()).expect("complete");

    assert_eq!(table.add(&key, at(3, 2, b"XY")), Ok(None));
    let reconstruction = table.reconstruction(&key).expect("still held");
    assert_eq!(reconstruction.fragments().len(), 2);
    assert!(reconstruction.anomalies().contains(AnomalyKind::OverlapConflict));
    assert_eq!(reconstruction.result().map(|r| r.payload().to_vec()), Some(b"abcdef".to_vec()));
}

#[rstest]
fn late_second_tail_is_flagged(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(15));
    table.add(&key, at(1, 0, b"HELLO")).expect("accepted");
    let done = table
        .add(&key, at(2, 5, b"WORLD").last())
        .expect("accepted")
        .expect("complete");

    assert_eq!(table.add(&key, at(3, 5, b"WOR").last()), Ok(None));
    let reconstruction = table.reconstruction(&key).expect("still held");
    assert!(reconstruction.anomalies().contains(AnomalyKind::MultipleTails));
    assert!(!reconstruction.anomalies().contains(AnomalyKind::OverlapConflict));
    assert!(done.anomalies().is_empty());
    assert_eq!(done.payload(), b"HELLOWORLD");
}

#[rstest]
fn strict_tails_reject_a_late_second_tail(flow: FlowKey) {
    let mut table = ReassemblyTable::new("strict", ReassemblyConfig::default().tolerate_multiple_tails(false));
    let key = KeyInput::new(&flow, MessageId::new(16));
    table.add(&key, at(1, 0, b"HELLO")).expect("accepted");
    table.add(&key, at(2, 5, b"WORLD").last()).expect("complete");

    assert_eq!(
        table.add(&key, at(3, 5, b"WOR").last()),
        Err(ReassemblyError::UnreconcilableLength { existing: 10, claimed: 8 })
    );
    let reconstruction = table.reconstruction(&key).expect("still held");
    assert_eq!(reconstruction.state(), ReconstructionState::Defragmented);
    assert_eq!(reconstruction.result().map(|r| r.payload().to_vec()), Some(b"HELLOWORLD".to_vec()));
}

#[rstest]
fn out_of_order_submission_credits_origin(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(7));
    table.add(&key, at(5, 0, b"now")).expect("accepted");
    let done = table
        .add_out_of_order(&key, at(5, 3, b"then").last(), FrameNumber::new(2))
        .expect("accepted")
        .expect("complete");

    assert_eq!(done.reassembled_in(), FrameNumber::new(5));
    assert_eq!(done.fragments()[1].frame, FrameNumber::new(2));
}

#[rstest]
fn set_total_length_completes_without_final_flag(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(8));
    table.add(&key, at(1, 0, b"1234")).expect("accepted");
    table.add(&key, at(2, 4, b"5678")).expect("accepted");

    let done = table
        .set_total_length(&key, 8, FrameNumber::new(3))
        .expect("length accepted")
        .expect("complete");
    assert_eq!(done.payload(), b"12345678");
    assert_eq!(done.reassembled_in(), FrameNumber::new(3));
    assert_eq!(
        table.set_total_length(&key, 6, FrameNumber::new(4)),
        Err(ReassemblyError::LengthLocked { current: 8, requested: 6 })
    );
}

#[rstest]
fn reset_total_length_reopens_a_grown_message(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(9));
    table.add(&key, at(1, 0, b"abcd").last()).expect("complete");

    assert_eq!(table.reset_total_length(&key, 6, FrameNumber::new(2)), Ok(None));
    assert_eq!(
        table.reconstruction(&key).map(reassembly::Reconstruction::state),
        Some(ReconstructionState::Accumulating)
    );
    let done = table
        .add(&key, at(3, 4, b"ef"))
        .expect("accepted")
        .expect("complete at the new total");
    assert_eq!(done.payload(), b"abcdef");
}

#[rstest]
fn truncate_shrinks_a_completed_message(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(10));
    let payload: Vec<u8> = (0..100).collect();
    completions(add_all(&mut table, &key, &split_bytes(&payload, 30)));

    let cut = table
        .truncate(&key, 40)
        .expect("shrinks")
        .expect("completed message replaced");
    assert_eq!(cut.payload(), &payload[..40]);
    assert_eq!(cut.fragments().len(), 2);
    assert_eq!(
        table.truncate(&key, 50),
        Err(ReassemblyError::InvalidTruncation { current: 40, requested: 50 })
    );
}

#[rstest]
fn end_completes_with_the_received_prefix(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(11));
    table.add(&key, at(1, 0, b"prefix")).expect("accepted");
    table.add(&key, at(2, 10, b"island")).expect("accepted");

    let done = table
        .end(&key, FrameNumber::new(3))
        .expect("ended")
        .expect("complete");
    assert_eq!(done.payload(), b"prefix");
    assert!(done.anomalies().contains(AnomalyKind::TooLong));
}

#[rstest]
fn partial_reassembly_extends_a_completed_message(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(12));
    table.add(&key, at(1, 0, b"GET /").last()).expect("complete");
    table.set_partial_reassembly(&key).expect("known identity");

    table.add(&key, at(2, 5, b" HTTP/1.1")).expect("reopened");
    let done = table
        .set_total_length(&key, 14, FrameNumber::new(2))
        .expect("length accepted")
        .expect("complete again");
    assert_eq!(done.payload(), b"GET / HTTP/1.1");
}

#[rstest]
fn size_cap_rejects_oversized_messages(flow: FlowKey) {
    let config = ReassemblyConfig::default().max_message_size(NonZeroUsize::new(8));
    let mut table = ReassemblyTable::new("capped", config);
    let key = KeyInput::new(&flow, MessageId::new(13));

    assert!(matches!(
        table.add(&key, at(1, 4, b"too long")),
        Err(ReassemblyError::MessageTooLarge { attempted: 12, .. })
    ));
    assert_eq!(table.in_progress(), 0);
}

#[rstest]
fn delete_hands_back_the_payload(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(14));
    table.add(&key, at(1, 0, b"bye").last()).expect("complete");
    assert_eq!(table.delete(&key).as_deref(), Some(&b"bye"[..]));
    assert!(table.get(&key).is_none());
    assert_eq!(table.delete(&key), None);
}

#[derive(Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
struct Announcement {
    sequence: u32,
    topic: String,
    ports: Vec<u16>,
}

#[rstest]
fn reassembled_payload_decodes_into_a_typed_message(mut table: ReassemblyTable, flow: FlowKey) {
    let sent = Announcement {
        sequence: 42,
        topic: "fragmented announcement".to_owned(),
        ports: vec![53, 5060, 8080],
    };
    let encoded = bincode::encode_to_vec(&sent, bincode::config::standard()).expect("encodes");
    let mut pieces = split_bytes(&encoded, 4);
    pieces.reverse();

    let key = KeyInput::new(&flow, MessageId::new(17));
    let done = completions(add_all(&mut table, &key, &pieces));
    let [message] = &done[..] else {
        panic!("expected one completion, got {}", done.len());
    };
    assert_eq!(message.decode::<Announcement>().expect("decodes"), sent);
}
