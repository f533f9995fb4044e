//! Unit tests for the table façade: routing, promotion and housekeeping.

use std::{net::Ipv4Addr, num::NonZeroUsize, sync::Arc};

use rstest::{fixture, rstest};

use super::{Lookup, ReassemblyTable};
use crate::{
    arena::{ArenaError, Scope},
    config::ReassemblyConfig,
    fragment::{FragmentDescriptor, ReassemblyError, ReconstructionState},
    key::{FlowKey, FrameNumber, KeyInput, KeyScheme, MessageId},
};

#[fixture]
fn table() -> ReassemblyTable { ReassemblyTable::new("test", ReassemblyConfig::default()) }

#[fixture]
fn flow() -> FlowKey {
    FlowKey::new(Ipv4Addr::new(198, 51, 100, 1), Ipv4Addr::new(198, 51, 100, 2)).with_ports(5000, 53)
}

fn fragment(frame: u32, position: u32, data: &[u8]) -> FragmentDescriptor<'_> {
    FragmentDescriptor::new(FrameNumber::new(frame), position, data)
}

#[rstest]
fn identities_do_not_share_fragments(mut table: ReassemblyTable, flow: FlowKey) {
    let first = KeyInput::new(&flow, MessageId::new(1));
    let second = KeyInput::new(&flow, MessageId::new(2));

    assert_eq!(table.add(&first, fragment(1, 0, b"one")), Ok(None));
    assert_eq!(table.add(&second, fragment(2, 3, b"two").last()), Ok(None));
    assert_eq!(table.in_progress(), 2);

    let done = table
        .add(&second, fragment(3, 0, b"TWO"))
        .expect("accepted")
        .expect("second identity completes");
    assert_eq!(done.payload(), b"TWOtwo");
    assert!(matches!(table.get(&first), Some(Lookup::Reconstruction(r)) if !r.is_defragmented()));
}

#[rstest]
fn discriminator_separates_reused_ids(mut table: ReassemblyTable, flow: FlowKey) {
    let plain = KeyInput::new(&flow, MessageId::new(9));
    let tagged = KeyInput::new(&flow, MessageId::new(9)).with_discriminator(b"retry");
    table.add(&plain, fragment(1, 0, b"a")).expect("accepted");
    table.add(&tagged, fragment(2, 0, b"b")).expect("accepted");
    assert_eq!(table.in_progress(), 2);
}

#[rstest]
fn address_scheme_ignores_ports(flow: FlowKey) {
    let mut table = ReassemblyTable::new("ip", ReassemblyConfig::default().key_scheme(KeyScheme::Addresses));
    let other_ports = flow.clone().with_ports(6000, 80);
    let head = KeyInput::new(&flow, MessageId::new(4));
    let tail = KeyInput::new(&other_ports, MessageId::new(4));

    table.add(&head, fragment(1, 0, b"same")).expect("accepted");
    let done = table
        .add(&tail, fragment(2, 4, b"flow").last())
        .expect("accepted")
        .expect("ports do not split the identity");
    assert_eq!(done.payload(), b"sameflow");
}

#[rstest]
fn add_check_promotes_and_serves_the_cache(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(7));
    table.add_check(&key, fragment(1, 0, b"cache")).expect("accepted");
    let first = table
        .add_check(&key, fragment(2, 5, b"d").last())
        .expect("accepted")
        .expect("completes");
    assert_eq!(table.in_progress(), 0);
    assert_eq!(table.results().len(), 1);

    let again = table
        .add_check(&key, fragment(9, 0, b"garbage").last())
        .expect("cache hit")
        .expect("cached result");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.payload(), b"cached");
    assert!(matches!(table.get(&key), Some(Lookup::Reassembled(_))));
}

#[rstest]
fn fallback_links_an_existing_result(mut table: ReassemblyTable, flow: FlowKey) {
    let original = KeyInput::new(&flow, MessageId::new(1));
    let retransmit = KeyInput::new(&flow, MessageId::new(2));
    let done = table
        .add_check(&original, fragment(1, 0, b"whole").last())
        .expect("accepted")
        .expect("single fragment completes");

    let linked = table
        .add_check_with_fallback(&retransmit, &original, fragment(5, 0, b"other").last())
        .expect("accepted")
        .expect("linked to fallback");
    assert!(Arc::ptr_eq(&done, &linked));
    assert_eq!(Arc::strong_count(&done), 4);
    assert!(table.get_reassembled(&retransmit).is_some());
}

#[rstest]
fn fallback_is_ignored_when_identity_is_in_progress(mut table: ReassemblyTable, flow: FlowKey) {
    let original = KeyInput::new(&flow, MessageId::new(1));
    let key = KeyInput::new(&flow, MessageId::new(2));
    table.add_check(&original, fragment(1, 0, b"x").last()).expect("accepted");
    table.add_check(&key, fragment(2, 0, b"ab")).expect("accepted");

    let done = table
        .add_check_with_fallback(&key, &original, fragment(3, 2, b"cd").last())
        .expect("accepted")
        .expect("own fragments complete");
    assert_eq!(done.payload(), b"abcd");
}

#[rstest]
fn discipline_mismatch_is_rejected(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(3));
    table.add(&key, fragment(1, 0, b"bytes")).expect("accepted");
    assert!(matches!(
        table.add_seq(&key, fragment(2, 1, b"block")),
        Err(ReassemblyError::DisciplineMismatch { .. })
    ));
}

#[rstest]
fn rejected_first_fragment_leaves_no_entry(flow: FlowKey) {
    let config = ReassemblyConfig::default().max_message_size(NonZeroUsize::new(4));
    let mut table = ReassemblyTable::new("capped", config);
    let key = KeyInput::new(&flow, MessageId::new(3));
    assert!(matches!(
        table.add(&key, fragment(1, 0, b"too big")),
        Err(ReassemblyError::MessageTooLarge { .. })
    ));
    assert!(table.get(&key).is_none());
    assert_eq!(table.keys().flow_count(), 0);

    table.add(&key, fragment(2, 0, b"fits")).expect("accepted");
    assert_eq!(table.keys().flow_count(), 1);
}

#[rstest]
fn first_fragment_completing_a_checked_message_interns_nothing(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(4));
    table
        .add_check(&key, fragment(1, 0, b"whole").last())
        .expect("accepted")
        .expect("single fragment completes");
    assert_eq!(table.in_progress(), 0);
    assert_eq!(table.keys().flow_count(), 0);
    assert!(table.get_reassembled(&key).is_some());
}

#[rstest]
fn arena_exhaustion_is_fatal(flow: FlowKey) {
    let config = ReassemblyConfig::default().arena_limit(NonZeroUsize::new(8));
    let mut table = ReassemblyTable::new("tiny", config);
    let key = KeyInput::new(&flow, MessageId::new(3));
    table.add(&key, fragment(1, 0, b"12345678")).expect("fits exactly");
    let err = table
        .add(&key, fragment(2, 8, b"9"))
        .expect_err("arena is full");
    assert!(err.is_fatal());
    assert!(matches!(err, ReassemblyError::Arena(ArenaError::Exhausted { .. })));
}

#[rstest]
fn replayed_completing_fragment_returns_the_same_result(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(5));
    let head = fragment(1, 0, b"re");
    let tail = fragment(2, 2, b"play").last();
    assert_eq!(table.add(&key, head), Ok(None));
    let first = table.add(&key, tail).expect("accepted").expect("completes");

    assert_eq!(table.add(&key, head), Ok(None));
    let replayed = table.add(&key, tail).expect("accepted").expect("cached result");
    assert!(Arc::ptr_eq(&first, &replayed));
}

#[rstest]
fn length_operations_require_an_existing_identity(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(8));
    assert_eq!(table.set_total_length(&key, 4, FrameNumber::new(1)), Err(ReassemblyError::NotFound));
    assert_eq!(table.reset_total_length(&key, 4, FrameNumber::new(1)), Err(ReassemblyError::NotFound));
    assert_eq!(table.truncate(&key, 1), Err(ReassemblyError::NotFound));
    assert_eq!(table.end(&key, FrameNumber::new(1)), Err(ReassemblyError::NotFound));
    assert_eq!(table.set_partial_reassembly(&key), Err(ReassemblyError::NotFound));
}

#[rstest]
fn start_expecting_then_sequence_blocks(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(6));
    table.start_expecting(&key, 2);
    table.start_expecting(&key, 9);
    assert_eq!(
        table.reconstruction(&key).and_then(|r| r.total_len()),
        Some(2)
    );

    table.add_seq(&key, fragment(1, 1, b"-b")).expect("accepted");
    let done = table
        .add_seq(&key, fragment(2, 0, b"a"))
        .expect("accepted")
        .expect("two blocks complete");
    assert_eq!(done.payload(), b"a-b");
}

#[rstest]
fn add_seq_next_appends_in_arrival_order(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(6));
    table.add_seq_next(&key, fragment(1, 0, b"x")).expect("accepted");
    table.add_seq_next(&key, fragment(2, 0, b"y")).expect("accepted");
    let done = table
        .add_seq_next(&key, fragment(3, 0, b"z").last())
        .expect("accepted")
        .expect("final fragment completes");
    assert_eq!(done.payload(), b"xyz");
    assert_eq!(table.get_reassembled(&key).map(|r| r.total_len()), Some(3));
}

#[rstest]
fn end_flushes_a_stream(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(2));
    table.add_seq(&key, fragment(1, 0, b"p0")).expect("accepted");
    table.add_seq(&key, fragment(2, 1, b"p1")).expect("accepted");
    let done = table
        .end(&key, FrameNumber::new(3))
        .expect("accepted")
        .expect("contiguous blocks complete");
    assert_eq!(done.payload(), b"p0p1");
    assert_eq!(done.reassembled_in(), FrameNumber::new(3));
    let again = table.end(&key, FrameNumber::new(4)).expect("accepted");
    assert!(again.is_some_and(|r| Arc::ptr_eq(&r, &done)));
}

#[rstest]
fn truncate_applies_to_cached_results(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(1));
    let whole = table
        .add_check(&key, fragment(1, 0, b"0123456789").last())
        .expect("accepted")
        .expect("completes");
    let cut = table
        .truncate(&key, 4)
        .expect("shrink accepted")
        .expect("cached result replaced");
    assert_eq!(cut.payload(), b"0123");
    assert_eq!(whole.payload(), b"0123456789");
    assert!(table.get_reassembled(&key).is_some_and(|r| Arc::ptr_eq(&r, &cut)));
}

#[rstest]
fn truncate_completes_an_in_progress_message(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(2));
    table.add(&key, fragment(1, 0, b"head")).expect("accepted");
    table.add(&key, fragment(2, 4, b"body")).expect("accepted");
    table.add(&key, fragment(3, 12, b"stray")).expect("accepted");

    let done = table
        .truncate(&key, 8)
        .expect("shrink accepted")
        .expect("retained prefix completes");
    assert_eq!(done.payload(), b"headbody");
    assert_eq!(done.reassembled_in(), FrameNumber::new(2));
    assert_eq!(
        table.reconstruction(&key).map(|r| r.state()),
        Some(ReconstructionState::Defragmented)
    );
}

#[rstest]
fn delete_hands_back_the_payload(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(1));
    table.add(&key, fragment(1, 0, b"gone").last()).expect("accepted");
    assert_eq!(table.delete(&key).as_deref(), Some(&b"gone"[..]));
    assert!(table.get(&key).is_none());
    assert_eq!(table.delete(&key), None);
}

#[rstest]
fn failed_reconstruction_stays_failed(flow: FlowKey) {
    let mut table = ReassemblyTable::new("strict", ReassemblyConfig::default().tolerate_multiple_tails(false));
    let key = KeyInput::new(&flow, MessageId::new(1));
    table.add(&key, fragment(1, 6, b"end").last()).expect("accepted");
    assert!(matches!(
        table.add(&key, fragment(2, 0, b"short").last()),
        Err(ReassemblyError::UnreconcilableLength { existing: 9, claimed: 5 })
    ));
    assert_eq!(
        table.reconstruction(&key).map(|r| r.state()),
        Some(ReconstructionState::Failed)
    );
    assert!(matches!(
        table.add(&key, fragment(3, 0, b"abcdef")),
        Err(ReassemblyError::Failed { .. })
    ));
}

#[rstest]
fn init_releases_everything(mut table: ReassemblyTable, flow: FlowKey) {
    let key = KeyInput::new(&flow, MessageId::new(1));
    table.add(&key, fragment(1, 0, b"held")).expect("accepted");
    table.add_check(&KeyInput::new(&flow, MessageId::new(2)), fragment(1, 0, b"x").last()).expect("accepted");
    let generation = table.arena().generation(Scope::Session);

    table.init();
    assert_eq!(table.in_progress(), 0);
    assert!(table.results().is_empty());
    assert_eq!(table.keys().flow_count(), 0);
    assert_eq!(table.arena().in_use(Scope::Session), 0);
    assert_eq!(table.arena().generation(Scope::Session), generation + 1);
}
