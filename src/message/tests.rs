use std::sync::Arc;

use proptest::prelude::*;

use super::*;
use crate::ids::{ConsumerUid, DestinationUid, SysMessageId};

fn reference(seq: u64, priority: u8, order: u64) -> Arc<PacketReference> {
    let dest = DestinationUid::queue("orders").unwrap();
    let packet = Packet::new(SysMessageId::new(1_000, seq), dest, b"x".to_vec()).with_priority(priority);
    Arc::new(PacketReference::new(packet, order))
}

fn drain_ids(list: &mut PendingList) -> Vec<u64> {
    std::iter::from_fn(|| list.pop_front())
        .map(|r| r.id().sequence())
        .collect()
}

#[test]
fn test_pending_list_priority_then_fifo() {
    let mut list = PendingList::default();
    list.add(reference(1, 4, 1));
    list.add(reference(2, 9, 2));
    list.add(reference(3, 4, 3));
    list.add(reference(4, 0, 4));
    list.add(reference(5, 9, 5));
    assert_eq!(drain_ids(&mut list), vec![2, 5, 1, 3, 4]);
}

#[test]
fn test_add_all_to_front_keeps_batch_order() {
    let mut list = PendingList::default();
    list.add(reference(1, 9, 1));
    list.add_all_to_front(vec![reference(2, 0, 2), reference(3, 4, 3)]);
    list.add_all_to_front(vec![reference(4, 4, 4)]);
    assert_eq!(drain_ids(&mut list), vec![4, 2, 3, 1]);
}

#[test]
fn test_add_ordered_restores_arrival_position() {
    let seq = Arc::new(OrderSequence::new());
    let mut list = PendingList::new(Arc::clone(&seq));
    let first = reference(1, 4, seq.next());
    let second = reference(2, 4, seq.next());
    let third = reference(3, 4, seq.next());

    list.add(Arc::clone(&third));
    list.add_all_ordered([Arc::clone(&second), Arc::clone(&first)]);
    assert_eq!(drain_ids(&mut list), vec![1, 2, 3]);
}

#[test]
fn test_pending_list_remove_and_reinsert() {
    let mut list = PendingList::default();
    let r = reference(1, 4, 1);
    list.add(Arc::clone(&r));
    list.add(Arc::clone(&r));
    assert_eq!(list.len(), 1);
    assert!(list.contains(r.id()));
    assert!(list.remove(r.id()).is_some());
    assert!(list.is_empty());
    assert!(list.remove(r.id()).is_none());
}

#[test]
fn test_pending_list_take_and_retain() {
    let mut list = PendingList::default();
    for i in 1..=5 {
        list.add(reference(i, 4, i));
    }
    let taken = list.take(2);
    assert_eq!(taken.len(), 2);
    list.retain(|r| r.id().sequence() != 4);
    assert_eq!(drain_ids(&mut list), vec![3, 5]);
}

#[test]
fn test_ref_table_detects_stale_handle() {
    let table = RefTable::new();
    let r = reference(1, 4, 1);
    let (handle, replaced) = table.insert(&r);
    assert!(replaced.is_none());
    assert_eq!(r.handle(), Some(handle));
    assert!(table.get(handle).is_some());

    assert!(table.remove(handle).is_some());
    assert!(table.get(handle).is_none());
    assert!(table.remove(handle).is_none());

    // The slot is reused with a new generation.
    let other = reference(2, 4, 2);
    let (reused, _) = table.insert(&other);
    assert_ne!(reused, handle);
    assert!(table.get(handle).is_none());
    assert_eq!(table.get(reused).unwrap().id(), other.id());
}

#[test]
fn test_ref_table_replaces_same_id() {
    let table = RefTable::new();
    let old = reference(1, 4, 1);
    let new = reference(1, 4, 2);
    let (old_handle, _) = table.insert(&old);
    let (_, replaced) = table.insert(&new);
    assert_eq!(replaced.unwrap().order(), 1);
    assert!(table.get(old_handle).is_none());
    assert_eq!(table.get_by_id(new.id()).unwrap().order(), 2);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_in_delivery_is_exclusive_per_stored_id() {
    let r = reference(1, 4, 1);
    let a = ConsumerUid::new();
    let b = ConsumerUid::new();
    r.store(&[ConsumerUid::QUEUE]);

    assert!(r.check_removal_and_set_in_delivery(ConsumerUid::QUEUE, a));
    assert!(!r.check_removal_and_set_in_delivery(ConsumerUid::QUEUE, b));
    assert_eq!(r.owner(), Some(a));

    r.remove_in_delivery(ConsumerUid::QUEUE);
    assert!(r.check_removal_and_set_in_delivery(ConsumerUid::QUEUE, b));
    assert_eq!(r.owner(), Some(b));
}

#[test]
fn test_topic_acks_are_independent() {
    let r = reference(1, 4, 1);
    let c1 = ConsumerUid::new();
    let c2 = ConsumerUid::new();
    r.store(&[c1, c2]);

    assert!(r.check_removal_and_set_in_delivery(c1, c1));
    assert!(r.check_removal_and_set_in_delivery(c2, c2));
    assert!(!r.acknowledged(c1));
    assert!(!r.acknowledged(c1));
    assert!(!r.is_fully_acknowledged());
    assert!(r.acknowledged(c2));
    assert!(r.is_fully_acknowledged());
}

#[test]
fn test_delivered_outcomes() {
    let dest = DestinationUid::topic("news").unwrap();
    let expired = Arc::new(PacketReference::new(
        Packet::new(SysMessageId::new(1, 1), dest.clone(), Vec::new()).with_expiration(10),
        1,
    ));
    let c = ConsumerUid::new();
    expired.store(&[c]);
    assert_eq!(expired.delivered(c, false, 11), DeliveredOutcome::Dead);
    assert!(expired.is_dead());

    let live = reference(2, 4, 2);
    live.store(&[c]);
    assert_eq!(live.delivered(c, false, 0), DeliveredOutcome::Deliver);
    assert_eq!(live.ack_state(c), Some(AckState::Delivered));
    assert_eq!(
        live.delivered(c, true, 0),
        DeliveredOutcome::AckedOnDelivery { removable: true }
    );

    live.destroy();
    assert_eq!(live.delivered(c, false, 0), DeliveredOutcome::Gone);
    assert!(!live.check_removal_and_set_in_delivery(c, c));
}

#[test]
fn test_delivery_packet_stamps_redelivery() {
    let r = reference(1, 4, 1);
    let c = ConsumerUid::new();
    r.store(&[c]);
    let first = r.delivery_packet(c, c);
    assert!(!first.redelivered);
    assert_eq!(first.delivery_count, 1);
    assert_eq!(first.consumer_id, Some(c));

    r.delivered(c, false, 0);
    let second = r.delivery_packet(c, c);
    assert!(second.redelivered);
    assert_eq!(second.delivery_count, 2);
}

#[test]
fn test_expiration_info_orders_by_time_then_id() {
    let a = ExpirationInfo::new(100, SysMessageId::new(5, 2));
    let b = ExpirationInfo::new(100, SysMessageId::new(5, 1));
    let c = ExpirationInfo::new(50, SysMessageId::new(9, 9));
    let mut all = vec![a, b, c];
    all.sort();
    assert_eq!(all, vec![c, b, a]);
    assert!(c.is_expired(50));
    assert!(!a.is_expired(99));
}

proptest! {
    #[test]
    fn prop_higher_priority_pops_first(priorities in proptest::collection::vec(0u8..=9, 1..64)) {
        let mut list = PendingList::default();
        for (i, p) in priorities.iter().enumerate() {
            list.add(reference(i as u64, *p, i as u64));
        }
        let popped: Vec<(u8, u64)> = std::iter::from_fn(|| list.pop_front())
            .map(|r| (r.priority(), r.id().sequence()))
            .collect();
        for pair in popped.windows(2) {
            let (p1, s1) = pair[0];
            let (p2, s2) = pair[1];
            prop_assert!(p1 > p2 || (p1 == p2 && s1 < s2));
        }
    }
}
