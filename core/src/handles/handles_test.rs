use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use super::*;
use crate::mem::testutil::RecordingMemory;
use crate::mem::{EmulatedMemory, is_deref_handle_address};

#[test]
fn acquire_is_idempotent_per_object() {
    let memory = RecordingMemory::new();
    let table = HandleTable::new();
    let object = Managed::buffer(vec![1, 2, 3]);

    let h1 = table.acquire(&memory, object.clone(), false);
    let h2 = table.acquire(&memory, object.clone(), false);
    assert_eq!(h1, h2);
    assert_eq!(memory.handle_allocs.load(Ordering::SeqCst), 1);

    // a different object gets a different address
    let other = table.acquire(&memory, Managed::buffer(vec![1, 2, 3]), false);
    assert_ne!(h1, other);
}

#[test]
fn refcount_tracks_acquires_minus_releases() {
    let memory = RecordingMemory::new();
    let table = HandleTable::new();
    let object = Managed::buffer(vec![0u8]);

    let address = table.acquire(&memory, object.clone(), false);
    table.acquire(&memory, object.clone(), false);

    table.release(&memory, address).unwrap();
    assert!(table.contains(address), "one reference still outstanding");
    assert_eq!(memory.freed_count_of(address), 0);

    table.release(&memory, address).unwrap();
    assert!(!table.contains(address));
    assert!(table.is_empty());
    assert_eq!(memory.freed_count_of(address), 1);
}

#[test]
fn resolve_round_trips_the_object() {
    let memory = EmulatedMemory::new();
    let table = HandleTable::new();
    let object = Managed::buffer(b"hello".to_vec());

    let address = table.acquire(&memory, object.clone(), false);
    assert_eq!(table.resolve(address).unwrap(), object);
}

#[test]
fn unknown_address_is_unresolved() {
    let memory = EmulatedMemory::new();
    let table = HandleTable::new();

    let err = table.resolve(NativePtr(0xdead)).unwrap_err();
    assert_eq!(err.downcast_ref::<UnresolvedHandle>(), Some(&UnresolvedHandle(NativePtr(0xdead))));

    let err = table.release(&memory, NativePtr(0xdead)).unwrap_err();
    assert!(err.downcast_ref::<UnresolvedHandle>().is_some());
}

#[test]
fn released_handle_cannot_be_resolved_again() {
    let memory = EmulatedMemory::new();
    let table = HandleTable::new();
    let address = table.acquire(&memory, Managed::buffer(vec![]), false);
    table.release(&memory, address).unwrap();

    assert!(table.resolve(address).is_err());
    assert!(table.release(&memory, address).is_err());
}

#[test]
fn auto_deref_selects_the_deref_region() {
    let memory = EmulatedMemory::new();
    let table = HandleTable::new();

    let plain = table.acquire(&memory, Managed::buffer(vec![1]), false);
    let deref = table.acquire(&memory, Managed::buffer(vec![2]), true);
    assert!(!is_deref_handle_address(plain));
    assert!(is_deref_handle_address(deref));
}

#[test]
fn live_addresses_and_objects_stay_in_bijection() {
    let memory = EmulatedMemory::new();
    let table = HandleTable::new();

    let objects: Vec<_> = (0..8).map(|i| Managed::buffer(vec![i as u8])).collect();
    let addresses: Vec<_> = objects
        .iter()
        .map(|o| table.acquire(&memory, o.clone(), false))
        .collect();

    // all addresses distinct
    for (i, a) in addresses.iter().enumerate() {
        for b in &addresses[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(table.len(), objects.len());

    // release half and check the survivors still resolve to their objects
    for address in &addresses[..4] {
        table.release(&memory, *address).unwrap();
    }
    assert_eq!(table.len(), 4);
    for (object, address) in objects.iter().zip(&addresses).skip(4) {
        assert_eq!(&table.resolve(*address).unwrap(), object);
    }
}

#[test]
fn concurrent_acquires_agree_on_one_address() {
    let memory = Arc::new(EmulatedMemory::new());
    let table = Arc::new(HandleTable::new());
    let object = Managed::buffer(vec![42]);

    let mut joins = Vec::new();
    for _ in 0..8 {
        let memory = memory.clone();
        let table = table.clone();
        let object = object.clone();
        joins.push(thread::spawn(move || table.acquire(&*memory, object, false)));
    }

    let addresses: Vec<NativePtr> = joins.into_iter().map(|j| j.join().unwrap()).collect();
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(table.len(), 1);

    // eight acquires need eight releases before the handle dies
    let address = addresses[0];
    for _ in 0..7 {
        table.release(&*memory, address).unwrap();
        assert!(table.contains(address));
    }
    table.release(&*memory, address).unwrap();
    assert!(!table.contains(address));
}
