use daqcore::ring::{active_len, RingChannel};

#[test]
fn test_active_len_never_exceeds_capacity() {
    const CAP: usize = 16;
    for read in 0..CAP {
        for write in 0..CAP {
            let len = active_len(read, write, CAP);
            assert!(len < CAP, "read {} write {} gave {}", read, write, len);
            assert_eq!(len == 0, read == write);
        }
    }
}

#[test]
fn test_retired_slot_still_readable_by_index() {
    let mut ring: RingChannel<u8, 8> = RingChannel::new();
    let idx = ring.push(0x42).unwrap();
    assert!(!ring.element_done(idx));
    assert!(ring.retire());
    assert!(ring.element_done(idx));
    assert_eq!(*ring.get(idx), 0x42);
}

#[test]
fn test_release_and_rewind_across_wrap() {
    let mut ring: RingChannel<u8, 8> = RingChannel::new();
    for b in 0..6 {
        ring.push(b).unwrap();
    }
    assert!(ring.release_to(5));
    for b in 6..10 {
        ring.push(b).unwrap();
    }
    assert_eq!(ring.write_index(), 2);
    assert_eq!(ring.len(), 5);

    // Abandon the two bytes written after the wrap.
    assert!(ring.rewind_to(0));
    assert_eq!(ring.len(), 3);
    // A cursor outside the live span is ignored.
    assert!(!ring.release_to(2));
    assert_eq!(ring.contiguous(5, 8), &[5, 6, 7]);
}
