use daqcore::event::{EventReceiver, PacketKind, EV_DUMP_SIZE, EVENT_PACKET_QUEUE};
use daqcore::mux::PacketSource;
use daqcore::sim::EventGenerator;

fn framed_packet(payload: u8) -> Vec<u8> {
    let mut bytes = vec![0xDC, 0x00, 0xFF, payload, 0x01, 0x02];
    bytes.extend((0..payload).map(|i| i.wrapping_add(0x20)));
    bytes.extend_from_slice(&[0xFF, 0x00, 0xFF]);
    bytes
}

#[test]
fn test_single_packet_recovered_for_payload_sizes() {
    for payload in [0u8, 3, 252] {
        let mut rx = EventReceiver::new();
        let packet = framed_packet(payload);
        rx.receive(&packet);
        assert_eq!(rx.scan(), 1, "payload {}", payload);
        assert_eq!(rx.pending_packets(), 1);
        let found = rx.peek_packet().unwrap();
        assert_eq!(found.kind, PacketKind::Framed);
        assert_eq!(found.len(), packet.len());
        assert_eq!(rx.packet_bytes(&found).as_slice(), packet.as_slice());
    }
}

#[test]
fn test_no_trailer_produces_one_dump() {
    let mut rx = EventReceiver::new();
    rx.receive(&vec![0x5A; EV_DUMP_SIZE + 10]);
    assert_eq!(rx.scan(), 1);
    let dump = rx.peek_packet().unwrap();
    assert_eq!(dump.kind, PacketKind::Dump);
    assert_eq!(dump.len(), 999);
}

#[test]
fn test_short_stream_without_trailer_waits() {
    let mut rx = EventReceiver::new();
    rx.receive(&[0xDC, 0x00, 0xFF, 0x03, 0x01]);
    assert_eq!(rx.scan(), 0);
    // Rest of the packet arrives: the same start is scanned again.
    rx.receive(&[0x02, 0xAA, 0xBB, 0xCC, 0xFF, 0x00, 0xFF]);
    assert_eq!(rx.scan(), 1);
    assert_eq!(rx.peek_packet().unwrap().len(), 12);
}

#[test]
fn test_consecutive_packets_each_found_once() {
    let mut rx = EventReceiver::new();
    let mut gen = EventGenerator::new();
    let first = gen.fixed();
    let second = gen.variable(0x01, 30);
    rx.receive(&first);
    assert_eq!(rx.scan(), 1);
    rx.receive(&second);
    assert_eq!(rx.scan(), 1);
    assert_eq!(rx.pending_packets(), 2);

    // Consume the first through the packet source interface.
    let span = rx.next_packet().unwrap();
    assert_eq!(span.len, first.len());
    rx.release(&span, span.start + span.len);
    rx.finish_packet();
    let next = rx.peek_packet().unwrap();
    assert_eq!(rx.packet_bytes(&next).as_slice(), second.as_slice());
    assert_eq!(rx.buffered(), second.len());
}

#[test]
fn test_full_queue_defers_scanning() {
    let mut rx = EventReceiver::new();
    let mut gen = EventGenerator::new();
    for _ in 0..EVENT_PACKET_QUEUE - 1 {
        rx.receive(&gen.fixed());
        assert_eq!(rx.scan(), 1);
    }
    rx.receive(&gen.fixed());
    assert_eq!(rx.scan(), 0);
    assert_eq!(rx.pending_packets(), EVENT_PACKET_QUEUE - 1);
}

#[test]
fn test_overrun_counts_discarded_bytes() {
    let mut rx = EventReceiver::new();
    rx.receive(&vec![0u8; 1100]);
    assert_eq!(rx.buffered(), 1023);
    assert_eq!(rx.stats().bytes_overwritten, 1100 - 1023);
}
