use cinder::{bitfield::Bitfield, picker::Picker};

#[test]
fn rarest_first_ordering() {
    let mut picker = Picker::new(4, 0);
    let peers = [0b1111_0000u8, 0b0111_0000, 0b0011_0000].map(|b| Bitfield::from_bytes(&[b], 4).unwrap());
    for p in &peers {
        picker.got_bitfield(p);
    }

    let mut order = Vec::new();
    while let Some(index) = picker.next(&peers[0], |i| !order.contains(&i)) {
        picker.requested(index);
        order.push(index);
    }
    assert_eq!(order, [0, 1, 2, 3]);
}

#[test]
fn lost_peer_changes_the_order() {
    let mut picker = Picker::new(4, 0);
    let p1 = Bitfield::from_bytes(&[0b1111_0000], 4).unwrap();
    let p2 = Bitfield::from_bytes(&[0b1000_0000], 4).unwrap();
    let p3 = Bitfield::from_bytes(&[0b1100_0000], 4).unwrap();
    for p in [&p1, &p2, &p3] {
        picker.got_bitfield(p);
    }
    assert_eq!(picker.next(&p1, |_| true), Some(2));

    picker.lost_bitfield(&p1);
    picker.got_bitfield(&p1);
    picker.lost_bitfield(&p2);
    picker.lost_bitfield(&p3);
    // every piece is down to one copy, ties go to the lowest index
    assert_eq!(picker.next(&p1, |_| true), Some(0));
}
