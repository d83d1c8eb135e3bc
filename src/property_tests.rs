//! Object tree, attributes and property tables.

use crate::machine::Machine;
use crate::object::ObjectSystem;
use crate::test_utils::StoryBuilder;
use test_log::test;

fn five_objects(version: u8) -> Machine {
    let mut b = StoryBuilder::new(version);
    // 1 is a root holding 2 and 3; 4 and 5 start parentless
    b.add_object(0, 0, 2, "root", &[]);
    b.add_object(1, 3, 0, "first", &[]);
    b.add_object(1, 0, 0, "second", &[]);
    b.add_object(0, 0, 0, "loose", &[]);
    b.add_object(0, 0, 0, "mover", &[]);
    Machine::new(b.build_image())
}

#[test]
fn reinsertion_detaches_from_the_old_parent() {
    for version in [3u8, 5] {
        let mut m = five_objects(version);
        m.insert_object(5, 2).unwrap();
        m.insert_object(5, 3).unwrap();
        assert_eq!(m.obj_parent(5).unwrap(), 3);
        // 5 must not linger in 2's child chain
        let mut cursor = m.obj_child(2).unwrap();
        while cursor != 0 {
            assert_ne!(cursor, 5);
            cursor = m.obj_sibling(cursor).unwrap();
        }
    }
}

#[test]
fn insertion_pushes_to_the_head_of_the_child_chain() {
    let mut m = five_objects(3);
    m.insert_object(4, 1).unwrap();
    assert_eq!(m.obj_child(1).unwrap(), 4);
    assert_eq!(m.obj_sibling(4).unwrap(), 2);
    assert_eq!(m.obj_sibling(2).unwrap(), 3);
}

#[test]
fn removal_relinks_the_middle_of_a_chain() {
    let mut m = five_objects(3);
    m.insert_object(4, 1).unwrap(); // chain: 4 2 3
    m.remove_object(2).unwrap();
    assert_eq!(m.obj_parent(2).unwrap(), 0);
    assert_eq!(m.obj_sibling(4).unwrap(), 3);
}

#[test]
fn moves_never_create_cycles() {
    let mut m = five_objects(3);
    let moves = [(2u16, 3u16), (3, 4), (4, 5), (5, 2), (2, 4), (3, 2)];
    for (obj, dest) in moves {
        m.insert_object(obj, dest).unwrap();
        // Every object's parent chain must terminate
        for obj in 1..=5u16 {
            let mut cursor = obj;
            let mut steps = 0;
            while cursor != 0 {
                cursor = m.obj_parent(cursor).unwrap();
                steps += 1;
                assert!(steps <= 5, "cycle through object {}", obj);
            }
        }
    }
}

#[test]
fn attributes_span_the_version_bitfield() {
    let mut b = StoryBuilder::new(3);
    b.add_object(0, 0, 0, "thing", &[]);
    b.set_attribute(1, 0);
    b.set_attribute(1, 31);
    let mut m = Machine::new(b.build_image());
    assert!(m.test_attribute(1, 0).unwrap());
    assert!(m.test_attribute(1, 31).unwrap());
    assert!(!m.test_attribute(1, 15).unwrap());
    m.clear_attribute(1, 31).unwrap();
    assert!(!m.test_attribute(1, 31).unwrap());
    m.set_attribute(1, 15).unwrap();
    assert!(m.test_attribute(1, 15).unwrap());
    // Out of range for v3: tolerated, never set
    assert!(!m.test_attribute(1, 40).unwrap());
    m.set_attribute(1, 40).unwrap();
    assert!(!m.test_attribute(1, 40).unwrap());
}

#[test]
fn wide_attribute_field_from_v4() {
    let mut b = StoryBuilder::new(5);
    b.add_object(0, 0, 0, "thing", &[]);
    b.set_attribute(1, 47);
    let m = Machine::new(b.build_image());
    assert!(m.test_attribute(1, 47).unwrap());
    assert!(!m.test_attribute(1, 46).unwrap());
}

#[test]
fn properties_read_with_default_fallback() {
    let mut b = StoryBuilder::new(3);
    b.property_default(7, 0x0BAD);
    b.add_object(0, 0, 0, "lamp", &[(10, &[0x12, 0x34]), (5, &[0xAB])]);
    let m = Machine::new(b.build_image());
    assert_eq!(m.get_property(1, 10).unwrap(), 0x1234);
    assert_eq!(m.get_property(1, 5).unwrap(), 0xAB);
    assert_eq!(m.get_property(1, 7).unwrap(), 0x0BAD);
}

#[test]
fn property_address_and_length() {
    let mut b = StoryBuilder::new(3);
    b.add_object(0, 0, 0, "lamp", &[(10, &[0x12, 0x34]), (5, &[0xAB])]);
    let m = Machine::new(b.build_image());
    let addr = m.property_address(1, 10).unwrap();
    assert_ne!(addr, 0);
    assert_eq!(m.property_length_at(addr).unwrap(), 2);
    let addr = m.property_address(1, 5).unwrap();
    assert_eq!(m.property_length_at(addr).unwrap(), 1);
    assert_eq!(m.property_address(1, 9).unwrap(), 0);
    assert_eq!(m.property_length_at(0).unwrap(), 0);
}

#[test]
fn two_byte_headers_carry_long_properties() {
    let mut b = StoryBuilder::new(5);
    let data = [1u8, 2, 3, 4, 5];
    b.add_object(0, 0, 0, "chest", &[(6, &data), (3, &[0x77, 0x88])]);
    let m = Machine::new(b.build_image());
    let addr = m.property_address(1, 6).unwrap();
    assert_eq!(m.property_length_at(addr).unwrap(), 5);
    assert_eq!(m.memory.read_byte(addr).unwrap(), 1);
    assert_eq!(m.get_property(1, 3).unwrap(), 0x7788);
}

#[test]
fn put_property_respects_field_width() {
    let mut b = StoryBuilder::new(3);
    b.add_object(0, 0, 0, "lamp", &[(10, &[0x12, 0x34]), (5, &[0xAB])]);
    let mut m = Machine::new(b.build_image());
    m.put_property(1, 10, 0xBEEF).unwrap();
    assert_eq!(m.get_property(1, 10).unwrap(), 0xBEEF);
    m.put_property(1, 5, 0x01FF).unwrap();
    // One-byte property keeps only the low byte
    assert_eq!(m.get_property(1, 5).unwrap(), 0xFF);
}

#[test]
fn next_property_walks_in_table_order() {
    let mut b = StoryBuilder::new(3);
    b.add_object(0, 0, 0, "lamp", &[(10, &[0x12, 0x34]), (5, &[0xAB])]);
    let m = Machine::new(b.build_image());
    assert_eq!(m.next_property(1, 0).unwrap(), 10);
    assert_eq!(m.next_property(1, 10).unwrap(), 5);
    assert_eq!(m.next_property(1, 5).unwrap(), 0);
}

#[test]
fn short_names_decode() {
    let mut b = StoryBuilder::new(3);
    b.add_object(0, 0, 0, "brass lantern", &[]);
    let m = Machine::new(b.build_image());
    assert_eq!(m.object_name(1).unwrap(), "brass lantern");
}

#[test]
fn object_zero_is_tolerated() {
    let mut m = five_objects(3);
    assert_eq!(m.obj_parent(0).unwrap(), 0);
    m.insert_object(0, 1).unwrap();
    m.remove_object(0).unwrap();
    assert_eq!(m.obj_child(1).unwrap(), 2);
}
