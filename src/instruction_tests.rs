//! Instruction form and operand decoding.

use crate::instruction::{Instruction, InstructionForm, OperandCount, OperandType};
use crate::test_utils::StoryBuilder;
use test_log::test;

const CODE: u32 = 0x800;

#[test]
fn long_form_two_small_constants() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0x14, 0x05, 0x06, 0x10]); // add 5 6 -> g16
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.form, InstructionForm::Long);
    assert_eq!(inst.operand_count, OperandCount::OP2);
    assert_eq!(inst.opcode, 0x14);
    assert_eq!(inst.operands, vec![5, 6]);
    assert_eq!(
        inst.operand_types,
        vec![OperandType::SmallConstant, OperandType::SmallConstant]
    );
    assert_eq!(inst.store_var, Some(0x10));
    assert_eq!(inst.branch, None);
    assert_eq!(inst.size, 4);
    assert_eq!(inst.canonical(), 0xD4);
}

#[test]
fn long_form_variable_operand_bits() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0x54, 0x10, 0x06, 0x00]); // add g16 6 -> stack
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(
        inst.operand_types,
        vec![OperandType::Variable, OperandType::SmallConstant]
    );
}

#[test]
fn short_form_large_constant() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0x8C, 0x01, 0x00]); // jump 0x100
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.form, InstructionForm::Short);
    assert_eq!(inst.operand_count, OperandCount::OP1);
    assert_eq!(inst.opcode, 0x0C);
    assert_eq!(inst.operands, vec![0x100]);
    assert_eq!(inst.size, 3);
}

#[test]
fn zero_operand_form() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0xB0]); // rtrue
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.operand_count, OperandCount::OP0);
    assert_eq!(inst.opcode, 0x00);
    assert_eq!(inst.size, 1);
    assert_eq!(inst.canonical(), 0xB0);
}

#[test]
fn variable_form_stops_at_omitted_types() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0xE0, 0x1F, 0x04, 0x00, 0x2A, 0x10]); // call 0x400 42 -> g16
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.form, InstructionForm::Variable);
    assert_eq!(inst.operand_count, OperandCount::VAR);
    assert_eq!(inst.operands, vec![0x400, 42]);
    assert_eq!(inst.store_var, Some(0x10));
    assert_eq!(inst.size, 6);
}

#[test]
fn double_type_bytes_for_call_vs2() {
    let mut b = StoryBuilder::new(4);
    // call_vs2 with six small-constant operands
    b.code(&[0xEC, 0x55, 0x5F, 1, 2, 3, 4, 5, 6, 0x10]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.opcode, 0x0C);
    assert_eq!(inst.operands, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(inst.store_var, Some(0x10));
    assert_eq!(inst.size, 10);
}

#[test]
fn store_and_branch_post_bytes_together() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0x91, 0x05, 0x10, 0xC5]); // get_sibling 5 -> g16 ?+5
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.store_var, Some(0x10));
    let branch = inst.branch.unwrap();
    assert!(branch.on_true);
    assert_eq!(branch.offset, 5);
    assert_eq!(branch.bytes, 1);
    assert_eq!(inst.size, 4);
}

#[test]
fn fourteen_bit_branch_offsets_sign_extend() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0x90, 0x00, 0xBF, 0xF8]); // jz 0 ?-8
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    let branch = inst.branch.unwrap();
    assert!(branch.on_true);
    assert_eq!(branch.offset, -8);
    assert_eq!(branch.bytes, 2);
}

#[test]
fn inline_text_is_captured_for_print() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0xB2]);
    b.code_zstring("hi");
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.text.as_deref(), Some("hi"));
    assert_eq!(inst.size, 3);
}

#[test]
fn extended_escape_decodes_from_v5() {
    let mut b = StoryBuilder::new(5);
    b.code(&[0xBE, 0x09, 0xFF, 0x10]); // save_undo -> g16
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.form, InstructionForm::Extended);
    assert_eq!(inst.ext_opcode, Some(0x09));
    assert_eq!(inst.store_var, Some(0x10));
    assert_eq!(inst.size, 4);
}

#[test]
fn extended_escape_is_plain_0op_before_v5() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0xBE]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.form, InstructionForm::Short);
    assert_eq!(inst.operand_count, OperandCount::OP0);
    assert_eq!(inst.ext_opcode, None);
    assert_eq!(inst.size, 1);
}

#[test]
fn save_is_a_branch_in_v3_and_a_store_in_v4() {
    let mut b = StoryBuilder::new(3);
    b.code(&[0xB5, 0xC5]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert!(inst.branch.is_some());
    assert_eq!(inst.store_var, None);

    let mut b = StoryBuilder::new(4);
    b.code(&[0xB5, 0x10]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert!(inst.branch.is_none());
    assert_eq!(inst.store_var, Some(0x10));
}

#[test]
fn aread_stores_only_from_v5() {
    let mut b = StoryBuilder::new(5);
    b.code(&[0xE4, 0x0F, 0x05, 0x40, 0x05, 0x60, 0x10]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.store_var, Some(0x10));

    let mut b = StoryBuilder::new(3);
    b.code(&[0xE4, 0x0F, 0x05, 0x40, 0x05, 0x60]);
    let mem = b.build_image();
    let inst = Instruction::decode(&mem, CODE).unwrap();
    assert_eq!(inst.store_var, None);
}
