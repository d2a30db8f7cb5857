//! Bytecode encoding for the stack machine: opcodes, the decoded
//! instruction form, a builder with back-patchable labels, and a decoder.
//!
//! This crate is pure data plumbing — it knows nothing about functions,
//! frames, or execution. The compiler in the `vm` crate drives the
//! builder; the interpreter and the optimizing pipeline drive the decoder.

mod builder;
mod decoder;
mod instruction;
mod op;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{decode_at, BytecodeDecoder};
pub use instruction::{local_name, Instruction};
pub use op::{Op, OperandKind, UNBOUND_TARGET};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).map(|(_, i)| i).collect()
    }

    #[test]
    fn round_trip() {
        let mut b = BytecodeBuilder::new();
        b.load_number(42.5);
        b.load_local(5);
        b.load_local(-1);
        b.dup();
        b.store_local(2);
        b.add();
        b.test_less_than();
        b.call(3, 2);
        b.drop_top();
        b.return_();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadNumber { value: 42.5 },
            Instruction::LoadLocal { slot: 5 },
            Instruction::LoadLocal { slot: -1 },
            Instruction::Dup,
            Instruction::StoreLocal { slot: 2 },
            Instruction::Add,
            Instruction::TestLessThan,
            Instruction::Call { constant: 3, argc: 2 },
            Instruction::Drop,
            Instruction::Return,
        ]);
    }

    #[test]
    fn forward_jump_is_patched() {
        let mut b = BytecodeBuilder::new();
        let mut label = Label::new();
        b.load_number(0.0);
        b.jump_if_false(&mut label);
        b.load_number(1.0);
        b.bind(&mut label);
        b.return_();

        let end = b.current_offset() - 1;
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadNumber { value: 0.0 },
            Instruction::JumpIfFalse { target: end },
            Instruction::LoadNumber { value: 1.0 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn one_label_multiple_uses() {
        let mut b = BytecodeBuilder::new();
        let mut end = Label::new();
        b.jump_if_true(&mut end);
        b.jump(&mut end);
        b.bind(&mut end);
        b.return_();

        let target = end.target().unwrap();
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::JumpIfTrue { target },
            Instruction::Jump { target },
            Instruction::Return,
        ]);
        // Binding is total: no sentinel operand survives.
        for (_, instruction) in BytecodeDecoder::new(b.as_bytes()) {
            if let Instruction::JumpIfTrue { target }
            | Instruction::Jump { target } = instruction
            {
                assert_ne!(target, UNBOUND_TARGET);
            }
        }
    }

    #[test]
    fn backward_loop_jump_resolves_immediately() {
        let mut b = BytecodeBuilder::new();
        let mut header = Label::new();
        b.bind(&mut header);
        b.loop_header();
        b.load_local(2);
        b.jump_loop(&mut header);

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoopHeader,
            Instruction::LoadLocal { slot: 2 },
            Instruction::JumpLoop { target: 0 },
        ]);
    }

    #[test]
    fn operand_table_matches_encoding() {
        // Every opcode's declared operand shape must agree with the byte
        // count the decoder consumes.
        let mut b = BytecodeBuilder::new();
        b.load_number(1.0);
        assert_eq!(b.as_bytes().len(), Op::LoadNumber.encoded_size());
        assert_eq!(Op::LoadNumber.operands(), &[OperandKind::NumberConstant]);
        assert_eq!(Op::Call.operands(), &[
            OperandKind::Constant,
            OperandKind::Count
        ]);
        assert_eq!(Op::Jump.encoded_size(), 5);
        assert_eq!(Op::Return.encoded_size(), 1);
    }

    #[test]
    fn display_instructions() {
        assert_eq!(
            Instruction::LoadLocal { slot: 2 }.to_string(),
            "LoadLocal r2"
        );
        assert_eq!(
            Instruction::StoreLocal { slot: -1 }.to_string(),
            "StoreLocal a0"
        );
        assert_eq!(Instruction::Jump { target: 7 }.to_string(), "Jump @7");
        assert_eq!(
            Instruction::Call { constant: 1, argc: 2 }.to_string(),
            "Call [1] 2"
        );
    }

    #[test]
    fn decoder_rejects_bad_opcode() {
        assert!(decode_at(&[0xFF], 0).is_none());
    }

    #[test]
    fn decoder_rejects_truncated_stream() {
        let mut b = BytecodeBuilder::new();
        b.load_number(1.0);
        let bytes = &b.as_bytes()[..4];
        assert!(decode_at(bytes, 0).is_none());
    }
}
