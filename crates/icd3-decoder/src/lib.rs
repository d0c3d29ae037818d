//! Instruction decoder for the trap engine (`spec.md` §4.C).
//!
//! `decode` is a pure function over a byte slice: it never allocates and
//! never consults process or thread state, which is what lets the trap
//! engine call it directly from inside a signal handler. It recognizes only
//! the narrow set of memory-access forms real MMIO drivers emit — loads,
//! register/immediate stores, the widening load forms, and `rep stos` — and
//! reports everything else as [`Category::Unknown`] rather than guessing.
//!
//! The heavy lifting (prefixes, ModR/M, SIB, displacement, immediates) is
//! delegated to `iced-x86`; this module only classifies the decoded
//! instruction and maps its register operands onto the saved-context slots
//! the trap engine writes back into.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Register};

/// Architectural upper bound on an x86-64 instruction's length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// What kind of memory access a decoded instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// `[mem] -> register`.
    Load,
    /// `register -> [mem]`.
    StoreReg,
    /// `imm -> [mem]`.
    StoreImm,
    /// `rep stos{b,w,d,q}`.
    RepStos,
    /// Decoded cleanly but outside the supported opcode set.
    Unknown,
}

/// Zero/sign extension applied to a narrow load before writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    None,
    Zero,
    Sign,
}

/// Index into the trapping thread's saved general-purpose register file.
///
/// Ordering matches glibc's x86-64 `mcontext_t.gregs[REG_*]` layout, which
/// is what `icd3-trap`'s context bridge reads and writes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RegSlot {
    R8 = 0,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    RDI,
    RSI,
    RBP,
    RBX,
    RDX,
    RAX,
    RCX,
    RSP,
    RIP,
}

impl RegSlot {
    pub fn index(self) -> usize {
        self as i32 as usize
    }
}

/// Everything the trap engine needs to act on one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    /// Total instruction length in bytes, for advancing the saved program counter.
    pub length: usize,
    pub category: Category,
    /// Operand width in bytes: 1, 2, 4, or 8.
    pub operand_size: u8,
    /// Destination register (loads) or source register (stores).
    pub reg_index: Option<RegSlot>,
    /// Extension applied to a load's value before writeback.
    pub extend: Extend,
    /// Literal value for `STORE_IMM`; unused otherwise.
    pub imm: u64,
    /// Implicit `rep stos` operands.
    pub rep_count_reg: Option<RegSlot>,
    pub dest_addr_reg: Option<RegSlot>,
    pub value_reg: Option<RegSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("instruction truncated or invalid within the supplied window")]
    InvalidInstruction,
}

/// Decodes the single instruction at the start of `bytes`.
///
/// `bytes` should hold up to [`MAX_INSTRUCTION_LEN`] bytes fetched starting
/// at the faulting program counter. Returns [`DecodeError::InvalidInstruction`]
/// only when the byte stream cannot form any valid x86-64 instruction at
/// all; an instruction that decodes fine but isn't in the supported opcode
/// set is reported as `Ok` with [`Category::Unknown`] — the caller decides
/// what to do with that, the decoder never guesses.
pub fn decode(bytes: &[u8]) -> Result<DecodedInsn, DecodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::InvalidInstruction);
    }
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(DecodeError::InvalidInstruction);
    }
    Ok(classify(&insn))
}

fn unknown(insn: &Instruction) -> DecodedInsn {
    DecodedInsn {
        length: insn.len(),
        category: Category::Unknown,
        operand_size: 0,
        reg_index: None,
        extend: Extend::None,
        imm: 0,
        rep_count_reg: None,
        dest_addr_reg: None,
        value_reg: None,
    }
}

fn classify(insn: &Instruction) -> DecodedInsn {
    let length = insn.len();

    macro_rules! load {
        ($size:expr, $extend:expr) => {{
            if insn.op1_kind() != iced_x86::OpKind::Memory {
                return unknown(insn);
            }
            let Some(reg_index) = gpr_slot(insn.op0_register()) else {
                return unknown(insn);
            };
            DecodedInsn {
                length,
                category: Category::Load,
                operand_size: $size,
                reg_index: Some(reg_index),
                extend: $extend,
                imm: 0,
                rep_count_reg: None,
                dest_addr_reg: None,
                value_reg: None,
            }
        }};
    }

    macro_rules! store_reg {
        ($size:expr) => {{
            if insn.op0_kind() != iced_x86::OpKind::Memory {
                return unknown(insn);
            }
            let Some(reg_index) = gpr_slot(insn.op1_register()) else {
                return unknown(insn);
            };
            DecodedInsn {
                length,
                category: Category::StoreReg,
                operand_size: $size,
                reg_index: Some(reg_index),
                extend: Extend::None,
                imm: 0,
                rep_count_reg: None,
                dest_addr_reg: None,
                value_reg: None,
            }
        }};
    }

    macro_rules! store_imm {
        ($size:expr) => {{
            if insn.op0_kind() != iced_x86::OpKind::Memory {
                return unknown(insn);
            }
            DecodedInsn {
                length,
                category: Category::StoreImm,
                operand_size: $size,
                reg_index: None,
                extend: Extend::None,
                imm: insn.immediate(1),
                rep_count_reg: None,
                dest_addr_reg: None,
                value_reg: None,
            }
        }};
    }

    macro_rules! rep_stos {
        ($size:expr) => {{
            if !insn.has_rep_prefix() {
                return unknown(insn);
            }
            DecodedInsn {
                length,
                category: Category::RepStos,
                operand_size: $size,
                reg_index: None,
                extend: Extend::None,
                imm: 0,
                rep_count_reg: Some(RegSlot::RCX),
                dest_addr_reg: Some(RegSlot::RDI),
                value_reg: gpr_slot(insn.op1_register()),
            }
        }};
    }

    match insn.code() {
        Code::Mov_r8_rm8 => load!(1, Extend::None),
        Code::Mov_r16_rm16 => load!(2, Extend::None),
        Code::Mov_r32_rm32 => load!(4, Extend::None),
        Code::Mov_r64_rm64 => load!(8, Extend::None),

        Code::Mov_rm8_r8 => store_reg!(1),
        Code::Mov_rm16_r16 => store_reg!(2),
        Code::Mov_rm32_r32 => store_reg!(4),
        Code::Mov_rm64_r64 => store_reg!(8),

        Code::Mov_rm8_imm8 => store_imm!(1),
        Code::Mov_rm16_imm16 => store_imm!(2),
        Code::Mov_rm32_imm32 => store_imm!(4),
        // `C7 /0` with REX.W (64-bit immediate store) is not in the
        // supported opcode table (`spec.md` §4.C lists only imm16/imm32
        // sizes for this form) and is intentionally left as `Unknown`.
        Code::Movzx_r16_rm8 => load!(1, Extend::Zero),
        Code::Movzx_r32_rm8 => load!(1, Extend::Zero),
        Code::Movzx_r64_rm8 => load!(1, Extend::Zero),
        Code::Movzx_r32_rm16 => load!(2, Extend::Zero),
        Code::Movzx_r64_rm16 => load!(2, Extend::Zero),

        Code::Movsx_r16_rm8 => load!(1, Extend::Sign),
        Code::Movsx_r32_rm8 => load!(1, Extend::Sign),
        Code::Movsx_r64_rm8 => load!(1, Extend::Sign),
        Code::Movsx_r32_rm16 => load!(2, Extend::Sign),
        Code::Movsx_r64_rm16 => load!(2, Extend::Sign),

        // Bare (non-`rep`) `stos` shares these `Code` values with the
        // `rep`-prefixed form; `rep_stos!` rejects it via `has_rep_prefix`,
        // since `spec.md`'s table only lists the `F3`-prefixed forms.
        Code::Stosb_m8_AL => rep_stos!(1),
        Code::Stosw_m16_AX => rep_stos!(2),
        Code::Stosd_m32_EAX => rep_stos!(4),
        Code::Stosq_m64_RAX => rep_stos!(8),

        _ => unknown(insn),
    }
}

/// Maps an `iced_x86` general-purpose register operand (of any width) onto
/// the saved-context slot that holds its 64-bit parent register.
fn gpr_slot(reg: Register) -> Option<RegSlot> {
    match reg {
        Register::AL | Register::AX | Register::EAX | Register::RAX => Some(RegSlot::RAX),
        Register::CL | Register::CX | Register::ECX | Register::RCX => Some(RegSlot::RCX),
        Register::DL | Register::DX | Register::EDX | Register::RDX => Some(RegSlot::RDX),
        Register::BL | Register::BX | Register::EBX | Register::RBX => Some(RegSlot::RBX),
        Register::SPL | Register::SP | Register::ESP | Register::RSP => Some(RegSlot::RSP),
        Register::BPL | Register::BP | Register::EBP | Register::RBP => Some(RegSlot::RBP),
        Register::SIL | Register::SI | Register::ESI | Register::RSI => Some(RegSlot::RSI),
        Register::DIL | Register::DI | Register::EDI | Register::RDI => Some(RegSlot::RDI),
        Register::R8L | Register::R8W | Register::R8D | Register::R8 => Some(RegSlot::R8),
        Register::R9L | Register::R9W | Register::R9D | Register::R9 => Some(RegSlot::R9),
        Register::R10L | Register::R10W | Register::R10D | Register::R10 => Some(RegSlot::R10),
        Register::R11L | Register::R11W | Register::R11D | Register::R11 => Some(RegSlot::R11),
        Register::R12L | Register::R12W | Register::R12D | Register::R12 => Some(RegSlot::R12),
        Register::R13L | Register::R13W | Register::R13D | Register::R13 => Some(RegSlot::R13),
        Register::R14L | Register::R14W | Register::R14D | Register::R14 => Some(RegSlot::R14),
        Register::R15L | Register::R15W | Register::R15D | Register::R15 => Some(RegSlot::R15),
        // AH/BH/CH/DH and non-GPR registers are not part of the supported
        // opcode set; no MMIO driver targets them through these forms.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_8bit_load() {
        // 8A 00 => mov al, byte ptr [rax]
        let d = decode(&[0x8A, 0x00]).unwrap();
        assert_eq!(d.length, 2);
        assert_eq!(d.category, Category::Load);
        assert_eq!(d.operand_size, 1);
        assert_eq!(d.reg_index, Some(RegSlot::RAX));
    }

    #[test]
    fn decodes_32bit_load_destination_register() {
        // 8B 18 => mov ebx, dword ptr [rax]
        let d = decode(&[0x8B, 0x18]).unwrap();
        assert_eq!(d.category, Category::Load);
        assert_eq!(d.operand_size, 4);
        assert_eq!(d.reg_index, Some(RegSlot::RBX));
    }

    #[test]
    fn decodes_64bit_load_with_rex_w() {
        // 48 8B 00 => mov rax, qword ptr [rax]
        let d = decode(&[0x48, 0x8B, 0x00]).unwrap();
        assert_eq!(d.length, 3);
        assert_eq!(d.operand_size, 8);
    }

    #[test]
    fn decodes_16bit_load_with_operand_size_prefix() {
        // 66 8B 00 => mov ax, word ptr [rax]
        let d = decode(&[0x66, 0x8B, 0x00]).unwrap();
        assert_eq!(d.operand_size, 2);
    }

    #[test]
    fn decodes_store_reg_honoring_modrm_reg_field() {
        // 89 18 => mov dword ptr [rax], ebx  (source = ebx, not the accumulator)
        let d = decode(&[0x89, 0x18]).unwrap();
        assert_eq!(d.category, Category::StoreReg);
        assert_eq!(d.operand_size, 4);
        assert_eq!(d.reg_index, Some(RegSlot::RBX));
    }

    #[test]
    fn decodes_store_imm8() {
        // C6 00 2A => mov byte ptr [rax], 0x2A
        let d = decode(&[0xC6, 0x00, 0x2A]).unwrap();
        assert_eq!(d.category, Category::StoreImm);
        assert_eq!(d.operand_size, 1);
        assert_eq!(d.imm, 0x2A);
    }

    #[test]
    fn decodes_store_imm32() {
        // C7 00 78 56 34 12 => mov dword ptr [rax], 0x12345678
        let d = decode(&[0xC7, 0x00, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(d.category, Category::StoreImm);
        assert_eq!(d.operand_size, 4);
        assert_eq!(d.imm, 0x1234_5678);
    }

    #[test]
    fn decodes_movzx_byte_to_32bit_with_zero_extend() {
        // 0F B6 00 => movzx eax, byte ptr [rax]
        let d = decode(&[0x0F, 0xB6, 0x00]).unwrap();
        assert_eq!(d.category, Category::Load);
        assert_eq!(d.operand_size, 1);
        assert_eq!(d.extend, Extend::Zero);
    }

    #[test]
    fn decodes_movsx_word_to_32bit_with_sign_extend() {
        // 0F BF 00 => movsx eax, word ptr [rax]
        let d = decode(&[0x0F, 0xBF, 0x00]).unwrap();
        assert_eq!(d.category, Category::Load);
        assert_eq!(d.operand_size, 2);
        assert_eq!(d.extend, Extend::Sign);
    }

    #[test]
    fn decodes_rep_stosb() {
        let d = decode(&[0xF3, 0xAA]).unwrap();
        assert_eq!(d.length, 2);
        assert_eq!(d.category, Category::RepStos);
        assert_eq!(d.operand_size, 1);
        assert_eq!(d.rep_count_reg, Some(RegSlot::RCX));
        assert_eq!(d.dest_addr_reg, Some(RegSlot::RDI));
        assert_eq!(d.value_reg, Some(RegSlot::RAX));
    }

    #[test]
    fn decodes_rep_stosd() {
        let d = decode(&[0xF3, 0xAB]).unwrap();
        assert_eq!(d.category, Category::RepStos);
        assert_eq!(d.operand_size, 4);
    }

    #[test]
    fn decodes_rep_stosq_with_rex_w() {
        let d = decode(&[0xF3, 0x48, 0xAB]).unwrap();
        assert_eq!(d.category, Category::RepStos);
        assert_eq!(d.operand_size, 8);
    }

    #[test]
    fn bare_stosb_without_rep_is_unknown() {
        let d = decode(&[0xAA]).unwrap();
        assert_eq!(d.category, Category::Unknown);
    }

    #[test]
    fn register_to_register_mov_is_unknown_not_a_load() {
        // 8B C0 => mov eax, eax (no memory operand at all)
        let d = decode(&[0x8B, 0xC0]).unwrap();
        assert_eq!(d.category, Category::Unknown);
    }

    #[test]
    fn unsupported_opcode_is_unknown_not_an_error() {
        // 90 => nop
        let d = decode(&[0x90]).unwrap();
        assert_eq!(d.category, Category::Unknown);
    }

    #[test]
    fn all_prefix_bytes_with_no_opcode_is_invalid() {
        let bytes = [0x66u8; MAX_INSTRUCTION_LEN];
        assert_eq!(decode(&bytes).unwrap_err(), DecodeError::InvalidInstruction);
    }

    #[test]
    fn empty_buffer_is_invalid() {
        assert_eq!(decode(&[]).unwrap_err(), DecodeError::InvalidInstruction);
    }
}
