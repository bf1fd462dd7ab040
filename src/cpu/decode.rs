//! BookE and VLE instruction decoders.
//!
//! The decoders cover the supervisor-level subset the firmware boot and
//! test paths exercise: integer arithmetic and logic, loads/stores,
//! branches, condition register compares, SPR/MSR moves, the TLB
//! maintenance instructions, the return-from-interrupt family and the
//! debug notify halt used for breakpoints. Unknown encodings decode to an
//! error so the execution loop can raise a Program exception.
//!
//! VLE is a variable-length encoding: the top nibble of the first halfword
//! selects between 16-bit `se_` and 32-bit `e_` forms.

use byteorder::{BigEndian, ByteOrder};

/// Which save/restore pair a return-from-interrupt instruction restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfiKind {
    /// rfi: SRR0/SRR1
    Base,
    /// rfci: CSRR0/CSRR1
    Critical,
    /// rfdi: DSRR0/DSRR1
    Debug,
    /// rfmci: MCSRR0/MCSRR1
    MachineCheck,
}

/// Decoded instruction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    // integer immediate
    Addi { rt: u8, ra: u8, simm: i32 },
    Addis { rt: u8, ra: u8, simm: i32 },
    Ori { ra: u8, rs: u8, uimm: u32 },
    Oris { ra: u8, rs: u8, uimm: u32 },
    Xori { ra: u8, rs: u8, uimm: u32 },
    AndiRc { ra: u8, rs: u8, uimm: u32 },
    // integer register
    Add { rt: u8, ra: u8, rb: u8 },
    Subf { rt: u8, ra: u8, rb: u8 },
    Neg { rt: u8, ra: u8 },
    Mullw { rt: u8, ra: u8, rb: u8 },
    And { ra: u8, rs: u8, rb: u8 },
    Or { ra: u8, rs: u8, rb: u8 },
    Xor { ra: u8, rs: u8, rb: u8 },
    Slw { ra: u8, rs: u8, rb: u8 },
    Srw { ra: u8, rs: u8, rb: u8 },
    Rlwinm { ra: u8, rs: u8, sh: u8, mb: u8, me: u8 },
    // compares
    Cmpwi { bf: u8, ra: u8, simm: i32 },
    Cmplwi { bf: u8, ra: u8, uimm: u32 },
    Cmpw { bf: u8, ra: u8, rb: u8 },
    Cmplw { bf: u8, ra: u8, rb: u8 },
    // loads/stores (D-form)
    Lwz { rt: u8, ra: u8, d: i32 },
    Lbz { rt: u8, ra: u8, d: i32 },
    Lhz { rt: u8, ra: u8, d: i32 },
    Stw { rs: u8, ra: u8, d: i32 },
    Stb { rs: u8, ra: u8, d: i32 },
    Sth { rs: u8, ra: u8, d: i32 },
    // loads/stores (X-form)
    Lwzx { rt: u8, ra: u8, rb: u8 },
    Stwx { rs: u8, ra: u8, rb: u8 },
    // branches
    Branch { target: i32, absolute: bool, link: bool },
    BranchCond { bo: u8, bi: u8, target: i32, absolute: bool, link: bool },
    BranchCondLr { bo: u8, bi: u8, link: bool },
    BranchCondCtr { bo: u8, bi: u8, link: bool },
    // system
    Sc,
    Isync,
    Msync,
    Mfspr { rt: u8, spr: u16 },
    Mtspr { rs: u8, spr: u16 },
    Mfmsr { rt: u8 },
    Mtmsr { rs: u8 },
    Mfcr { rt: u8 },
    Rfi(RfiKind),
    Dnh,
    // TLB maintenance
    Tlbre,
    Tlbwe,
    Tlbsx { ra: u8, rb: u8 },
    Tlbivax { ra: u8, rb: u8 },
    Tlbsync,
    // VLE-only small forms
    SeLi { rx: u8, imm: u32 },
    SeMtlr { rx: u8 },
    SeMflr { rx: u8 },
}

/// A decoded instruction with its encoded size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub size: u8,
}

/// Decoder rejection. The execution loop turns this into a Program
/// exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub word: u32,
}

fn sext(val: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((val << shift) as i32) >> shift
}

fn rt(w: u32) -> u8 {
    ((w >> 21) & 0x1F) as u8
}

fn ra(w: u32) -> u8 {
    ((w >> 16) & 0x1F) as u8
}

fn rb(w: u32) -> u8 {
    ((w >> 11) & 0x1F) as u8
}

fn d16(w: u32) -> i32 {
    sext(w & 0xFFFF, 16)
}

fn spr_num(w: u32) -> u16 {
    (((w >> 16) & 0x1F) | (((w >> 11) & 0x1F) << 5)) as u16
}

/// Decode a 32-bit BookE instruction word.
pub fn decode_booke(w: u32) -> Result<Op, DecodeError> {
    let opcd = w >> 26;
    let kind = match opcd {
        10 => OpKind::Cmplwi { bf: (rt(w) >> 2), ra: ra(w), uimm: w & 0xFFFF },
        11 => OpKind::Cmpwi { bf: (rt(w) >> 2), ra: ra(w), simm: d16(w) },
        14 => OpKind::Addi { rt: rt(w), ra: ra(w), simm: d16(w) },
        15 => OpKind::Addis { rt: rt(w), ra: ra(w), simm: d16(w) },
        16 => OpKind::BranchCond {
            bo: rt(w),
            bi: ra(w),
            target: sext(w & 0xFFFC, 16),
            absolute: w & 2 != 0,
            link: w & 1 != 0,
        },
        17 => OpKind::Sc,
        18 => OpKind::Branch {
            target: sext(w & 0x03FF_FFFC, 26),
            absolute: w & 2 != 0,
            link: w & 1 != 0,
        },
        19 => {
            let xo = (w >> 1) & 0x3FF;
            match xo {
                16 => OpKind::BranchCondLr { bo: rt(w), bi: ra(w), link: w & 1 != 0 },
                528 => OpKind::BranchCondCtr { bo: rt(w), bi: ra(w), link: w & 1 != 0 },
                50 => OpKind::Rfi(RfiKind::Base),
                51 => OpKind::Rfi(RfiKind::Critical),
                39 => OpKind::Rfi(RfiKind::Debug),
                38 => OpKind::Rfi(RfiKind::MachineCheck),
                150 => OpKind::Isync,
                198 => OpKind::Dnh,
                _ => return Err(DecodeError { word: w }),
            }
        }
        21 => OpKind::Rlwinm {
            ra: ra(w),
            rs: rt(w),
            sh: rb(w),
            mb: ((w >> 6) & 0x1F) as u8,
            me: ((w >> 1) & 0x1F) as u8,
        },
        24 => OpKind::Ori { ra: ra(w), rs: rt(w), uimm: w & 0xFFFF },
        25 => OpKind::Oris { ra: ra(w), rs: rt(w), uimm: w & 0xFFFF },
        26 => OpKind::Xori { ra: ra(w), rs: rt(w), uimm: w & 0xFFFF },
        28 => OpKind::AndiRc { ra: ra(w), rs: rt(w), uimm: w & 0xFFFF },
        31 => {
            let xo = (w >> 1) & 0x3FF;
            match xo {
                0 => OpKind::Cmpw { bf: (rt(w) >> 2), ra: ra(w), rb: rb(w) },
                32 => OpKind::Cmplw { bf: (rt(w) >> 2), ra: ra(w), rb: rb(w) },
                19 => OpKind::Mfcr { rt: rt(w) },
                23 => OpKind::Lwzx { rt: rt(w), ra: ra(w), rb: rb(w) },
                24 => OpKind::Slw { ra: ra(w), rs: rt(w), rb: rb(w) },
                28 => OpKind::And { ra: ra(w), rs: rt(w), rb: rb(w) },
                40 => OpKind::Subf { rt: rt(w), ra: ra(w), rb: rb(w) },
                83 => OpKind::Mfmsr { rt: rt(w) },
                104 => OpKind::Neg { rt: rt(w), ra: ra(w) },
                146 => OpKind::Mtmsr { rs: rt(w) },
                151 => OpKind::Stwx { rs: rt(w), ra: ra(w), rb: rb(w) },
                235 => OpKind::Mullw { rt: rt(w), ra: ra(w), rb: rb(w) },
                266 => OpKind::Add { rt: rt(w), ra: ra(w), rb: rb(w) },
                316 => OpKind::Xor { ra: ra(w), rs: rt(w), rb: rb(w) },
                339 => OpKind::Mfspr { rt: rt(w), spr: spr_num(w) },
                371 => OpKind::Mfspr { rt: rt(w), spr: spr_num(w) },
                444 => OpKind::Or { ra: ra(w), rs: rt(w), rb: rb(w) },
                467 => OpKind::Mtspr { rs: rt(w), spr: spr_num(w) },
                536 => OpKind::Srw { ra: ra(w), rs: rt(w), rb: rb(w) },
                566 => OpKind::Tlbsync,
                598 => OpKind::Msync,
                786 => OpKind::Tlbivax { ra: ra(w), rb: rb(w) },
                914 => OpKind::Tlbsx { ra: ra(w), rb: rb(w) },
                946 => OpKind::Tlbre,
                978 => OpKind::Tlbwe,
                _ => return Err(DecodeError { word: w }),
            }
        }
        32 => OpKind::Lwz { rt: rt(w), ra: ra(w), d: d16(w) },
        34 => OpKind::Lbz { rt: rt(w), ra: ra(w), d: d16(w) },
        36 => OpKind::Stw { rs: rt(w), ra: ra(w), d: d16(w) },
        38 => OpKind::Stb { rs: rt(w), ra: ra(w), d: d16(w) },
        40 => OpKind::Lhz { rt: rt(w), ra: ra(w), d: d16(w) },
        44 => OpKind::Sth { rs: rt(w), ra: ra(w), d: d16(w) },
        _ => return Err(DecodeError { word: w }),
    };
    Ok(Op { kind, size: 4 })
}

/// Whether the leading halfword of a VLE instruction selects a 32-bit
/// `e_` form.
fn vle_is_32bit(hw: u16) -> bool {
    let nib = hw >> 12;
    nib & 1 == 1 && nib < 8
}

/// Decode a VLE instruction from up to 4 bytes.
pub fn decode_vle(bytes: &[u8]) -> Result<Op, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError { word: 0 });
    }
    let hw = BigEndian::read_u16(bytes) as u32;

    if vle_is_32bit(hw as u16) {
        if bytes.len() < 4 {
            return Err(DecodeError { word: hw });
        }
        let w = BigEndian::read_u32(bytes);
        let opcd = w >> 26;
        let kind = match opcd {
            // e_b / e_bl (BD24)
            30 => OpKind::Branch {
                target: sext(w & 0x01FF_FFFE, 25),
                absolute: false,
                link: w & 1 != 0,
            },
            // e_dnh shares the BookE primary 31 encoding space
            31 => {
                let xo = (w >> 1) & 0x3FF;
                match xo {
                    97 => OpKind::Dnh,
                    _ => return Err(DecodeError { word: w }),
                }
            }
            _ => return Err(DecodeError { word: w }),
        };
        return Ok(Op { kind, size: 4 });
    }

    let kind = match hw {
        0x0000 => return Err(DecodeError { word: hw }), // se_illegal
        0x0001 => OpKind::Isync,                        // se_isync
        0x0004 => OpKind::BranchCondLr { bo: 20, bi: 0, link: false }, // se_blr
        0x0005 => OpKind::BranchCondLr { bo: 20, bi: 0, link: true },  // se_blrl
        0x0006 => OpKind::BranchCondCtr { bo: 20, bi: 0, link: false }, // se_bctr
        0x0007 => OpKind::BranchCondCtr { bo: 20, bi: 0, link: true }, // se_bctrl
        0x0008 => OpKind::Rfi(RfiKind::Base),           // se_rfi
        0x0009 => OpKind::Rfi(RfiKind::Critical),       // se_rfci
        0x000A => OpKind::Rfi(RfiKind::Debug),          // se_rfdi
        0x000B => OpKind::Rfi(RfiKind::MachineCheck),   // se_rfmci
        0x000F => OpKind::Dnh,                          // 2-byte debug trap
        _ => match hw >> 11 {
            // se_li rx, ui7
            0b01001 => OpKind::SeLi {
                rx: (hw & 0xF) as u8,
                imm: (hw >> 4) & 0x7F,
            },
            _ => match hw >> 8 {
                // se_mtlr / se_mflr
                0x00 if hw & 0xF0 == 0x90 => OpKind::SeMtlr { rx: (hw & 0xF) as u8 },
                0x00 if hw & 0xF0 == 0x80 => OpKind::SeMflr { rx: (hw & 0xF) as u8 },
                // se_b / se_bl (BD8)
                0xE8 => OpKind::Branch {
                    target: sext(hw & 0xFF, 8) << 1,
                    absolute: false,
                    link: false,
                },
                0xE9 => OpKind::Branch {
                    target: sext(hw & 0xFF, 8) << 1,
                    absolute: false,
                    link: true,
                },
                _ => return Err(DecodeError { word: hw }),
            },
        },
    };
    Ok(Op { kind, size: 2 })
}

/// Decode from raw bytes in the given mode.
pub fn decode(bytes: &[u8], vle: bool) -> Result<Op, DecodeError> {
    if vle {
        decode_vle(bytes)
    } else {
        if bytes.len() < 4 {
            return Err(DecodeError { word: 0 });
        }
        decode_booke(BigEndian::read_u32(bytes))
    }
}

/// Trap instruction bytes substituted for breakpoints: 4-byte `dnh` for
/// BookE, 2-byte or 4-byte debug trap for VLE.
pub fn trap_bytes(vle: bool, size: usize) -> &'static [u8] {
    match (vle, size) {
        (false, _) => &[0x4C, 0x00, 0x01, 0x8C],
        (true, 2) => &[0x00, 0x0F],
        (true, _) => &[0x7C, 0x00, 0x00, 0xC2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booke(w: u32) -> OpKind {
        decode_booke(w).unwrap().kind
    }

    #[test]
    fn test_decode_addi_family() {
        // addi r3, r0, 0x100
        assert_eq!(booke(0x3860_0100), OpKind::Addi { rt: 3, ra: 0, simm: 0x100 });
        // addis r9, r9, -1
        assert_eq!(booke(0x3D29_FFFF), OpKind::Addis { rt: 9, ra: 9, simm: -1 });
        // ori r4, r3, 0xBEEF
        assert_eq!(booke(0x6064_BEEF), OpKind::Ori { ra: 4, rs: 3, uimm: 0xBEEF });
    }

    #[test]
    fn test_decode_loads_stores() {
        // lwz r5, 8(r1)
        assert_eq!(booke(0x80A1_0008), OpKind::Lwz { rt: 5, ra: 1, d: 8 });
        // stw r5, -4(r1)
        assert_eq!(booke(0x90A1_FFFC), OpKind::Stw { rs: 5, ra: 1, d: -4 });
        // lbz r7, 0(r2)
        assert_eq!(booke(0x88E2_0000), OpKind::Lbz { rt: 7, ra: 2, d: 0 });
        // sth r3, 2(r4)
        assert_eq!(booke(0xB064_0002), OpKind::Sth { rs: 3, ra: 4, d: 2 });
    }

    #[test]
    fn test_decode_branches() {
        // b .+8
        assert_eq!(
            booke(0x4800_0008),
            OpKind::Branch { target: 8, absolute: false, link: false }
        );
        // bl .-4
        assert_eq!(
            booke(0x4BFF_FFFD),
            OpKind::Branch { target: -4, absolute: false, link: true }
        );
        // blr
        assert_eq!(booke(0x4E80_0020), OpKind::BranchCondLr { bo: 20, bi: 0, link: false });
        // bdnz .-8 (bc 16,0,-8)
        assert_eq!(
            booke(0x4200_FFF8),
            OpKind::BranchCond { bo: 16, bi: 0, target: -8, absolute: false, link: false }
        );
    }

    #[test]
    fn test_decode_sprs() {
        // mfspr r3, 26 (SRR0): spr field split low||high
        assert_eq!(booke(0x7C7A_02A6), OpKind::Mfspr { rt: 3, spr: 26 });
        // mtspr 26, r3
        assert_eq!(booke(0x7C7A_03A6), OpKind::Mtspr { rs: 3, spr: 26 });
        // mtspr IVPR (63), r5
        assert_eq!(booke(0x7CBF_0BA6), OpKind::Mtspr { rs: 5, spr: 63 });
        // mfmsr r4
        assert_eq!(booke(0x7C80_00A6), OpKind::Mfmsr { rt: 4 });
    }

    #[test]
    fn test_decode_tlb_ops() {
        assert_eq!(booke(0x7C00_0764), OpKind::Tlbre);
        assert_eq!(booke(0x7C00_07A4), OpKind::Tlbwe);
        assert_eq!(booke(0x7C00_046C), OpKind::Tlbsync);
        // tlbsx 0, r4: xo=914
        assert_eq!(booke(0x7C00_2724), OpKind::Tlbsx { ra: 0, rb: 4 });
        // tlbivax 0, r5: xo=786
        assert_eq!(booke(0x7C00_2E24), OpKind::Tlbivax { ra: 0, rb: 5 });
    }

    #[test]
    fn test_decode_rfi_family() {
        assert_eq!(booke(0x4C00_0064), OpKind::Rfi(RfiKind::Base));
        assert_eq!(booke(0x4C00_0066), OpKind::Rfi(RfiKind::Critical));
        assert_eq!(booke(0x4C00_004E), OpKind::Rfi(RfiKind::Debug));
        assert_eq!(booke(0x4C00_004C), OpKind::Rfi(RfiKind::MachineCheck));
    }

    #[test]
    fn test_decode_dnh_trap() {
        assert_eq!(booke(0x4C00_018C), OpKind::Dnh);
        assert_eq!(decode(&[0x4C, 0x00, 0x01, 0x8C], false).unwrap().kind, OpKind::Dnh);
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode_booke(0xFFFF_FFFF).is_err());
        assert!(decode_booke(0x0000_0000).is_err());
    }

    #[test]
    fn test_vle_16bit_forms() {
        assert!(decode_vle(&[0x00, 0x00]).is_err()); // se_illegal
        assert_eq!(decode_vle(&[0x00, 0x01]).unwrap().kind, OpKind::Isync);
        assert_eq!(
            decode_vle(&[0x00, 0x04]).unwrap(),
            Op { kind: OpKind::BranchCondLr { bo: 20, bi: 0, link: false }, size: 2 }
        );
        assert_eq!(decode_vle(&[0x00, 0x08]).unwrap().kind, OpKind::Rfi(RfiKind::Base));
        assert_eq!(decode_vle(&[0x00, 0x0F]).unwrap().kind, OpKind::Dnh);
    }

    #[test]
    fn test_vle_se_li() {
        // se_li r7, 0x2A = 0x48|imm<<4|rx
        let op = decode_vle(&[0x4A, 0xA7]).unwrap();
        assert_eq!(op, Op { kind: OpKind::SeLi { rx: 7, imm: 0x2A }, size: 2 });
    }

    #[test]
    fn test_vle_se_b() {
        // se_b .-2
        let op = decode_vle(&[0xE8, 0xFF]).unwrap();
        assert_eq!(op, Op { kind: OpKind::Branch { target: -2, absolute: false, link: false }, size: 2 });
    }

    #[test]
    fn test_vle_e_b() {
        // e_b .+0x10
        let op = decode_vle(&[0x78, 0x00, 0x00, 0x10]).unwrap();
        assert_eq!(op, Op { kind: OpKind::Branch { target: 0x10, absolute: false, link: false }, size: 4 });
        assert_eq!(op.size, 4);
    }

    #[test]
    fn test_vle_e_dnh() {
        let op = decode_vle(&[0x7C, 0x00, 0x00, 0xC2]).unwrap();
        assert_eq!(op.kind, OpKind::Dnh);
        assert_eq!(op.size, 4);
    }

    #[test]
    fn test_trap_bytes() {
        assert_eq!(trap_bytes(false, 4), &[0x4C, 0x00, 0x01, 0x8C]);
        assert_eq!(trap_bytes(true, 2), &[0x00, 0x0F]);
        assert_eq!(trap_bytes(true, 4), &[0x7C, 0x00, 0x00, 0xC2]);
    }
}
