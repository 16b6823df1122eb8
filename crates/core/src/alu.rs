//! Arithmetic-logic unit.
//!
//! Every operation is a function of its operands, the operand width and, for the carry-chain
//! operations, the incoming carry flag. Results are returned; flags are written to the borrowed
//! [`Flags`]. Values travel as `u32` holding the low `width` bits; the typed `add8`/`shl16`/...
//! wrappers exist for callers that think in concrete widths.

use crate::error::Fault;
use crate::flags::Flags;
use crate::state::Width;

/// Parity of a nibble, bit `n` set when `n` has an even number of ones
const FOUR_BIT_PARITY_TABLE: u32 = 0b1001_0110_0110_1001;

/// Shift and rotate counts only use their low 5 bits
/// Shift and rotate counts are taken modulo 32 from the 80186 on
pub const SHIFT_COUNT_MASK: u32 = 0x1F;

/// Even parity of the low byte of `value`
#[inline]
pub fn parity(value: u32) -> bool {
    let low = (FOUR_BIT_PARITY_TABLE >> (value & 0x0F)) & 1;
    let high = (FOUR_BIT_PARITY_TABLE >> ((value >> 4) & 0x0F)) & 1;
    low == high
}

#[inline]
fn carry_bits_add(v1: u32, v2: u32, res: u32) -> u32 {
    v1 ^ v2 ^ res ^ ((v1 ^ res) & !(v1 ^ v2))
}

#[inline]
fn borrow_bits_sub(v1: u32, v2: u32, res: u32) -> u32 {
    v1 ^ v2 ^ res ^ ((v1 ^ res) & (v1 ^ v2))
}

#[inline]
fn overflow_bits_add(v1: u32, v2: u32, res: u32) -> u32 {
    (v1 ^ res) & !(v1 ^ v2)
}

#[inline]
fn overflow_bits_sub(v1: u32, v2: u32, res: u32) -> u32 {
    (v1 ^ res) & (v1 ^ v2)
}

/// Flag-writing view used by instruction bodies
pub struct Alu<'a> {
    flags: &'a mut Flags,
}

macro_rules! typed_binary {
    ($($name:ident => $op:ident, $width:expr, $ty:ty;)*) => {
        $(
            #[inline]
            pub fn $name(&mut self, v1: $ty, v2: $ty) -> $ty {
                self.$op($width, v1 as u32, v2 as u32) as $ty
            }
        )*
    };
}

macro_rules! typed_count {
    ($($name:ident => $op:ident, $width:expr, $ty:ty;)*) => {
        $(
            #[inline]
            pub fn $name(&mut self, value: $ty, count: u8) -> $ty {
                self.$op($width, value as u32, count as u32) as $ty
            }
        )*
    };
}

impl<'a> Alu<'a> {
    pub fn new(flags: &'a mut Flags) -> Self {
        Self { flags }
    }

    /// Set ZF, SF and PF from `res`
    #[inline]
    pub fn update_flags(&mut self, width: Width, res: u32) {
        let res = res & width.mask();
        self.flags.zero = res == 0;
        self.flags.sign = res & width.msb() != 0;
        self.flags.parity = parity(res);
    }

    fn add_with(&mut self, width: Width, v1: u32, v2: u32, carry_in: bool) -> u32 {
        let mask = width.mask();
        let (v1, v2) = (v1 & mask, v2 & mask);
        let res = v1.wrapping_add(v2).wrapping_add(carry_in as u32) & mask;
        self.update_flags(width, res);
        let carry = carry_bits_add(v1, v2, res);
        self.flags.carry = carry & width.msb() != 0;
        self.flags.auxiliary = carry & 0x08 != 0;
        self.flags.overflow = overflow_bits_add(v1, v2, res) & width.msb() != 0;
        res
    }

    fn sub_with(&mut self, width: Width, v1: u32, v2: u32, borrow_in: bool) -> u32 {
        let mask = width.mask();
        let (v1, v2) = (v1 & mask, v2 & mask);
        let res = v1.wrapping_sub(v2).wrapping_sub(borrow_in as u32) & mask;
        self.update_flags(width, res);
        let borrow = borrow_bits_sub(v1, v2, res);
        self.flags.carry = borrow & width.msb() != 0;
        self.flags.auxiliary = borrow & 0x08 != 0;
        self.flags.overflow = overflow_bits_sub(v1, v2, res) & width.msb() != 0;
        res
    }

    pub fn add(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        self.add_with(width, v1, v2, false)
    }

    pub fn adc(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        let carry = self.flags.carry;
        self.add_with(width, v1, v2, carry)
    }

    pub fn sub(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        self.sub_with(width, v1, v2, false)
    }

    pub fn sbb(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        let carry = self.flags.carry;
        self.sub_with(width, v1, v2, carry)
    }

    /// CF is not modified
    pub fn inc(&mut self, width: Width, value: u32) -> u32 {
        let carry = self.flags.carry;
        let res = self.add(width, value, 1);
        self.flags.carry = carry;
        res
    }

    /// CF is not modified
    pub fn dec(&mut self, width: Width, value: u32) -> u32 {
        let carry = self.flags.carry;
        let res = self.sub(width, value, 1);
        self.flags.carry = carry;
        res
    }

    fn logic(&mut self, width: Width, res: u32) -> u32 {
        let res = res & width.mask();
        self.update_flags(width, res);
        self.flags.carry = false;
        self.flags.overflow = false;
        res
    }

    pub fn and(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        self.logic(width, v1 & v2)
    }

    pub fn or(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        self.logic(width, v1 | v2)
    }

    pub fn xor(&mut self, width: Width, v1: u32, v2: u32) -> u32 {
        self.logic(width, v1 ^ v2)
    }

    /// Unsigned multiply; the double-width product is returned
    pub fn mul(&mut self, width: Width, v1: u32, v2: u32) -> u64 {
        let mask = width.mask() as u64;
        let res = (v1 as u64 & mask) * (v2 as u64 & mask);
        let upper_half_non_zero = res >> width.bits() != 0;
        self.flags.overflow = upper_half_non_zero;
        self.flags.carry = upper_half_non_zero;
        let low = (res & mask) as u32;
        match width {
            // ZF, SF and PF only look at AL
            Width::Byte => self.update_flags(Width::Byte, low),
            _ => {
                self.flags.zero = res == 0;
                self.flags.parity = parity(low);
                self.flags.sign = low & width.msb() != 0;
            }
        }
        res
    }

    /// Signed multiply; the double-width product is returned as raw bits
    pub fn imul(&mut self, width: Width, v1: u32, v2: u32) -> u64 {
        let a = width.sign_extend(v1) as i32 as i64;
        let b = width.sign_extend(v2) as i32 as i64;
        let res = a * b;
        let truncated = width.sign_extend(res as u32) as i32 as i64;
        let does_not_fit = res != truncated;
        self.flags.overflow = does_not_fit;
        self.flags.carry = does_not_fit;
        let double_mask = if width == Width::Dword {
            u64::MAX
        } else {
            (1u64 << (width.bits() * 2)) - 1
        };
        res as u64 & double_mask
    }

    /// Unsigned divide of a double-width dividend; returns `(quotient, remainder)`
    pub fn div(&mut self, width: Width, dividend: u64, divisor: u32) -> Result<(u32, u32), Fault> {
        let divisor = (divisor & width.mask()) as u64;
        if divisor == 0 {
            return Err(Fault::DivisionError("Division by zero".into()));
        }
        let quotient = dividend / divisor;
        if quotient > width.mask() as u64 {
            return Err(Fault::DivisionError(format!(
                "Division result out of range: {}",
                quotient
            )));
        }
        Ok((quotient as u32, (dividend % divisor) as u32))
    }

    /// Signed divide; `dividend` holds the raw bits of a double-width signed value
    pub fn idiv(&mut self, width: Width, dividend: u64, divisor: u32) -> Result<(u32, u32), Fault> {
        let divisor = width.sign_extend(divisor) as i32 as i64;
        if divisor == 0 {
            return Err(Fault::DivisionError("Division by zero".into()));
        }
        let dividend = match width {
            Width::Byte => dividend as u16 as i16 as i64,
            Width::Word => dividend as u32 as i32 as i64,
            Width::Dword => dividend as i64,
        };
        let Some(quotient) = dividend.checked_div(divisor) else {
            return Err(Fault::DivisionError("Division result out of range".into()));
        };
        let max = (width.msb() - 1) as i64;
        let min = -(width.msb() as i64);
        if quotient > max || quotient < min {
            return Err(Fault::DivisionError(format!(
                "Division result out of range: {}",
                quotient
            )));
        }
        let remainder = dividend % divisor;
        Ok((
            quotient as u32 & width.mask(),
            remainder as u32 & width.mask(),
        ))
    }

    /// OF for right rotates: XOR of the two top bits of the result
    fn set_overflow_for_right_rotate(&mut self, width: Width, res: u32) {
        let msb = res & width.msb() != 0;
        let before_msb = res & (width.msb() >> 1) != 0;
        self.flags.overflow = msb ^ before_msb;
    }

    pub fn rol(&mut self, width: Width, value: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count % bits;
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let res = ((value << count) | (value >> (bits - count))) & width.mask();
        self.flags.carry = res & 1 != 0;
        self.flags.overflow = (res & width.msb() != 0) ^ self.flags.carry;
        res
    }

    pub fn ror(&mut self, width: Width, value: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count % bits;
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let res = ((value >> count) | (value << (bits - count))) & width.mask();
        self.flags.carry = (value >> (count - 1)) & 1 != 0;
        self.set_overflow_for_right_rotate(width, res);
        res
    }

    pub fn rcl(&mut self, width: Width, value: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count % (bits + 1);
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        // Computed on 64 bits: the rotate spans width + 1 bits
        let v = value as u64;
        let old_carry = self.flags.carry as u64;
        let carry = (v >> (bits - count)) & 1;
        let mask = (1u64 << (count - 1)) - 1;
        let res = (v << count) | ((v >> (bits + 1 - count)) & mask) | (old_carry << (count - 1));
        let res = (res & width.mask() as u64) as u32;
        self.flags.carry = carry != 0;
        self.flags.overflow = (res & width.msb() != 0) ^ self.flags.carry;
        res
    }

    pub fn rcr(&mut self, width: Width, value: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count % (bits + 1);
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let v = value as u64;
        let old_carry = self.flags.carry as u64;
        let carry = (v >> (count - 1)) & 1;
        let mask = (1u64 << (bits - count)) - 1;
        let res = ((v >> count) & mask) | (v << (bits + 1 - count)) | (old_carry << (bits - count));
        let res = (res & width.mask() as u64) as u32;
        self.flags.carry = carry != 0;
        self.set_overflow_for_right_rotate(width, res);
        res
    }

    pub fn shl(&mut self, width: Width, value: u32, count: u32) -> u32 {
        // Anything past the width leaves zero with CF clear
        let count = count.min(width.bits() + 1);
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let v = value as u64;
        let msb_before = (v << (count - 1)) & width.msb() as u64 != 0;
        self.flags.carry = msb_before;
        let res = ((v << count) & width.mask() as u64) as u32;
        self.update_flags(width, res);
        self.flags.overflow = (res & width.msb() != 0) ^ msb_before;
        res
    }

    pub fn shr(&mut self, width: Width, value: u32, count: u32) -> u32 {
        let count = count.min(width.bits() + 1);
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let msb = value & width.msb() != 0;
        let v = value as u64;
        self.flags.carry = (v >> (count - 1)) & 1 != 0;
        let res = (v >> count) as u32;
        self.update_flags(width, res);
        self.flags.overflow = count == 1 && msb;
        res
    }

    pub fn sar(&mut self, width: Width, value: u32, count: u32) -> u32 {
        // Past the width every bit is a copy of the sign
        let count = count.min(width.bits());
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let signed = width.sign_extend(value) as i32 as i64;
        self.flags.carry = (signed >> (count - 1)) & 1 != 0;
        let res = (signed >> count) as u32 & width.mask();
        self.update_flags(width, res);
        self.flags.overflow = false;
        res
    }

    /// Double precision shift left of `destination`, filling from the top of `source`
    pub fn shld(&mut self, width: Width, destination: u32, source: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count & SHIFT_COUNT_MASK;
        let (dst, src) = (destination & width.mask(), source & width.mask());
        if count == 0 {
            return dst;
        }
        if count > bits {
            // Undefined on hardware: the source is shifted in again, flags stay
            return ((src as u64) << (count - bits)) as u32 & width.mask();
        }
        let (d, s) = (dst as u64, src as u64);
        let res = (((d << count) | (s >> (bits - count))) & width.mask() as u64) as u32;
        self.flags.carry = (d >> (bits - count)) & 1 != 0;
        self.update_flags(width, res);
        self.flags.overflow = (res ^ dst) & width.msb() != 0;
        res
    }

    /// Double precision shift right of `destination`, filling from the bottom of `source`
    pub fn shrd(&mut self, width: Width, destination: u32, source: u32, count: u32) -> u32 {
        let bits = width.bits();
        let count = count & SHIFT_COUNT_MASK;
        let (dst, src) = (destination & width.mask(), source & width.mask());
        if count == 0 {
            return dst;
        }
        if count > bits {
            return src >> (count - bits);
        }
        let (d, s) = (dst as u64, src as u64);
        let res = (((d >> count) | (s << (bits - count))) & width.mask() as u64) as u32;
        self.flags.carry = (d >> (count - 1)) & 1 != 0;
        self.update_flags(width, res);
        self.flags.overflow = (res ^ dst) & width.msb() != 0;
        res
    }

    /// DAA on AL
    pub fn daa(&mut self, al: u8) -> u8 {
        let old_al = al;
        let old_cf = self.flags.carry;
        let mut al = al;
        if (al & 0x0F) > 9 || self.flags.auxiliary {
            al = al.wrapping_add(6);
            self.flags.auxiliary = true;
        } else {
            self.flags.auxiliary = false;
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_add(0x60);
            self.flags.carry = true;
        } else {
            self.flags.carry = false;
        }
        self.update_flags(Width::Byte, al as u32);
        al
    }

    /// DAS on AL
    pub fn das(&mut self, al: u8) -> u8 {
        let old_al = al;
        let old_cf = self.flags.carry;
        let mut al = al;
        self.flags.carry = false;
        if (al & 0x0F) > 9 || self.flags.auxiliary {
            al = al.wrapping_sub(6);
            self.flags.carry = old_cf || old_al < 6;
            self.flags.auxiliary = true;
        } else {
            self.flags.auxiliary = false;
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60);
            self.flags.carry = true;
        }
        self.update_flags(Width::Byte, al as u32);
        al
    }

    /// AAA on AX
    pub fn aaa(&mut self, ax: u16) -> u16 {
        let mut ax = ax;
        if (ax & 0x0F) > 9 || self.flags.auxiliary {
            ax = ax.wrapping_add(0x106); // Add 1 to AH, 6 to AL
            self.flags.auxiliary = true;
            self.flags.carry = true;
        } else {
            self.flags.auxiliary = false;
            self.flags.carry = false;
        }
        ax & 0xFF0F
    }

    /// AAS on AX
    pub fn aas(&mut self, ax: u16) -> u16 {
        let mut ax = ax;
        if (ax & 0x0F) > 9 || self.flags.auxiliary {
            let al = (ax as u8).wrapping_sub(6);
            let ah = ((ax >> 8) as u8).wrapping_sub(1);
            ax = (ah as u16) << 8 | al as u16;
            self.flags.auxiliary = true;
            self.flags.carry = true;
        } else {
            self.flags.auxiliary = false;
            self.flags.carry = false;
        }
        ax & 0xFF0F
    }

    /// AAM: AH = AL / base, AL = AL % base
    pub fn aam(&mut self, al: u8, base: u8) -> Result<u16, Fault> {
        if base == 0 {
            return Err(Fault::DivisionError("AAM with base 0".into()));
        }
        let ah = al / base;
        let al = al % base;
        self.update_flags(Width::Byte, al as u32);
        Ok((ah as u16) << 8 | al as u16)
    }

    /// AAD: AL = AL + AH * base, AH = 0
    pub fn aad(&mut self, ax: u16, base: u8) -> u16 {
        let al = (ax as u8).wrapping_add(((ax >> 8) as u8).wrapping_mul(base));
        self.update_flags(Width::Byte, al as u32);
        al as u16
    }

    typed_binary! {
        add8 => add, Width::Byte, u8;
        add16 => add, Width::Word, u16;
        add32 => add, Width::Dword, u32;
        adc8 => adc, Width::Byte, u8;
        adc16 => adc, Width::Word, u16;
        adc32 => adc, Width::Dword, u32;
        sub8 => sub, Width::Byte, u8;
        sub16 => sub, Width::Word, u16;
        sub32 => sub, Width::Dword, u32;
        sbb8 => sbb, Width::Byte, u8;
        sbb16 => sbb, Width::Word, u16;
        sbb32 => sbb, Width::Dword, u32;
        and8 => and, Width::Byte, u8;
        and16 => and, Width::Word, u16;
        and32 => and, Width::Dword, u32;
        or8 => or, Width::Byte, u8;
        or16 => or, Width::Word, u16;
        or32 => or, Width::Dword, u32;
        xor8 => xor, Width::Byte, u8;
        xor16 => xor, Width::Word, u16;
        xor32 => xor, Width::Dword, u32;
    }

    typed_count! {
        rol8 => rol, Width::Byte, u8;
        rol16 => rol, Width::Word, u16;
        rol32 => rol, Width::Dword, u32;
        ror8 => ror, Width::Byte, u8;
        ror16 => ror, Width::Word, u16;
        ror32 => ror, Width::Dword, u32;
        rcl8 => rcl, Width::Byte, u8;
        rcl16 => rcl, Width::Word, u16;
        rcl32 => rcl, Width::Dword, u32;
        rcr8 => rcr, Width::Byte, u8;
        rcr16 => rcr, Width::Word, u16;
        rcr32 => rcr, Width::Dword, u32;
        shl8 => shl, Width::Byte, u8;
        shl16 => shl, Width::Word, u16;
        shl32 => shl, Width::Dword, u32;
        shr8 => shr, Width::Byte, u8;
        shr16 => shr, Width::Word, u16;
        shr32 => shr, Width::Dword, u32;
        sar8 => sar, Width::Byte, u8;
        sar16 => sar, Width::Word, u16;
        sar32 => sar, Width::Dword, u32;
    }

    pub fn mul8(&mut self, v1: u8, v2: u8) -> u16 {
        self.mul(Width::Byte, v1 as u32, v2 as u32) as u16
    }

    pub fn mul16(&mut self, v1: u16, v2: u16) -> u32 {
        self.mul(Width::Word, v1 as u32, v2 as u32) as u32
    }

    pub fn mul32(&mut self, v1: u32, v2: u32) -> u64 {
        self.mul(Width::Dword, v1, v2)
    }

    pub fn imul8(&mut self, v1: i8, v2: i8) -> i16 {
        self.imul(Width::Byte, v1 as u8 as u32, v2 as u8 as u32) as u16 as i16
    }

    pub fn imul16(&mut self, v1: i16, v2: i16) -> i32 {
        self.imul(Width::Word, v1 as u16 as u32, v2 as u16 as u32) as u32 as i32
    }

    pub fn imul32(&mut self, v1: i32, v2: i32) -> i64 {
        self.imul(Width::Dword, v1 as u32, v2 as u32) as i64
    }

    pub fn div8(&mut self, dividend: u16, divisor: u8) -> Result<u8, Fault> {
        self.div(Width::Byte, dividend as u64, divisor as u32)
            .map(|(q, _)| q as u8)
    }

    pub fn div16(&mut self, dividend: u32, divisor: u16) -> Result<u16, Fault> {
        self.div(Width::Word, dividend as u64, divisor as u32)
            .map(|(q, _)| q as u16)
    }

    pub fn div32(&mut self, dividend: u64, divisor: u32) -> Result<u32, Fault> {
        self.div(Width::Dword, dividend, divisor).map(|(q, _)| q)
    }

    pub fn idiv8(&mut self, dividend: i16, divisor: i8) -> Result<i8, Fault> {
        self.idiv(Width::Byte, dividend as u16 as u64, divisor as u8 as u32)
            .map(|(q, _)| q as u8 as i8)
    }

    pub fn idiv16(&mut self, dividend: i32, divisor: i16) -> Result<i16, Fault> {
        self.idiv(Width::Word, dividend as u32 as u64, divisor as u16 as u32)
            .map(|(q, _)| q as u16 as i16)
    }

    pub fn idiv32(&mut self, dividend: i64, divisor: i32) -> Result<i32, Fault> {
        self.idiv(Width::Dword, dividend as u64, divisor as u32)
            .map(|(q, _)| q as i32)
    }

    pub fn shld16(&mut self, destination: u16, source: u16, count: u8) -> u16 {
        self.shld(Width::Word, destination as u32, source as u32, count as u32) as u16
    }

    pub fn shld32(&mut self, destination: u32, source: u32, count: u8) -> u32 {
        self.shld(Width::Dword, destination, source, count as u32)
    }

    pub fn shrd16(&mut self, destination: u16, source: u16, count: u8) -> u16 {
        self.shrd(Width::Word, destination as u32, source as u32, count as u32) as u16
    }

    pub fn shrd32(&mut self, destination: u32, source: u32, count: u8) -> u32 {
        self.shrd(Width::Dword, destination, source, count as u32)
    }
}
