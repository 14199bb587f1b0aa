#![allow(clippy::cast_possible_truncation)]

const PM4_TYPE_SHIFT: u32 = 30;
const PM4_COUNT_SHIFT: u32 = 16;
const PM4_COUNT_MASK: u32 = 0x3FFF;
const PM4_OPCODE_SHIFT: u32 = 8;
const PM4_OPCODE_MASK: u32 = 0xFF;

const PM4_TYPE_3: u32 = 3;

/// Builds a PM4 type-3 header for a packet of `packet_dwords` dwords (header included).
///
/// The hardware count field holds the body length minus one.
#[must_use]
pub const fn pm4_type3_header(opcode: u32, packet_dwords: usize) -> u32 {
    (PM4_TYPE_3 << PM4_TYPE_SHIFT)
        | ((((packet_dwords - 2) as u32) & PM4_COUNT_MASK) << PM4_COUNT_SHIFT)
        | ((opcode & PM4_OPCODE_MASK) << PM4_OPCODE_SHIFT)
}

#[must_use]
pub const fn pm4_type(header: u32) -> u32 {
    header >> PM4_TYPE_SHIFT
}

#[must_use]
pub const fn pm4_opcode(header: u32) -> u32 {
    (header >> PM4_OPCODE_SHIFT) & PM4_OPCODE_MASK
}

/// Total packet length in dwords, header included.
#[must_use]
pub const fn pm4_packet_dwords(header: u32) -> usize {
    (((header >> PM4_COUNT_SHIFT) & PM4_COUNT_MASK) + 2) as usize
}

#[must_use]
pub const fn lower_32_bits(val: u64) -> u32 {
    (val & 0xFFFF_FFFF) as u32
}

#[must_use]
pub const fn upper_32_bits(val: u64) -> u32 {
    (val >> 32) as u32
}

#[must_use]
pub const fn make_u64(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Ceiling log2; `order_base_2(0) == 0`.
#[must_use]
pub const fn order_base_2(val: u64) -> u32 {
    if val <= 1 {
        0
    } else {
        64 - (val - 1).leading_zeros()
    }
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type3_header_encodes_body_length() {
        // 7-dword packet: header + 6 body dwords, count field = 5
        let header = pm4_type3_header(0xA4, 7);
        assert_eq!(pm4_type(header), 3);
        assert_eq!(pm4_opcode(header), 0xA4);
        assert_eq!(pm4_packet_dwords(header), 7);
        assert_eq!((header >> 16) & 0x3FFF, 5);
    }

    #[test]
    fn order_base_2_rounds_up() {
        assert_eq!(order_base_2(1), 0);
        assert_eq!(order_base_2(2), 1);
        assert_eq!(order_base_2(3), 2);
        assert_eq!(order_base_2(4096), 12);
        assert_eq!(order_base_2(4097), 13);
    }

    #[test]
    fn splits_and_joins_addresses() {
        let addr = 0x0000_8000_1234_5600;
        assert_eq!(make_u64(lower_32_bits(addr), upper_32_bits(addr)), addr);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }
}
