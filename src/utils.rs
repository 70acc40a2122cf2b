pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

/// Rounds `value` up to `align`, which must be a power of two.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to `align`, which must be a power of two.
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `multiple` (any non-zero value).
#[must_use]
pub const fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// An alignment of zero is satisfied by any address.
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    align == 0 || value % align == 0
}

/// Zero is treated as "no alignment requested" and accepted.
#[must_use]
pub const fn is_valid_alignment(align: usize) -> bool {
    align == 0 || align.is_power_of_two()
}

/// Parses `"64"`, `"64k"`, `"2M"` or `"1g"` into a byte count.
#[must_use]
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.as_bytes().last()? {
        b'k' | b'K' => (&text[..text.len() - 1], KIB),
        b'm' | b'M' => (&text[..text.len() - 1], MIB),
        b'g' | b'G' => (&text[..text.len() - 1], GIB),
        _ => (text, 1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

/// Parses an integer the way `strtol(.., 0)` does: `0x` is hex, a leading `0` is octal.
#[must_use]
pub fn parse_int_auto_radix(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}
