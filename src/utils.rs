/// Division rounding towards negative infinity; the modulus takes the sign of `b`.
/// Callers rule out `b == 0` and `i64::MIN / -1`.
pub fn floor_divmod(a: i64, b: i64) -> (i64, i64) {
    let (quotient, remainder) = (a / b, a % b);
    if remainder != 0 && (remainder < 0) != (b < 0) {
        (quotient - 1, remainder + b)
    } else {
        (quotient, remainder)
    }
}

/// Seconds between the Smalltalk epoch (1901-01-01) and the Unix epoch.
pub const SMALLTALK_EPOCH_OFFSET: u64 = 2_177_452_800;

#[cfg(test)]
mod tests {
    use super::floor_divmod;

    #[test]
    fn floors_towards_negative_infinity() {
        assert_eq!(floor_divmod(7, 2), (3, 1));
        assert_eq!(floor_divmod(-7, 2), (-4, 1));
        assert_eq!(floor_divmod(7, -2), (-4, -1));
        assert_eq!(floor_divmod(-7, -2), (3, -1));
        assert_eq!(floor_divmod(-8, 2), (-4, 0));
    }
}
