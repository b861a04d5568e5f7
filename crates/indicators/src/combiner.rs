/// AND-combine a set of entry (or exit) signal sequences: `+1` iff every
/// sequence reads `+1` at that bar, `-1` iff every sequence reads `-1`,
/// else `0` (spec.md §4.3).
pub fn and_combine(sequences: &[Vec<i8>]) -> Vec<i8> {
    if sequences.is_empty() {
        return vec![];
    }
    let n = sequences[0].len();
    let mut out = vec![0i8; n];
    for t in 0..n {
        let all_long = sequences.iter().all(|s| s[t] == 1);
        let all_short = sequences.iter().all(|s| s[t] == -1);
        out[t] = if all_long {
            1
        } else if all_short {
            -1
        } else {
            0
        };
    }
    out
}

/// Derive an NDayCycle exit column from the already-combined entry column:
/// for every bar where `entry[t] != 0`, set `exit[t+n] = -1` (variant 1,
/// close-long) or `+1` (variant 2, close-short) when `t+n` is in range.
/// This overrides the AND rule and is the only way NDayCycle exits are
/// produced (spec.md §4.3).
pub fn derive_nday_cycle_exit(entry: &[i8], n: usize, variant: u32) -> Vec<i8> {
    let len = entry.len();
    let mut out = vec![0i8; len];
    let fire = if variant == 1 { -1i8 } else { 1i8 };
    for (t, value) in entry.iter().enumerate() {
        if *value != 0 && t + n < len {
            out[t + n] = fire;
        }
    }
    out
}
