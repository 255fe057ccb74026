use std::cmp::Ordering;

/// Compares dot-separated numeric versions component by component.
///
/// Components that are missing or not plain non-negative integers count as
/// zero, so `"1.2"` equals `"1.2.0"` and `"1.2.x"` equals `"1.2.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// True when `candidate` is strictly newer than `current`, ignoring a leading `v` on either.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(strip_v(candidate), strip_v(current)) == Ordering::Greater
}

pub fn strip_v(version: &str) -> &str {
    version.trim().trim_start_matches(['v', 'V'])
}

fn components(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}
