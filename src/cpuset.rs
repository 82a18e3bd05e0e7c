//! CPU set parsing and resolution for heater placement.
//!
//! Heater workers run one per CPU in the resolved set. The set is given in the
//! format used by Linux taskset/numactl:
//! - Single CPUs: `"0"`, `"3"`
//! - Ranges: `"0-3"`
//! - Mixed: `"0-1,3"`

use crate::error::{HearthError, Result};

/// Parse a CPU set string into a sorted, deduplicated list of CPU IDs.
///
/// # Examples
///
/// ```
/// use hearth::cpuset::parse_cpuset;
///
/// assert_eq!(parse_cpuset("0-2,5").unwrap(), vec![0, 1, 2, 5]);
/// ```
///
/// # Errors
///
/// Returns `HearthError::InvalidCpuSet` if the string cannot be parsed.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let invalid = |msg: String| HearthError::InvalidCpuSet(msg);

    let mut cpus = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad range start in '{}'", part)))?;
                let hi: usize = hi
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad range end in '{}'", part)))?;
                if lo > hi {
                    return Err(invalid(format!("descending range '{}'", part)));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(
                part.parse()
                    .map_err(|_| invalid(format!("bad CPU ID '{}'", part)))?,
            ),
        }
    }

    if cpus.is_empty() {
        return Err(invalid(format!("no CPU IDs in '{}'", s.trim())));
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Format a sorted CPU list back into compact range notation.
///
/// ```
/// use hearth::cpuset::format_cpuset;
///
/// assert_eq!(format_cpuset(&[0, 1, 2, 5, 7, 8]), "0-2,5,7-8");
/// ```
pub fn format_cpuset(cpus: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = cpus.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}

/// Logical CPU IDs this process may run on.
pub fn available_cpus() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Resolve the CPUs the heater pool should occupy.
///
/// `None` means every available CPU, i.e. one heater per logical core.
///
/// # Errors
///
/// Returns an error if the set cannot be parsed, names a CPU this process
/// cannot use, or resolves to nothing.
pub fn resolve_heater_cpus(cpuset: Option<&str>) -> Result<Vec<usize>> {
    let available = available_cpus();
    let cpus = match cpuset {
        Some(spec) => {
            let cpus = parse_cpuset(spec)?;
            if let Some(&missing) = cpus.iter().find(|cpu| !available.contains(cpu)) {
                return Err(HearthError::CpuNotAvailable(missing));
            }
            cpus
        }
        None => available,
    };

    if cpus.is_empty() {
        return Err(HearthError::NoCpusAvailable);
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_cpuset("2").unwrap(), vec![2]);
        assert_eq!(parse_cpuset("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpuset(" 3, 0 - 1 ,1").unwrap(), vec![0, 1, 3]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpuset("").is_err());
        assert!(parse_cpuset(" , ").is_err());
        assert!(parse_cpuset("x").is_err());
        assert!(parse_cpuset("4-2").is_err());
        assert!(parse_cpuset("-1").is_err());
    }

    #[test]
    fn test_format_roundtrip_shape() {
        assert_eq!(format_cpuset(&[]), "");
        assert_eq!(format_cpuset(&[3]), "3");
        assert_eq!(format_cpuset(&[0, 1, 2, 3]), "0-3");
        assert_eq!(format_cpuset(&[0, 2, 4]), "0,2,4");
    }

    #[test]
    fn test_resolve_defaults_to_all_cpus() {
        let cpus = resolve_heater_cpus(None).unwrap();
        assert_eq!(cpus, available_cpus());
        assert!(!cpus.is_empty());
    }

    #[test]
    fn test_resolve_rejects_unknown_cpu() {
        assert!(matches!(
            resolve_heater_cpus(Some("99999")),
            Err(HearthError::CpuNotAvailable(99999))
        ));
    }
}
