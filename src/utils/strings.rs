use crate::error::{RuntimeError, RuntimeResult};

/// Parse an integer with an optional K/M/G binary suffix.
///
/// The suffix switch falls through: "1G" is `1 << 30`, "1M" is `1 << 20`,
/// "1K" is `1 << 10`. A trailing character outside the known suffixes is
/// ignored and the leading integer is returned as-is.
pub fn parse_size_with_unit(s: &str) -> RuntimeResult<u64> {
    let s = s.trim();
    let digits: usize = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err(RuntimeError::invalid_value(format!(
            "parse_size_with_unit({}): bad integer value",
            s
        )));
    }
    let value: u64 = s[..digits].parse().map_err(|_| {
        RuntimeError::invalid_value(format!("parse_size_with_unit({}): bad integer value", s))
    })?;

    let shift = match s[digits..].chars().next() {
        Some('G') | Some('g') => 30,
        Some('M') | Some('m') => 20,
        Some('K') | Some('k') => 10,
        _ => 0,
    };
    Ok(value << shift)
}

/// Render a controller set the way the kernel names cgroup mounts:
/// comma-separated, in iteration order.
pub fn comma_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for item in items {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(item.as_ref());
    }
    out
}

/// Parse one pid per line, as read from a cgroup `tasks` or `cgroup.procs`
/// knob. Blank lines are skipped.
pub fn lines_to_pids(data: &str) -> RuntimeResult<Vec<i32>> {
    let mut pids = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid = line.parse::<i32>().map_err(|_| {
            RuntimeError::invalid_value(format!("lines_to_pids({}): bad pid", line))
        })?;
        pids.push(pid);
    }
    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_suffixes() {
        assert_eq!(parse_size_with_unit("1K").unwrap(), 1024);
        assert_eq!(parse_size_with_unit("1M").unwrap(), 1048576);
        assert_eq!(parse_size_with_unit("1G").unwrap(), 1073741824);
        assert_eq!(parse_size_with_unit("5").unwrap(), 5);
        assert_eq!(parse_size_with_unit("5k").unwrap(), 5 << 10);
        assert_eq!(parse_size_with_unit("16m").unwrap(), 16 << 20);
    }

    #[test]
    fn unknown_suffix_is_ignored() {
        // Fall-through behavior: an unrecognized suffix leaves the value
        // untouched and reports no error.
        assert_eq!(parse_size_with_unit("5z").unwrap(), 5);
        assert_eq!(parse_size_with_unit("7 ").unwrap(), 7);
    }

    #[test]
    fn bad_integer_is_rejected() {
        assert!(parse_size_with_unit("abc").is_err());
        assert!(parse_size_with_unit("").is_err());
        assert!(parse_size_with_unit("K").is_err());
    }

    #[test]
    fn comma_lists() {
        assert_eq!(comma_list(["cpu", "cpuacct"]), "cpu,cpuacct");
        assert_eq!(comma_list(Vec::<&str>::new()), "");
        assert_eq!(comma_list(["memory"]), "memory");
    }

    #[test]
    fn pid_lines() {
        assert_eq!(lines_to_pids("1\n23\n\n456\n").unwrap(), vec![1, 23, 456]);
        assert!(lines_to_pids("12\nx\n").is_err());
        assert!(lines_to_pids("").unwrap().is_empty());
    }
}
