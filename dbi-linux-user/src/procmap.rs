//! Parses `/proc/self/maps` into the sorted range list `ExecBroker`'s
//! `add_instrumented_module_from_addr` expects — the "process map"
//! external collaborator named in the interface design.

use std::fs;
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct MappedRange {
    pub range: Range<u64>,
    pub executable: bool,
    pub path: Option<String>,
}

pub fn read_self_maps() -> std::io::Result<Vec<MappedRange>> {
    let contents = fs::read_to_string("/proc/self/maps")?;
    Ok(parse_maps(&contents))
}

fn parse_maps(contents: &str) -> Vec<MappedRange> {
    let mut out = Vec::new();
    for line in contents.lines() {
        if let Some(entry) = parse_line(line) {
            out.push(entry);
        }
    }
    out
}

fn parse_line(line: &str) -> Option<MappedRange> {
    let mut fields = line.split_whitespace();
    let addr_range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(str::to_string);

    let (start_s, end_s) = addr_range.split_once('-')?;
    let start = u64::from_str_radix(start_s, 16).ok()?;
    let end = u64::from_str_radix(end_s, 16).ok()?;
    let executable = perms.as_bytes().get(2) == Some(&b'x');

    Some(MappedRange {
        range: start..end,
        executable,
        path,
    })
}

/// Convenience view for `ExecBroker::add_instrumented_module_from_addr`,
/// which only needs (range, executable) pairs.
pub fn as_exec_pairs(maps: &[MappedRange]) -> Vec<(Range<u64>, bool)> {
    maps.iter().map(|m| (m.range.clone(), m.executable)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_line() {
        let line = "7f0000000000-7f0000021000 r-xp 00000000 08:01 123456 /usr/lib/libc.so.6";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.range, 0x7f0000000000..0x7f0000021000);
        assert!(entry.executable);
        assert_eq!(entry.path.as_deref(), Some("/usr/lib/libc.so.6"));
    }

    #[test]
    fn non_executable_mapping_is_flagged_correctly() {
        let line = "7f0000000000-7f0000021000 rw-p 00000000 00:00 0";
        let entry = parse_line(line).unwrap();
        assert!(!entry.executable);
        assert_eq!(entry.path, None);
    }

    #[test]
    fn malformed_line_is_skipped() {
        assert!(parse_line("not a maps line").is_none());
    }
}
