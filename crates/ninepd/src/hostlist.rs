//! SLURM-style host list parsing and matching (spec.md §4.8).
//!
//! Grounded on `examples/original_source/src/liblsd/hostlist.h`'s
//! `hostlist_t`/`hostset_t` API; reimplemented here as a small parser over
//! `prefix[a-b,c,d-e]` range syntax rather than porting the C library's
//! bitmap/iterator machinery, since all the server needs is membership
//! testing against a connection's client identifier.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `*` or absent: matches anything (spec.md §4.8).
    Any,
    Explicit(Vec<HostEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    prefix: String,
    /// `None` means a bare hostname with no bracketed range.
    ranges: Option<Vec<(u32, u32)>>,
    /// Zero-padding width inferred from the range digits, e.g. `a[01-03]`.
    width: usize,
}

impl HostPattern {
    pub fn parse(spec: &str) -> HostPattern {
        let spec = spec.trim();
        if spec.is_empty() || spec == "*" {
            return HostPattern::Any;
        }
        let mut entries = Vec::new();
        for part in spec.split(',') {
            if let Some(entry) = parse_one(part.trim()) {
                entries.push(entry);
            }
        }
        HostPattern::Explicit(entries)
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Explicit(entries) => entries.iter().any(|e| e.matches(host)),
        }
    }
}

impl HostEntry {
    fn matches(&self, host: &str) -> bool {
        let Some(ranges) = &self.ranges else {
            return host == self.prefix;
        };
        let Some(suffix) = host.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if self.width > 0 && suffix.len() != self.width {
            return false;
        }
        let Ok(n) = suffix.parse::<u32>() else {
            return false;
        };
        ranges.iter().any(|&(lo, hi)| n >= lo && n <= hi)
    }
}

/// Parses one comma-separated element: `name`, `name5`, or
/// `name[0-15,20,22-24]`.
fn parse_one(part: &str) -> Option<HostEntry> {
    if part.is_empty() {
        return None;
    }
    match part.find('[') {
        None => Some(HostEntry {
            prefix: part.to_owned(),
            ranges: None,
            width: 0,
        }),
        Some(open) => {
            let close = part.rfind(']')?;
            if close < open {
                return None;
            }
            let prefix = part[..open].to_owned();
            let body = &part[open + 1..close];
            let mut ranges = Vec::new();
            let mut width = 0;
            for piece in body.split(',') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                match piece.split_once('-') {
                    Some((lo, hi)) => {
                        width = width.max(lo.len()).max(hi.len());
                        let lo: u32 = lo.parse().ok()?;
                        let hi: u32 = hi.parse().ok()?;
                        ranges.push((lo, hi));
                    }
                    None => {
                        width = width.max(piece.len());
                        let n: u32 = piece.parse().ok()?;
                        ranges.push((n, n));
                    }
                }
            }
            Some(HostEntry {
                prefix,
                ranges: Some(ranges),
                width,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_everything() {
        assert!(HostPattern::parse("*").matches("whatever"));
        assert!(HostPattern::parse("").matches("whatever"));
    }

    #[test]
    fn range_and_union() {
        let p = HostPattern::parse("a[0-15,20,22-24]");
        assert!(p.matches("a0"));
        assert!(p.matches("a15"));
        assert!(!p.matches("a16"));
        assert!(p.matches("a20"));
        assert!(!p.matches("a21"));
        assert!(p.matches("a23"));
    }

    #[test]
    fn plain_hostname() {
        let p = HostPattern::parse("b0");
        assert!(p.matches("b0"));
        assert!(!p.matches("b1"));
    }

    #[test]
    fn scenario_export_matching() {
        let scratch = HostPattern::parse("a[0-3]");
        assert!(scratch.matches("a1"));
        assert!(!scratch.matches("b0"));
    }
}
