//! Static `(channel, group, field) -> bit_range` dictionaries for the DTM
//! watchpoint value/mask registers, loaded once at startup rather than
//! parsed from a data file on the hot path.

use crate::error::{CmnError, Result};

use super::Channel;

/// An inclusive bit range `[lo, hi]` within a 64-bit watchpoint register.
#[derive(Debug, Clone, Copy)]
pub struct BitRange {
    pub lo: u32,
    pub hi: u32,
}

impl BitRange {
    const fn new(lo: u32, hi: u32) -> Self {
        BitRange { lo, hi }
    }

    fn value_mask(&self, value: u64) -> Result<(u64, u64)> {
        let width = self.hi - self.lo + 1;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        if value > mask {
            return Err(CmnError::ParseError {
                token: value.to_string(),
                reason: format!("value out of bit range {}..{}", self.lo, self.hi),
            });
        }
        Ok((value << self.lo, mask << self.lo))
    }
}

struct FieldEntry {
    /// Pipe-separated aliases, e.g. in the original data `"opcode|cmd"`.
    aliases: &'static [&'static str],
    range: BitRange,
}

macro_rules! field_table {
    ($($aliases:expr => ($lo:expr, $hi:expr)),+ $(,)?) => {
        &[$(FieldEntry { aliases: &$aliases, range: BitRange::new($lo, $hi) }),+]
    };
}

// Group 0 carries the fields that identify the transaction; group 1 carries
// extended/optional fields. Ranges are disjoint within each group so that
// combining multiple fields never ORs overlapping mask bits.
fn table(channel: Channel, group: u8) -> &'static [FieldEntry] {
    use Channel::*;
    match (channel, group) {
        (Req, 0) => field_table! {
            ["srcid"] => (0, 10),
            ["tgtid"] => (11, 21),
            ["txnid"] => (22, 33),
            ["opcode", "cmd"] => (34, 40),
        },
        (Req, 1) => field_table! {
            ["lpid"] => (0, 4),
            ["mpam"] => (5, 14),
            ["addr"] => (15, 62),
        },
        (Rsp, 0) => field_table! {
            ["srcid"] => (0, 10),
            ["tgtid"] => (11, 21),
            ["txnid"] => (22, 33),
            ["opcode", "cmd"] => (34, 38),
        },
        (Rsp, 1) => field_table! {
            ["dbid"] => (0, 11),
            ["cbusy"] => (12, 14),
        },
        (Snp, 0) => field_table! {
            ["srcid"] => (0, 10),
            ["txnid"] => (11, 22),
            ["opcode", "cmd"] => (23, 27),
        },
        (Snp, 1) => field_table! {
            ["fwdnid"] => (0, 10),
            ["mpam"] => (11, 20),
            ["addr"] => (21, 48),
        },
        (Dat, 0) => field_table! {
            ["srcid"] => (0, 10),
            ["tgtid"] => (11, 21),
            ["txnid"] => (22, 33),
            ["opcode", "cmd"] => (34, 37),
        },
        (Dat, 1) => field_table! {
            ["homenid"] => (0, 10),
            ["dbid"] => (11, 22),
            ["resp"] => (23, 25),
            ["datasrc"] => (26, 29),
            ["cbusy"] => (30, 32),
        },
        _ => &[],
    }
}

/// Resolves `(channel, group, field)` to a `(value, mask)` pair suitable for
/// ORing into the watchpoint's compiled value/mask words.
pub fn value_mask(channel: Channel, group: u8, field: &str, value: u64) -> Result<(u64, u64)> {
    let field_lc = field.to_ascii_lowercase();
    for entry in table(channel, group) {
        if entry.aliases.iter().any(|a| *a == field_lc) {
            return entry.range.value_mask(value);
        }
    }
    Err(CmnError::ParseError {
        token: field.to_string(),
        reason: format!("unknown field {field:?} for channel={channel:?} group={group}"),
    })
}

/// The bit range a field resolves to, used by the packet decoder's
/// opcode reverse lookup path. Returns `None` if the field is not in the
/// table for this channel/group.
pub fn bit_range(channel: Channel, group: u8, field: &str) -> Option<BitRange> {
    let field_lc = field.to_ascii_lowercase();
    table(channel, group)
        .iter()
        .find(|e| e.aliases.iter().any(|a| *a == field_lc))
        .map(|e| e.range)
}
