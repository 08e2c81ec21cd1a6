//! Per-channel opcode name tables (AMBA CHI issue-B mnemonics), resolved
//! case-insensitively and reversible for packet decoding.

use crate::error::{CmnError, Result};

use super::Channel;

struct Opcode {
    name: &'static str,
    value: u64,
}

macro_rules! opcodes {
    ($($name:expr => $value:expr),+ $(,)?) => {
        &[$(Opcode { name: $name, value: $value }),+]
    };
}

fn table(channel: Channel) -> &'static [Opcode] {
    use Channel::*;
    match channel {
        Req => opcodes! {
            "reqlcrdreturn" => 0x00,
            "readshared" => 0x01,
            "readclean" => 0x02,
            "readonce" => 0x03,
            "readnosnp" => 0x04,
            "pcrdreturn" => 0x05,
            "readunique" => 0x07,
            "cleanshared" => 0x08,
            "cleaninvalid" => 0x09,
            "makeinvalid" => 0x0A,
            "cleanunique" => 0x0B,
            "makeunique" => 0x0C,
            "evict" => 0x0D,
            "writeuniqueptl" => 0x18,
            "writeuniquefull" => 0x19,
            "writebackptl" => 0x1A,
            "writebackfull" => 0x1B,
            "writecleanfull" => 0x1C,
            "writenosnpptl" => 0x1F,
        },
        Rsp => opcodes! {
            "resplcrdreturn" => 0x00,
            "snpresp" => 0x01,
            "compack" => 0x02,
            "retryack" => 0x03,
            "comp" => 0x04,
            "compdbidresp" => 0x05,
            "dbidresp" => 0x06,
            "comp_persist" => 0x07,
            "dbidresp_ordered" => 0x08,
        },
        Snp => opcodes! {
            "snplcrdreturn" => 0x00,
            "snpshared" => 0x01,
            "snpclean" => 0x02,
            "snponce" => 0x03,
            "snpnotshareddirty" => 0x04,
            "snpuniquestash" => 0x05,
            "snpmakeinvalidstash" => 0x06,
            "snpunique" => 0x07,
            "snpcleanshared" => 0x08,
            "snpcleaninvalid" => 0x09,
            "snpmakeinvalid" => 0x0A,
        },
        Dat => opcodes! {
            "datlcrdreturn" => 0x00,
            "snprespdata" => 0x01,
            "copybackwrdata" => 0x02,
            "noncopybackwrdata" => 0x03,
            "compdata" => 0x04,
            "snprespdataptl" => 0x05,
            "snprespdatafwded" => 0x06,
            "writedatacancel" => 0x07,
            "databuffer_ordered" => 0x0B,
            "comp_data" => 0x0C,
        },
    }
}

/// Resolves an opcode reference for `channel`: a numeric literal is
/// accepted directly, otherwise the string is matched case-insensitively
/// against the channel's mnemonic table.
pub fn resolve(channel: Channel, opcode_or_name: &str) -> Result<u64> {
    if let Some(v) = parse_numeric(opcode_or_name) {
        return Ok(v);
    }
    let lc = opcode_or_name.to_ascii_lowercase();
    table(channel)
        .iter()
        .find(|o| o.name == lc)
        .map(|o| o.value)
        .ok_or_else(|| CmnError::ParseError {
            token: opcode_or_name.to_string(),
            reason: format!("invalid opcode {opcode_or_name:?} for channel {channel:?}"),
        })
}

/// Reverse lookup used by the packet decoder: numeric opcode to mnemonic,
/// falling back to a hex literal for values the table does not name.
pub fn name(channel: Channel, value: u64) -> String {
    table(channel)
        .iter()
        .find(|o| o.value == value)
        .map(|o| o.name.to_string())
        .unwrap_or_else(|| format!("{value:#x}"))
}

fn parse_numeric(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse::<u64>().ok()
    }
}
